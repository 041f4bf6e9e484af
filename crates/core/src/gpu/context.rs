//! GPU context and initialization
//!
//! Distinguishes "no GPU found" (expected on headless machines) from "GPU
//! found but failed to initialize" (worth a warning). The device is created
//! with the largest buffers and workgroups the adapter offers, since the
//! block update binds whole-grid storage buffers and runs one invocation per
//! block node.

use tracing::{debug, info};

/// Result of a GPU initialization attempt
#[derive(Debug)]
pub enum GpuInitResult {
    /// GPU initialized successfully
    Success(GpuContext),
    /// No compatible adapter
    NoGpuFound,
    /// Adapter found but the device could not be created
    InitFailed {
        /// Name of the adapter that failed
        adapter_name: String,
        /// Error message
        error: String,
    },
}

/// Storage buffers bound by the block update kernel
pub(crate) const REQUIRED_STORAGE_BUFFERS: u32 = 8;

/// Device limits for the block update on an adapter offering `adapter`
///
/// Buffer sizes and workgroup dimensions are raised to what the adapter
/// supports. `None` when it cannot bind the kernel's storage buffers.
fn solver_limits(adapter: &wgpu::Limits) -> Option<wgpu::Limits> {
    if adapter.max_storage_buffers_per_shader_stage < REQUIRED_STORAGE_BUFFERS {
        return None;
    }
    Some(wgpu::Limits {
        max_storage_buffers_per_shader_stage: REQUIRED_STORAGE_BUFFERS,
        max_storage_buffer_binding_size: adapter.max_storage_buffer_binding_size,
        max_buffer_size: adapter.max_buffer_size,
        max_compute_invocations_per_workgroup: adapter.max_compute_invocations_per_workgroup,
        max_compute_workgroup_size_x: adapter.max_compute_workgroup_size_x,
        max_compute_workgroup_storage_size: adapter.max_compute_workgroup_storage_size,
        max_compute_workgroups_per_dimension: adapter.max_compute_workgroups_per_dimension,
        ..wgpu::Limits::downlevel_defaults()
    })
}

/// Device and queue of the selected adapter
#[derive(Debug)]
pub struct GpuContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
    adapter_info: wgpu::AdapterInfo,
}

impl GpuContext {
    /// Request a high performance adapter and create its device
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> GpuInitResult {
        info!("Looking for a GPU adapter for the eikonal solver");

        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = if let Some(a) =
            pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })) {
            debug!("Found GPU adapter: {}", a.get_info().name);
            a
        } else {
            debug!("No GPU adapter found");
            return GpuInitResult::NoGpuFound;
        };

        let adapter_info = adapter.get_info();
        let adapter_name = adapter_info.name.clone();
        let Some(required_limits) = solver_limits(&adapter.limits()) else {
            return GpuInitResult::InitFailed {
                adapter_name,
                error: format!(
                    "fewer than {REQUIRED_STORAGE_BUFFERS} storage buffers per compute stage"
                ),
            };
        };
        debug!(
            "Requesting storage bindings of {} bytes, workgroups of {} invocations",
            required_limits.max_storage_buffer_binding_size,
            required_limits.max_compute_invocations_per_workgroup
        );

        match pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("Eikonal Solver Device"),
                required_features: wgpu::Features::empty(),
                required_limits,
                memory_hints: wgpu::MemoryHints::Performance,
            },
            None,
        )) {
            Ok((device, queue)) => {
                info!("Eikonal solver running on {}", adapter_name);
                GpuInitResult::Success(Self {
                    device,
                    queue,
                    adapter_info,
                })
            }
            Err(e) => {
                debug!("Failed to create GPU device: {}", e);
                GpuInitResult::InitFailed {
                    adapter_name,
                    error: e.to_string(),
                }
            }
        }
    }

    /// Adapter name for logging
    #[must_use]
    pub fn adapter_name(&self) -> &str {
        &self.adapter_info.name
    }

    /// Largest workgroup the device runs, one invocation per block node
    #[must_use]
    pub fn max_workgroup_size(&self) -> u32 {
        let limits = self.device.limits();
        limits
            .max_compute_invocations_per_workgroup
            .min(limits.max_compute_workgroup_size_x)
    }

    /// Most blocks one round can launch, one workgroup each
    #[must_use]
    pub fn max_blocks_per_round(&self) -> u32 {
        self.device.limits().max_compute_workgroups_per_dimension
    }

    /// Whether a storage buffer of `bytes` fits the device limits
    #[must_use]
    pub fn can_allocate(&self, bytes: u64) -> bool {
        let limits = self.device.limits();
        bytes <= limits.max_buffer_size && bytes <= u64::from(limits.max_storage_buffer_binding_size)
    }

    #[must_use]
    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    #[must_use]
    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_follow_adapter() {
        let adapter = wgpu::Limits {
            max_storage_buffer_binding_size: 1 << 30,
            max_buffer_size: 1 << 31,
            max_compute_invocations_per_workgroup: 1024,
            max_compute_workgroup_size_x: 1024,
            ..wgpu::Limits::default()
        };
        let limits = solver_limits(&adapter).unwrap();
        assert_eq!(limits.max_storage_buffer_binding_size, 1 << 30);
        assert_eq!(limits.max_buffer_size, 1 << 31);
        assert_eq!(limits.max_compute_invocations_per_workgroup, 1024);
        assert_eq!(limits.max_storage_buffers_per_shader_stage, REQUIRED_STORAGE_BUFFERS);
        assert!(limits.check_limits(&adapter));
    }

    #[test]
    fn test_limits_need_storage_buffers() {
        let adapter = wgpu::Limits {
            max_storage_buffers_per_shader_stage: 4,
            ..wgpu::Limits::downlevel_defaults()
        };
        assert!(solver_limits(&adapter).is_none());
    }

    #[test]
    fn test_gpu_init_returns_valid_result() {
        // Which variant depends on the machine
        match GpuContext::new() {
            GpuInitResult::Success(ctx) => {
                assert!(!ctx.adapter_name().is_empty());
                assert!(ctx.max_workgroup_size() >= 64);
                assert!(ctx.can_allocate(1 << 20));
                assert!(ctx.max_blocks_per_round() >= 1);
            }
            GpuInitResult::NoGpuFound => {}
            GpuInitResult::InitFailed {
                adapter_name,
                error,
            } => {
                assert!(!adapter_name.is_empty());
                assert!(!error.is_empty());
            }
        }
    }
}
