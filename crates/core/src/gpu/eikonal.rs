//! wgpu backend of the block update
//!
//! Covers the first order, single copy configuration. Stencils and neighbour
//! slots never change during a solve, so they are resolved once on the host
//! and uploaded with the problem. Each round the host writes the launch list,
//! dispatches one workgroup per block, copies the next values over the
//! current ones and reads back the per-block statistics for the scheduler.

use std::time::Instant;

use bytemuck::{Pod, Zeroable};
use tracing::{debug, info, warn};

use super::GpuContext;
use crate::config::{Discipline, SolverConfig};
use crate::error::{ConfigError, SolverError};
use crate::grid::{in_range, index, position, Grid};
use crate::problem::Problem;
use crate::scheme::{Scheme, Stencil};
use crate::solver::{check_scheme, node_stencil, Propagation, RoundReport, SolveReport};

/// Infinity on the device
const GPU_INF: f32 = 3.0e38;
const INVALID: u32 = u32::MAX;
const LOCAL: u32 = 0x8000_0000;

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct UpdateParams {
    atol: f32,
    rtol: f32,
    _pad0: f32,
    _pad1: f32,
}

/// Block-parallel eikonal solver on a GPU
pub struct GpuSolver {
    context: GpuContext,
    config: SolverConfig,
    grid: Grid,
    propagation: Propagation,
    pipeline: wgpu::ComputePipeline,
    bind_group: wgpu::BindGroup,
    u_in: wgpu::Buffer,
    u_out: wgpu::Buffer,
    blocks: wgpu::Buffer,
    min_chg: wgpu::Buffer,
    rounds: usize,
}

impl GpuSolver {
    /// Upload `problem` and compile the update kernel
    ///
    /// # Errors
    ///
    /// `Config(Unsupported)` for capabilities the device kernel does not
    /// implement, and every error of [`crate::Solver::new`].
    pub fn new<S: Scheme + ?Sized>(
        context: GpuContext,
        problem: &Problem,
        config: SolverConfig,
        scheme: &S,
    ) -> Result<Self, SolverError> {
        config.validate()?;
        check_supported(&config)?;
        if problem.ndim() != config.ndim() {
            return Err(ConfigError::DimensionMismatch {
                what: "block shape",
                expected: problem.ndim(),
                found: config.ndim(),
            }
            .into());
        }
        let grid = Grid::new(problem.shape(), &config.shape_i, &config.periodic)?;
        check_scheme(scheme, problem, &config, &grid)?;

        let size_i = grid.size_i();
        let size_tot = grid.size_tot();
        let workgroup = size_i.next_power_of_two();
        if workgroup > context.max_workgroup_size() as usize {
            return Err(ConfigError::Unsupported("blocks larger than the device workgroup").into());
        }
        if grid.size_o() > context.max_blocks_per_round() as usize {
            return Err(ConfigError::Unsupported("more blocks than one dispatch launches").into());
        }
        if size_tot >= LOCAL as usize {
            return Err(ConfigError::Unsupported("grids of 2^31 nodes or more").into());
        }
        let nact = config.nact();
        let ntot = config.ntot();
        let neighbor_bytes = (size_tot * ntot * std::mem::size_of::<u32>()) as u64;
        if !context.can_allocate(neighbor_bytes) {
            return Err(SolverError::Gpu(format!(
                "neighbour table of {neighbor_bytes} bytes exceeds the device buffer limits"
            )));
        }

        let data = problem.to_blocks(&grid, false, false);
        let (weights, neighbors) = resolve_stencils(scheme, &grid, &data, &config)?;

        let mut propagation = Propagation::new(&grid, &config);
        propagation.activate_sources(&data.values, size_i);

        let device = context.device();
        let prelude = format!(
            "const SIZE_I: u32 = {size_i}u;\nconst WG: u32 = {workgroup}u;\nconst NACT: u32 = {nact}u;\nconst NSYM: u32 = {}u;\nconst NTOT: u32 = {ntot}u;\nconst NITER: u32 = {}u;\n",
            config.nsym, config.niter_i
        );
        let source = prelude + include_str!("eikonal_update.wgsl");
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Eikonal Update Shader"),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });

        let storage = |binding: u32, read_only: bool| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };
        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Eikonal Update Bind Group Layout"),
            entries: &[
                storage(0, true),
                storage(1, false),
                storage(2, true),
                storage(3, true),
                storage(4, true),
                storage(5, true),
                storage(6, true),
                storage(7, false),
                wgpu::BindGroupLayoutEntry {
                    binding: 8,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Eikonal Update Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("Eikonal Update Pipeline"),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: "main",
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            cache: None,
        });

        let values = to_device(&data.values);
        let rhs = to_device(&data.rhs);
        let seeds: Vec<u32> = data.seeds.iter().map(|&s| u32::from(s)).collect();
        let params = UpdateParams {
            atol: config.tolerance.atol,
            rtol: config.tolerance.rtol,
            _pad0: 0.0,
            _pad1: 0.0,
        };

        let init = |label: &str, contents: &[u8], usage: wgpu::BufferUsages| {
            wgpu::util::DeviceExt::create_buffer_init(
                device,
                &wgpu::util::BufferInitDescriptor {
                    label: Some(label),
                    contents,
                    usage,
                },
            )
        };
        let storage_rw = wgpu::BufferUsages::STORAGE
            | wgpu::BufferUsages::COPY_SRC
            | wgpu::BufferUsages::COPY_DST;
        let u_in = init("Values In", bytemuck::cast_slice(&values), storage_rw);
        let u_out = init("Values Out", bytemuck::cast_slice(&values), storage_rw);
        let rhs = init("Rhs", bytemuck::cast_slice(&rhs), wgpu::BufferUsages::STORAGE);
        let seeds = init("Seeds", bytemuck::cast_slice(&seeds), wgpu::BufferUsages::STORAGE);
        let weights = init("Weights", bytemuck::cast_slice(&weights), wgpu::BufferUsages::STORAGE);
        let neighbors = init(
            "Neighbors",
            bytemuck::cast_slice(&neighbors),
            wgpu::BufferUsages::STORAGE,
        );
        let params = init(
            "Update Params",
            bytemuck::bytes_of(&params),
            wgpu::BufferUsages::UNIFORM,
        );
        let list_bytes = (grid.size_o() * std::mem::size_of::<u32>()) as u64;
        let blocks = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Launch List"),
            size: list_bytes,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let min_chg = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Block Statistics"),
            size: list_bytes,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });

        let buffers = [&u_in, &u_out, &rhs, &seeds, &weights, &neighbors, &blocks, &min_chg, &params];
        let entries: Vec<wgpu::BindGroupEntry<'_>> = buffers
            .iter()
            .enumerate()
            .map(|(binding, buffer)| wgpu::BindGroupEntry {
                binding: binding as u32,
                resource: buffer.as_entire_binding(),
            })
            .collect();
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Eikonal Update Bind Group"),
            layout: &bind_group_layout,
            entries: &entries,
        });

        info!(
            "GPU solver ready on {}: shape {:?}, blocks {:?} of {:?}, workgroup {}",
            context.adapter_name(),
            grid.shape(),
            grid.shape_o(),
            grid.shape_i(),
            workgroup
        );

        Ok(Self {
            context,
            config,
            grid,
            propagation,
            pipeline,
            bind_group,
            u_in,
            u_out,
            blocks,
            min_chg,
            rounds: 0,
        })
    }

    /// Run one round on the device
    ///
    /// # Errors
    ///
    /// `Gpu` when the statistics cannot be read back.
    pub fn step(&mut self) -> Result<RoundReport, SolverError> {
        self.rounds += 1;
        let list = self.propagation.begin_round().to_vec();
        let frozen = self.propagation.frozen_blocks();
        let front = self.propagation.front();
        let launch: Vec<u32> = list
            .iter()
            .filter(|&&n_o| !self.propagation.abort(n_o))
            .map(|&n_o| n_o as u32)
            .collect();

        let outcomes: Vec<(usize, f32)> = if launch.is_empty() {
            Vec::new()
        } else {
            let stats = self.dispatch(&launch)?;
            launch
                .iter()
                .zip(stats)
                .map(|(&n_o, chg)| (n_o as usize, from_device(chg)))
                .collect()
        };

        self.propagation.end_round(&outcomes);
        let report = RoundReport {
            round: self.rounds,
            launched: list.len(),
            processed: outcomes.len(),
            changed: outcomes.iter().filter(|(_, c)| *c < f32::INFINITY).count(),
            frozen,
            active: self.propagation.active_blocks(),
            front,
        };
        debug!(
            "GPU round {}: {} processed, {} changed, {} active",
            report.round, report.processed, report.changed, report.active
        );
        Ok(report)
    }

    fn dispatch(&self, launch: &[u32]) -> Result<Vec<f32>, SolverError> {
        let device = self.context.device();
        let queue = self.context.queue();
        queue.write_buffer(&self.blocks, 0, bytemuck::cast_slice(launch));

        let stats_bytes = std::mem::size_of_val(launch) as u64;
        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Statistics Readback"),
            size: stats_bytes,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Eikonal Update Encoder"),
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Eikonal Update Pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &self.bind_group, &[]);
            pass.dispatch_workgroups(launch.len() as u32, 1, 1);
        }
        let values_bytes = (self.grid.size_tot() * std::mem::size_of::<f32>()) as u64;
        encoder.copy_buffer_to_buffer(&self.u_out, 0, &self.u_in, 0, values_bytes);
        encoder.copy_buffer_to_buffer(&self.min_chg, 0, &staging, 0, stats_bytes);
        queue.submit(Some(encoder.finish()));

        read_back(device, &staging)
    }

    /// Run rounds until no block is active or the round cap is hit
    ///
    /// # Errors
    ///
    /// `NonConvergence` as [`crate::Solver::solve`], `Gpu` on device failure.
    pub fn solve(&mut self) -> Result<SolveReport, SolverError> {
        let start = Instant::now();
        let mut rounds = 0;
        let mut blocks_processed = 0;
        while !self.propagation.is_converged() && rounds < self.config.max_rounds {
            blocks_processed += self.step()?.processed;
            rounds += 1;
        }
        let report = SolveReport {
            rounds,
            blocks_processed,
            elapsed: start.elapsed(),
            converged: self.propagation.is_converged(),
        };
        if report.converged {
            info!(
                "GPU solve converged in {} rounds, {:.3}s",
                report.rounds,
                report.elapsed.as_secs_f64()
            );
        } else {
            let active_blocks = self.propagation.active_blocks();
            if self.config.raise_on_non_convergence {
                return Err(SolverError::NonConvergence {
                    rounds,
                    active_blocks,
                });
            }
            warn!(
                "GPU solver did not converge after {} rounds ({} blocks still active)",
                rounds, active_blocks
            );
        }
        Ok(report)
    }

    /// Solution, row-major over the domain
    ///
    /// # Errors
    ///
    /// `Gpu` when the values cannot be read back.
    pub fn values(&self) -> Result<Vec<f32>, SolverError> {
        let device = self.context.device();
        let bytes = (self.grid.size_tot() * std::mem::size_of::<f32>()) as u64;
        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Values Readback"),
            size: bytes,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Values Copy Encoder"),
        });
        encoder.copy_buffer_to_buffer(&self.u_in, 0, &staging, 0, bytes);
        self.context.queue().submit(Some(encoder.finish()));

        let values: Vec<f32> = read_back(device, &staging)?
            .into_iter()
            .map(from_device)
            .collect();
        Ok(self.grid.block_squeeze(&values, 1))
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    pub fn propagation(&self) -> &Propagation {
        &self.propagation
    }

    pub fn adapter_name(&self) -> &str {
        self.context.adapter_name()
    }
}

/// Reject capabilities the device kernel does not implement
fn check_supported(config: &SolverConfig) -> Result<(), ConfigError> {
    let unsupported = [
        (config.order2.is_some(), "second order"),
        (config.multiprecision.is_some(), "multi-precision"),
        (config.factorization.is_some(), "source factorization"),
        (config.drift, "drift"),
        (config.walls, "walls"),
        (config.nmix > 1, "scheme mixing"),
        (config.flow.any(), "flow export"),
        (
            config.scheduling.discipline == Discipline::InPlace,
            "the in-place discipline",
        ),
    ];
    match unsupported.iter().find(|(on, _)| *on) {
        Some(&(_, what)) => Err(ConfigError::Unsupported(what)),
        None => Ok(()),
    }
}

/// Per-node weights and neighbour codes, block layout
fn resolve_stencils<S: Scheme + ?Sized>(
    scheme: &S,
    grid: &Grid,
    data: &crate::problem::BlockData,
    config: &SolverConfig,
) -> Result<(Vec<f32>, Vec<u32>), SolverError> {
    let ndim = grid.ndim();
    let (nsym, nact, ntot) = (config.nsym, config.nact(), config.ntot());
    let size_i = grid.size_i();
    let size_tot = grid.size_tot();

    let mut weights = vec![0.0_f32; size_tot * nact];
    let mut neighbors = vec![INVALID; size_tot * ntot];
    let mut stencil = Stencil::new(nact, ndim);
    let mut geom = Vec::with_capacity(data.geom_size);
    let mut x_t = vec![0_i64; ndim];
    let mut x_i = vec![0_i64; ndim];
    let mut y_i = vec![0_i64; ndim];
    let mut y_t = vec![0_i64; ndim];

    for n_t in 0..size_tot {
        if data.seeds[n_t] {
            continue;
        }
        grid.node_position(n_t, &mut x_t);
        position(n_t % size_i, grid.shape_i(), &mut x_i);
        node_stencil(scheme, data, size_tot, n_t, &x_t, &mut geom, &mut stencil);
        if stencil.radius() > config.stencil_radius {
            return Err(ConfigError::TableMismatch {
                what: "radius",
                expected: config.stencil_radius,
                found: stencil.radius(),
            }
            .into());
        }
        weights[n_t * nact..(n_t + 1) * nact].copy_from_slice(&stencil.weights);

        let mut slot = n_t * ntot;
        for k in 0..nact {
            let sides: &[i64] = if k < nsym { &[-1, 1] } else { &[1] };
            for &eps in sides {
                let e = stencil.offset(k);
                for l in 0..ndim {
                    let o = eps * i64::from(e[l]);
                    y_i[l] = x_i[l] + o;
                    y_t[l] = x_t[l] + o;
                }
                neighbors[slot] = if in_range(&y_i, grid.shape_i()) {
                    LOCAL | index(&y_i, grid.shape_i()) as u32
                } else if grid.contains(&y_t) {
                    grid.index_total(&y_t) as u32
                } else {
                    INVALID
                };
                slot += 1;
            }
        }
    }
    Ok((weights, neighbors))
}

fn to_device(values: &[f32]) -> Vec<f32> {
    values
        .iter()
        .map(|&v| if v.is_finite() { v } else { GPU_INF })
        .collect()
}

fn from_device(v: f32) -> f32 {
    if v >= GPU_INF {
        f32::INFINITY
    } else {
        v
    }
}

/// Map a readback buffer and copy its contents (blocking)
fn read_back(device: &wgpu::Device, staging: &wgpu::Buffer) -> Result<Vec<f32>, SolverError> {
    let slice = staging.slice(..);
    let (sender, receiver) = std::sync::mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |result| {
        sender.send(result).ok();
    });
    device.poll(wgpu::Maintain::Wait);
    match receiver.recv() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(SolverError::Gpu(e.to_string())),
        Err(e) => return Err(SolverError::Gpu(e.to_string())),
    }
    let data = slice.get_mapped_range();
    let values = bytemuck::cast_slice::<u8, f32>(&data).to_vec();
    drop(data);
    staging.unmap();
    Ok(values)
}
