//! GPU backend (feature `gpu`)
//!
//! Runs the block update as a wgpu compute shader, one workgroup per block
//! with the staged values in workgroup memory. Scheduling stays on the host
//! and uses the same [`crate::solver::Propagation`] as the CPU solver.
//! Only the first order, single copy configuration is implemented; other
//! capabilities are rejected when the solver is built.

mod context;
mod eikonal;

pub use context::{GpuContext, GpuInitResult};
pub use eikonal::GpuSolver;
