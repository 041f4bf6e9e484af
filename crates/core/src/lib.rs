//! Block-decomposed fast marching for eikonal equations
//!
//! Solves static Hamilton-Jacobi equations of eikonal type on Cartesian grids
//! with a monotone, causal finite difference scheme supplied by the caller.
//! The grid is cut into blocks of a few nodes; each round the active blocks
//! are updated in parallel, every block owning its scratch memory, and a
//! scheduler decides which blocks need another visit. Rounds repeat until
//! no block changes.
//!
//! ## Layout
//!
//! - [`grid`]: bi-level addressing (block, node within block), periodic axes
//! - [`scheme`]: the stencil provider seam and precomputed stencil tables
//! - [`solver`]: local update, block kernel, scheduler and driver
//! - [`flow`]: upwind flow exports of a converged solution
//! - `gpu` (feature `gpu`): wgpu backend of the block kernel
//!
//! ## Example
//!
//! ```
//! use hfm_core::{Isotropic, Problem, Solver, SolverConfig};
//!
//! let mut problem = Problem::new(&[32, 32]);
//! problem.add_seed(&[16, 16], 0.0).unwrap();
//! let mut solver = Solver::new(&problem, SolverConfig::isotropic(2), Isotropic).unwrap();
//! let report = solver.solve().unwrap();
//! assert!(report.converged);
//! let distance = solver.values();
//! assert_eq!(distance[16 * 32 + 20], 4.0);
//! ```

pub mod config;
pub mod error;
pub mod flow;
pub mod grid;
pub mod problem;
pub mod scheme;
pub mod solver;

#[cfg(feature = "gpu")]
pub mod gpu;

pub use config::{
    Discipline, Factorization, FlowExports, Freeze, MultiPrecision, Order2, Scheduling,
    SolverConfig, Tolerance,
};
pub use error::{ConfigError, SolverError};
pub use flow::FlowField;
pub use grid::Grid;
pub use problem::Problem;
pub use scheme::{Diagonal, Isotropic, Scheme, Stencil, StencilTable};
pub use solver::{Propagation, RoundReport, SolveReport, Solver, Visibility, WallDistance};

#[cfg(feature = "gpu")]
pub use gpu::{GpuContext, GpuInitResult, GpuSolver};
