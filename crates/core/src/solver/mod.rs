//! Block-decomposed fast marching solver
//!
//! The solver is organised bottom-up:
//!
//! - [`local`]: fixed point update of one node from its neighbour values
//! - [`kernel`]: one visit of one block, staging and sweeping its nodes
//! - [`propagation`]: which blocks are visited each round
//! - [`driver`]: the round loop over the rayon pool, exports
//!
//! Shift corrections and wall visibility are separate helpers used by the
//! kernel while resolving neighbours.

mod driver;
mod kernel;
pub mod local;
mod propagation;
pub mod shift;
mod walls;

pub use driver::{RoundReport, SolveReport, Solver};
pub use kernel::{BlockKernel, BlockScratch, BlockUpdate, Neighbor};
pub use local::{normalize, LocalFlow, LocalSolver};
pub use propagation::Propagation;
pub use walls::{Visibility, WallDistance};

#[cfg(feature = "gpu")]
pub(crate) use driver::check_scheme;
#[cfg(feature = "gpu")]
pub(crate) use kernel::node_stencil;
