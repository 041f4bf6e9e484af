//! Error types
//!
//! The block kernel itself has no error channel: out-of-domain neighbours are
//! `∞`, NaN differences count as converged and multi-precision overflow
//! degrades silently. Errors only arise when a configuration or a problem is
//! assembled, before any round runs, and when the driver gives up.

use std::fmt;

/// Inconsistent solver configuration, rejected before any kernel launch
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// Zero-dimensional grid or block shape
    EmptyShape,
    /// Two per-axis descriptions disagree on the dimension
    DimensionMismatch {
        /// Which input had the wrong dimension (e.g. `"periodic"`, `"factor origin"`)
        what: &'static str,
        /// Expected number of axes
        expected: usize,
        /// Number of axes found
        found: usize,
    },
    /// A shape has a zero extent along some axis
    ZeroExtent {
        /// Which shape (e.g. `"block shape"`)
        what: &'static str,
        /// Offending axis
        axis: usize,
    },
    /// A periodic axis is not a multiple of the block extent, so padding would break the wrap
    PeriodicPadding {
        /// Offending axis
        axis: usize,
        /// Domain extent along the axis
        extent: usize,
        /// Block extent along the axis
        block: usize,
    },
    /// No active offsets, or no scheme copy
    StencilCounts {
        /// Symmetric offsets per copy
        nsym: usize,
        /// Forward offsets per copy
        nfwd: usize,
        /// Number of mixed copies
        nmix: usize,
    },
    /// Negative or non-finite convergence tolerance
    Tolerance {
        /// Absolute tolerance
        atol: f32,
        /// Relative tolerance
        rtol: f32,
    },
    /// Non-positive multi-precision step or ceiling
    MultiPrecision {
        /// Step of the integer correction
        step: f32,
        /// Overflow ceiling
        max: f32,
    },
    /// Second order threshold outside `[0, ∞)`
    Order2Threshold(f32),
    /// Factorization metric is not symmetric positive definite
    FactorMetric,
    /// Factorization radius is not positive
    FactorRadius(f32),
    /// Capability needs the separate current/next buffer discipline
    RequiresStrictDiscipline(&'static str),
    /// Causality freezing keeps frozen blocks in the pruned active list
    FreezeRequiresPruning,
    /// Freezing margin is negative or not a number
    FreezeDelta(f32),
    /// A zero iteration or block count where at least one is required
    ZeroCount(&'static str),
    /// Stencil provider disagrees with the configuration
    TableMismatch {
        /// Which quantity (e.g. `"entries"`, `"radius"`)
        what: &'static str,
        /// Expected size
        expected: usize,
        /// Size found
        found: usize,
    },
    /// Capability not implemented by the selected backend
    Unsupported(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyShape => write!(f, "grid and block shapes must have at least one axis"),
            Self::DimensionMismatch {
                what,
                expected,
                found,
            } => write!(f, "{what}: expected {expected} axes, got {found}"),
            Self::ZeroExtent { what, axis } => write!(f, "{what} has zero extent on axis {axis}"),
            Self::PeriodicPadding {
                axis,
                extent,
                block,
            } => write!(
                f,
                "periodic axis {axis} has extent {extent}, not a multiple of the block extent {block}"
            ),
            Self::StencilCounts { nsym, nfwd, nmix } => write!(
                f,
                "stencil needs at least one offset and one copy (nsym={nsym}, nfwd={nfwd}, nmix={nmix})"
            ),
            Self::Tolerance { atol, rtol } => write!(
                f,
                "tolerances must be finite and non-negative (atol={atol}, rtol={rtol})"
            ),
            Self::MultiPrecision { step, max } => write!(
                f,
                "multi-precision step and ceiling must be positive (step={step}, max={max})"
            ),
            Self::Order2Threshold(t) => {
                write!(f, "second order threshold must be non-negative, got {t}")
            }
            Self::FactorMetric => {
                write!(f, "factorization metric must be symmetric positive definite")
            }
            Self::FactorRadius(r) => write!(f, "factorization radius must be positive, got {r}"),
            Self::RequiresStrictDiscipline(what) => write!(
                f,
                "{what} requires the strict (separate current/next buffer) discipline"
            ),
            Self::FreezeRequiresPruning => {
                write!(f, "causality freezing requires the pruned active list")
            }
            Self::FreezeDelta(d) => write!(f, "freezing margin must be non-negative, got {d}"),
            Self::ZeroCount(what) => write!(f, "{what} must be at least one"),
            Self::TableMismatch {
                what,
                expected,
                found,
            } => write!(f, "stencil {what}: expected {expected}, got {found}"),
            Self::Unsupported(what) => write!(f, "{what} is not supported by this backend"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Failure of problem assembly or of a solve
#[derive(Debug, Clone, PartialEq)]
pub enum SolverError {
    /// The configuration was rejected
    Config(ConfigError),
    /// An input array has the wrong length
    Shape {
        /// Which array (e.g. `"cost"`, `"drift"`)
        what: &'static str,
        /// Expected length
        expected: usize,
        /// Length found
        found: usize,
    },
    /// Data required by an enabled capability was not supplied
    MissingData(&'static str),
    /// A position lies outside the domain
    OutOfDomain(Vec<i64>),
    /// The active list did not empty within the round cap
    NonConvergence {
        /// Rounds performed
        rounds: usize,
        /// Blocks still active
        active_blocks: usize,
    },
    /// GPU backend failure
    Gpu(String),
}

impl fmt::Display for SolverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => write!(f, "invalid configuration: {e}"),
            Self::Shape {
                what,
                expected,
                found,
            } => write!(f, "{what}: expected {expected} entries, got {found}"),
            Self::MissingData(what) => write!(f, "missing problem data: {what}"),
            Self::OutOfDomain(x) => write!(f, "position {x:?} is outside the domain"),
            Self::NonConvergence {
                rounds,
                active_blocks,
            } => write!(
                f,
                "solver did not converge after {rounds} rounds ({active_blocks} blocks still active)"
            ),
            Self::Gpu(msg) => write!(f, "GPU backend: {msg}"),
        }
    }
}

impl std::error::Error for SolverError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Config(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConfigError> for SolverError {
    fn from(error: ConfigError) -> Self {
        Self::Config(error)
    }
}
