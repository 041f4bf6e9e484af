//! Solver configuration
//!
//! Every optional refinement of the update is an independent capability of
//! [`SolverConfig`]. The configuration is fixed for the lifetime of a solve:
//! the solver validates it once at construction and never mutates it.

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default block extent along each axis
pub const DEFAULT_BLOCK_EXTENT: usize = 8;

/// Default second order causality threshold
pub const DEFAULT_ORDER2_THRESHOLD: f32 = 0.3;

/// Convergence tolerance, a node is converged when
/// `|u_old - u_new| <= atol + rtol * |u_new|`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tolerance {
    pub atol: f32,
    pub rtol: f32,
}

impl Default for Tolerance {
    fn default() -> Self {
        Self {
            atol: 1e-6,
            rtol: 1e-6,
        }
    }
}

impl Tolerance {
    /// Zero tolerance: iterate until values stop changing exactly
    pub fn exact() -> Self {
        Self {
            atol: 0.0,
            rtol: 0.0,
        }
    }

    /// Tolerance for a node whose new value is `value`
    #[inline]
    pub fn at(&self, value: f32) -> f32 {
        self.atol + self.rtol * value.abs()
    }
}

/// One-sided second order differences
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Order2 {
    /// Relative mismatch between the first order and the extrapolated
    /// increment beyond which the correction is abandoned
    pub threshold: f32,
}

impl Default for Order2 {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_ORDER2_THRESHOLD,
        }
    }
}

/// Extended precision accumulation, true value `u + uq * step`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MultiPrecision {
    /// Quantum of the integer correction
    pub step: f32,
    /// Ceiling on `|u + uq * step|` above which the correction is dropped
    pub max: f32,
}

impl MultiPrecision {
    /// Correction with quantum `step` and the default ceiling `step * i32::MAX / 2`
    pub fn new(step: f32) -> Self {
        Self {
            step,
            max: step * (i32::MAX / 2) as f32,
        }
    }
}

/// Source factorization: near `origin` the solution is sought as a
/// correction of the distance `d(z) = sqrt(zᵀ M z)` to the origin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Factorization {
    /// Source position, in grid coordinates
    pub origin: Vec<f32>,
    /// Constant symmetric positive definite metric `M`
    pub metric: DMatrix<f32>,
    /// Nodes farther than this from the origin are not corrected
    pub radius: f32,
}

impl Factorization {
    /// Isotropic factorization around `origin` for a local cost `cost`
    pub fn isotropic(origin: Vec<f32>, cost: f32, radius: f32) -> Self {
        let ndim = origin.len();
        Self {
            origin,
            metric: DMatrix::identity(ndim, ndim) * (cost * cost),
            radius,
        }
    }
}

/// Flow export kinds, each independently optional
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowExports {
    /// Weight per active offset
    pub weights: bool,
    /// Sum of the weights
    pub weightsum: bool,
    /// Signed upwind offset per active offset
    pub offsets: bool,
    /// Storage index of the upwind neighbour per active offset
    pub indices: bool,
    /// Weighted sum of the upwind offsets
    pub vector: bool,
}

impl FlowExports {
    /// Every export kind
    pub fn all() -> Self {
        Self {
            weights: true,
            weightsum: true,
            offsets: true,
            indices: true,
            vector: true,
        }
    }

    pub fn any(&self) -> bool {
        self.weights || self.weightsum || self.offsets || self.indices || self.vector
    }
}

/// Buffer discipline of a round
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Discipline {
    /// Blocks read the round-start snapshot and write a separate next buffer
    #[default]
    Strict,
    /// Blocks write back immediately; later blocks may read fresher values
    InPlace,
}

/// Causality based freezing
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Freeze {
    /// Blocks whose front estimate exceeds the global front by more than
    /// `delta` are postponed
    pub delta: f32,
}

/// Scheduling policy of the active list
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Scheduling {
    pub discipline: Discipline,
    /// Launch only the listed active blocks instead of every block
    pub pruning: bool,
    pub freeze: Option<Freeze>,
}

impl Default for Scheduling {
    fn default() -> Self {
        Self {
            discipline: Discipline::Strict,
            pruning: true,
            freeze: None,
        }
    }
}

/// Complete, immutable configuration of a solve
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverConfig {
    /// Block shape
    pub shape_i: Vec<usize>,
    /// Periodic flag per axis
    pub periodic: Vec<bool>,
    /// Symmetric offsets per scheme copy
    pub nsym: usize,
    /// Forward-only offsets per scheme copy
    pub nfwd: usize,
    /// Scheme copies combined by min or max
    pub nmix: usize,
    /// Largest offset component produced by the scheme
    pub stencil_radius: usize,
    /// Local sweeps over a block per visit
    pub niter_i: usize,
    pub tolerance: Tolerance,
    pub order2: Option<Order2>,
    pub multiprecision: Option<MultiPrecision>,
    pub factorization: Option<Factorization>,
    /// Shift neighbours by the per-node drift supplied with the problem
    pub drift: bool,
    /// Skip neighbours hidden behind walls
    pub walls: bool,
    pub flow: FlowExports,
    pub scheduling: Scheduling,
    /// Round cap of [`crate::Solver::solve`]
    pub max_rounds: usize,
    /// Fail instead of warning when the round cap is hit
    pub raise_on_non_convergence: bool,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self::isotropic(2)
    }
}

impl SolverConfig {
    /// First order isotropic configuration in `ndim` dimensions
    ///
    /// One symmetric offset per axis, cubic blocks, pruned active list.
    pub fn isotropic(ndim: usize) -> Self {
        Self {
            shape_i: vec![DEFAULT_BLOCK_EXTENT; ndim],
            periodic: vec![false; ndim],
            nsym: ndim,
            nfwd: 0,
            nmix: 1,
            stencil_radius: 1,
            niter_i: 1,
            tolerance: Tolerance::default(),
            order2: None,
            multiprecision: None,
            factorization: None,
            drift: false,
            walls: false,
            flow: FlowExports::default(),
            scheduling: Scheduling::default(),
            max_rounds: 10_000,
            raise_on_non_convergence: false,
        }
    }

    /// Every block is launched each round, inactive blocks abort immediately
    pub fn global_iteration(mut self) -> Self {
        self.scheduling.pruning = false;
        self.scheduling.freeze = None;
        self
    }

    /// Only active blocks are launched, listed in a pruned active list
    pub fn adaptive_gauss_seidel(mut self) -> Self {
        self.scheduling.pruning = true;
        self
    }

    pub fn ndim(&self) -> usize {
        self.shape_i.len()
    }

    /// Active offsets per scheme copy
    pub fn nact(&self) -> usize {
        self.nsym + self.nfwd
    }

    /// Stencil entries over all copies
    pub fn nactx(&self) -> usize {
        self.nmix * self.nact()
    }

    /// Neighbour slots per copy, symmetric offsets count twice
    pub fn ntot(&self) -> usize {
        2 * self.nsym + self.nfwd
    }

    /// Neighbour slots over all copies
    pub fn ntotx(&self) -> usize {
        self.nmix * self.ntot()
    }

    /// Whether neighbour values carry a shift (factorization or drift)
    pub fn has_shift(&self) -> bool {
        self.factorization.is_some() || self.drift
    }

    /// Reach, in blocks, of a change along each axis
    pub fn block_reach(&self) -> Vec<usize> {
        let reach = self.stencil_radius * if self.order2.is_some() { 2 } else { 1 };
        self.shape_i.iter().map(|&s| reach.div_ceil(s)).collect()
    }

    /// Check the configuration for inconsistencies
    ///
    /// # Errors
    ///
    /// Returns the first inconsistency found, see [`ConfigError`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ndim = self.ndim();
        if ndim == 0 {
            return Err(ConfigError::EmptyShape);
        }
        if self.periodic.len() != ndim {
            return Err(ConfigError::DimensionMismatch {
                what: "periodic",
                expected: ndim,
                found: self.periodic.len(),
            });
        }
        if let Some(axis) = self.shape_i.iter().position(|&n| n == 0) {
            return Err(ConfigError::ZeroExtent {
                what: "block shape",
                axis,
            });
        }
        if self.nact() == 0 || self.nmix == 0 {
            return Err(ConfigError::StencilCounts {
                nsym: self.nsym,
                nfwd: self.nfwd,
                nmix: self.nmix,
            });
        }
        if self.niter_i == 0 {
            return Err(ConfigError::ZeroCount("niter_i"));
        }
        if self.stencil_radius == 0 {
            return Err(ConfigError::ZeroCount("stencil_radius"));
        }

        let Tolerance { atol, rtol } = self.tolerance;
        if !(atol.is_finite() && rtol.is_finite() && atol >= 0.0 && rtol >= 0.0) {
            return Err(ConfigError::Tolerance { atol, rtol });
        }
        if let Some(Order2 { threshold }) = self.order2 {
            if threshold.is_nan() || threshold < 0.0 {
                return Err(ConfigError::Order2Threshold(threshold));
            }
        }
        if let Some(MultiPrecision { step, max }) = self.multiprecision {
            if step.is_nan() || max.is_nan() || step <= 0.0 || max <= 0.0 || step.is_infinite() {
                return Err(ConfigError::MultiPrecision { step, max });
            }
        }
        if let Some(factor) = &self.factorization {
            validate_factorization(factor, ndim)?;
        }

        let Scheduling {
            discipline,
            pruning,
            freeze,
        } = self.scheduling;
        if let Some(Freeze { delta }) = freeze {
            if delta.is_nan() || delta < 0.0 {
                return Err(ConfigError::FreezeDelta(delta));
            }
            if !pruning {
                return Err(ConfigError::FreezeRequiresPruning);
            }
        }
        if discipline == Discipline::InPlace {
            if self.multiprecision.is_some() {
                return Err(ConfigError::RequiresStrictDiscipline("multi-precision"));
            }
            if self.nmix > 1 {
                return Err(ConfigError::RequiresStrictDiscipline("scheme mixing"));
            }
            if freeze.is_some() {
                return Err(ConfigError::RequiresStrictDiscipline("causality freezing"));
            }
        }
        Ok(())
    }
}

fn validate_factorization(factor: &Factorization, ndim: usize) -> Result<(), ConfigError> {
    if factor.origin.len() != ndim {
        return Err(ConfigError::DimensionMismatch {
            what: "factorization origin",
            expected: ndim,
            found: factor.origin.len(),
        });
    }
    let m = &factor.metric;
    if m.nrows() != ndim || m.ncols() != ndim {
        return Err(ConfigError::DimensionMismatch {
            what: "factorization metric",
            expected: ndim,
            found: m.nrows().max(m.ncols()),
        });
    }
    if factor.radius.is_nan() || factor.radius <= 0.0 {
        return Err(ConfigError::FactorRadius(factor.radius));
    }
    let scale = m.amax();
    let asymmetry = (m - m.transpose()).amax();
    if !scale.is_finite() || asymmetry > 1e-5 * scale {
        return Err(ConfigError::FactorMetric);
    }
    if m.clone().cholesky().is_none() {
        return Err(ConfigError::FactorMetric);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = SolverConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ntotx(), 4);
        assert_eq!(config.block_reach(), vec![1, 1]);
    }

    #[test]
    fn test_in_place_rejects_strict_only_capabilities() {
        let mut config = SolverConfig::isotropic(2);
        config.scheduling.discipline = Discipline::InPlace;
        assert!(config.validate().is_ok());

        config.multiprecision = Some(MultiPrecision::new(1.0));
        assert_eq!(
            config.validate(),
            Err(ConfigError::RequiresStrictDiscipline("multi-precision"))
        );

        config.multiprecision = None;
        config.nmix = 2;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::RequiresStrictDiscipline(_))
        ));

        config.nmix = 1;
        config.scheduling.freeze = Some(Freeze { delta: 1.0 });
        assert!(matches!(
            config.validate(),
            Err(ConfigError::RequiresStrictDiscipline(_))
        ));
    }

    #[test]
    fn test_freeze_requires_pruning() {
        let mut config = SolverConfig::isotropic(1).global_iteration();
        config.scheduling.freeze = Some(Freeze { delta: 0.5 });
        assert_eq!(config.validate(), Err(ConfigError::FreezeRequiresPruning));
        assert!(config.adaptive_gauss_seidel().validate().is_ok());
    }

    #[test]
    fn test_factorization_metric_checked() {
        let mut config = SolverConfig::isotropic(2);
        config.factorization = Some(Factorization::isotropic(vec![1.0, 1.0], 1.0, 4.0));
        assert!(config.validate().is_ok());

        let mut factor = Factorization::isotropic(vec![1.0, 1.0], 1.0, 4.0);
        factor.metric = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 1.0]);
        config.factorization = Some(factor);
        assert_eq!(config.validate(), Err(ConfigError::FactorMetric));

        let mut factor = Factorization::isotropic(vec![1.0, 1.0], 1.0, 4.0);
        factor.metric = DMatrix::from_row_slice(2, 2, &[1.0, 0.5, 0.0, 1.0]);
        config.factorization = Some(factor);
        assert_eq!(config.validate(), Err(ConfigError::FactorMetric));

        config.factorization = Some(Factorization::isotropic(vec![1.0], 1.0, 4.0));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_numeric_parameters_checked() {
        let mut config = SolverConfig::isotropic(1);
        config.tolerance.atol = -1.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Tolerance { .. })
        ));

        let mut config = SolverConfig::isotropic(1);
        config.multiprecision = Some(MultiPrecision::new(0.0));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MultiPrecision { .. })
        ));

        let mut config = SolverConfig::isotropic(1);
        config.nsym = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::StencilCounts { .. })
        ));
    }

    #[test]
    fn test_block_reach_accounts_for_order2() {
        let mut config = SolverConfig::isotropic(2);
        config.shape_i = vec![4, 1];
        config.stencil_radius = 2;
        assert_eq!(config.block_reach(), vec![1, 2]);
        config.order2 = Some(Order2::default());
        assert_eq!(config.block_reach(), vec![1, 4]);
    }

    #[test]
    fn test_serde_derives() {
        fn assert_serde<T: Serialize + for<'de> Deserialize<'de>>() {}
        assert_serde::<SolverConfig>();
    }
}
