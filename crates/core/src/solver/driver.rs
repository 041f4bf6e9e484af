//! Host side of a solve: round loop, write-back and exports
//!
//! A round fixes the launch list, runs the block kernel on every listed block
//! that does not abort, writes the results back and hands the per-block
//! statistics to the scheduler. Under the strict discipline every block of a
//! round reads the round-start snapshot and the blocks run in parallel on the
//! rayon pool; the in-place discipline visits the list sequentially and
//! writes back immediately.

use std::time::{Duration, Instant};

use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::config::{Discipline, FlowExports, SolverConfig};
use crate::error::{ConfigError, SolverError};
use crate::flow::FlowField;
use crate::grid::Grid;
use crate::problem::{BlockData, Problem};
use crate::scheme::{Scheme, Stencil};

use super::kernel::{node_stencil, BlockKernel, BlockUpdate, KernelInputs};
use super::local::normalize;
use super::propagation::Propagation;

/// Statistics of one round
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoundReport {
    /// Round number, starting at 1
    pub round: usize,
    /// Blocks in the launch list
    pub launched: usize,
    /// Blocks that did not abort
    pub processed: usize,
    /// Processed blocks whose values changed
    pub changed: usize,
    /// Blocks frozen this round
    pub frozen: usize,
    /// Blocks active for the next round
    pub active: usize,
    /// Smallest front estimate over the launch list
    pub front: f32,
}

/// Outcome of [`Solver::solve`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolveReport {
    pub rounds: usize,
    /// Block visits over all rounds
    pub blocks_processed: usize,
    pub elapsed: Duration,
    /// Whether the active list emptied before the round cap
    pub converged: bool,
}

/// Block-parallel eikonal solver
///
/// # Example
///
/// ```
/// use hfm_core::{Isotropic, Problem, Solver, SolverConfig};
///
/// let mut problem = Problem::new(&[5]);
/// problem.add_seed(&[0], 0.0).unwrap();
/// let mut solver = Solver::new(&problem, SolverConfig::isotropic(1), Isotropic).unwrap();
/// solver.solve().unwrap();
/// assert_eq!(solver.values(), vec![0.0, 1.0, 2.0, 3.0, 4.0]);
/// ```
pub struct Solver<S: Scheme> {
    config: SolverConfig,
    grid: Grid,
    scheme: S,
    data: BlockData,
    kernel: BlockKernel,
    propagation: Propagation,
    /// Values, block layout
    u: Vec<f32>,
    /// Precision corrections, empty without multi-precision
    uq: Vec<i32>,
    rounds: usize,
}

impl<S: Scheme> Solver<S> {
    /// Assemble a solver and activate the blocks around the seeds
    ///
    /// # Arguments
    ///
    /// * `problem` - Per-node data over the domain
    /// * `config` - Capabilities and scheduling, validated here
    /// * `scheme` - Stencil provider
    ///
    /// # Errors
    ///
    /// Any inconsistency between the configuration, the problem and the
    /// scheme, see [`ConfigError`] and [`SolverError`].
    pub fn new(problem: &Problem, config: SolverConfig, scheme: S) -> Result<Self, SolverError> {
        config.validate()?;
        if problem.ndim() != config.ndim() {
            return Err(ConfigError::DimensionMismatch {
                what: "block shape",
                expected: problem.ndim(),
                found: config.ndim(),
            }
            .into());
        }
        let grid = Grid::new(problem.shape(), &config.shape_i, &config.periodic)?;
        check_scheme(&scheme, problem, &config, &grid)?;
        if config.drift && !problem.has_drift() {
            return Err(SolverError::MissingData("drift"));
        }
        if config.walls && !problem.has_walls() {
            return Err(SolverError::MissingData("walls"));
        }

        let data = problem.to_blocks(&grid, config.drift, config.walls);
        let radius = match scheme.radius() {
            Some(radius) => radius,
            None => scan_radius(&scheme, &grid, &data, &config),
        };
        if radius > config.stencil_radius {
            return Err(ConfigError::TableMismatch {
                what: "radius",
                expected: config.stencil_radius,
                found: radius,
            }
            .into());
        }

        let mut u = data.values.clone();
        let uq = match &config.multiprecision {
            Some(mp) => {
                let mut uq = vec![0; u.len()];
                for (v, q) in u.iter_mut().zip(&mut uq) {
                    (*v, *q) = normalize(*v, 0, mp);
                }
                uq
            }
            None => Vec::new(),
        };

        let mut propagation = Propagation::new(&grid, &config);
        let size_i = grid.size_i();
        let sources = propagation.activate_sources(&data.values, size_i);

        info!(
            "Solver ready: shape {:?}, blocks {:?} of {:?}, nsym={} nfwd={} nmix={}, {:?} discipline, pruning={}, freeze={:?}",
            grid.shape(),
            grid.shape_o(),
            grid.shape_i(),
            config.nsym,
            config.nfwd,
            config.nmix,
            config.scheduling.discipline,
            config.scheduling.pruning,
            config.scheduling.freeze.map(|f| f.delta),
        );
        debug!(
            "Capabilities: order2={} multiprecision={} factorization={} drift={} walls={}; {} source blocks, {} active",
            config.order2.is_some(),
            config.multiprecision.is_some(),
            config.factorization.is_some(),
            config.drift,
            config.walls,
            sources,
            propagation.active_blocks()
        );

        Ok(Self {
            kernel: BlockKernel::new(&config),
            config,
            grid,
            scheme,
            data,
            propagation,
            u,
            uq,
            rounds: 0,
        })
    }

    /// Run one round
    pub fn step(&mut self) -> RoundReport {
        let Self {
            config,
            grid,
            scheme,
            data,
            kernel,
            propagation,
            u,
            uq,
            rounds,
        } = self;
        *rounds += 1;

        let list = propagation.begin_round().to_vec();
        let frozen = propagation.frozen_blocks();
        let front = propagation.front();
        let size_i = grid.size_i();
        let exports = FlowExports::default();

        let outcomes: Vec<(usize, f32)> = match config.scheduling.discipline {
            Discipline::Strict => {
                let updates: Vec<BlockUpdate> = {
                    let inputs = KernelInputs {
                        grid: &*grid,
                        scheme: &*scheme,
                        data: &*data,
                        u: u.as_slice(),
                        uq: uq.as_slice(),
                    };
                    let sched = &*propagation;
                    let kernel = &*kernel;
                    list.par_iter()
                        .filter(|&&n_o| !sched.abort(n_o))
                        .map_init(
                            || kernel.scratch(size_i),
                            |scratch, &n_o| kernel.update(&inputs, n_o, exports, scratch),
                        )
                        .collect()
                };
                updates
                    .iter()
                    .map(|update| {
                        write_back(u, uq, size_i, update);
                        (update.n_o, update.min_chg)
                    })
                    .collect()
            }
            Discipline::InPlace => {
                let mut scratch = kernel.scratch(size_i);
                let mut outcomes = Vec::with_capacity(list.len());
                for &n_o in &list {
                    if propagation.abort(n_o) {
                        continue;
                    }
                    let update = {
                        let inputs = KernelInputs {
                            grid: &*grid,
                            scheme: &*scheme,
                            data: &*data,
                            u: u.as_slice(),
                            uq: uq.as_slice(),
                        };
                        kernel.update(&inputs, n_o, exports, &mut scratch)
                    };
                    write_back(u, uq, size_i, &update);
                    outcomes.push((n_o, update.min_chg));
                }
                outcomes
            }
        };

        propagation.end_round(&outcomes);
        let report = RoundReport {
            round: *rounds,
            launched: list.len(),
            processed: outcomes.len(),
            changed: outcomes.iter().filter(|(_, c)| *c < f32::INFINITY).count(),
            frozen,
            active: propagation.active_blocks(),
            front,
        };
        debug!(
            "Round {}: {} launched, {} processed, {} changed, {} frozen, {} active, front {:.4}",
            report.round,
            report.launched,
            report.processed,
            report.changed,
            report.frozen,
            report.active,
            report.front
        );
        report
    }

    /// Run rounds until no block is active or the round cap is hit
    ///
    /// # Errors
    ///
    /// `NonConvergence` when the cap is hit and the configuration asks to
    /// fail; otherwise a warning is logged and the report says so.
    pub fn solve(&mut self) -> Result<SolveReport, SolverError> {
        let start = Instant::now();
        let mut rounds = 0;
        let mut blocks_processed = 0;
        while !self.propagation.is_converged() && rounds < self.config.max_rounds {
            blocks_processed += self.step().processed;
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
                "Converged in {} rounds, {} block visits, {:.3}s",
                report.rounds,
                report.blocks_processed,
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
                "Solver did not converge after {} rounds ({} blocks still active)",
                rounds, active_blocks
            );
        }
        Ok(report)
    }

    /// Solution, row-major over the domain, corrections folded in
    pub fn values(&self) -> Vec<f32> {
        match &self.config.multiprecision {
            Some(mp) => {
                let total: Vec<f32> = self
                    .u
                    .iter()
                    .zip(&self.uq)
                    .map(|(&u, &q)| u + q as f32 * mp.step)
                    .collect();
                self.grid.block_squeeze(&total, 1)
            }
            None => self.grid.block_squeeze(&self.u, 1),
        }
    }

    /// Solution with the correction folded in double precision
    pub fn values_f64(&self) -> Vec<f64> {
        let step = self.config.multiprecision.map_or(0.0, |mp| f64::from(mp.step));
        let total: Vec<f64> = if self.uq.is_empty() {
            self.u.iter().map(|&u| f64::from(u)).collect()
        } else {
            self.u
                .iter()
                .zip(&self.uq)
                .map(|(&u, &q)| f64::from(u) + f64::from(q) * step)
                .collect()
        };
        self.grid.block_squeeze(&total, 1)
    }

    /// Values in the block layout, without correction
    pub fn raw_values(&self) -> &[f32] {
        &self.u
    }

    /// Precision corrections in the block layout, empty without multi-precision
    pub fn raw_corrections(&self) -> &[i32] {
        &self.uq
    }

    /// One kernel pass over every block reconstructing the requested exports
    ///
    /// Values are left untouched: the pass recomputes them from the current
    /// state only to select the upwind offsets.
    pub fn extract_flow(&self, exports: FlowExports) -> FlowField {
        let mut field = FlowField::new(&self.grid, self.config.nact(), exports);
        if !exports.any() {
            return field;
        }
        let size_i = self.grid.size_i();
        let inputs = KernelInputs {
            grid: &self.grid,
            scheme: &self.scheme,
            data: &self.data,
            u: &self.u,
            uq: &self.uq,
        };
        let kernel = &self.kernel;
        let updates: Vec<BlockUpdate> = (0..self.grid.size_o())
            .into_par_iter()
            .map_init(
                || kernel.scratch(size_i),
                |scratch, n_o| kernel.update(&inputs, n_o, exports, scratch),
            )
            .collect();
        for update in &updates {
            if let Some(flow) = &update.flow {
                field.write_block(update.n_o, flow);
            }
        }
        debug!("Flow extracted over {} blocks", updates.len());
        field
    }

    /// Flow exports requested by the configuration
    pub fn flow(&self) -> FlowField {
        self.extract_flow(self.config.flow)
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    pub fn scheme(&self) -> &S {
        &self.scheme
    }

    pub fn propagation(&self) -> &Propagation {
        &self.propagation
    }

    /// Rounds run since construction
    pub fn rounds(&self) -> usize {
        self.rounds
    }

    pub fn is_converged(&self) -> bool {
        self.propagation.is_converged()
    }
}

/// Copy a block visit into the shared arrays
fn write_back(u: &mut [f32], uq: &mut [i32], size_i: usize, update: &BlockUpdate) {
    let base = update.n_o * size_i;
    u[base..base + size_i].copy_from_slice(&update.values);
    if !update.valuesq.is_empty() {
        uq[base..base + size_i].copy_from_slice(&update.valuesq);
    }
}

/// Largest offset component over every free node
/// Check a stencil provider against the problem and configuration
///
/// Precomputed tables must hold `nactx` entries of the grid dimension, and
/// the geometry components must match what the problem supplies.
pub(crate) fn check_scheme<S: Scheme + ?Sized>(
    scheme: &S,
    problem: &Problem,
    config: &SolverConfig,
    grid: &Grid,
) -> Result<(), SolverError> {
    if let Some((entries, ndim)) = scheme.table_shape() {
        if entries != config.nactx() {
            return Err(ConfigError::TableMismatch {
                what: "entries",
                expected: config.nactx(),
                found: entries,
            }
            .into());
        }
        if ndim != grid.ndim() {
            return Err(ConfigError::TableMismatch {
                what: "dimension",
                expected: grid.ndim(),
                found: ndim,
            }
            .into());
        }
    }
    if scheme.geom_size() != problem.geom_size() {
        return Err(ConfigError::TableMismatch {
            what: "geometry components",
            expected: scheme.geom_size(),
            found: problem.geom_size(),
        }
        .into());
    }
    Ok(())
}

fn scan_radius<S: Scheme + ?Sized>(
    scheme: &S,
    grid: &Grid,
    data: &BlockData,
    config: &SolverConfig,
) -> usize {
    let mut stencil = Stencil::new(config.nactx(), grid.ndim());
    let mut geom = Vec::with_capacity(data.geom_size);
    let mut x_t = vec![0_i64; grid.ndim()];
    let mut radius = 0;
    for n_t in 0..grid.size_tot() {
        if data.seeds[n_t] {
            continue;
        }
        grid.node_position(n_t, &mut x_t);
        node_stencil(scheme, data, grid.size_tot(), n_t, &x_t, &mut geom, &mut stencil);
        radius = radius.max(stencil.radius());
    }
    radius
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Tolerance;
    use crate::scheme::{Isotropic, StencilTable};

    fn line(n: usize, block: usize) -> (Problem, SolverConfig) {
        let mut problem = Problem::new(&[n]);
        problem.add_seed(&[0], 0.0).unwrap();
        let mut config = SolverConfig::isotropic(1);
        config.shape_i = vec![block];
        config.tolerance = Tolerance::exact();
        (problem, config)
    }

    #[test]
    fn test_line_distance() {
        let (problem, config) = line(5, 2);
        let mut solver = Solver::new(&problem, config, Isotropic).unwrap();
        let report = solver.solve().unwrap();
        assert!(report.converged);
        assert_eq!(solver.values(), vec![0.0, 1.0, 2.0, 3.0, 4.0]);
        // Padding node keeps ∞
        assert!(solver.raw_values()[5].is_infinite());
    }

    #[test]
    fn test_initial_activation_around_seeds() {
        let (problem, config) = line(16, 2);
        let solver = Solver::new(&problem, config, Isotropic).unwrap();
        assert_eq!(solver.propagation().active_blocks(), 2);
        assert_eq!(solver.propagation().min_chg(1), 0.0);
    }

    #[test]
    fn test_step_reports_round() {
        let (problem, config) = line(8, 2);
        let mut solver = Solver::new(&problem, config, Isotropic).unwrap();
        let first = solver.step();
        assert_eq!(first.round, 1);
        assert_eq!(first.launched, 2);
        assert_eq!(first.processed, 2);
        assert_eq!(first.changed, 1);
        assert_eq!(first.front, 0.0);
    }

    #[test]
    fn test_round_cap() {
        let (problem, mut config) = line(64, 2);
        config.max_rounds = 3;
        let mut solver = Solver::new(&problem, config.clone(), Isotropic).unwrap();
        let report = solver.solve().unwrap();
        assert!(!report.converged);
        assert_eq!(report.rounds, 3);

        config.raise_on_non_convergence = true;
        let mut solver = Solver::new(&problem, config, Isotropic).unwrap();
        assert!(matches!(
            solver.solve(),
            Err(SolverError::NonConvergence { rounds: 3, .. })
        ));
    }

    #[test]
    fn test_rejects_mismatched_inputs() {
        let (problem, config) = line(8, 2);

        let mut wrong = config.clone();
        wrong.shape_i = vec![2, 2];
        wrong.periodic = vec![false, false];
        assert!(matches!(
            Solver::new(&problem, wrong, Isotropic),
            Err(SolverError::Config(ConfigError::DimensionMismatch { .. }))
        ));

        let mut walls = config.clone();
        walls.walls = true;
        assert!(matches!(
            Solver::new(&problem, walls, Isotropic),
            Err(SolverError::MissingData("walls"))
        ));

        let table = StencilTable::from_scheme(&Isotropic, &[], 1, 0, 4, 2);
        assert!(matches!(
            Solver::new(&problem, config.clone(), table),
            Err(SolverError::Config(ConfigError::TableMismatch { what: "entries", .. }))
        ));

        let long = |_: &[f32], _: &[i64], s: &mut Stencil| s.set(0, 1.0, &[2]);
        assert!(matches!(
            Solver::new(&problem, config, long),
            Err(SolverError::Config(ConfigError::TableMismatch { what: "radius", found: 2, .. }))
        ));
    }

    #[test]
    fn test_in_place_matches_strict() {
        let (problem, config) = line(12, 3);
        let mut strict = Solver::new(&problem, config.clone(), Isotropic).unwrap();
        strict.solve().unwrap();

        let mut in_place = config;
        in_place.scheduling.discipline = Discipline::InPlace;
        let mut in_place = Solver::new(&problem, in_place, Isotropic).unwrap();
        let report = in_place.solve().unwrap();
        assert!(report.converged);
        assert_eq!(in_place.values(), strict.values());
    }
}
