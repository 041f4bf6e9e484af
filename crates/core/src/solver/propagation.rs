//! Active block scheduling
//!
//! Each block carries an active flag and a front estimate `min_chg`: the
//! smallest value it, or a neighbour whose change reached it, produced
//! while still changing. A round runs as
//!
//! 1. [`Propagation::begin_round`]: the launch list is fixed. Under pruning it
//!    holds the active blocks only, otherwise every block. With freezing, the
//!    front `f` is the smallest estimate over the list and blocks whose
//!    estimate exceeds `f + delta` are frozen for this round.
//! 2. [`Propagation::abort`] at kernel entry skips inactive and frozen blocks.
//! 3. [`Propagation::finalize`] reduces the per-node changes of a block.
//! 4. [`Propagation::end_round`]: processed blocks go dormant, frozen blocks
//!    stay active with their estimate, and every block whose values changed
//!    activates the blocks within stencil reach, itself included, passing on
//!    its statistic.
//!
//! Freezing only defers visits: the block holding the front is never frozen,
//! so every round makes progress and every frozen block is eventually
//! visited. The converged values do not depend on it.

use rustc_hash::FxHashSet;

use crate::config::{Freeze, SolverConfig};
use crate::grid::{in_range_periodic, index_periodic, position, Grid};

/// Scheduler state carried across rounds
#[derive(Debug, Clone)]
pub struct Propagation {
    shape_o: Vec<usize>,
    periodic: Vec<bool>,
    reach: Vec<usize>,
    pruning: bool,
    freeze: Option<Freeze>,
    active: Vec<bool>,
    frozen: Vec<bool>,
    min_chg: Vec<f32>,
    /// Launch list of the current round
    list: Vec<usize>,
    /// Blocks listed next round (pruning only)
    pending: FxHashSet<usize>,
    front: f32,
}

impl Propagation {
    /// All blocks dormant
    pub fn new(grid: &Grid, config: &SolverConfig) -> Self {
        let size_o = grid.size_o();
        Self {
            shape_o: grid.shape_o().to_vec(),
            periodic: grid.periodic().to_vec(),
            reach: config.block_reach(),
            pruning: config.scheduling.pruning,
            freeze: config.scheduling.freeze,
            active: vec![false; size_o],
            frozen: vec![false; size_o],
            min_chg: vec![f32::INFINITY; size_o],
            list: Vec::new(),
            pending: FxHashSet::default(),
            front: f32::INFINITY,
        }
    }

    /// Mark block `n_o` active with front estimate at most `value`
    pub fn activate(&mut self, n_o: usize, value: f32) {
        self.active[n_o] = true;
        self.min_chg[n_o] = self.min_chg[n_o].min(value);
        if self.pruning {
            self.pending.insert(n_o);
        }
    }

    /// Activate every block within stencil reach of `n_o`, itself included
    pub fn activate_neighborhood(&mut self, n_o: usize, value: f32) {
        let ndim = self.shape_o.len();
        let mut x_o = vec![0_i64; ndim];
        position(n_o, &self.shape_o, &mut x_o);

        let span: Vec<usize> = self.reach.iter().map(|&r| 2 * r + 1).collect();
        let count: usize = span.iter().product();
        let mut y_o = vec![0_i64; ndim];
        for m in 0..count {
            let mut code = m;
            for k in (0..ndim).rev() {
                y_o[k] = x_o[k] + (code % span[k]) as i64 - self.reach[k] as i64;
                code /= span[k];
            }
            if in_range_periodic(&y_o, &self.shape_o, &self.periodic) {
                let n = index_periodic(&y_o, &self.shape_o, &self.periodic);
                self.activate(n, value);
            }
        }
    }

    /// Activate, around every block holding a finite value, the blocks it can reach
    ///
    /// `values` is in block layout. Seeds and finite initial values count
    /// alike; the estimate of a source block is its smallest finite value.
    /// Returns the number of source blocks.
    pub fn activate_sources(&mut self, values: &[f32], size_i: usize) -> usize {
        let mut sources = 0;
        for (n_o, block) in values.chunks_exact(size_i).enumerate() {
            let front = block
                .iter()
                .copied()
                .filter(|v| v.is_finite())
                .fold(f32::INFINITY, f32::min);
            if front.is_finite() {
                self.activate_neighborhood(n_o, front);
                sources += 1;
            }
        }
        sources
    }

    /// Fix the launch list of the round and apply freezing
    pub fn begin_round(&mut self) -> &[usize] {
        if self.pruning {
            self.list.clear();
            self.list.extend(self.pending.drain().filter(|&n| self.active[n]));
            self.list.sort_unstable();
        } else if self.list.len() != self.active.len() {
            self.list = (0..self.active.len()).collect();
        }

        self.front = self
            .list
            .iter()
            .filter(|&&n| self.active[n])
            .map(|&n| self.min_chg[n])
            .fold(f32::INFINITY, f32::min);
        if let Some(Freeze { delta }) = self.freeze {
            let threshold = self.front + delta;
            for &n in &self.list {
                self.frozen[n] = self.min_chg[n] > threshold;
            }
        }
        &self.list
    }

    /// Whether block `n_o` skips this round
    #[inline]
    pub fn abort(&self, n_o: usize) -> bool {
        !self.active[n_o] || self.frozen[n_o]
    }

    /// Reduce the per-node changes of a block to its statistic
    ///
    /// Converged nodes hold `∞`; the result is `∞` when all converged.
    pub fn finalize(chg: &[f32]) -> f32 {
        chg.iter().copied().fold(f32::INFINITY, f32::min)
    }

    /// Consume the statistics of the blocks processed this round
    ///
    /// `outcomes` lists `(n_o, min_chg)` for every block that did not abort.
    pub fn end_round(&mut self, outcomes: &[(usize, f32)]) {
        for &(n, _) in outcomes {
            self.active[n] = false;
            self.min_chg[n] = f32::INFINITY;
        }
        for i in 0..self.list.len() {
            let n = self.list[i];
            if self.frozen[n] {
                self.frozen[n] = false;
                if self.pruning {
                    self.pending.insert(n);
                }
            }
        }
        for &(n, chg) in outcomes {
            if chg < f32::INFINITY {
                self.activate_neighborhood(n, chg);
            }
        }
    }

    /// No block is active: the values are a fixed point
    pub fn is_converged(&self) -> bool {
        !self.active.iter().any(|&a| a)
    }

    pub fn active_blocks(&self) -> usize {
        self.active.iter().filter(|&&a| a).count()
    }

    /// Blocks frozen in the current round
    pub fn frozen_blocks(&self) -> usize {
        self.list.iter().filter(|&&n| self.frozen[n]).count()
    }

    /// Smallest front estimate over the current launch list
    pub fn front(&self) -> f32 {
        self.front
    }

    pub fn is_active(&self, n_o: usize) -> bool {
        self.active[n_o]
    }

    /// Front estimate of block `n_o`
    pub fn min_chg(&self, n_o: usize) -> f32 {
        self.min_chg[n_o]
    }
}
