//! Block update kernel
//!
//! One invocation processes one block of `size_i` nodes and owns all its
//! scratch memory. The work is staged like a GPU work-group:
//!
//! 1. Every node fetches its stencil, stages its current value (`rhs` on
//!    seeds) and resolves each neighbour slot either to a same-block local
//!    index or to a value read from the round-start snapshot (`∞` outside
//!    the domain), shift corrections included.
//! 2. Once every node is staged, the local solver runs on each free node,
//!    `niter_i` Jacobi sweeps over the staged block values.
//! 3. Flow exports are reconstructed from the last sweep, and the change of
//!    each node is reduced to the block statistic: the smallest new value
//!    among the nodes that moved by more than the tolerance.
//!
//! The kernel never writes the shared arrays; it returns a [`BlockUpdate`]
//! that the driver writes back.

use crate::config::{FlowExports, MultiPrecision, SolverConfig, Tolerance};
use crate::flow::BlockFlow;
use crate::grid::{in_range, index, position, Grid, INVALID_INDEX};
use crate::problem::BlockData;
use crate::scheme::{Scheme, Stencil};

use super::local::{normalize, Candidate, LocalFlow, LocalSolver, NodeInput};
use super::propagation::Propagation;
use super::shift::{drift_shift, FactorShift, SidePair};
use super::walls::Visibility;

/// Resolved neighbour slot
///
/// A same-block neighbour is read from the staged block values at each sweep,
/// `value` then holds only its shift. Other neighbours are read once from the
/// snapshot, shift included.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub local: Option<usize>,
    pub value: f32,
    pub valueq: i32,
}

impl Neighbor {
    /// Outside the domain, or hidden behind a wall
    pub const UNREACHABLE: Self = Self {
        local: None,
        value: f32::INFINITY,
        valueq: 0,
    };
}

/// Read-only inputs of a round
pub(crate) struct KernelInputs<'a, S: ?Sized> {
    pub grid: &'a Grid,
    pub scheme: &'a S,
    pub data: &'a BlockData,
    /// Round-start values, block layout
    pub u: &'a [f32],
    /// Round-start corrections, empty without multi-precision
    pub uq: &'a [i32],
}

/// Result of one block visit
#[derive(Debug, Clone, PartialEq)]
pub struct BlockUpdate {
    pub n_o: usize,
    pub values: Vec<f32>,
    /// Empty without multi-precision
    pub valuesq: Vec<i32>,
    /// Smallest new value among the nodes still changing, `∞` if none
    pub min_chg: f32,
    pub flow: Option<BlockFlow>,
}

/// Task-owned buffers of one block visit
#[derive(Debug, Clone)]
pub struct BlockScratch {
    u_i: Vec<f32>,
    uq_i: Vec<i32>,
    next_u: Vec<f32>,
    next_uq: Vec<i32>,
    u_old: Vec<f32>,
    uq_old: Vec<i32>,
    seed: Vec<bool>,
    rhs: Vec<f32>,
    chg: Vec<f32>,

    weights: Vec<f32>,
    offsets: Vec<i32>,
    mix_is_min: Vec<bool>,
    nb: Vec<Neighbor>,
    nb2: Vec<Neighbor>,

    flow_weights: Vec<f32>,
    flow_side: Vec<u8>,
    flow_kmix: Vec<usize>,

    v: Vec<f32>,
    vq: Vec<i32>,
    v2: Vec<f32>,
    vq2: Vec<i32>,
    cands: Vec<Candidate>,
    flow: LocalFlow,

    origin: Vec<i64>,
    x_i: Vec<i64>,
    x_t: Vec<i64>,
    y_i: Vec<i64>,
    y_t: Vec<i64>,
    x_rel: Vec<f32>,
    e: Vec<i32>,
    offset: Vec<i32>,
    /// Scaled offset and sample position of the wall test
    sight: Vec<i32>,
    sample: Vec<i64>,
    geom: Vec<f32>,
    drift: Vec<f32>,
    stencil: Stencil,
}

/// Block update with the capabilities of a configuration
#[derive(Debug, Clone)]
pub struct BlockKernel {
    ndim: usize,
    nsym: usize,
    nact: usize,
    nactx: usize,
    ntotx: usize,
    niter_i: usize,
    tolerance: Tolerance,
    order2: bool,
    multiprecision: Option<MultiPrecision>,
    factor: Option<FactorShift>,
    drift: bool,
    walls: bool,
    local: LocalSolver,
}

impl BlockKernel {
    pub fn new(config: &SolverConfig) -> Self {
        Self {
            ndim: config.ndim(),
            nsym: config.nsym,
            nact: config.nact(),
            nactx: config.nactx(),
            ntotx: config.ntotx(),
            niter_i: config.niter_i,
            tolerance: config.tolerance,
            order2: config.order2.is_some(),
            multiprecision: config.multiprecision,
            factor: config.factorization.as_ref().map(FactorShift::new),
            drift: config.drift,
            walls: config.walls,
            local: LocalSolver::new(config),
        }
    }

    /// Fresh buffers for blocks of `size_i` nodes
    pub fn scratch(&self, size_i: usize) -> BlockScratch {
        let (ndim, nactx, ntotx) = (self.ndim, self.nactx, self.ntotx);
        let n2 = if self.order2 { ntotx } else { 0 };
        BlockScratch {
            u_i: vec![0.0; size_i],
            uq_i: vec![0; size_i],
            next_u: vec![0.0; size_i],
            next_uq: vec![0; size_i],
            u_old: vec![0.0; size_i],
            uq_old: vec![0; size_i],
            seed: vec![false; size_i],
            rhs: vec![0.0; size_i],
            chg: vec![f32::INFINITY; size_i],
            weights: vec![0.0; size_i * nactx],
            offsets: vec![0; size_i * nactx * ndim],
            mix_is_min: vec![true; size_i],
            nb: vec![Neighbor::UNREACHABLE; size_i * ntotx],
            nb2: vec![Neighbor::UNREACHABLE; size_i * n2],
            flow_weights: vec![0.0; size_i * self.nact],
            flow_side: vec![0; size_i * self.nsym],
            flow_kmix: vec![0; size_i],
            v: vec![0.0; ntotx],
            vq: vec![0; ntotx],
            v2: vec![0.0; n2],
            vq2: vec![0; n2],
            cands: Vec::with_capacity(self.nact),
            flow: LocalFlow::new(self.nact, self.nsym),
            origin: vec![0; ndim],
            x_i: vec![0; ndim],
            x_t: vec![0; ndim],
            y_i: vec![0; ndim],
            y_t: vec![0; ndim],
            x_rel: vec![0.0; ndim],
            e: vec![0; ndim],
            offset: vec![0; ndim],
            sight: vec![0; ndim],
            sample: vec![0; ndim],
            geom: Vec::new(),
            drift: vec![0.0; ndim],
            stencil: Stencil::new(nactx, ndim),
        }
    }

    /// Process block `n_o`
    ///
    /// # Arguments
    ///
    /// * `inputs` - Round-start snapshot and problem data
    /// * `n_o` - Block index
    /// * `exports` - Flow kinds to reconstruct, none during ordinary rounds
    /// * `s` - Scratch buffers from [`BlockKernel::scratch`]
    pub(crate) fn update<S: Scheme + ?Sized>(
        &self,
        inputs: &KernelInputs<'_, S>,
        n_o: usize,
        exports: FlowExports,
        s: &mut BlockScratch,
    ) -> BlockUpdate {
        let grid = inputs.grid;
        let size_i = grid.size_i();
        let base = n_o * size_i;
        grid.block_origin(n_o, &mut s.origin);

        for n_i in 0..size_i {
            self.locate(grid, n_i, s);
            self.stage_node(inputs, n_i, base + n_i, s);
        }

        let record = exports.any();
        for sweep in 0..self.niter_i {
            let last = sweep + 1 == self.niter_i;
            for n_i in 0..size_i {
                if s.seed[n_i] {
                    s.next_u[n_i] = s.u_i[n_i];
                    s.next_uq[n_i] = s.uq_i[n_i];
                    if record && last {
                        s.flow.clear();
                        self.store_flow(n_i, s);
                    }
                    continue;
                }
                self.solve_node(n_i, record && last, s);
            }
            std::mem::swap(&mut s.u_i, &mut s.next_u);
            std::mem::swap(&mut s.uq_i, &mut s.next_uq);
        }

        let flow = record.then(|| self.export_flow(grid, exports, s));
        let min_chg = self.reduce_change(s);

        BlockUpdate {
            n_o,
            values: s.u_i.clone(),
            valuesq: if self.multiprecision.is_some() {
                s.uq_i.clone()
            } else {
                Vec::new()
            },
            min_chg,
            flow,
        }
    }

    /// Inner and total position of node `n_i`
    fn locate(&self, grid: &Grid, n_i: usize, s: &mut BlockScratch) {
        position(n_i, grid.shape_i(), &mut s.x_i);
        for k in 0..self.ndim {
            s.x_t[k] = s.origin[k] + s.x_i[k];
        }
    }

    fn stage_node<S: Scheme + ?Sized>(
        &self,
        inputs: &KernelInputs<'_, S>,
        n_i: usize,
        n_t: usize,
        s: &mut BlockScratch,
    ) {
        let (ndim, nactx, ntotx) = (self.ndim, self.nactx, self.ntotx);
        let data = inputs.data;
        let size_tot = inputs.grid.size_tot();

        node_stencil(inputs.scheme, data, size_tot, n_t, &s.x_t, &mut s.geom, &mut s.stencil);
        s.weights[n_i * nactx..(n_i + 1) * nactx].copy_from_slice(&s.stencil.weights);
        s.offsets[n_i * nactx * ndim..(n_i + 1) * nactx * ndim].copy_from_slice(&s.stencil.offsets);
        s.mix_is_min[n_i] = s.stencil.mix_is_min;

        let u_old = inputs.u[n_t];
        let uq_old = if self.multiprecision.is_some() {
            inputs.uq[n_t]
        } else {
            0
        };
        s.u_old[n_i] = u_old;
        s.uq_old[n_i] = uq_old;
        s.seed[n_i] = data.seeds[n_t];
        s.rhs[n_i] = data.rhs[n_t];

        if s.seed[n_i] {
            let (u, uq) = match &self.multiprecision {
                Some(mp) => normalize(s.rhs[n_i], 0, mp),
                None => (s.rhs[n_i], 0),
            };
            s.u_i[n_i] = u;
            s.uq_i[n_i] = uq;
            return;
        }
        s.u_i[n_i] = u_old;
        s.uq_i[n_i] = uq_old;

        let factors = match &self.factor {
            Some(factor) => factor.relative(&s.x_t, &mut s.x_rel),
            None => false,
        };
        let drift = match (&data.drift, self.drift) {
            (Some(drift), true) => {
                for k in 0..ndim {
                    s.drift[k] = drift[n_t + size_tot * k];
                }
                true
            }
            _ => false,
        };
        let walls: Option<&dyn Visibility> = if self.walls {
            data.walls.as_ref().map(|w| w as &dyn Visibility)
        } else {
            None
        };

        let mut kv = n_i * ntotx;
        for kx in 0..nactx {
            let kact = kx % self.nact;
            let start = (n_i * nactx + kx) * ndim;
            s.e.copy_from_slice(&s.offsets[start..start + ndim]);

            let mut fact: SidePair = [0.0; 2];
            let mut fact2: SidePair = [0.0; 2];
            if factors {
                if let Some(factor) = &self.factor {
                    factor.sym(&s.x_rel, &s.e, &mut fact, self.order2.then_some(&mut fact2));
                }
            }
            if drift {
                drift_shift(&s.drift, &s.e, &mut fact);
            }

            for side in 0..2_usize {
                if side == 0 && kact >= self.nsym {
                    continue;
                }
                let eps = if side == 0 { -1 } else { 1 };
                for k in 0..ndim {
                    s.offset[k] = eps * s.e[k];
                }

                s.nb[kv] = self.neighbor(inputs, walls, 1, fact[side], s);
                if self.order2 {
                    s.nb2[kv] = if s.nb[kv] == Neighbor::UNREACHABLE {
                        Neighbor::UNREACHABLE
                    } else {
                        self.neighbor(inputs, walls, 2, fact2[side], s)
                    };
                }
                kv += 1;
            }
        }
    }

    /// Resolve the neighbour at `x_t + mult * offset`
    fn neighbor<S: ?Sized>(
        &self,
        inputs: &KernelInputs<'_, S>,
        walls: Option<&dyn Visibility>,
        mult: i64,
        shift: f32,
        s: &mut BlockScratch,
    ) -> Neighbor {
        let grid = inputs.grid;
        for k in 0..self.ndim {
            let o = mult * i64::from(s.offset[k]);
            s.y_i[k] = s.x_i[k] + o;
            s.y_t[k] = s.x_t[k] + o;
            s.sight[k] = o as i32;
        }
        if let Some(walls) = walls {
            if !walls.visible(grid, &s.x_t, &s.sight, &mut s.sample) {
                return Neighbor::UNREACHABLE;
            }
        }

        if in_range(&s.y_i, grid.shape_i()) {
            Neighbor {
                local: Some(index(&s.y_i, grid.shape_i())),
                value: shift,
                valueq: 0,
            }
        } else if grid.contains(&s.y_t) {
            let n = grid.index_total(&s.y_t);
            Neighbor {
                local: None,
                value: inputs.u[n] + shift,
                valueq: if self.multiprecision.is_some() {
                    inputs.uq[n]
                } else {
                    0
                },
            }
        } else {
            Neighbor::UNREACHABLE
        }
    }

    fn solve_node(&self, n_i: usize, record: bool, s: &mut BlockScratch) {
        let ntotx = self.ntotx;
        let resolve = |nb: &Neighbor, u_i: &[f32], uq_i: &[i32]| match nb.local {
            Some(j) => (u_i[j] + nb.value, uq_i[j]),
            None => (nb.value, nb.valueq),
        };
        for kv in 0..ntotx {
            (s.v[kv], s.vq[kv]) = resolve(&s.nb[n_i * ntotx + kv], &s.u_i, &s.uq_i);
        }
        if self.order2 {
            for kv in 0..ntotx {
                (s.v2[kv], s.vq2[kv]) = resolve(&s.nb2[n_i * ntotx + kv], &s.u_i, &s.uq_i);
            }
        }

        let input = NodeInput {
            rhs: s.rhs[n_i],
            weights: &s.weights[n_i * self.nactx..(n_i + 1) * self.nactx],
            mix_is_min: s.mix_is_min[n_i],
            v: &s.v,
            vq: &s.vq,
            v2: &s.v2,
            vq2: &s.vq2,
        };
        let (u, uq) = self
            .local
            .solve(&input, &mut s.cands, record.then_some(&mut s.flow));
        s.next_u[n_i] = u;
        s.next_uq[n_i] = uq;
        if record {
            self.store_flow(n_i, s);
        }
    }

    fn store_flow(&self, n_i: usize, s: &mut BlockScratch) {
        let (nact, nsym) = (self.nact, self.nsym);
        s.flow_weights[n_i * nact..(n_i + 1) * nact].copy_from_slice(&s.flow.weights);
        s.flow_side[n_i * nsym..(n_i + 1) * nsym].copy_from_slice(&s.flow.active_side);
        s.flow_kmix[n_i] = s.flow.kmix;
    }

    fn export_flow(&self, grid: &Grid, exports: FlowExports, s: &mut BlockScratch) -> BlockFlow {
        let (ndim, nact, nactx) = (self.ndim, self.nact, self.nactx);
        let size_i = grid.size_i();
        let mut out = BlockFlow::new(exports, size_i, nact, ndim);

        for n_i in 0..size_i {
            self.locate(grid, n_i, s);
            let kmix = s.flow_kmix[n_i];
            let mut weightsum = 0.0;
            for k in 0..nact {
                let w = s.flow_weights[n_i * nact + k];
                weightsum += w;
                let eps = if k < self.nsym {
                    2 * i32::from(s.flow_side[n_i * self.nsym + k]) - 1
                } else {
                    1
                };
                let start = (n_i * nactx + kmix * nact + k) * ndim;
                for l in 0..ndim {
                    let o = eps * s.offsets[start + l];
                    s.y_t[l] = s.x_t[l] + i64::from(o);
                    if exports.offsets {
                        out.offsets[n_i + size_i * (k + nact * l)] = o;
                    }
                    if exports.vector {
                        out.vector[n_i + size_i * l] += w * o as f32;
                    }
                }
                if exports.weights {
                    out.weights[n_i + size_i * k] = w;
                }
                if exports.indices {
                    out.indices[n_i + size_i * k] = if grid.contains(&s.y_t) {
                        grid.index_total(&s.y_t)
                    } else {
                        INVALID_INDEX
                    };
                }
            }
            if exports.weightsum {
                out.weightsum[n_i] = weightsum;
            }
        }
        out
    }

    fn reduce_change(&self, s: &mut BlockScratch) -> f32 {
        for n_i in 0..s.u_i.len() {
            let (u_new, uq_new) = (s.u_i[n_i], s.uq_i[n_i]);
            let (diff, total) = match &self.multiprecision {
                Some(mp) => {
                    let dq = (i64::from(s.uq_old[n_i]) - i64::from(uq_new)) as f32;
                    (
                        (s.u_old[n_i] - u_new + dq * mp.step).abs(),
                        u_new + uq_new as f32 * mp.step,
                    )
                }
                None => ((s.u_old[n_i] - u_new).abs(), u_new),
            };
            // NaN (∞ - ∞ at the boundary) compares false: converged
            s.chg[n_i] = if diff > self.tolerance.at(total) {
                total
            } else {
                f32::INFINITY
            };
        }
        Propagation::finalize(&s.chg)
    }
}

/// Stencil of the node stored at `n_t`, gathering its geometry components
pub(crate) fn node_stencil<S: Scheme + ?Sized>(
    scheme: &S,
    data: &BlockData,
    size_tot: usize,
    n_t: usize,
    x_t: &[i64],
    geom: &mut Vec<f32>,
    stencil: &mut Stencil,
) {
    geom.clear();
    geom.extend((0..data.geom_size).map(|k| data.geom[n_t + size_tot * k]));
    stencil.weights.fill(0.0);
    scheme.stencil(geom, x_t, stencil);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::problem::Problem;
    use crate::scheme::Isotropic;

    struct Setup {
        grid: Grid,
        data: BlockData,
        kernel: BlockKernel,
    }

    fn setup_1d(n: usize, block: usize, niter_i: usize) -> Setup {
        let mut config = SolverConfig::isotropic(1);
        config.shape_i = vec![block];
        config.niter_i = niter_i;
        config.tolerance = Tolerance::exact();
        let grid = Grid::new(&[n], &[block], &[false]).unwrap();
        let mut problem = Problem::new(&[n]);
        problem.add_seed(&[0], 0.0).unwrap();
        Setup {
            data: problem.to_blocks(&grid, false, false),
            kernel: BlockKernel::new(&config),
            grid,
        }
    }

    fn run(setup: &Setup, u: &[f32], n_o: usize, exports: FlowExports) -> BlockUpdate {
        let inputs = KernelInputs {
            grid: &setup.grid,
            scheme: &Isotropic,
            data: &setup.data,
            u,
            uq: &[],
        };
        let mut scratch = setup.kernel.scratch(setup.grid.size_i());
        setup.kernel.update(&inputs, n_o, exports, &mut scratch)
    }

    #[test]
    fn test_single_sweep_is_jacobi() {
        let setup = setup_1d(4, 4, 1);
        let update = run(&setup, &setup.data.values, 0, FlowExports::default());
        assert_eq!(update.values[..2], [0.0, 1.0]);
        assert!(update.values[2].is_infinite());
        assert_eq!(update.min_chg, 1.0);
    }

    #[test]
    fn test_inner_sweeps_propagate_through_block() {
        let setup = setup_1d(4, 4, 4);
        let update = run(&setup, &setup.data.values, 0, FlowExports::default());
        assert_eq!(update.values, vec![0.0, 1.0, 2.0, 3.0]);
        assert_eq!(update.min_chg, 1.0);
        assert!(update.valuesq.is_empty());
    }

    #[test]
    fn test_reads_neighbouring_block_from_snapshot() {
        let setup = setup_1d(4, 2, 1);
        let u = [0.0, 1.0, f32::INFINITY, f32::INFINITY];
        let update = run(&setup, &u, 1, FlowExports::default());
        assert_eq!(update.values[0], 2.0);
        assert!(update.values[1].is_infinite());
        assert_eq!(update.min_chg, 2.0);
    }

    #[test]
    fn test_converged_block_reports_infinity() {
        let setup = setup_1d(4, 2, 1);
        let u = [0.0, 1.0, 2.0, 3.0];
        let update = run(&setup, &u, 1, FlowExports::default());
        assert_eq!(update.values, vec![2.0, 3.0]);
        assert!(update.min_chg.is_infinite());

        // All nodes at ∞: ∞ - ∞ is not a change
        let u = [f32::INFINITY; 4];
        assert!(run(&setup, &u, 1, FlowExports::default()).min_chg.is_infinite());
    }

    #[test]
    fn test_flow_export() {
        let setup = setup_1d(4, 2, 1);
        let u = [0.0, 1.0, 2.0, 3.0];
        let seed_block = run(&setup, &u, 0, FlowExports::all());
        let flow = seed_block.flow.unwrap();
        // Seed: no flow
        assert_eq!(flow.weights[0], 0.0);
        assert_eq!(flow.weightsum[0], 0.0);
        assert_eq!(flow.vector[0], 0.0);
        // Node 1 looks back at node 0
        assert_eq!(flow.weights[1], 1.0);
        assert_eq!(flow.offsets[1], -1);
        assert_eq!(flow.indices[1], 0);
        assert_eq!(flow.vector[1], -1.0);

        let far_block = run(&setup, &u, 1, FlowExports::all()).flow.unwrap();
        assert_eq!(far_block.indices, vec![1, 2]);
    }

    #[test]
    fn test_walls_hide_neighbours() {
        let mut config = SolverConfig::isotropic(1);
        config.shape_i = vec![4];
        config.walls = true;
        config.niter_i = 4;
        let grid = Grid::new(&[4], &[4], &[false]).unwrap();
        let mut problem = Problem::new(&[4]);
        problem.add_seed(&[0], 0.0).unwrap();
        problem.set_walls(vec![false, false, true, false]).unwrap();
        let setup = Setup {
            data: problem.to_blocks(&grid, false, true),
            kernel: BlockKernel::new(&config),
            grid,
        };
        let update = run(&setup, &setup.data.values, 0, FlowExports::default());
        assert_eq!(update.values[1], 1.0);
        assert!(update.values[2].is_infinite());
        assert!(update.values[3].is_infinite());
    }
}
