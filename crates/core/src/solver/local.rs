//! Local fixed-point update of one node
//!
//! Given the neighbour values seen through the stencil, solves for the
//! largest `u` such that
//!
//! ```text
//! Σ_k  w_k · max(0, u - v_k)²  =  rhs²
//! ```
//!
//! where `v_k` is the smaller neighbour along symmetric offset `k` (either
//! side), or the single neighbour along a forward offset. Candidates are
//! sorted increasingly and added one at a time while they stay below the
//! running solution, which keeps the update monotone and causal: a neighbour
//! at `∞` is never selected.
//!
//! # Refinements
//!
//! - Second order: an active offset whose next neighbour along the same ray
//!   is consistent with the first order solution (within `threshold`) is
//!   replaced by the one-sided second order difference
//!   `(3u - 4v + v2) / 2`, i.e. value `v + (v - v2)/3` and weight `9w/4`.
//! - Multi-precision: values are compared relative to the integer correction
//!   of the smallest neighbour, see [`normalize`].
//! - Mixing: `nmix` stencil copies are solved independently and combined by
//!   min or max; the winning copy is recorded for flow export.

use crate::config::{MultiPrecision, SolverConfig};

/// Fold the extended precision pair `(u, uq)` so that `0 <= u < step`
///
/// Non-finite values, and values whose magnitude reaches `max`, drop the
/// correction: the pair degrades to a single float.
#[inline]
pub fn normalize(u: f32, uq: i32, mp: &MultiPrecision) -> (f32, i32) {
    let total = u + uq as f32 * mp.step;
    if !u.is_finite() || total.abs() >= mp.max {
        return (total, 0);
    }
    let n = (u / mp.step).floor();
    (u - n * mp.step, uq.saturating_add(n as i32))
}

/// Neighbour data of one free node
#[derive(Debug, Clone, Copy)]
pub struct NodeInput<'a> {
    pub rhs: f32,
    /// Stencil weights, `nactx` entries
    pub weights: &'a [f32],
    pub mix_is_min: bool,
    /// Neighbour values, one per slot (`ntotx`)
    pub v: &'a [f32],
    /// Integer corrections of `v`, zero without multi-precision
    pub vq: &'a [i32],
    /// Next neighbour along the same ray, empty without second order
    pub v2: &'a [f32],
    pub vq2: &'a [i32],
}

/// Upwind data of the last update, for flow export
#[derive(Debug, Clone, PartialEq)]
pub struct LocalFlow {
    /// `w_k (u - v_k)` per active offset of the winning copy, zero if not upwind
    pub weights: Vec<f32>,
    /// Side (0 for `-e`, 1 for `+e`) of each symmetric offset
    pub active_side: Vec<u8>,
    /// Winning stencil copy
    pub kmix: usize,
}

impl LocalFlow {
    pub fn new(nact: usize, nsym: usize) -> Self {
        Self {
            weights: vec![0.0; nact],
            active_side: vec![0; nsym],
            kmix: 0,
        }
    }

    /// Flow of a seed: no upwind offset
    pub fn clear(&mut self) {
        self.weights.fill(0.0);
        self.active_side.fill(0);
        self.kmix = 0;
    }
}

/// Candidate upwind neighbour of one offset
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    /// Neighbour value, relative to the reference correction
    pub t: f32,
    pub w: f32,
    /// Offset within its copy
    pub k: usize,
    pub side: u8,
    /// Neighbour slot
    pub slot: usize,
}

/// Per-node solver, built once from the configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalSolver {
    nsym: usize,
    nfwd: usize,
    nmix: usize,
    order2: Option<f32>,
    multiprecision: Option<MultiPrecision>,
}

impl LocalSolver {
    pub fn new(config: &SolverConfig) -> Self {
        Self {
            nsym: config.nsym,
            nfwd: config.nfwd,
            nmix: config.nmix,
            order2: config.order2.map(|o| o.threshold),
            multiprecision: config.multiprecision,
        }
    }

    fn nact(&self) -> usize {
        self.nsym + self.nfwd
    }

    fn ntot(&self) -> usize {
        2 * self.nsym + self.nfwd
    }

    /// First neighbour slot of offset `k` in copy `kmix`
    #[inline]
    pub fn slot(&self, kmix: usize, k: usize) -> usize {
        let within = if k < self.nsym { 2 * k } else { self.nsym + k };
        kmix * self.ntot() + within
    }

    /// Solve for the new value of a free node
    ///
    /// Returns the pair `(u, uq)`, normalized when multi-precision is enabled
    /// (`uq == 0` otherwise). When `flow` is given it receives the upwind
    /// weights of the winning copy.
    pub fn solve(
        &self,
        input: &NodeInput<'_>,
        cands: &mut Vec<Candidate>,
        mut flow: Option<&mut LocalFlow>,
    ) -> (f32, i32) {
        let q_ref = self.reference_q(input);

        let mut best: Option<f32> = None;
        for kmix in 0..self.nmix {
            let value = self.solve_copy(input, kmix, q_ref, cands);
            let wins = match best {
                None => true,
                Some(b) if input.mix_is_min => value < b,
                Some(b) => value > b,
            };
            if wins {
                best = Some(value);
                if let Some(flow) = flow.as_deref_mut() {
                    record_flow(value, cands, kmix, flow);
                }
            }
        }
        let value = best.unwrap_or(f32::INFINITY);

        match &self.multiprecision {
            Some(mp) => normalize(value, q_ref, mp),
            None => (value, 0),
        }
    }

    /// Correction of the smallest finite neighbour, the common reference
    fn reference_q(&self, input: &NodeInput<'_>) -> i32 {
        let Some(mp) = &self.multiprecision else {
            return 0;
        };
        let step = f64::from(mp.step);
        let mut best = f64::INFINITY;
        let mut q_ref = 0;
        for (&v, &q) in input.v.iter().zip(input.vq) {
            let total = f64::from(v) + f64::from(q) * step;
            if total < best {
                best = total;
                q_ref = q;
            }
        }
        q_ref
    }

    #[inline]
    fn relative(&self, v: f32, q: i32, q_ref: i32) -> f32 {
        match &self.multiprecision {
            Some(mp) if q != q_ref => v + (i64::from(q) - i64::from(q_ref)) as f32 * mp.step,
            _ => v,
        }
    }

    fn solve_copy(
        &self,
        input: &NodeInput<'_>,
        kmix: usize,
        q_ref: i32,
        cands: &mut Vec<Candidate>,
    ) -> f32 {
        cands.clear();
        let nact = self.nact();
        for k in 0..nact {
            let slot = self.slot(kmix, k);
            let w = input.weights[kmix * nact + k];
            let t0 = self.relative(input.v[slot], input.vq[slot], q_ref);
            let (t, side) = if k < self.nsym {
                let t1 = self.relative(input.v[slot + 1], input.vq[slot + 1], q_ref);
                if t1 < t0 {
                    (t1, 1)
                } else {
                    (t0, 0)
                }
            } else {
                (t0, 1)
            };
            let slot = if k < self.nsym { slot + usize::from(side) } else { slot };
            cands.push(Candidate { t, w, k, side, slot });
        }
        cands.sort_by(|a, b| a.t.total_cmp(&b.t));

        let value = solve_sorted(input.rhs, cands);
        match self.order2 {
            Some(threshold) if value.is_finite() && !input.v2.is_empty() => {
                if self.refine_order2(input, q_ref, value, threshold, cands) {
                    cands.sort_by(|a, b| a.t.total_cmp(&b.t));
                    solve_sorted(input.rhs, cands)
                } else {
                    value
                }
            }
            _ => value,
        }
    }

    /// Upgrade consistent upwind offsets to second order, returns whether any changed
    fn refine_order2(
        &self,
        input: &NodeInput<'_>,
        q_ref: i32,
        value: f32,
        threshold: f32,
        cands: &mut [Candidate],
    ) -> bool {
        let mut changed = false;
        for c in cands.iter_mut().filter(|c| c.t < value && c.w > 0.0) {
            let v2 = self.relative(input.v2[c.slot], input.vq2[c.slot], q_ref);
            if !(v2.is_finite() && v2 <= c.t) {
                continue;
            }
            let d1 = value - c.t;
            let d2 = c.t - v2;
            if (d1 - d2).abs() <= threshold * d1 {
                c.t += d2 / 3.0;
                c.w *= 9.0 / 4.0;
                changed = true;
            }
        }
        changed
    }
}

/// Solve the local equation over candidates sorted by increasing value
///
/// Values are taken relative to the smallest candidate so that the
/// discriminant does not cancel catastrophically for large values.
fn solve_sorted(rhs: f32, cands: &[Candidate]) -> f32 {
    let Some(t_min) = cands.first().map(|c| c.t) else {
        return f32::INFINITY;
    };
    if !t_min.is_finite() {
        return f32::INFINITY;
    }

    let (mut a, mut b, mut c) = (0.0_f32, 0.0_f32, -rhs * rhs);
    let mut value = f32::INFINITY;
    for cand in cands {
        if cand.w <= 0.0 {
            continue;
        }
        let t = cand.t - t_min;
        if t >= value {
            break;
        }
        a += cand.w;
        b += cand.w * t;
        c += cand.w * t * t;
        let disc = b * b - a * c;
        if disc < 0.0 {
            break;
        }
        value = (b + disc.sqrt()) / a;
    }
    t_min + value
}

fn record_flow(value: f32, cands: &[Candidate], kmix: usize, flow: &mut LocalFlow) {
    flow.weights.fill(0.0);
    flow.active_side.fill(0);
    flow.kmix = kmix;
    for c in cands {
        if let Some(side) = flow.active_side.get_mut(c.k) {
            *side = c.side;
        }
        if c.t < value && value.is_finite() {
            flow.weights[c.k] = c.w * (value - c.t);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Order2;
    use approx::assert_relative_eq;

    fn solver(nsym: usize, nfwd: usize, nmix: usize) -> LocalSolver {
        let mut config = SolverConfig::isotropic(1);
        config.nsym = nsym;
        config.nfwd = nfwd;
        config.nmix = nmix;
        LocalSolver::new(&config)
    }

    fn input<'a>(rhs: f32, weights: &'a [f32], v: &'a [f32], vq: &'a [i32]) -> NodeInput<'a> {
        NodeInput {
            rhs,
            weights,
            mix_is_min: true,
            v,
            vq,
            v2: &[],
            vq2: &[],
        }
    }

    #[test]
    fn test_single_neighbour() {
        let s = solver(1, 0, 1);
        let mut cands = Vec::new();
        let (u, uq) = s.solve(&input(1.0, &[4.0], &[3.0, f32::INFINITY], &[0, 0]), &mut cands, None);
        assert_relative_eq!(u, 3.5);
        assert_eq!(uq, 0);
    }

    #[test]
    fn test_two_equal_neighbours() {
        let s = solver(2, 0, 1);
        let mut cands = Vec::new();
        let v = [0.0, 7.0, f32::INFINITY, 0.0];
        let (u, _) = s.solve(&input(1.0, &[1.0, 1.0], &v, &[0; 4]), &mut cands, None);
        assert_relative_eq!(u, std::f32::consts::FRAC_1_SQRT_2);
    }

    #[test]
    fn test_non_causal_neighbour_ignored() {
        let s = solver(2, 0, 1);
        let mut cands = Vec::new();
        let v = [0.0, f32::INFINITY, 5.0, 6.0];
        let (u, _) = s.solve(&input(1.0, &[1.0, 1.0], &v, &[0; 4]), &mut cands, None);
        assert_eq!(u, 1.0);
    }

    #[test]
    fn test_all_infinite_stays_infinite() {
        let s = solver(2, 1, 1);
        let mut cands = Vec::new();
        let v = [f32::INFINITY; 5];
        let (u, _) = s.solve(&input(1.0, &[1.0; 3], &v, &[0; 5]), &mut cands, None);
        assert!(u.is_infinite());
    }

    #[test]
    fn test_large_values_keep_precision() {
        let s = solver(2, 0, 1);
        let mut cands = Vec::new();
        let v = [1.0e5, f32::INFINITY, f32::INFINITY, 1.0e5];
        let (u, _) = s.solve(&input(1.0, &[1.0, 1.0], &v, &[0; 4]), &mut cands, None);
        assert_relative_eq!(u - 1.0e5, std::f32::consts::FRAC_1_SQRT_2, epsilon = 1e-2);
    }

    #[test]
    fn test_forward_offset_uses_plus_side_only() {
        let s = solver(0, 1, 1);
        let mut cands = Vec::new();
        let (u, _) = s.solve(&input(2.0, &[1.0], &[1.0], &[0]), &mut cands, None);
        assert_eq!(u, 3.0);
    }

    #[test]
    fn test_mixing_min_and_max() {
        let s = solver(1, 0, 2);
        let mut cands = Vec::new();
        let mut flow = LocalFlow::new(1, 1);
        // Copy 0 reaches 1 + 1, copy 1 reaches 0 + 1/2
        let v = [1.0, f32::INFINITY, f32::INFINITY, 0.0];
        let weights = [1.0, 4.0];
        let mut node = input(1.0, &weights, &v, &[0; 4]);

        let (u, _) = s.solve(&node, &mut cands, Some(&mut flow));
        assert_eq!(u, 0.5);
        assert_eq!(flow.kmix, 1);
        assert_eq!(flow.active_side, vec![1]);

        node.mix_is_min = false;
        let (u, _) = s.solve(&node, &mut cands, Some(&mut flow));
        assert_eq!(u, 2.0);
        assert_eq!(flow.kmix, 0);
        assert_eq!(flow.active_side, vec![0]);
        assert_eq!(flow.weights, vec![1.0]);
    }

    #[test]
    fn test_flow_weights_are_upwind_only() {
        let s = solver(2, 0, 1);
        let mut cands = Vec::new();
        let mut flow = LocalFlow::new(2, 2);
        let v = [0.0, 3.0, 9.0, 8.0];
        let (u, _) = s.solve(&input(1.0, &[1.0, 1.0], &v, &[0; 4]), &mut cands, Some(&mut flow));
        assert_eq!(u, 1.0);
        assert_eq!(flow.weights, vec![1.0, 0.0]);
        assert_eq!(flow.active_side, vec![0, 1]);
    }

    #[test]
    fn test_second_order_exact_on_linear_data() {
        let mut config = SolverConfig::isotropic(1);
        config.order2 = Some(Order2::default());
        let s = LocalSolver::new(&config);
        let mut cands = Vec::new();

        let v = [1.0, f32::INFINITY];
        let mut node = input(1.0, &[1.0], &v, &[0, 0]);
        node.v2 = &[0.0, f32::INFINITY];
        node.vq2 = &[0, 0];
        let (u, _) = s.solve(&node, &mut cands, None);
        assert_relative_eq!(u, 2.0);
        assert_relative_eq!(cands[0].w, 2.25);

        // Inconsistent second neighbour falls back to first order
        node.v2 = &[0.5, f32::INFINITY];
        let (u, _) = s.solve(&node, &mut cands, None);
        assert_eq!(u, 2.0);
        assert_eq!(cands[0].w, 1.0);
    }

    #[test]
    fn test_multiprecision_relative_to_smallest_neighbour() {
        let mut config = SolverConfig::isotropic(1);
        config.multiprecision = Some(MultiPrecision::new(1.0));
        let s = LocalSolver::new(&config);
        let mut cands = Vec::new();
        // Neighbour totals 3.5 and 10.25
        let v = [0.5, 0.25];
        let vq = [3, 10];
        let (u, uq) = s.solve(&input(1.0, &[1.0], &v, &vq), &mut cands, None);
        assert_eq!((u, uq), (0.5, 4));
    }

    #[test]
    fn test_normalize() {
        let mp = MultiPrecision::new(2.0);
        assert_eq!(normalize(5.0, 1, &mp), (1.0, 3));
        assert_eq!(normalize(-1.0, 0, &mp), (1.0, -1));
        assert_eq!(normalize(1.5, 0, &mp), (1.5, 0));
        let (u, uq) = normalize(f32::INFINITY, 7, &mp);
        assert!(u.is_infinite());
        assert_eq!(uq, 0);

        let small = MultiPrecision { step: 1.0, max: 10.0 };
        assert_eq!(normalize(3.0, 8, &small), (11.0, 0));
    }
}
