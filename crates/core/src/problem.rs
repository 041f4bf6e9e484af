//! Problem data
//!
//! A [`Problem`] collects the per-node inputs in row-major order over the
//! user's domain shape: boundary conditions, right-hand side, geometry,
//! drift, walls and optional initial values. The solver converts it once to
//! the block layout, padding with inert nodes.

use tracing::warn;

use crate::error::SolverError;
use crate::grid::{self, Grid};
use crate::solver::WallDistance;

/// Inputs of a solve, row-major over the domain
#[derive(Debug, Clone, PartialEq)]
pub struct Problem {
    shape: Vec<usize>,
    seeds: Vec<bool>,
    rhs: Vec<f32>,
    geom: Vec<f32>,
    geom_size: usize,
    drift: Option<Vec<f32>>,
    walls: Option<Vec<bool>>,
    values: Option<Vec<f32>>,
}

/// Problem data converted to the block layout of a grid
#[derive(Debug, Clone)]
pub(crate) struct BlockData {
    pub values: Vec<f32>,
    pub seeds: Vec<bool>,
    pub rhs: Vec<f32>,
    pub geom: Vec<f32>,
    pub geom_size: usize,
    pub drift: Option<Vec<f32>>,
    pub walls: Option<WallDistance>,
}

impl Problem {
    /// Unit right-hand side, no seeds, over a domain of shape `shape`
    pub fn new(shape: &[usize]) -> Self {
        let size = grid::size_of(shape);
        Self {
            shape: shape.to_vec(),
            seeds: vec![false; size],
            rhs: vec![1.0; size],
            geom: Vec::new(),
            geom_size: 0,
            drift: None,
            walls: None,
            values: None,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Number of nodes
    pub fn size(&self) -> usize {
        self.seeds.len()
    }

    pub fn seeds(&self) -> &[bool] {
        &self.seeds
    }

    pub fn rhs(&self) -> &[f32] {
        &self.rhs
    }

    /// Geometry components per node
    pub fn geom_size(&self) -> usize {
        self.geom_size
    }

    pub fn has_drift(&self) -> bool {
        self.drift.is_some()
    }

    pub fn has_walls(&self) -> bool {
        self.walls.is_some()
    }

    /// Row-major index of the in-domain position `x`
    fn node_index(&self, x: &[i64]) -> Result<usize, SolverError> {
        if x.len() != self.ndim() || !grid::in_range(x, &self.shape) {
            return Err(SolverError::OutOfDomain(x.to_vec()));
        }
        Ok(grid::index(x, &self.shape))
    }

    fn check_len(&self, what: &'static str, found: usize, ncomp: usize) -> Result<(), SolverError> {
        let expected = ncomp * self.size();
        if found == expected {
            Ok(())
        } else {
            Err(SolverError::Shape {
                what,
                expected,
                found,
            })
        }
    }

    /// Fix the value at `x` to `value`
    ///
    /// A seed on a wall node is overridden by the wall when walls are enabled.
    ///
    /// # Errors
    ///
    /// `OutOfDomain` when `x` is not a node of the domain.
    pub fn add_seed(&mut self, x: &[i64], value: f32) -> Result<(), SolverError> {
        let n = self.node_index(x)?;
        self.seeds[n] = true;
        self.rhs[n] = value;
        Ok(())
    }

    /// Seed every node within `radius` of the fractional point `center`
    ///
    /// A node `y` receives `value + norm(y - center)`, so the seeded region
    /// already holds the distance to `center` measured by `norm`.
    ///
    /// # Arguments
    ///
    /// * `center` - Point in grid coordinates, possibly between nodes
    /// * `radius` - Seeding radius, measured by `norm`
    /// * `value` - Value at `center`
    /// * `norm` - Distance functional applied to `y - center`
    ///
    /// # Errors
    ///
    /// `OutOfDomain` when `center` has the wrong dimension. Returns the number
    /// of seeded nodes.
    pub fn spread_seed<N>(
        &mut self,
        center: &[f32],
        radius: f32,
        value: f32,
        norm: N,
    ) -> Result<usize, SolverError>
    where
        N: Fn(&[f32]) -> f32,
    {
        let ndim = self.ndim();
        if center.len() != ndim {
            return Err(SolverError::OutOfDomain(
                center.iter().map(|&c| c.round() as i64).collect(),
            ));
        }
        let reach = radius.ceil().max(0.0) as i64;
        let lo: Vec<i64> = center.iter().map(|&c| c.floor() as i64 - reach).collect();
        let span = (2 * reach + 2) as usize;
        let count = span.pow(ndim as u32);

        let mut seeded = 0;
        let mut y = vec![0_i64; ndim];
        let mut rel = vec![0.0_f32; ndim];
        for m in 0..count {
            let mut code = m;
            for k in (0..ndim).rev() {
                y[k] = lo[k] + (code % span) as i64;
                code /= span;
            }
            if !grid::in_range(&y, &self.shape) {
                continue;
            }
            for k in 0..ndim {
                rel[k] = y[k] as f32 - center[k];
            }
            let d = norm(&rel);
            if d <= radius {
                let n = grid::index(&y, &self.shape);
                self.seeds[n] = true;
                self.rhs[n] = value + d;
                seeded += 1;
            }
        }
        Ok(seeded)
    }

    /// Right-hand side `cost * h` on every non-seed node
    ///
    /// # Errors
    ///
    /// `Shape` when `cost` does not have one entry per node.
    pub fn set_cost(&mut self, cost: &[f32], h: f32) -> Result<(), SolverError> {
        self.check_len("cost", cost.len(), 1)?;
        for ((rhs, &c), &seed) in self.rhs.iter_mut().zip(cost).zip(&self.seeds) {
            if !seed {
                *rhs = c * h;
            }
        }
        Ok(())
    }

    /// Uniform right-hand side `cost * h` on every non-seed node
    pub fn set_uniform_cost(&mut self, cost: f32, h: f32) {
        for (rhs, &seed) in self.rhs.iter_mut().zip(&self.seeds) {
            if !seed {
                *rhs = cost * h;
            }
        }
    }

    /// Geometry of `ncomp` components per node, component-major
    ///
    /// # Errors
    ///
    /// `Shape` when `geom` does not hold `ncomp` entries per node.
    pub fn set_geometry(&mut self, geom: Vec<f32>, ncomp: usize) -> Result<(), SolverError> {
        self.check_len("geometry", geom.len(), ncomp)?;
        self.geom = geom;
        self.geom_size = ncomp;
        Ok(())
    }

    /// Drift vector per node, component-major (`ndim` components)
    ///
    /// # Errors
    ///
    /// `Shape` when `drift` does not hold `ndim` entries per node.
    pub fn set_drift(&mut self, drift: Vec<f32>) -> Result<(), SolverError> {
        self.check_len("drift", drift.len(), self.ndim())?;
        self.drift = Some(drift);
        Ok(())
    }

    /// Obstacle nodes: unreachable, and opaque to longer offsets
    ///
    /// # Errors
    ///
    /// `Shape` when `walls` does not have one entry per node.
    pub fn set_walls(&mut self, walls: Vec<bool>) -> Result<(), SolverError> {
        self.check_len("walls", walls.len(), 1)?;
        self.walls = Some(walls);
        Ok(())
    }

    /// Initial values, a super-solution away from the seeds
    ///
    /// Defaults to `∞` away from the seeds. A finite initial value activates
    /// its block in the first round just like a seed does, but unlike a seed
    /// it may still decrease.
    ///
    /// # Errors
    ///
    /// `Shape` when `values` does not have one entry per node.
    pub fn set_initial_values(&mut self, values: Vec<f32>) -> Result<(), SolverError> {
        self.check_len("values", values.len(), 1)?;
        self.values = Some(values);
        Ok(())
    }

    /// Convert to the block layout of `grid`
    ///
    /// Padding nodes are seeds of value `∞`; wall nodes too.
    pub(crate) fn to_blocks(&self, grid: &Grid, use_drift: bool, use_walls: bool) -> BlockData {
        let mut seeds = grid.block_expand(&self.seeds, 1, true);
        let mut rhs = grid.block_expand(&self.rhs, 1, f32::INFINITY);

        let walls = match (&self.walls, use_walls) {
            (Some(walls), true) => {
                let buried = self.seeds.iter().zip(walls).filter(|(&s, &w)| s && w).count();
                if buried > 0 {
                    warn!("{} seeds lie on walls and are never reached", buried);
                }
                let walls = grid.block_expand(walls, 1, false);
                for (n, _) in walls.iter().enumerate().filter(|(_, &w)| w) {
                    seeds[n] = true;
                    rhs[n] = f32::INFINITY;
                }
                Some(WallDistance::new(grid, &walls))
            }
            _ => None,
        };

        let mut values = match &self.values {
            Some(values) => grid.block_expand(values, 1, f32::INFINITY),
            None => vec![f32::INFINITY; grid.size_tot()],
        };
        for n in 0..grid.size_tot() {
            if seeds[n] {
                values[n] = rhs[n];
            }
        }

        BlockData {
            values,
            geom: grid.block_expand(&self.geom, self.geom_size, 0.0),
            geom_size: self.geom_size,
            drift: self
                .drift
                .as_ref()
                .filter(|_| use_drift)
                .map(|d| grid.block_expand(d, grid.ndim(), 0.0)),
            walls,
            seeds,
            rhs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn euclidean(z: &[f32]) -> f32 {
        z.iter().map(|a| a * a).sum::<f32>().sqrt()
    }

    #[test]
    fn test_add_seed_checks_domain() {
        let mut problem = Problem::new(&[4, 4]);
        problem.add_seed(&[1, 2], 0.5).unwrap();
        assert!(problem.seeds()[6]);
        assert_eq!(problem.rhs()[6], 0.5);
        assert_eq!(
            problem.add_seed(&[4, 0], 0.0),
            Err(SolverError::OutOfDomain(vec![4, 0]))
        );
    }

    #[test]
    fn test_set_cost_spares_seeds() {
        let mut problem = Problem::new(&[3]);
        problem.add_seed(&[0], 0.0).unwrap();
        problem.set_cost(&[5.0, 2.0, 3.0], 0.5).unwrap();
        assert_eq!(problem.rhs(), &[0.0, 1.0, 1.5]);
        assert!(matches!(
            problem.set_cost(&[1.0], 1.0),
            Err(SolverError::Shape { what: "cost", .. })
        ));
    }

    #[test]
    fn test_spread_seed_holds_distance() {
        let mut problem = Problem::new(&[9, 9]);
        let n = problem
            .spread_seed(&[4.5, 4.0], 1.0, 2.0, euclidean)
            .unwrap();
        // (4,4), (5,4) at 0.5, (4,3), (4,5), (5,3), (5,5) at sqrt(1.25) > 1
        assert_eq!(n, 2);
        let idx = grid::index(&[5, 4], &[9, 9]);
        assert!(problem.seeds()[idx]);
        assert_eq!(problem.rhs()[idx], 2.5);
    }

    #[test]
    fn test_block_data_pads_with_inert_seeds() {
        let grid = Grid::new(&[3], &[2], &[false]).unwrap();
        let mut problem = Problem::new(&[3]);
        problem.add_seed(&[0], 0.0).unwrap();
        problem.set_walls(vec![false, true, false]).unwrap();
        let data = problem.to_blocks(&grid, false, true);
        assert_eq!(data.seeds, vec![true, true, false, true]);
        assert_eq!(data.values[0], 0.0);
        assert!(data.values[1].is_infinite());
        assert!(data.values[2].is_infinite());
        assert!(data.rhs[3].is_infinite());
        let walls = data.walls.unwrap();
        assert_eq!(walls.get(1), 0);
        assert_eq!(walls.get(2), 1);
    }

    #[test]
    fn test_wall_overrides_seed() {
        let grid = Grid::new(&[4], &[2], &[false]).unwrap();
        let mut problem = Problem::new(&[4]);
        problem.add_seed(&[0], 0.0).unwrap();
        problem.add_seed(&[2], 1.0).unwrap();
        problem.set_walls(vec![false, false, true, false]).unwrap();

        let data = problem.to_blocks(&grid, false, true);
        assert!(data.seeds[2]);
        assert!(data.values[2].is_infinite());
        // Walls disabled: the seed holds its value
        let data = problem.to_blocks(&grid, false, false);
        assert_eq!(data.values[2], 1.0);
    }
}
