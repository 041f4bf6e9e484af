//! Obstacle-aware neighbour visibility
//!
//! A neighbour `x + e` is reachable only if the segment from `x` to `x + e`
//! crosses no wall node. Walls are summarized by a saturating distance map:
//! `dist[n]` is a lower bound on the chessboard distance from node `n` to the
//! nearest wall, zero on walls. Segments are sphere-traced through this map.

use std::collections::VecDeque;

use crate::grid::Grid;

/// Visibility test consulted per candidate neighbour
pub trait Visibility: Send + Sync {
    /// Whether `x + offset` can be seen from the node at total position `x`
    ///
    /// `sample` is scratch space of `x.len()` entries.
    fn visible(&self, grid: &Grid, x: &[i64], offset: &[i32], sample: &mut [i64]) -> bool;
}

/// Chessboard distance to the nearest wall, saturating at `u8::MAX`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WallDistance {
    /// Block layout
    dist: Vec<u8>,
}

impl WallDistance {
    /// Distance map of the walls `walls` (block layout)
    ///
    /// Breadth-first search from every wall node over the `3^ndim - 1`
    /// neighbours, periodic axes wrapping.
    pub fn new(grid: &Grid, walls: &[bool]) -> Self {
        debug_assert_eq!(walls.len(), grid.size_tot());
        let ndim = grid.ndim();
        let mut dist = vec![u8::MAX; grid.size_tot()];
        let mut queue = VecDeque::new();
        for (n, _) in walls.iter().enumerate().filter(|(_, &w)| w) {
            dist[n] = 0;
            queue.push_back(n);
        }

        let nneigh = 3_usize.pow(ndim as u32);
        let mut x = vec![0_i64; ndim];
        let mut y = vec![0_i64; ndim];
        while let Some(n) = queue.pop_front() {
            let d = dist[n];
            grid.node_position(n, &mut x);
            for m in 0..nneigh {
                let mut code = m;
                for k in 0..ndim {
                    y[k] = x[k] + (code % 3) as i64 - 1;
                    code /= 3;
                }
                if !grid.contains(&y) {
                    continue;
                }
                let ny = grid.index_total(&y);
                if dist[ny] > d + 1 {
                    dist[ny] = d + 1;
                    queue.push_back(ny);
                }
            }
        }
        Self { dist }
    }

    /// Distance value of the node stored at `n_t`
    pub fn get(&self, n_t: usize) -> u8 {
        self.dist[n_t]
    }

    /// The whole map, block layout
    pub fn as_slice(&self) -> &[u8] {
        &self.dist
    }
}

impl Visibility for WallDistance {
    fn visible(&self, grid: &Grid, x: &[i64], offset: &[i32], q: &mut [i64]) -> bool {
        let steps = offset
            .iter()
            .map(|o| o.unsigned_abs() as usize)
            .max()
            .unwrap_or(0);
        if steps == 0 {
            return true;
        }

        let mut j = 0_usize;
        // Samples of the segment at t = j / steps, rounded to the nearest node.
        // Consecutive samples are at chessboard distance at most one, so nodes
        // skipped from a sample at distance d are within distance d - 1 of it.
        while j <= steps {
            let t = j as f32 / steps as f32;
            for k in 0..x.len() {
                q[k] = x[k] + (t * offset[k] as f32).round() as i64;
            }
            if !grid.contains(q) {
                j += 1;
                continue;
            }
            let d = self.dist[grid.index_total(q)] as usize;
            if d == 0 {
                return false;
            }
            j += d.saturating_sub(2).max(1);
        }
        true
    }
}
