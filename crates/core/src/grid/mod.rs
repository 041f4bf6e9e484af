//! Bi-level grid addressing
//!
//! The domain is stored block by block: an outer grid of blocks of shape
//! `shape_o`, each holding `size_i` contiguous inner cells of shape `shape_i`.
//! The node at total position `x_t` lives at
//!
//! ```text
//! n_t = Index(x_t / shape_i, shape_o) * size_i + Index(x_t % shape_i, shape_i)
//! ```
//!
//! so a block's nodes form the contiguous range `n_o*size_i .. (n_o+1)*size_i`
//! and a block task can own its slice outright.
//!
//! User arrays of arbitrary shape are padded up to `shape_tot = shape_o *
//! shape_i` (see [`Grid::block_expand`]); periodic axes must not need padding.

pub mod addressing;
mod layout;

pub use addressing::{in_range, in_range_periodic, index, index_periodic, position, size_of, wrap};

use crate::error::ConfigError;

/// Linear index marking "no node" in exported index arrays
pub const INVALID_INDEX: usize = usize::MAX;

/// Two-level Cartesian grid with optional periodic axes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grid {
    shape: Vec<usize>,
    shape_i: Vec<usize>,
    shape_o: Vec<usize>,
    shape_tot: Vec<usize>,
    periodic: Vec<bool>,
    size_i: usize,
    size_o: usize,
    size_tot: usize,
}

impl Grid {
    /// Create the block decomposition of a domain of shape `shape`
    ///
    /// # Arguments
    ///
    /// * `shape` - Domain shape as supplied by the user
    /// * `shape_i` - Block shape, one extent per axis
    /// * `periodic` - Periodic flag per axis
    ///
    /// # Errors
    ///
    /// Rejects empty or zero extents, mismatched dimensions, and periodic
    /// axes whose extent is not a multiple of the block extent.
    pub fn new(shape: &[usize], shape_i: &[usize], periodic: &[bool]) -> Result<Self, ConfigError> {
        if shape.is_empty() || shape_i.is_empty() {
            return Err(ConfigError::EmptyShape);
        }
        let ndim = shape.len();
        for (what, found) in [("block shape", shape_i.len()), ("periodic", periodic.len())] {
            if found != ndim {
                return Err(ConfigError::DimensionMismatch {
                    what,
                    expected: ndim,
                    found,
                });
            }
        }
        for (what, s) in [("domain shape", shape), ("block shape", shape_i)] {
            if let Some(axis) = s.iter().position(|&n| n == 0) {
                return Err(ConfigError::ZeroExtent { what, axis });
            }
        }
        for k in 0..ndim {
            if periodic[k] && shape[k] % shape_i[k] != 0 {
                return Err(ConfigError::PeriodicPadding {
                    axis: k,
                    extent: shape[k],
                    block: shape_i[k],
                });
            }
        }

        let shape_o: Vec<usize> = shape
            .iter()
            .zip(shape_i)
            .map(|(&n, &b)| n.div_ceil(b))
            .collect();
        let shape_tot: Vec<usize> = shape_o.iter().zip(shape_i).map(|(&o, &i)| o * i).collect();

        Ok(Self {
            size_i: size_of(shape_i),
            size_o: size_of(&shape_o),
            size_tot: size_of(&shape_tot),
            shape: shape.to_vec(),
            shape_i: shape_i.to_vec(),
            shape_o,
            shape_tot,
            periodic: periodic.to_vec(),
        })
    }

    /// Number of axes
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Unpadded domain shape
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Block shape
    pub fn shape_i(&self) -> &[usize] {
        &self.shape_i
    }

    /// Shape of the grid of blocks
    pub fn shape_o(&self) -> &[usize] {
        &self.shape_o
    }

    /// Padded domain shape, `shape_o * shape_i`
    pub fn shape_tot(&self) -> &[usize] {
        &self.shape_tot
    }

    pub fn periodic(&self) -> &[bool] {
        &self.periodic
    }

    /// Nodes per block
    pub fn size_i(&self) -> usize {
        self.size_i
    }

    /// Number of blocks
    pub fn size_o(&self) -> usize {
        self.size_o
    }

    /// Number of nodes, padding included
    pub fn size_tot(&self) -> usize {
        self.size_tot
    }

    /// Number of nodes of the unpadded domain
    pub fn size(&self) -> usize {
        size_of(&self.shape)
    }

    /// Storage index of the node at total position `x_t`
    ///
    /// Periodic axes are wrapped first. The caller checks [`Grid::contains`]
    /// beforehand; the result is meaningless for positions out of range on a
    /// non-periodic axis.
    pub fn index_total(&self, x_t: &[i64]) -> usize {
        let mut n_o = 0_usize;
        let mut n_i = 0_usize;
        for k in 0..self.ndim() {
            let s_i = self.shape_i[k] as i64;
            let xk = if self.periodic[k] {
                wrap(x_t[k], self.shape_tot[k])
            } else {
                x_t[k]
            };
            if k > 0 {
                n_o *= self.shape_o[k];
                n_i *= self.shape_i[k];
            }
            n_o += (xk / s_i) as usize;
            n_i += (xk % s_i) as usize;
        }
        n_o * self.size_i + n_i
    }

    /// Total position of the node stored at `n_t`
    pub fn node_position(&self, n_t: usize, x_t: &mut [i64]) {
        let n_o = n_t / self.size_i;
        let n_i = n_t % self.size_i;
        self.block_origin(n_o, x_t);
        let mut x_i = vec![0_i64; self.ndim()];
        position(n_i, &self.shape_i, &mut x_i);
        for (xk, ik) in x_t.iter_mut().zip(&x_i) {
            *xk += ik;
        }
    }

    /// Block coordinates of block `n_o` in the grid of blocks
    pub fn block_position(&self, n_o: usize, x_o: &mut [i64]) {
        position(n_o, &self.shape_o, x_o);
    }

    /// Total position of the first node of block `n_o`
    pub fn block_origin(&self, n_o: usize, x_t: &mut [i64]) {
        self.block_position(n_o, x_t);
        for (xk, &s) in x_t.iter_mut().zip(&self.shape_i) {
            *xk *= s as i64;
        }
    }

    /// Linear block index of block coordinates `x_o`, wrapping periodic axes
    ///
    /// Returns `None` when `x_o` leaves the grid of blocks along a non-periodic axis.
    pub fn block_index(&self, x_o: &[i64]) -> Option<usize> {
        in_range_periodic(x_o, &self.shape_o, &self.periodic)
            .then(|| index_periodic(x_o, &self.shape_o, &self.periodic))
    }

    /// Whether `x_t` lies in the (periodically extended) padded domain
    pub fn contains(&self, x_t: &[i64]) -> bool {
        in_range_periodic(x_t, &self.shape_tot, &self.periodic)
    }

    /// Whether the in-range position `x_t` is a padding node
    pub fn is_padding(&self, x_t: &[i64]) -> bool {
        x_t.iter()
            .zip(&self.shape)
            .zip(&self.periodic)
            .any(|((&xk, &sk), &per)| !per && xk >= sk as i64)
    }
}
