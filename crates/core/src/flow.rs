//! Upwind flow exports
//!
//! At a converged node the local solve selects a few upwind offsets with
//! positive weights `w_k (u - v_k)`. These reconstruct the characteristic
//! direction through the node: the flow vector `Σ_k weight_k · offset_k`
//! points upwind, toward the source, and its opposite is the direction in
//! which the front travels.
//!
//! Every export kind is independently optional ([`FlowExports`]). Arrays are
//! component-major: component `k` of node `n` is stored at `n + size * k`;
//! offsets use `k + nact * l` for component `l` of offset `k`.

use crate::config::FlowExports;
use crate::grid::{index, Grid, INVALID_INDEX};

/// Flow exports of one block, local to its `size_i` nodes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlockFlow {
    pub weights: Vec<f32>,
    pub weightsum: Vec<f32>,
    pub offsets: Vec<i32>,
    pub indices: Vec<usize>,
    pub vector: Vec<f32>,
}

impl BlockFlow {
    /// Buffers for the requested kinds only, the others stay empty
    pub fn new(exports: FlowExports, size_i: usize, nact: usize, ndim: usize) -> Self {
        let sized = |on: bool, n: usize| if on { n } else { 0 };
        Self {
            weights: vec![0.0; sized(exports.weights, size_i * nact)],
            weightsum: vec![0.0; sized(exports.weightsum, size_i)],
            offsets: vec![0; sized(exports.offsets, size_i * nact * ndim)],
            indices: vec![0; sized(exports.indices, size_i * nact)],
            vector: vec![0.0; sized(exports.vector, size_i * ndim)],
        }
    }
}

/// Flow exports over the whole grid, block layout
#[derive(Debug, Clone, PartialEq)]
pub struct FlowField {
    grid: Grid,
    nact: usize,
    exports: FlowExports,
    weights: Vec<f32>,
    weightsum: Vec<f32>,
    offsets: Vec<i32>,
    indices: Vec<usize>,
    vector: Vec<f32>,
}

impl FlowField {
    pub(crate) fn new(grid: &Grid, nact: usize, exports: FlowExports) -> Self {
        let size_tot = grid.size_tot();
        let ndim = grid.ndim();
        let sized = |on: bool, n: usize| if on { n } else { 0 };
        Self {
            grid: grid.clone(),
            nact,
            exports,
            weights: vec![0.0; sized(exports.weights, size_tot * nact)],
            weightsum: vec![0.0; sized(exports.weightsum, size_tot)],
            offsets: vec![0; sized(exports.offsets, size_tot * nact * ndim)],
            indices: vec![0; sized(exports.indices, size_tot * nact)],
            vector: vec![0.0; sized(exports.vector, size_tot * ndim)],
        }
    }

    /// Copy the exports of block `n_o` into place
    pub(crate) fn write_block(&mut self, n_o: usize, block: &BlockFlow) {
        let size_i = self.grid.size_i();
        let size_tot = self.grid.size_tot();
        let base = n_o * size_i;
        scatter(&mut self.weights, &block.weights, base, size_i, size_tot);
        scatter(&mut self.weightsum, &block.weightsum, base, size_i, size_tot);
        scatter(&mut self.offsets, &block.offsets, base, size_i, size_tot);
        scatter(&mut self.indices, &block.indices, base, size_i, size_tot);
        scatter(&mut self.vector, &block.vector, base, size_i, size_tot);
    }

    pub fn exports(&self) -> FlowExports {
        self.exports
    }

    /// Active offsets per node
    pub fn nact(&self) -> usize {
        self.nact
    }

    /// Weights `[nact][shape]`, row-major per offset
    pub fn weights(&self) -> Option<Vec<f32>> {
        self.exports
            .weights
            .then(|| self.grid.block_squeeze(&self.weights, self.nact))
    }

    /// Sum of the weights `[shape]`
    pub fn weightsum(&self) -> Option<Vec<f32>> {
        self.exports
            .weightsum
            .then(|| self.grid.block_squeeze(&self.weightsum, 1))
    }

    /// Signed upwind offsets `[ndim][nact][shape]`
    pub fn offsets(&self) -> Option<Vec<i32>> {
        self.exports
            .offsets
            .then(|| self.grid.block_squeeze(&self.offsets, self.nact * self.grid.ndim()))
    }

    /// Row-major index of each upwind neighbour `[nact][shape]`
    ///
    /// [`INVALID_INDEX`] marks neighbours outside the domain.
    pub fn indices(&self) -> Option<Vec<usize>> {
        if !self.exports.indices {
            return None;
        }
        let mut x = vec![0_i64; self.grid.ndim()];
        let mut indices = self.grid.block_squeeze(&self.indices, self.nact);
        for n in &mut indices {
            if *n == INVALID_INDEX {
                continue;
            }
            self.grid.node_position(*n, &mut x);
            *n = if self.grid.is_padding(&x) {
                INVALID_INDEX
            } else {
                index(&x, self.grid.shape())
            };
        }
        Some(indices)
    }

    /// Storage indices in the block layout, before conversion
    pub fn raw_indices(&self) -> &[usize] {
        &self.indices
    }

    /// Flow vector `[ndim][shape]`
    pub fn vector(&self) -> Option<Vec<f32>> {
        self.exports
            .vector
            .then(|| self.grid.block_squeeze(&self.vector, self.grid.ndim()))
    }

    /// Unit front direction `[ndim][shape]`, opposite to the flow vector
    ///
    /// Zero where the flow vanishes (seeds, unreached nodes).
    pub fn geodesic_flow(&self) -> Option<Vec<f32>> {
        let mut flow = self.vector()?;
        let ndim = self.grid.ndim();
        let size = self.grid.size();
        for n in 0..size {
            let norm = (0..ndim)
                .map(|l| flow[n + size * l] * flow[n + size * l])
                .sum::<f32>()
                .sqrt();
            for l in 0..ndim {
                let c = &mut flow[n + size * l];
                *c = if norm > 0.0 && norm.is_finite() {
                    -*c / norm
                } else {
                    0.0
                };
            }
        }
        Some(flow)
    }
}

/// Copy each `size_i` component chunk of `src` to `base + size_tot * c`
fn scatter<T: Copy>(dst: &mut [T], src: &[T], base: usize, size_i: usize, size_tot: usize) {
    for (c, chunk) in src.chunks_exact(size_i).enumerate() {
        let start = base + size_tot * c;
        dst[start..start + size_i].copy_from_slice(chunk);
    }
}
