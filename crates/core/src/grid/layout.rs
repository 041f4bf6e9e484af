//! Conversion between row-major user arrays and the block-contiguous layout
//!
//! Arrays with several components per node (geometry, drift, flow vectors)
//! are stored component-major: component `k` of node `n` sits at
//! `n + size * k`, in both layouts.

use super::{index, position, Grid};

impl Grid {
    /// Reorder a row-major array of the domain shape into block layout
    ///
    /// Padding nodes receive `fill`.
    ///
    /// # Arguments
    ///
    /// * `arr` - Row-major data of `ncomp` components, `ncomp * self.size()` entries
    /// * `ncomp` - Components per node
    /// * `fill` - Value of the padding nodes
    pub fn block_expand<T: Copy>(&self, arr: &[T], ncomp: usize, fill: T) -> Vec<T> {
        debug_assert_eq!(arr.len(), ncomp * self.size());
        let size = self.size();
        let size_tot = self.size_tot();
        let mut out = vec![fill; ncomp * size_tot];
        let mut x = vec![0_i64; self.ndim()];
        for n_t in 0..size_tot {
            self.node_position(n_t, &mut x);
            if self.is_padding(&x) {
                continue;
            }
            let n = index(&x, self.shape());
            for k in 0..ncomp {
                out[n_t + size_tot * k] = arr[n + size * k];
            }
        }
        out
    }

    /// Inverse of [`Grid::block_expand`], dropping the padding
    pub fn block_squeeze<T: Copy>(&self, arr: &[T], ncomp: usize) -> Vec<T> {
        debug_assert_eq!(arr.len(), ncomp * self.size_tot());
        let size = self.size();
        let size_tot = self.size_tot();
        let mut out = Vec::with_capacity(ncomp * size);
        let mut x = vec![0_i64; self.ndim()];
        for k in 0..ncomp {
            for n in 0..size {
                position(n, self.shape(), &mut x);
                out.push(arr[self.index_total(&x) + size_tot * k]);
            }
        }
        out
    }
}
