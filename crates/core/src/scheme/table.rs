//! Stencils precomputed along one parameter axis
//!
//! Models whose stencil depends on a single coordinate (typically an angle
//! discretized along the last axis) are expensive to build per node but take
//! only `samples` distinct values. The table stores them once and is looked up
//! by that coordinate.

use super::{Scheme, Stencil};

/// Stencils indexed by the coordinate of one axis
#[derive(Debug, Clone, PartialEq)]
pub struct StencilTable {
    axis: usize,
    ndim: usize,
    nactx: usize,
    /// `[samples][nactx]`
    weights: Vec<f32>,
    /// `[samples][nactx][ndim]`
    offsets: Vec<i32>,
    mix_is_min: Vec<bool>,
}

impl StencilTable {
    /// Evaluate `scheme` at each coordinate `0..samples` of `axis`
    ///
    /// Other coordinates are zero and every sample sees the geometry `geom`.
    ///
    /// # Arguments
    ///
    /// * `scheme` - Stencil provider to tabulate
    /// * `geom` - Geometry passed to every evaluation
    /// * `ndim` - Dimension of the grid
    /// * `axis` - Axis indexing the table
    /// * `samples` - Number of distinct coordinates along `axis`
    /// * `nactx` - Stencil entries
    pub fn from_scheme<S: Scheme + ?Sized>(
        scheme: &S,
        geom: &[f32],
        ndim: usize,
        axis: usize,
        samples: usize,
        nactx: usize,
    ) -> Self {
        let mut weights = Vec::with_capacity(samples * nactx);
        let mut offsets = Vec::with_capacity(samples * nactx * ndim);
        let mut mix_is_min = Vec::with_capacity(samples);
        let mut stencil = Stencil::new(nactx, ndim);
        let mut x = vec![0_i64; ndim];
        for sample in 0..samples {
            x[axis] = sample as i64;
            scheme.stencil(geom, &x, &mut stencil);
            weights.extend_from_slice(&stencil.weights);
            offsets.extend_from_slice(&stencil.offsets);
            mix_is_min.push(stencil.mix_is_min);
        }
        Self {
            axis,
            ndim,
            nactx,
            weights,
            offsets,
            mix_is_min,
        }
    }

    /// Number of tabulated coordinates
    pub fn samples(&self) -> usize {
        self.mix_is_min.len()
    }

    pub fn nactx(&self) -> usize {
        self.nactx
    }

    pub fn ndim(&self) -> usize {
        self.ndim
    }

    /// Axis indexing the table
    pub fn axis(&self) -> usize {
        self.axis
    }

    /// Copy the stencil of coordinate `sample` (wrapped) into `stencil`
    pub fn lookup(&self, sample: i64, stencil: &mut Stencil) {
        let samples = self.samples();
        if samples == 0 {
            return;
        }
        let s = sample.rem_euclid(samples as i64) as usize;
        let w = self.nactx;
        let o = self.nactx * self.ndim;
        stencil.weights.copy_from_slice(&self.weights[s * w..(s + 1) * w]);
        stencil.offsets.copy_from_slice(&self.offsets[s * o..(s + 1) * o]);
        stencil.mix_is_min = self.mix_is_min[s];
    }
}

impl Scheme for StencilTable {
    fn stencil(&self, _geom: &[f32], x: &[i64], stencil: &mut Stencil) {
        self.lookup(x[self.axis], stencil);
    }

    fn radius(&self) -> Option<usize> {
        Some(
            self.offsets
                .iter()
                .map(|o| o.unsigned_abs() as usize)
                .max()
                .unwrap_or(0),
        )
    }

    fn table_shape(&self) -> Option<(usize, usize)> {
        Some((self.nactx, self.ndim))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rotating(_: &[f32], x: &[i64], s: &mut Stencil) {
        // Alternates between the two axes along axis 1
        if x[1] % 2 == 0 {
            s.set(0, 1.0, &[1, 0]);
        } else {
            s.set(0, 2.0, &[0, 2]);
        }
        s.mix_is_min = x[1] != 3;
    }

    #[test]
    fn test_table_matches_scheme() {
        let table = StencilTable::from_scheme(&rotating, &[], 2, 1, 4, 1);
        assert_eq!(table.samples(), 4);
        assert_eq!(Scheme::radius(&table), Some(2));

        let mut expected = Stencil::new(1, 2);
        let mut found = Stencil::new(1, 2);
        for j in 0..4 {
            rotating(&[], &[7, j], &mut expected);
            table.stencil(&[], &[7, j], &mut found);
            assert_eq!(found, expected, "sample {j}");
        }
    }

    #[test]
    fn test_lookup_wraps() {
        let table = StencilTable::from_scheme(&rotating, &[], 2, 1, 4, 1);
        let mut a = Stencil::new(1, 2);
        let mut b = Stencil::new(1, 2);
        table.lookup(-1, &mut a);
        table.lookup(3, &mut b);
        assert_eq!(a, b);
        assert!(!a.mix_is_min);
    }
}
