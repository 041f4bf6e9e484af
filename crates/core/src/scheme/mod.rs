//! Stencil providers
//!
//! A [`Scheme`] turns the local geometry of a node into a finite difference
//! stencil: `nactx = nmix * nact` non-negative weights and integer offsets,
//! the first `nsym` offsets of each copy being usable in both directions.
//! The discretized equation at a node with value `u` reads
//!
//! ```text
//! Σ_k  w_k · max(0, u - v_k)²  =  rhs²
//! ```
//!
//! where `v_k` is the smaller of the neighbour values at `x ± e_k` for a
//! symmetric offset and the value at `x + e_k` for a forward one.

mod table;

pub use table::StencilTable;

/// Stencil of one node, reused across nodes to avoid allocation
#[derive(Debug, Clone, PartialEq)]
pub struct Stencil {
    /// One weight per entry
    pub weights: Vec<f32>,
    /// Offsets, entry `k` component `l` at `k * ndim + l`
    pub offsets: Vec<i32>,
    /// Whether mixed copies are combined by min (else max)
    pub mix_is_min: bool,
    ndim: usize,
}

impl Stencil {
    /// Zeroed stencil of `nactx` entries in dimension `ndim`
    pub fn new(nactx: usize, ndim: usize) -> Self {
        Self {
            weights: vec![0.0; nactx],
            offsets: vec![0; nactx * ndim],
            mix_is_min: true,
            ndim,
        }
    }

    pub fn ndim(&self) -> usize {
        self.ndim
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    /// Offset of entry `k`
    #[inline]
    pub fn offset(&self, k: usize) -> &[i32] {
        &self.offsets[k * self.ndim..(k + 1) * self.ndim]
    }

    /// Set entry `k`
    pub fn set(&mut self, k: usize, weight: f32, offset: &[i32]) {
        self.weights[k] = weight;
        self.offsets[k * self.ndim..(k + 1) * self.ndim].copy_from_slice(offset);
    }

    /// Set entry `k` to the unit offset along `axis`
    pub fn set_axis(&mut self, k: usize, weight: f32, axis: usize) {
        self.weights[k] = weight;
        let e = &mut self.offsets[k * self.ndim..(k + 1) * self.ndim];
        e.fill(0);
        e[axis] = 1;
    }

    /// Largest offset component in absolute value
    pub fn radius(&self) -> usize {
        self.offsets
            .iter()
            .map(|o| o.unsigned_abs() as usize)
            .max()
            .unwrap_or(0)
    }
}

/// Local stencil construction, evaluated once per node and round
pub trait Scheme: Send + Sync {
    /// Fill `stencil` for the node at total position `x`
    ///
    /// # Arguments
    ///
    /// * `geom` - Geometry components of the node (possibly empty)
    /// * `x` - Total grid position of the node
    /// * `stencil` - Output, sized `nactx` entries by the caller
    fn stencil(&self, geom: &[f32], x: &[i64], stencil: &mut Stencil);

    /// Geometry components read per node
    fn geom_size(&self) -> usize {
        0
    }

    /// Largest offset component, when known without evaluating every node
    fn radius(&self) -> Option<usize> {
        None
    }

    /// Entries and dimension, when fixed by the provider
    fn table_shape(&self) -> Option<(usize, usize)> {
        None
    }
}

impl<F> Scheme for F
where
    F: Fn(&[f32], &[i64], &mut Stencil) + Send + Sync,
{
    fn stencil(&self, geom: &[f32], x: &[i64], stencil: &mut Stencil) {
        self(geom, x, stencil);
    }
}

/// Isotropic first order scheme: one unit symmetric offset per axis
///
/// The cost enters through `rhs = cost * h`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Isotropic;

impl Scheme for Isotropic {
    fn stencil(&self, _geom: &[f32], _x: &[i64], stencil: &mut Stencil) {
        for k in 0..stencil.ndim() {
            stencil.set_axis(k, 1.0, k);
        }
        stencil.mix_is_min = true;
    }

    fn radius(&self) -> Option<usize> {
        Some(1)
    }
}

/// Axis-aligned anisotropic scheme, `geom[k]` is the weight of axis `k`
///
/// Models the diagonal metric `diag(geom)`: the speed along axis `k` is
/// `1 / sqrt(geom[k])` for unit cost.
#[derive(Debug, Clone, Copy)]
pub struct Diagonal {
    pub ndim: usize,
}

impl Scheme for Diagonal {
    fn stencil(&self, geom: &[f32], _x: &[i64], stencil: &mut Stencil) {
        for k in 0..self.ndim {
            stencil.set_axis(k, geom[k].max(0.0), k);
        }
        stencil.mix_is_min = true;
    }

    fn geom_size(&self) -> usize {
        self.ndim
    }

    fn radius(&self) -> Option<usize> {
        Some(1)
    }
}
