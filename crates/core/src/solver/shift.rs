//! Shift corrections of neighbour values
//!
//! A shift is added to the value read at `x + eps·e` before the local solve.
//!
//! - Factorization: near the source the solution behaves like the distance
//!   `d(z) = sqrt(zᵀ M z)`, whose kink the first order scheme resolves
//!   poorly. Replacing `d` by its tangent at `x` makes the scheme exact for
//!   it: the neighbour `y` is shifted by `d(x) + eps<∇d(x), e> - d(y)`.
//! - Drift: the two directions of an offset are biased oppositely by
//!   `<drift, e>`.

use crate::config::Factorization;

/// Shifts of the two sides (`-e`, `+e`) of an offset
pub type SidePair = [f32; 2];

/// Source factorization, precomputed from the configuration
#[derive(Debug, Clone, PartialEq)]
pub struct FactorShift {
    origin: Vec<f32>,
    /// Row-major `ndim x ndim`
    metric: Vec<f32>,
    radius2: f32,
}

impl FactorShift {
    pub fn new(factor: &Factorization) -> Self {
        let ndim = factor.origin.len();
        let mut metric = Vec::with_capacity(ndim * ndim);
        for i in 0..ndim {
            for j in 0..ndim {
                metric.push(factor.metric[(i, j)]);
            }
        }
        Self {
            origin: factor.origin.clone(),
            metric,
            radius2: factor.radius * factor.radius,
        }
    }

    fn ndim(&self) -> usize {
        self.origin.len()
    }

    /// Position of `x_t` relative to the origin
    ///
    /// Returns false when the node is outside the factorization radius, or
    /// at the origin itself where the distance has no gradient.
    pub fn relative(&self, x_t: &[i64], x_rel: &mut [f32]) -> bool {
        let mut r2 = 0.0;
        for k in 0..self.ndim() {
            x_rel[k] = x_t[k] as f32 - self.origin[k];
            r2 += x_rel[k] * x_rel[k];
        }
        r2 > 0.0 && r2 < self.radius2
    }

    /// `zᵀ M z`
    fn norm2(&self, z: &[f32]) -> f32 {
        let n = self.ndim();
        let mut s = 0.0;
        for i in 0..n {
            for j in 0..n {
                s += z[i] * self.metric[i * n + j] * z[j];
            }
        }
        s
    }

    /// Shifts of offset `e` at the relative position `x_rel`
    ///
    /// `fact` receives the shifts of `x ± e` and `fact2`, when given, those
    /// of `x ± 2e`.
    pub fn sym(&self, x_rel: &[f32], e: &[i32], fact: &mut SidePair, fact2: Option<&mut SidePair>) {
        let n = self.ndim();
        let d = self.norm2(x_rel).sqrt();
        if d <= 0.0 {
            return;
        }
        // <∇d(x), e> with ∇d = M x / d
        let mut grad_e = 0.0;
        for i in 0..n {
            let mx: f32 = (0..n).map(|j| self.metric[i * n + j] * x_rel[j]).sum();
            grad_e += mx * e[i] as f32;
        }
        grad_e /= d;

        let shift = |scale: f32| {
            let mut y2 = 0.0;
            for i in 0..n {
                let yi = x_rel[i] + scale * e[i] as f32;
                for j in 0..n {
                    let yj = x_rel[j] + scale * e[j] as f32;
                    y2 += yi * self.metric[i * n + j] * yj;
                }
            }
            d + scale * grad_e - y2.sqrt()
        };
        fact[0] = shift(-1.0);
        fact[1] = shift(1.0);
        if let Some(fact2) = fact2 {
            fact2[0] = shift(-2.0);
            fact2[1] = shift(2.0);
        }
    }
}

/// Add the drift bias of offset `e` to the side shifts
#[inline]
pub fn drift_shift(drift: &[f32], e: &[i32], fact: &mut SidePair) {
    let s: f32 = drift.iter().zip(e).map(|(&d, &ek)| d * ek as f32).sum();
    fact[0] += s;
    fact[1] -= s;
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::DMatrix;

    #[test]
    fn test_shift_vanishes_along_radial_line() {
        let shift = FactorShift::new(&Factorization::isotropic(vec![0.0, 0.0], 1.0, 10.0));
        let mut x_rel = [0.0; 2];
        assert!(shift.relative(&[5, 0], &mut x_rel));
        let mut fact = [0.0; 2];
        shift.sym(&x_rel, &[1, 0], &mut fact, None);
        assert_relative_eq!(fact[0], 0.0, epsilon = 1e-6);
        assert_relative_eq!(fact[1], 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_shift_restores_tangent_plane() {
        let shift = FactorShift::new(&Factorization::isotropic(vec![0.0, 0.0], 1.0, 10.0));
        let mut x_rel = [0.0; 2];
        assert!(shift.relative(&[3, 4], &mut x_rel));
        let mut fact = [0.0; 2];
        let mut fact2 = [0.0; 2];
        shift.sym(&x_rel, &[0, 1], &mut fact, Some(&mut fact2));
        // d(3,5) + fact[1] is the tangent plane of d at (3,4)
        let tangent = 5.0 + 0.8;
        assert_relative_eq!(34.0_f32.sqrt() + fact[1], tangent, epsilon = 1e-5);
        assert_relative_eq!(18.0_f32.sqrt() + fact[0], 5.0 - 0.8, epsilon = 1e-5);
        assert_relative_eq!(45.0_f32.sqrt() + fact2[1], 5.0 + 1.6, epsilon = 1e-5);
        // Distance is convex, tangent lies below
        assert!(fact[0] < 0.0 && fact[1] < 0.0);
    }

    #[test]
    fn test_anisotropic_metric() {
        let factor = Factorization {
            origin: vec![0.0, 0.0],
            metric: DMatrix::from_row_slice(2, 2, &[4.0, 0.0, 0.0, 1.0]),
            radius: 10.0,
        };
        let shift = FactorShift::new(&factor);
        let mut x_rel = [0.0; 2];
        assert!(shift.relative(&[2, 0], &mut x_rel));
        let mut fact = [0.0; 2];
        shift.sym(&x_rel, &[1, 0], &mut fact, None);
        // Linear along the axis: d = 2|x|
        assert_relative_eq!(fact[1], 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_radius_and_origin_excluded() {
        let shift = FactorShift::new(&Factorization::isotropic(vec![1.0], 1.0, 2.0));
        let mut x_rel = [0.0];
        assert!(!shift.relative(&[1], &mut x_rel));
        assert!(shift.relative(&[2], &mut x_rel));
        assert!(!shift.relative(&[3], &mut x_rel));
    }

    #[test]
    fn test_drift_biases_sides_oppositely() {
        let mut fact = [0.5, 0.5];
        drift_shift(&[0.25, -1.0], &[2, 1], &mut fact);
        assert_eq!(fact, [0.0, 1.0]);
    }
}
