//! Row-major index arithmetic
//!
//! Pure functions converting between Cartesian coordinates and linear indices,
//! with optional per-axis periodic wrap. The last axis varies fastest.
//!
//! Coordinates are `i64` so that neighbour positions may step outside the
//! domain before being bounds-checked; indices are `usize`.

/// Wrap a coordinate onto `0..n` (periodic axes only)
#[inline]
pub fn wrap(x: i64, n: usize) -> i64 {
    x.rem_euclid(n as i64)
}

/// Inverse of [`index`]: coordinates of linear index `n` in an array of shape `shape`
///
/// Writes the result into `x`, which must have the same length as `shape`.
pub fn position(mut n: usize, shape: &[usize], x: &mut [i64]) {
    debug_assert_eq!(shape.len(), x.len());
    for k in (1..shape.len()).rev() {
        x[k] = (n % shape[k]) as i64;
        n /= shape[k];
    }
    if let Some(x0) = x.first_mut() {
        *x0 = n as i64;
    }
}

/// Row-major linearization of `x`
///
/// The caller guarantees `x` is in range, see [`in_range`].
pub fn index(x: &[i64], shape: &[usize]) -> usize {
    let mut n = 0_usize;
    for (k, (&xk, &sk)) in x.iter().zip(shape).enumerate() {
        if k > 0 {
            n *= sk;
        }
        n += xk as usize;
    }
    n
}

/// Row-major linearization, wrapping periodic axes first
///
/// Non-periodic axes must already be in range.
pub fn index_periodic(x: &[i64], shape: &[usize], periodic: &[bool]) -> usize {
    let mut n = 0_usize;
    for k in 0..shape.len() {
        if k > 0 {
            n *= shape[k];
        }
        let xk = if periodic[k] { wrap(x[k], shape[k]) } else { x[k] };
        n += xk as usize;
    }
    n
}

/// Whether `x` lies inside the box `0..shape`
pub fn in_range(x: &[i64], shape: &[usize]) -> bool {
    x.iter()
        .zip(shape)
        .all(|(&xk, &sk)| xk >= 0 && xk < sk as i64)
}

/// Bounds test where periodic axes are always in range
pub fn in_range_periodic(x: &[i64], shape: &[usize], periodic: &[bool]) -> bool {
    x.iter()
        .zip(shape)
        .zip(periodic)
        .all(|((&xk, &sk), &per)| per || (xk >= 0 && xk < sk as i64))
}

/// Number of elements in an array of the given shape
pub fn size_of(shape: &[usize]) -> usize {
    shape.iter().product()
}
