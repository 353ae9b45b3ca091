#![deny(missing_docs)]
#![doc = env!("CARGO_PKG_DESCRIPTION")]

/// dense row-major matrix type.
pub mod mat;

/// singular value decomposition and SVD-based pseudo-inverse.
pub mod svd;

/// QR decomposition and linear least squares.
pub mod lstsq;

pub use lstsq::{linear_least_squares, qr};
pub use mat::{Mat, MatError};
pub use svd::{pseudo_inverse, svd, PseudoInverse, Svd};

/// Degeneracy threshold used by every solver in the workspace.
///
/// Kept at single precision even though all arithmetic runs in `f64`:
/// singular values below this level carry no usable information for the
/// registration fits, which accumulate energies from single-precision
/// image data.
pub const MACHINE_EPSILON: f64 = f32::EPSILON as f64;

/// Binomial coefficient `n` choose `k` as a float.
///
/// Only exercised for the small orders that show up in piecewise
/// polynomial spline integrals, where the product below is exact.
pub fn binomial(n: u32, k: u32) -> f64 {
    if k > n {
        return 0.0;
    }
    let k = k.min(n - k);
    let mut prod = 1.0;
    for i in 1..=k {
        prod = prod * f64::from(n - k + i) / f64::from(i);
    }
    prod
}

#[cfg(test)]
mod tests {
    use super::binomial;

    #[test]
    fn test_binomial_small_orders() {
        assert_eq!(binomial(0, 0), 1.0);
        assert_eq!(binomial(4, 0), 1.0);
        assert_eq!(binomial(4, 1), 4.0);
        assert_eq!(binomial(4, 2), 6.0);
        assert_eq!(binomial(4, 4), 1.0);
        assert_eq!(binomial(3, 2), 3.0);
        assert_eq!(binomial(2, 3), 0.0);
    }
}
