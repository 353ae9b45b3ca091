//! QR decomposition and linear least squares.

use crate::Mat;

/// Decompose `a` (rows x cols, rows >= cols) into an orthonormal `Q` of
/// the same shape and an upper-triangular `R` (cols x cols) via modified
/// Gram–Schmidt, such that `Q · R = a` and `Qᵗ · Q = I`.
///
/// A column with zero remaining norm is left as the zero column; the
/// corresponding diagonal of `R` comes out zero and is handled downstream
/// as a rank deficiency.
pub fn qr(a: &Mat) -> (Mat, Mat) {
    let lines = a.rows();
    let columns = a.cols();
    let mut q = a.clone();
    let mut r = Mat::zeros(columns, columns);

    for j in 0..columns {
        for k in 0..j {
            let mut s = 0.0;
            for i in 0..lines {
                s += q[(i, j)] * q[(i, k)];
            }
            for i in 0..lines {
                let t = s * q[(i, k)];
                q[(i, j)] -= t;
            }
        }
        let mut s = 0.0;
        for i in 0..lines {
            s += q[(i, j)] * q[(i, j)];
        }
        let s = if s * s == 0.0 { 0.0 } else { 1.0 / s.sqrt() };
        for i in 0..lines {
            q[(i, j)] *= s;
        }
    }
    for i in 0..columns {
        for j in i..columns {
            let mut sum = 0.0;
            for k in 0..lines {
                sum += q[(k, i)] * a[(k, j)];
            }
            r[(i, j)] = sum;
        }
    }
    (q, r)
}

/// Least-squares solution of `A · x = b` through QR back-substitution.
///
/// A near-zero diagonal pivot marks a free variable, which is set to
/// zero rather than reported as an error; degenerate systems therefore
/// yield the minimal-information solution instead of failing. This can
/// differ from the SVD least-norm solution when the fit is not unique.
pub fn linear_least_squares(a: &Mat, b: &[f64]) -> Vec<f64> {
    debug_assert_eq!(b.len(), a.rows());
    let lines = a.rows();
    let columns = a.cols();
    let (q, r) = qr(a);

    let mut x = vec![0.0; columns];
    for (i, xi) in x.iter_mut().enumerate() {
        let mut s = 0.0;
        for j in 0..lines {
            s += q[(j, i)] * b[j];
        }
        *xi = s;
    }
    for i in (0..columns).rev() {
        let s = r[(i, i)];
        if s * s == 0.0 {
            x[i] = 0.0;
        } else {
            x[i] /= s;
        }
        for j in (0..i).rev() {
            let t = r[(j, i)] * x[i];
            x[j] -= t;
        }
    }
    x
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_qr_reconstruction() {
        let a = Mat::from_vec(3, 2, vec![1.0, 2.0, 0.0, 1.0, 1.0, 0.0]).unwrap();
        let (q, r) = qr(&a);
        for i in 0..3 {
            for j in 0..2 {
                let mut sum = 0.0;
                for k in 0..2 {
                    sum += q[(i, k)] * r[(k, j)];
                }
                assert_relative_eq!(sum, a[(i, j)], epsilon = 1e-12);
            }
        }
        // Q columns orthonormal.
        for i in 0..2 {
            for j in 0..2 {
                let mut dot = 0.0;
                for k in 0..3 {
                    dot += q[(k, i)] * q[(k, j)];
                }
                let want = if i == j { 1.0 } else { 0.0 };
                assert_relative_eq!(dot, want, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_least_squares_exact() {
        // Square well-conditioned system has the exact solution.
        let a = Mat::from_vec(2, 2, vec![2.0, 1.0, 1.0, 3.0]).unwrap();
        let x = linear_least_squares(&a, &[5.0, 10.0]);
        assert_relative_eq!(x[0], 1.0, epsilon = 1e-12);
        assert_relative_eq!(x[1], 3.0, epsilon = 1e-12);
    }

    #[test]
    fn test_least_squares_overdetermined() {
        // Fit y = 2t + 1 through noiseless samples.
        let a = Mat::from_vec(3, 2, vec![0.0, 1.0, 1.0, 1.0, 2.0, 1.0]).unwrap();
        let x = linear_least_squares(&a, &[1.0, 3.0, 5.0]);
        assert_relative_eq!(x[0], 2.0, epsilon = 1e-12);
        assert_relative_eq!(x[1], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_least_squares_degenerate_pivot() {
        // Second column identical to the first: its pivot vanishes and
        // the free variable is pinned to zero.
        let a = Mat::from_vec(2, 2, vec![1.0, 1.0, 1.0, 1.0]).unwrap();
        let x = linear_least_squares(&a, &[2.0, 2.0]);
        assert_relative_eq!(x[1], 0.0, epsilon = 1e-12);
        assert_relative_eq!(x[0], 2.0, epsilon = 1e-12);
    }
}
