//! Singular value decomposition for general dense matrices.
//!
//! Golub–Reinsch: Householder bidiagonalization followed by implicit-shift
//! QR sweeps. The sweep count is capped; callers receive a convergence
//! flag and are expected to treat a non-converged result as "use what you
//! have" rather than as an error, since the registration fits tolerate
//! approximate spectra.

use crate::{Mat, MACHINE_EPSILON};

/// Hard cap on QR sweeps per singular value.
pub const MAX_SVD_SWEEPS: usize = 1000;

/// Result of [`svd`]: `A = U · diag(w) · Vᵗ`.
#[derive(Debug, Clone)]
pub struct Svd {
    /// Left singular vectors, same shape as the input (decomposed in place).
    pub u: Mat,
    /// Singular values, unordered, one per input column.
    pub w: Vec<f64>,
    /// Right singular vectors, `cols` x `cols`, untransposed.
    pub v: Mat,
    /// False if the sweep cap was hit before the bidiagonal collapsed.
    pub converged: bool,
}

/// Result of [`pseudo_inverse`].
#[derive(Debug, Clone)]
pub struct PseudoInverse {
    /// The Moore–Penrose pseudo-inverse, `cols` x `rows`.
    pub inverse: Mat,
    /// True when the observations minus the null-space dimension do not
    /// cover the unknowns; the fit does not determine every parameter.
    pub underconstrained: bool,
    /// Convergence flag propagated from the underlying [`svd`].
    pub converged: bool,
}

#[inline]
fn same_sign(a: f64, b: f64) -> f64 {
    if b >= 0.0 {
        a.abs()
    } else {
        -a.abs()
    }
}

/// Decompose `a` into `U · diag(w) · Vᵗ`, consuming `a` as the workspace
/// for `U`.
///
/// Any shape is accepted; for systems with fewer rows than columns the
/// null-space columns come out with zero singular values, which is what
/// the underconstrained detection in [`pseudo_inverse`] keys on.
pub fn svd(mut a: Mat) -> Svd {
    let lines = a.rows();
    let columns = a.cols();
    let mut w = vec![0.0; columns];
    let mut v = Mat::zeros(columns, columns);
    let mut rv1 = vec![0.0; columns];

    let u = &mut a;
    let (mut g, mut scale, mut norm) = (0.0f64, 0.0f64, 0.0f64);
    let mut l = 0usize;

    // Householder reduction to bidiagonal form.
    for i in 0..columns {
        l = i + 1;
        rv1[i] = scale * g;
        g = 0.0;
        let mut s = 0.0;
        scale = 0.0;
        if i < lines {
            for k in i..lines {
                scale += u[(k, i)].abs();
            }
            if scale != 0.0 {
                for k in i..lines {
                    u[(k, i)] /= scale;
                    s += u[(k, i)] * u[(k, i)];
                }
                let f = u[(i, i)];
                g = if f >= 0.0 { -s.sqrt() } else { s.sqrt() };
                let h = f * g - s;
                u[(i, i)] = f - g;
                for j in l..columns {
                    let mut s2 = 0.0;
                    for k in i..lines {
                        s2 += u[(k, i)] * u[(k, j)];
                    }
                    let f2 = s2 / h;
                    for k in i..lines {
                        let t = f2 * u[(k, i)];
                        u[(k, j)] += t;
                    }
                }
                for k in i..lines {
                    u[(k, i)] *= scale;
                }
            }
        }
        w[i] = scale * g;
        g = 0.0;
        s = 0.0;
        scale = 0.0;
        if i < lines && i != columns - 1 {
            for k in l..columns {
                scale += u[(i, k)].abs();
            }
            if scale != 0.0 {
                for k in l..columns {
                    u[(i, k)] /= scale;
                    s += u[(i, k)] * u[(i, k)];
                }
                let f = u[(i, l)];
                g = if f >= 0.0 { -s.sqrt() } else { s.sqrt() };
                let h = f * g - s;
                u[(i, l)] = f - g;
                for k in l..columns {
                    rv1[k] = u[(i, k)] / h;
                }
                for j in l..lines {
                    let mut s2 = 0.0;
                    for k in l..columns {
                        s2 += u[(j, k)] * u[(i, k)];
                    }
                    for k in l..columns {
                        let t = s2 * rv1[k];
                        u[(j, k)] += t;
                    }
                }
                for k in l..columns {
                    u[(i, k)] *= scale;
                }
            }
        }
        norm = norm.max(w[i].abs() + rv1[i].abs());
    }

    // Accumulate right-hand transformations.
    for i in (0..columns).rev() {
        if i < columns - 1 {
            if g != 0.0 {
                for j in l..columns {
                    v[(j, i)] = u[(i, j)] / (u[(i, l)] * g);
                }
                for j in l..columns {
                    let mut s = 0.0;
                    for k in l..columns {
                        s += u[(i, k)] * v[(k, j)];
                    }
                    for k in l..columns {
                        if s != 0.0 {
                            let t = s * v[(k, i)];
                            v[(k, j)] += t;
                        }
                    }
                }
            }
            for j in l..columns {
                v[(i, j)] = 0.0;
                v[(j, i)] = 0.0;
            }
        }
        v[(i, i)] = 1.0;
        g = rv1[i];
        l = i;
    }

    // Accumulate left-hand transformations.
    for i in (0..lines.min(columns)).rev() {
        let l = i + 1;
        g = w[i];
        for j in l..columns {
            u[(i, j)] = 0.0;
        }
        if g != 0.0 {
            g = 1.0 / g;
            for j in l..columns {
                let mut s = 0.0;
                for k in l..lines {
                    s += u[(k, i)] * u[(k, j)];
                }
                let f = s * g / u[(i, i)];
                for k in i..lines {
                    if f != 0.0 {
                        let t = f * u[(k, i)];
                        u[(k, j)] += t;
                    }
                }
            }
            for j in i..lines {
                u[(j, i)] *= g;
            }
        } else {
            for j in i..lines {
                u[(j, i)] = 0.0;
            }
        }
        u[(i, i)] += 1.0;
    }

    // Diagonalize the bidiagonal form with implicit-shift QR sweeps.
    let mut converged = true;
    'values: for k in (0..columns).rev() {
        for its in 1..=MAX_SVD_SWEEPS {
            // Split test: rv1[0] is exactly zero by construction, so this
            // scan always terminates before underflowing.
            let (l, nm, flag) = {
                let mut l = k;
                loop {
                    if rv1[l].abs() + norm == norm {
                        break (l, 0usize, false);
                    }
                    if w[l - 1].abs() + norm == norm {
                        break (l, l - 1, true);
                    }
                    l -= 1;
                }
            };
            if flag {
                let mut c = 0.0;
                let mut s = 1.0;
                for i in l..=k {
                    let f = s * rv1[i];
                    rv1[i] *= c;
                    if f.abs() + norm == norm {
                        break;
                    }
                    g = w[i];
                    let mut h = f.hypot(g);
                    w[i] = h;
                    h = 1.0 / h;
                    c = g * h;
                    s = -f * h;
                    for j in 0..lines {
                        let y = u[(j, nm)];
                        let z = u[(j, i)];
                        u[(j, nm)] = y * c + z * s;
                        u[(j, i)] = z * c - y * s;
                    }
                }
            }
            let mut z = w[k];
            if l == k {
                // Convergence for this singular value.
                if z < 0.0 {
                    w[k] = -z;
                    for j in 0..columns {
                        v[(j, k)] = -v[(j, k)];
                    }
                }
                break;
            }
            if its == MAX_SVD_SWEEPS {
                // Best-effort exit: keep whatever the sweeps produced.
                converged = false;
                break 'values;
            }
            // Shift from the bottom 2x2 minor.
            let mut x = w[l];
            let nm = k - 1;
            let mut y = w[nm];
            g = rv1[nm];
            let mut h = rv1[k];
            let mut f = ((y - z) * (y + z) + (g - h) * (g + h)) / (2.0 * h * y);
            g = f.hypot(1.0);
            f = ((x - z) * (x + z) + h * ((y / (f + same_sign(g, f))) - h)) / x;
            let mut c = 1.0;
            let mut s = 1.0;
            for j in l..=nm {
                let i = j + 1;
                g = rv1[i];
                y = w[i];
                h = s * g;
                g *= c;
                z = f.hypot(h);
                rv1[j] = z;
                c = f / z;
                s = h / z;
                f = x * c + g * s;
                g = g * c - x * s;
                h = y * s;
                y *= c;
                for jj in 0..columns {
                    let xv = v[(jj, j)];
                    let zv = v[(jj, i)];
                    v[(jj, j)] = xv * c + zv * s;
                    v[(jj, i)] = zv * c - xv * s;
                }
                z = f.hypot(h);
                w[j] = z;
                if z != 0.0 {
                    let zi = 1.0 / z;
                    c = f * zi;
                    s = h * zi;
                }
                f = c * g + s * y;
                x = c * y - s * g;
                for jj in 0..lines {
                    let yu = u[(jj, j)];
                    let zu = u[(jj, i)];
                    u[(jj, j)] = yu * c + zu * s;
                    u[(jj, i)] = zu * c - yu * s;
                }
            }
            rv1[l] = 0.0;
            rv1[k] = f;
            w[k] = x;
        }
    }

    Svd {
        u: a,
        w,
        v,
        converged,
    }
}

/// Compute the SVD pseudo-inverse of `b`, zeroing singular values below
/// [`MACHINE_EPSILON`].
///
/// The `underconstrained` flag reports whether the surviving observations
/// cover all unknowns; callers decide whether such a fit is usable.
pub fn pseudo_inverse(b: Mat) -> PseudoInverse {
    let rows = b.rows();
    let cols = b.cols();

    let Svd {
        u,
        mut w,
        mut v,
        converged,
    } = svd(b);
    if !converged {
        log::warn!("svd hit the {MAX_SVD_SWEEPS}-sweep cap; using best-effort spectrum");
    }

    // Invert the spectrum, zeroing anything below the noise floor.
    let mut zero_count = 0usize;
    for wk in w.iter_mut() {
        if wk.abs() < MACHINE_EPSILON {
            *wk = 0.0;
            zero_count += 1;
        } else {
            *wk = 1.0 / *wk;
        }
    }
    let underconstrained = rows < cols + zero_count;

    // V <- V · diag(1/w)
    for i in 0..cols {
        for j in 0..cols {
            v[(i, j)] *= w[j];
        }
    }

    // inverse = V · diag(1/w) · Uᵗ
    let mut inverse = Mat::zeros(cols, rows);
    for i in 0..cols {
        for j in 0..rows {
            let mut sum = 0.0;
            for k in 0..cols {
                sum += v[(i, k)] * u[(j, k)];
            }
            inverse[(i, j)] = sum;
        }
    }

    PseudoInverse {
        inverse,
        underconstrained,
        converged,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn reconstruct(s: &Svd, rows: usize, cols: usize) -> Mat {
        let mut a = Mat::zeros(rows, cols);
        for i in 0..rows {
            for j in 0..cols {
                let mut sum = 0.0;
                for k in 0..cols {
                    sum += s.u[(i, k)] * s.w[k] * s.v[(j, k)];
                }
                a[(i, j)] = sum;
            }
        }
        a
    }

    fn check_svd(data: Vec<f64>, rows: usize, cols: usize) -> Svd {
        let a = Mat::from_vec(rows, cols, data).unwrap();
        let expected = a.clone();
        let s = svd(a);
        assert!(s.converged);
        let r = reconstruct(&s, rows, cols);
        for i in 0..rows {
            for j in 0..cols {
                assert_relative_eq!(r[(i, j)], expected[(i, j)], epsilon = 1e-10);
            }
        }
        // V columns are orthonormal.
        for j in 0..cols {
            for j2 in 0..cols {
                let mut dot = 0.0;
                for i in 0..cols {
                    dot += s.v[(i, j)] * s.v[(i, j2)];
                }
                let want = if j == j2 { 1.0 } else { 0.0 };
                assert_relative_eq!(dot, want, epsilon = 1e-10);
            }
        }
        s
    }

    #[test]
    fn test_svd_square() {
        check_svd(vec![4.0, 1.0, 2.0, -1.0, 3.0, 0.5, 0.0, 2.0, 5.0], 3, 3);
    }

    #[test]
    fn test_svd_tall() {
        check_svd(vec![1.0, 0.0, 0.5, 2.0, -1.0, 1.0, 3.0, 0.0], 4, 2);
    }

    #[test]
    fn test_svd_rank_deficient() {
        // Second column is twice the first.
        let s = check_svd(vec![1.0, 2.0, 2.0, 4.0, 3.0, 6.0], 3, 2);
        let mut zeros = 0;
        for wk in &s.w {
            if wk.abs() < 1e-10 {
                zeros += 1;
            }
        }
        assert_eq!(zeros, 1);
    }

    #[test]
    fn test_pseudo_inverse_tall_full_rank() {
        let b = Mat::from_vec(3, 2, vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0]).unwrap();
        let p = pseudo_inverse(b.clone());
        assert!(!p.underconstrained);
        // (pinv * B) should be the 2x2 identity.
        for i in 0..2 {
            for j in 0..2 {
                let mut sum = 0.0;
                for k in 0..3 {
                    sum += p.inverse[(i, k)] * b[(k, j)];
                }
                let want = if i == j { 1.0 } else { 0.0 };
                assert_relative_eq!(sum, want, epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn test_pseudo_inverse_underconstrained() {
        // One observation cannot pin down three unknowns.
        let b = Mat::from_vec(1, 3, vec![1.0, 1.0, 1.0]).unwrap();
        let p = pseudo_inverse(b);
        assert!(p.underconstrained);
        assert_eq!(p.inverse.rows(), 3);
        assert_eq!(p.inverse.cols(), 1);
    }
}
