//! Divergence/curl smoothness penalty as a quadratic form.
//!
//! The penalty integrates the squared gradients of the divergence and
//! the curl of the deformation over the target extent. Expressed on the
//! B-spline coefficients `c1` (x component) and `c2` (y component),
//! flattened row-major, it becomes
//!
//! ```text
//! c1ᵗ·P11·c1 + c2ᵗ·P22·c2 + c1ᵗ·P12·c2
//! ```
//!
//! Every entry is a closed-form integral of products of B-spline
//! derivative pieces. Two basis functions interact only when their
//! supports overlap (at most ±2 intervals apart), and each of the four
//! polynomial pieces of the cubic kernel either lies inside the overlap
//! or not, so all distinct integrals fit in a 16x16 table indexed by
//! the piece-occupancy encodings of the two functions.

use warpline_linalg::{binomial, Mat};

/// The three penalty matrices for one deformation scale.
///
/// Pure function of the interval count, the target's current size and
/// the two weights; rebuilt from scratch whenever any of those change.
#[derive(Debug, Clone)]
pub struct RegularizationOperator {
    /// Quadratic form over the x-component coefficients.
    pub p11: Mat,
    /// Quadratic form over the y-component coefficients.
    pub p22: Mat,
    /// Bilinear coupling between the two components.
    pub p12: Mat,
}

impl RegularizationOperator {
    /// Build the operator for `intervals` subdivisions of a target of
    /// the given current size.
    pub fn build(
        intervals: usize,
        width: usize,
        height: usize,
        div_weight: f64,
        curl_weight: f64,
    ) -> Self {
        let m2 = (intervals + 3) * (intervals + 3);
        let mut p11 = Mat::zeros(m2, m2);
        add_quadratic(intervals, div_weight, [2, 0, 2, 0], width, height, &mut p11);
        add_quadratic(
            intervals,
            div_weight + curl_weight,
            [1, 1, 1, 1],
            width,
            height,
            &mut p11,
        );
        add_quadratic(intervals, curl_weight, [0, 2, 0, 2], width, height, &mut p11);

        let mut p22 = Mat::zeros(m2, m2);
        add_quadratic(intervals, div_weight, [0, 2, 0, 2], width, height, &mut p22);
        add_quadratic(
            intervals,
            div_weight + curl_weight,
            [1, 1, 1, 1],
            width,
            height,
            &mut p22,
        );
        add_quadratic(intervals, curl_weight, [2, 0, 2, 0], width, height, &mut p22);

        let mut p12 = Mat::zeros(m2, m2);
        add_quadratic(
            intervals,
            2.0 * div_weight,
            [2, 0, 1, 1],
            width,
            height,
            &mut p12,
        );
        add_quadratic(
            intervals,
            2.0 * div_weight,
            [1, 1, 0, 2],
            width,
            height,
            &mut p12,
        );
        add_quadratic(
            intervals,
            -2.0 * curl_weight,
            [0, 2, 1, 1],
            width,
            height,
            &mut p12,
        );
        add_quadratic(
            intervals,
            -2.0 * curl_weight,
            [1, 1, 2, 0],
            width,
            height,
            &mut p12,
        );

        Self { p11, p22, p12 }
    }

    /// Side length of the (square) matrices.
    pub fn size(&self) -> usize {
        self.p11.rows()
    }
}

/// Accumulate `weight * ∫ D^q1x D^q1y (basis) · D^q2x D^q2y (basis)`
/// into `r`. `q` holds `[q1x, q1y, q2x, q2y]`, the derivative orders of
/// the two interacting basis functions along each axis.
fn add_quadratic(
    intervals: usize,
    weight: f64,
    q: [usize; 4],
    width: usize,
    height: usize,
    r: &mut Mat,
) {
    if weight == 0.0 {
        return;
    }
    let [q1, q2, q3, q4] = q;

    let eta_x = eta_table(q1, q3, width, intervals);
    let eta_y = if q2 != q1 || q4 != q3 || height != width {
        eta_table(q2, q4, height, intervals)
    } else {
        eta_x
    };

    let m = intervals as i64 + 1;
    let mp = intervals + 3;
    for l in -1..=m {
        for k in -1..=m {
            for n in -1..=m {
                for mm in -1..=m {
                    let (Some(ip), Some(jp)) =
                        (eta_index(l, n, intervals), eta_index(k, mm, intervals))
                    else {
                        continue;
                    };
                    let mn = ((n + 1) as usize) * mp + (mm + 1) as usize;
                    let kl = ((l + 1) as usize) * mp + (k + 1) as usize;
                    r[(kl, mn)] += weight * eta_x[jp.0][jp.1] * eta_y[ip.0][ip.1];
                }
            }
        }
    }
}

/// All distinct overlap integrals for one axis, keyed by the piece
/// encodings of the two basis functions.
fn eta_table(q1: usize, q2: usize, dim: usize, intervals: usize) -> [[f64; 16]; 16] {
    let mut eta = [[0.0; 16]; 16];
    let mut done = [[false; 16]; 16];
    let m = intervals as i64 + 1;
    let h = dim as f64 / intervals as f64;
    for ki1 in -1..=m {
        for ki2 in -1..=m {
            if let Some((i0, i1)) = eta_index(ki1, ki2, intervals) {
                if !done[i0][i1] {
                    eta[i0][i1] =
                        integral_dd(0.0, dim as f64, ki1 as f64, ki2 as f64, h, q1, q2);
                    done[i0][i1] = true;
                }
            }
        }
    }
    eta
}

/// Encode which of the four polynomial pieces of each basis function lie
/// inside the support intersection, or `None` when the supports do not
/// overlap the domain together.
fn eta_index(ki1: i64, ki2: i64, intervals: usize) -> Option<(usize, usize)> {
    let kir = (intervals as i64).min(ki1.min(ki2) + 2);
    let kil = 0i64.max(ki1.max(ki2) - 2);
    if kil >= kir {
        return None;
    }

    let (kil, kir) = (kil as f64, kir as f64);
    let mut ip = [0i32; 2];
    let mut two_i = 1;
    for i in 0..=3 {
        // Middle sample of piece i of each function.
        let mid1 = ki1 as f64 + i as f64 - 1.5;
        if kil <= mid1 && mid1 <= kir {
            ip[0] += two_i;
        }
        let mid2 = ki2 as f64 + i as f64 - 1.5;
        if kil <= mid2 && mid2 <= kir {
            ip[1] += two_i;
        }
        two_i *= 2;
    }
    Some(((ip[0] - 1) as usize, (ip[1] - 1) as usize))
}

/// Integral over `[x0, xf]` of the product of the `q1`-th and `q2`-th
/// derivatives of two shifted cubic kernels, taken in spline units.
///
/// Differentiating a cubic B-spline lowers it to a signed combination of
/// lower-degree kernels at half-sample shifts; the tables below encode
/// that expansion for orders zero to two.
fn integral_dd(x0: f64, xf: f64, s1: f64, s2: f64, h: f64, q1: usize, q2: usize) -> f64 {
    const C: [[f64; 3]; 3] = [[1.0, 0.0, 0.0], [1.0, -1.0, 0.0], [1.0, -2.0, 1.0]];
    const D: [[u32; 3]; 3] = [[3, 0, 0], [2, 2, 0], [1, 1, 1]];
    const S: [[f64; 3]; 3] = [[0.0, 0.0, 0.0], [-0.5, 0.5, 0.0], [1.0, 0.0, -1.0]];

    let mut integral = 0.0;
    for k in 0..3 {
        let ck = C[q1][k];
        if ck == 0.0 {
            continue;
        }
        for l in 0..3 {
            let cl = C[q2][l];
            if cl == 0.0 {
                continue;
            }
            integral += ck
                * cl
                * integral_bb(x0, xf, s1 + S[q1][k], s2 + S[q2][l], h, D[q1][k], D[q2][l]);
        }
    }
    integral
}

/// Integral of the product of two shifted B-spline kernels of degrees
/// `n1` and `n2`, expanded into one-sided power functions.
fn integral_bb(x0: f64, xf: f64, s1: f64, s2: f64, h: f64, n1: u32, n2: u32) -> f64 {
    let xfp = xf / h;
    let x0p = x0 / h;

    let mut fact_n1 = 1.0;
    for k in 2..=n1 {
        fact_n1 *= k as f64;
    }
    let mut fact_n2 = 1.0;
    for k in 2..=n2 {
        fact_n2 *= k as f64;
    }

    let c1: Vec<f64> = (0..=n1 + 1)
        .map(|k| {
            let sign = if k % 2 == 0 { 1.0 } else { -1.0 };
            sign * binomial(n1 + 1, k) / fact_n1
        })
        .collect();
    let c2: Vec<f64> = (0..=n2 + 1)
        .map(|k| {
            let sign = if k % 2 == 0 { 1.0 } else { -1.0 };
            sign * binomial(n2 + 1, k) / fact_n2
        })
        .collect();

    let n1_half = (n1 + 1) as f64 / 2.0;
    let n2_half = (n2 + 1) as f64 / 2.0;
    let mut integral = 0.0;
    for (k, c1k) in c1.iter().enumerate() {
        for (l, c2l) in c2.iter().enumerate() {
            integral += c1k
                * c2l
                * integral_pp(
                    x0p,
                    xfp,
                    s1 + k as f64 - n1_half,
                    s2 + l as f64 - n2_half,
                    n1,
                    n2,
                );
        }
    }
    integral * h
}

/// Integral over `[x0, xf]` of `(x - s1)_+^q1 · (x - s2)_+^q2`.
fn integral_pp(x0: f64, xf: f64, s1: f64, s2: f64, q1: u32, q2: u32) -> f64 {
    // Shift so the first factor starts at zero.
    let s2p = s2 - s1;
    let xfp = xf - s1;
    let x0p = (x0 - s1).max(s2p.max(0.0));
    if xfp < 0.0 || x0p > xfp {
        return 0.0;
    }

    // Evaluate the primitive at both ends.
    let mut upper = 0.0;
    let mut lower = 0.0;
    for k in 0..=q2 {
        let aux = binomial(q2, k) / (q1 + k + 1) as f64 * (-s2p).powi((q2 - k) as i32);
        upper += xfp.powi((q1 + k + 1) as i32) * aux;
        lower += x0p.powi((q1 + k + 1) as i32) * aux;
    }
    upper - lower
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use warpline_spline::bspline_3;

    fn bspline_3_dd(x: f64) -> f64 {
        let x = x.abs();
        if x < 1.0 {
            3.0 * x - 2.0
        } else if x < 2.0 {
            2.0 - x
        } else {
            0.0
        }
    }

    fn bspline_3_d(x: f64) -> f64 {
        // Odd function; evaluate on the magnitude and restore the sign.
        let sign = if x < 0.0 { -1.0 } else { 1.0 };
        let a = x.abs();
        let v = if a < 1.0 {
            1.5 * a * a - 2.0 * a
        } else if a < 2.0 {
            let t = 2.0 - a;
            -0.5 * t * t
        } else {
            0.0
        };
        sign * v
    }

    #[test]
    fn test_zero_weights_give_zero_matrices() {
        let op = RegularizationOperator::build(2, 16, 16, 0.0, 0.0);
        assert!(op.p11.as_slice().iter().all(|&v| v == 0.0));
        assert!(op.p22.as_slice().iter().all(|&v| v == 0.0));
        assert!(op.p12.as_slice().iter().all(|&v| v == 0.0));
        assert_eq!(op.size(), 25);
    }

    #[test]
    fn test_quadratic_form_matches_numerical_integration() {
        let intervals = 1usize;
        let (width, height) = (8usize, 6usize);
        let (div_w, curl_w) = (1.0, 0.7);
        let op = RegularizationOperator::build(intervals, width, height, div_w, curl_w);

        let grid = intervals + 3;
        let m2 = grid * grid;
        // Fixed pseudo-random coefficients.
        let c1: Vec<f64> = (0..m2).map(|k| ((k * 7 + 3) as f64 * 0.83).sin()).collect();
        let c2: Vec<f64> = (0..m2).map(|k| ((k * 5 + 1) as f64 * 1.21).cos()).collect();

        let mut quad = 0.0;
        for i in 0..m2 {
            for j in 0..m2 {
                quad += c1[i] * op.p11[(i, j)] * c1[j]
                    + c2[i] * op.p22[(i, j)] * c2[j]
                    + c1[i] * op.p12[(i, j)] * c2[j];
            }
        }

        // Numerically integrate the penalty density in spline units.
        // Each control point (i, j) carries the kernel centered at
        // (j - 1, i - 1); derivatives are taken in spline units and the
        // physical measure contributes hx * hy.
        let hx = width as f64 / intervals as f64;
        let hy = height as f64 / intervals as f64;
        let second = |c: &[f64], xi: f64, eta: f64, dx: usize, dy: usize| -> f64 {
            let mut sum = 0.0;
            for i in 0..grid {
                for j in 0..grid {
                    let bx = match dx {
                        0 => bspline_3(xi - (j as f64 - 1.0)),
                        1 => bspline_3_d(xi - (j as f64 - 1.0)),
                        _ => bspline_3_dd(xi - (j as f64 - 1.0)),
                    };
                    let by = match dy {
                        0 => bspline_3(eta - (i as f64 - 1.0)),
                        1 => bspline_3_d(eta - (i as f64 - 1.0)),
                        _ => bspline_3_dd(eta - (i as f64 - 1.0)),
                    };
                    sum += c[i * grid + j] * bx * by;
                }
            }
            sum
        };

        let steps = 160;
        let dxi = intervals as f64 / steps as f64;
        let mut numeric = 0.0;
        for a in 0..steps {
            let xi = (a as f64 + 0.5) * dxi;
            for b in 0..steps {
                let eta = (b as f64 + 0.5) * dxi;
                let x_uu = second(&c1, xi, eta, 2, 0);
                let x_uv = second(&c1, xi, eta, 1, 1);
                let x_vv = second(&c1, xi, eta, 0, 2);
                let y_uu = second(&c2, xi, eta, 2, 0);
                let y_uv = second(&c2, xi, eta, 1, 1);
                let y_vv = second(&c2, xi, eta, 0, 2);
                let div = (x_uu + y_uv).powi(2) + (x_uv + y_vv).powi(2);
                let curl = (y_uu - x_uv).powi(2) + (y_uv - x_vv).powi(2);
                numeric += div_w * div + curl_w * curl;
            }
        }
        numeric *= hx * hy * dxi * dxi;

        assert_relative_eq!(quad, numeric, max_relative = 1e-2);
    }

    #[test]
    fn test_scales_with_domain_size() {
        // Doubling the extent doubles the spline unit h on each axis;
        // the second-derivative penalty entries scale accordingly.
        let a = RegularizationOperator::build(1, 8, 8, 1.0, 0.0);
        let b = RegularizationOperator::build(1, 16, 16, 1.0, 0.0);
        let idx = (7, 7);
        assert!(a.p11[idx] != 0.0);
        // Every eta factor carries h from the change of variable and
        // the domain integral; the ratio is fixed across entries.
        let ratio = b.p11[idx] / a.p11[idx];
        for i in 0..a.p11.rows() {
            for j in 0..a.p11.cols() {
                if a.p11[(i, j)].abs() > 1e-12 {
                    assert_relative_eq!(b.p11[(i, j)] / a.p11[(i, j)], ratio, epsilon = 1e-9);
                }
            }
        }
    }
}
