//! Four-tap index/weight vectors for cubic B-spline evaluation.
//!
//! A cubic spline value at a real coordinate is a weighted sum of the
//! four surrounding coefficients. [`tap_set`] resolves the coefficient
//! indices under the requested boundary policy and evaluates the value,
//! first-derivative and second-derivative weights of each tap in one
//! pass, so a caller can reuse the same taps for any of the six
//! derivative combinations.

use crate::basis::bspline_3;

/// Index policy at the borders of the coefficient array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    /// Fold out-of-range taps back with whole-sample mirror symmetry.
    ///
    /// Used for coefficient arrays derived from image samples, whose
    /// spline extension is mirrored by construction.
    Mirror,
    /// Mark out-of-range taps invalid so their contribution is skipped.
    ///
    /// Used for deformation coefficient grids, which have no meaningful
    /// extension beyond the control lattice.
    Skip,
}

/// Indices and weights of the four taps along one axis.
#[derive(Debug, Clone)]
pub struct TapSet {
    /// Coefficient index per tap; `None` marks an out-of-range tap under
    /// [`Boundary::Skip`].
    pub index: [Option<usize>; 4],
    /// Value weights.
    pub weight: [f64; 4],
    /// First-derivative weights.
    pub d_weight: [f64; 4],
    /// Second-derivative weights.
    pub d2_weight: [f64; 4],
}

/// Compute the four-tap set at `coord` for a coefficient row of length
/// `len` under the given boundary policy.
///
/// Tap 0 is the rightmost influencing spline; taps run right to left,
/// matching the weight ordering below.
pub fn tap_set(coord: f64, len: usize, boundary: Boundary) -> TapSet {
    let ic = coord as i64;
    let len_i = len as i64;
    let twice_len = 2 * len_i;

    let mut index = [None; 4];
    let mut p = if coord >= 0.0 { ic + 2 } else { ic + 1 };
    for slot in index.iter_mut() {
        match boundary {
            Boundary::Mirror => {
                let mut q = if p < 0 { -1 - p } else { p };
                if q >= twice_len {
                    q -= twice_len * (q / twice_len);
                }
                let folded = if q >= len_i { twice_len - 1 - q } else { q };
                *slot = Some(folded as usize);
            }
            Boundary::Skip => {
                *slot = if p < 0 || p >= len_i {
                    None
                } else {
                    Some(p as usize)
                };
            }
        }
        p -= 1;
    }

    // Fractional offset from the base sample.
    let e = coord - if coord >= 0.0 { ic as f64 } else { (ic - 1) as f64 };
    let s = 1.0 - e;

    let mut d_weight = [0.0; 4];
    let mut weight = [0.0; 4];
    d_weight[0] = 0.5 * e * e;
    weight[0] = e * d_weight[0] / 3.0;
    d_weight[3] = -0.5 * s * s;
    weight[3] = s * d_weight[3] / -3.0;
    d_weight[1] = 1.0 - 2.0 * d_weight[0] + d_weight[3];
    weight[1] = 2.0 / 3.0 + (1.0 + e) * d_weight[3];
    d_weight[2] = 1.5 * e * (e - 4.0 / 3.0);
    weight[2] = 2.0 / 3.0 - (2.0 - e) * d_weight[0];

    let d2_weight = [e, s - 2.0 * e, e - 2.0 * s, s];

    TapSet {
        index,
        weight,
        d_weight,
        d2_weight,
    }
}

/// Per-row and per-column tap tables for dense grid evaluation of a
/// deformation coefficient grid.
///
/// During optimization every target pixel is mapped through the same
/// spline; recomputing identical one-dimensional weights `W*H` times
/// dominates the cost, so the tables are filled once per raster size.
#[derive(Debug, Clone)]
pub struct PrecomputedTaps {
    x: Vec<TapSet>,
    y: Vec<TapSet>,
}

impl PrecomputedTaps {
    /// Build the tables for a `width` x `height` target extent and a
    /// deformation grid with the given number of intervals.
    pub fn new(width: usize, height: usize, intervals: usize) -> Self {
        let grid = intervals + 3;
        let x = (0..width)
            .map(|u| {
                let tu = (u * intervals) as f64 / (width - 1) as f64 + 1.0;
                tap_set(tu, grid, Boundary::Skip)
            })
            .collect();
        let y = (0..height)
            .map(|v| {
                let tv = (v * intervals) as f64 / (height - 1) as f64 + 1.0;
                tap_set(tv, grid, Boundary::Skip)
            })
            .collect();
        Self { x, y }
    }

    /// Width of the raster the tables were built for.
    #[inline]
    pub fn width(&self) -> usize {
        self.x.len()
    }

    /// Height of the raster the tables were built for.
    #[inline]
    pub fn height(&self) -> usize {
        self.y.len()
    }

    /// Tap set for column `u`.
    #[inline]
    pub fn x(&self, u: usize) -> &TapSet {
        &self.x[u]
    }

    /// Tap set for row `v`.
    #[inline]
    pub fn y(&self, v: usize) -> &TapSet {
        &self.y[v]
    }

    /// Combined value weight of taps `(l, m)` at grid position `(u, v)`.
    #[inline]
    pub fn weight(&self, l: usize, m: usize, u: usize, v: usize) -> f64 {
        self.y[v].weight[l] * self.x[u].weight[m]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_weights_sum_to_one() {
        for i in 0..20 {
            let coord = 0.31 * i as f64;
            let t = tap_set(coord, 64, Boundary::Mirror);
            let sum: f64 = t.weight.iter().sum();
            assert_relative_eq!(sum, 1.0, epsilon = 1e-12);
            // Derivative weights of a partition of unity sum to zero.
            let dsum: f64 = t.d_weight.iter().sum();
            assert_relative_eq!(dsum, 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_weights_match_kernel() {
        let coord = 5.3;
        let t = tap_set(coord, 64, Boundary::Mirror);
        // Tap 0 belongs to the rightmost spline at index 7.
        assert_eq!(t.index[0], Some(7));
        for (k, idx) in t.index.iter().enumerate() {
            let j = idx.unwrap() as f64;
            assert_relative_eq!(t.weight[k], bspline_3(coord - j), epsilon = 1e-12);
        }
    }

    #[test]
    fn test_mirror_folding() {
        let t = tap_set(-0.4, 8, Boundary::Mirror);
        // All taps fold to valid indices.
        for idx in &t.index {
            assert!(idx.unwrap() < 8);
        }
    }

    #[test]
    fn test_skip_marks_out_of_range() {
        let t = tap_set(0.5, 8, Boundary::Skip);
        // Rightmost tap p = 2, leftmost p = -1 is out of range.
        assert_eq!(t.index[0], Some(2));
        assert_eq!(t.index[3], None);
    }

    #[test]
    fn test_precomputed_matches_per_call() {
        let intervals = 4;
        let pre = PrecomputedTaps::new(17, 11, intervals);
        assert_eq!(pre.width(), 17);
        assert_eq!(pre.height(), 11);
        for u in [0usize, 8, 16] {
            let tu = (u * intervals) as f64 / 16.0 + 1.0;
            let direct = tap_set(tu, intervals + 3, Boundary::Skip);
            for k in 0..4 {
                assert_eq!(pre.x(u).index[k], direct.index[k]);
                assert_relative_eq!(pre.x(u).weight[k], direct.weight[k]);
            }
        }
    }
}
