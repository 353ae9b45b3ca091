#![deny(missing_docs)]
#![doc = env!("CARGO_PKG_DESCRIPTION")]

/// B-spline kernel evaluation.
pub mod basis;

/// FIR and IIR filters for sample/coefficient/dual conversions.
pub mod filters;

/// Four-tap index/weight vectors for cubic interpolation.
pub mod taps;

pub use basis::{bspline_1, bspline_2, bspline_3};
pub use filters::{
    antisymmetric_fir_mirror_off_bounds, reduce_dual, samples_to_coefficients,
    symmetric_fir_mirror_off_bounds, SplineDegree, CUBIC_TWO_SCALE,
};
pub use taps::{tap_set, Boundary, PrecomputedTaps, TapSet};
