#![doc = env!("CARGO_PKG_DESCRIPTION")]

#[doc(inline)]
pub use warpline_image as image;

#[doc(inline)]
pub use warpline_linalg as linalg;

#[doc(inline)]
pub use warpline_registration as registration;

#[doc(inline)]
pub use warpline_spline as spline;
