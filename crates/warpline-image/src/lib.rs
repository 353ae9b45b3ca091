#![deny(missing_docs)]
#![doc = env!("CARGO_PKG_DESCRIPTION")]

/// cooperative cancellation token.
pub mod cancel;

/// image error types.
pub mod error;

/// raster image type.
pub mod image;

/// boolean region masks.
pub mod mask;

/// B-spline image model and pyramids.
pub mod model;

pub use cancel::CancelToken;
pub use error::ImageError;
pub use image::{Image, ImageSize};
pub use mask::{Mask, Polygon};
pub use model::{build_model_pair, ImageModel, ImageRole, ModelTaps, Resolution};
