/// An error type for the image module.
#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ImageError {
    /// Error when the data length does not match the image size.
    #[error("data length ({0}) does not match the image size ({1})")]
    InvalidLength(usize, usize),

    /// Error when two rasters that must be aligned have different sizes.
    #[error("expected size {0}x{1}, got {2}x{3}")]
    SizeMismatch(usize, usize, usize, usize),
}
