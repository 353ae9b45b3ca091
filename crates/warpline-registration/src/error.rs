/// An error type for the registration crate.
#[derive(thiserror::Error, Debug)]
pub enum RegistrationError {
    /// The deformation scale bounds are inverted.
    #[error("min deformation scale ({0}) exceeds max deformation scale ({1})")]
    InvalidScaleBounds(usize, usize),

    /// A weight that must be non-negative is not.
    #[error("{0} weight must be >= 0 and finite, got {1}")]
    InvalidWeight(&'static str, f64),

    /// The optimizer stop threshold must be positive.
    #[error("stop threshold must be > 0 and finite, got {0}")]
    InvalidStopThreshold(f64),

    /// A mask is not aligned to the raster it belongs to.
    #[error("mask size {got_width}x{got_height} does not match image size {width}x{height}")]
    MaskSizeMismatch {
        /// Expected width (the image width).
        width: usize,
        /// Expected height (the image height).
        height: usize,
        /// Actual mask width.
        got_width: usize,
        /// Actual mask height.
        got_height: usize,
    },

    /// Reading or writing a persisted file failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A persisted transform file is malformed.
    #[error("transform file, line {line}: {message}")]
    TransformParse {
        /// One-based line number of the offending line.
        line: usize,
        /// What was expected there.
        message: String,
    },

    /// A landmark exchange file is malformed.
    #[error("landmark file, line {line}: {message}")]
    LandmarkParse {
        /// One-based line number of the offending line.
        line: usize,
        /// What was expected there.
        message: String,
    },
}
