use num_traits::ToPrimitive;

use crate::error::ImageError;

/// Image size in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageSize {
    /// Width of the image in pixels.
    pub width: usize,
    /// Height of the image in pixels.
    pub height: usize,
}

impl std::fmt::Display for ImageSize {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "ImageSize {{ width: {}, height: {} }}",
            self.width, self.height
        )
    }
}

impl From<[usize; 2]> for ImageSize {
    fn from(size: [usize; 2]) -> Self {
        ImageSize {
            width: size[0],
            height: size[1],
        }
    }
}

/// A single-channel raster of real-valued samples in row-major order.
///
/// Registration runs entirely on `f64` intensities; [`Image::from_samples`]
/// ingests any primitive sample type up front.
///
/// # Examples
///
/// ```
/// use warpline_image::{Image, ImageSize};
///
/// let image = Image::new(
///     ImageSize {
///         width: 2,
///         height: 2,
///     },
///     vec![0.0, 1.0, 2.0, 3.0],
/// )
/// .unwrap();
///
/// assert_eq!(image.width(), 2);
/// assert_eq!(image.pixel(1, 1), 3.0);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    size: ImageSize,
    data: Vec<f64>,
}

impl Image {
    /// Create a new image from pixel data.
    ///
    /// # Errors
    ///
    /// Returns [`ImageError::InvalidLength`] if the data length does not
    /// match `size.width * size.height`.
    pub fn new(size: ImageSize, data: Vec<f64>) -> Result<Self, ImageError> {
        if data.len() != size.width * size.height {
            return Err(ImageError::InvalidLength(
                data.len(),
                size.width * size.height,
            ));
        }
        Ok(Self { size, data })
    }

    /// Create an image filled with a constant value.
    pub fn from_size_val(size: ImageSize, val: f64) -> Self {
        Self {
            size,
            data: vec![val; size.width * size.height],
        }
    }

    /// Ingest a raster of any primitive sample type.
    ///
    /// Samples that cannot be represented (only relevant for exotic
    /// types) map to zero.
    pub fn from_samples<T: ToPrimitive>(size: ImageSize, samples: &[T]) -> Result<Self, ImageError> {
        if samples.len() != size.width * size.height {
            return Err(ImageError::InvalidLength(
                samples.len(),
                size.width * size.height,
            ));
        }
        let data = samples
            .iter()
            .map(|s| s.to_f64().unwrap_or(0.0))
            .collect();
        Ok(Self { size, data })
    }

    /// The image size.
    #[inline]
    pub fn size(&self) -> ImageSize {
        self.size
    }

    /// Width of the image in pixels.
    #[inline]
    pub fn width(&self) -> usize {
        self.size.width
    }

    /// Height of the image in pixels.
    #[inline]
    pub fn height(&self) -> usize {
        self.size.height
    }

    /// The sample data in row-major order.
    #[inline]
    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    /// The sample data in row-major order, mutably.
    #[inline]
    pub fn as_slice_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    /// The sample at pixel `(x, y)`.
    #[inline]
    pub fn pixel(&self, x: usize, y: usize) -> f64 {
        self.data[y * self.size.width + x]
    }

    pub(crate) fn into_data(self) -> Vec<f64> {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_shape_check() {
        let bad = Image::new(
            ImageSize {
                width: 3,
                height: 2,
            },
            vec![0.0; 5],
        );
        assert_eq!(bad, Err(ImageError::InvalidLength(5, 6)));
    }

    #[test]
    fn test_from_samples_u8() {
        let img = Image::from_samples(
            ImageSize {
                width: 2,
                height: 1,
            },
            &[10u8, 250u8],
        )
        .unwrap();
        assert_eq!(img.as_slice(), &[10.0, 250.0]);
    }

    #[test]
    fn test_from_samples_u16_and_f32() {
        let img = Image::from_samples(
            ImageSize {
                width: 2,
                height: 1,
            },
            &[40_000u16, 1u16],
        )
        .unwrap();
        assert_eq!(img.pixel(0, 0), 40_000.0);

        let img = Image::from_samples(
            ImageSize {
                width: 1,
                height: 1,
            },
            &[0.5f32],
        )
        .unwrap();
        assert_eq!(img.pixel(0, 0), 0.5);
    }
}
