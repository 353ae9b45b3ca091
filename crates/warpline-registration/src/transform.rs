//! The fitted elastic transform: field sampling, warping, persistence.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use warpline_image::{Image, ImageModel, ImageSize, Resolution};
use warpline_linalg::Mat;

use crate::error::RegistrationError;

/// A tensor-product cubic B-spline deformation over a uniform
/// `intervals` x `intervals` control grid spanning the target extent.
///
/// `cx`/`cy` hold the x and y source coordinates of the deformation,
/// each of size `(intervals + 3)` squared. Mapping a target pixel
/// `(u, v)` evaluates both splines at
/// `t = u * intervals / (width - 1) + 1`.
#[derive(Debug, Clone, PartialEq)]
pub struct ElasticTransform {
    /// Number of control intervals per axis (a power of two).
    pub intervals: usize,
    /// X-coordinate coefficient grid.
    pub cx: Mat,
    /// Y-coordinate coefficient grid.
    pub cy: Mat,
}

impl ElasticTransform {
    /// Wrap existing coefficient grids.
    ///
    /// # Panics
    ///
    /// Panics if either grid is not `(intervals + 3)` squared.
    pub fn new(intervals: usize, cx: Mat, cy: Mat) -> Self {
        let grid = intervals + 3;
        assert_eq!((cx.rows(), cx.cols()), (grid, grid));
        assert_eq!((cy.rows(), cy.cols()), (grid, grid));
        Self { intervals, cx, cy }
    }

    fn interpolators(&self) -> (ImageModel, ImageModel) {
        let grid = self.intervals + 3;
        (
            ImageModel::from_coefficients(grid, grid, self.cx.as_slice().to_vec()),
            ImageModel::from_coefficients(grid, grid, self.cy.as_slice().to_vec()),
        )
    }

    /// Map one target pixel into source coordinates.
    ///
    /// Convenience for occasional lookups; use [`Self::sample_field`]
    /// for dense evaluation.
    pub fn map_point(&self, target_size: ImageSize, u: f64, v: f64) -> [f64; 2] {
        let (swx, swy) = self.interpolators();
        let tu = u * self.intervals as f64 / (target_size.width - 1) as f64 + 1.0;
        let tv = v * self.intervals as f64 / (target_size.height - 1) as f64 + 1.0;
        let taps = swx.taps(tu, tv, Resolution::Full);
        [swx.interpolate(&taps), swy.interpolate(&taps)]
    }

    /// Sample the dense per-pixel coordinate maps over the target
    /// extent, row-major `(x map, y map)`.
    pub fn sample_field(&self, target_size: ImageSize) -> (Vec<f64>, Vec<f64>) {
        let (swx, swy) = self.interpolators();
        let (width, height) = (target_size.width, target_size.height);
        let mut map_x = vec![0.0; width * height];
        let mut map_y = vec![0.0; width * height];
        let mut k = 0;
        for v in 0..height {
            let tv = (v * self.intervals) as f64 / (height - 1) as f64 + 1.0;
            for u in 0..width {
                let tu = (u * self.intervals) as f64 / (width - 1) as f64 + 1.0;
                let taps = swx.taps(tu, tv, Resolution::Full);
                map_x[k] = swx.interpolate(&taps);
                map_y[k] = swy.interpolate(&taps);
                k += 1;
            }
        }
        (map_x, map_y)
    }

    /// Warp a source model into the target frame.
    ///
    /// Every target pixel maps through the deformation and samples the
    /// source spline; pixels mapping outside the source extent come out
    /// zero.
    pub fn warp(&self, source: &ImageModel, target_size: ImageSize) -> Image {
        let (map_x, map_y) = self.sample_field(target_size);
        let (sw, sh) = (source.width() as f64, source.height() as f64);
        let mut out = Image::from_size_val(target_size, 0.0);
        for (k, value) in out.as_slice_mut().iter_mut().enumerate() {
            let (x, y) = (map_x[k], map_y[k]);
            if x >= 0.0 && x < sw && y >= 0.0 && y < sh {
                let taps = source.taps(x, y, Resolution::Full);
                *value = source.interpolate(&taps);
            }
        }
        out
    }

    /// Write the persisted text form.
    pub fn write_to<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        let grid = self.intervals + 3;
        writeln!(writer, "Intervals={}", self.intervals)?;
        writeln!(writer)?;
        writeln!(writer, "X Coeffs -----------------------------------")?;
        for i in 0..grid {
            for j in 0..grid {
                write!(writer, "{:>21} ", self.cx[(i, j)])?;
            }
            writeln!(writer)?;
        }
        writeln!(writer)?;
        writeln!(writer, "Y Coeffs -----------------------------------")?;
        for i in 0..grid {
            for j in 0..grid {
                write!(writer, "{:>21} ", self.cy[(i, j)])?;
            }
            writeln!(writer)?;
        }
        Ok(())
    }

    /// Save the persisted text form to a file.
    pub fn save(&self, path: &Path) -> Result<(), RegistrationError> {
        let mut writer = BufWriter::new(File::create(path)?);
        self.write_to(&mut writer)?;
        Ok(())
    }

    /// Parse the persisted text form.
    ///
    /// # Errors
    ///
    /// Wrong token counts and non-numeric fields are reported with the
    /// offending line number; no partial transform is returned.
    pub fn read_from<R: BufRead>(reader: R) -> Result<Self, RegistrationError> {
        let mut lines = reader.lines();
        let mut line_number = 0usize;
        let next_line = |lines: &mut std::io::Lines<R>,
                             line_number: &mut usize|
         -> Result<String, RegistrationError> {
            *line_number += 1;
            lines
                .next()
                .transpose()?
                .ok_or(RegistrationError::TransformParse {
                    line: *line_number,
                    message: "unexpected end of file".into(),
                })
        };

        let header = next_line(&mut lines, &mut line_number)?;
        let mut parts = header.split('=');
        let (Some(_), Some(value), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(RegistrationError::TransformParse {
                line: line_number,
                message: "cannot read number of intervals".into(),
            });
        };
        let intervals: usize =
            value
                .trim()
                .parse()
                .map_err(|_| RegistrationError::TransformParse {
                    line: line_number,
                    message: format!("'{}' is not a number of intervals", value.trim()),
                })?;
        let grid = intervals + 3;

        let read_matrix = |lines: &mut std::io::Lines<R>,
                               line_number: &mut usize|
         -> Result<Mat, RegistrationError> {
            // Blank separator and section header.
            next_line(lines, line_number)?;
            next_line(lines, line_number)?;
            let mut m = Mat::zeros(grid, grid);
            for i in 0..grid {
                let row = next_line(lines, line_number)?;
                let tokens: Vec<&str> = row.split_whitespace().collect();
                if tokens.len() != grid {
                    return Err(RegistrationError::TransformParse {
                        line: *line_number,
                        message: format!("expected {} coefficients, got {}", grid, tokens.len()),
                    });
                }
                for (j, token) in tokens.iter().enumerate() {
                    m[(i, j)] = token
                        .parse()
                        .map_err(|_| RegistrationError::TransformParse {
                            line: *line_number,
                            message: format!("'{token}' is not a coefficient"),
                        })?;
                }
            }
            Ok(m)
        };

        let cx = read_matrix(&mut lines, &mut line_number)?;
        let cy = read_matrix(&mut lines, &mut line_number)?;
        Ok(Self { intervals, cx, cy })
    }

    /// Load the persisted text form from a file.
    pub fn load(path: &Path) -> Result<Self, RegistrationError> {
        Self::read_from(BufReader::new(File::open(path)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use warpline_image::{CancelToken, ImageRole};

    fn arbitrary_transform(intervals: usize) -> ElasticTransform {
        let grid = intervals + 3;
        let cx = Mat::from_vec(
            grid,
            grid,
            (0..grid * grid)
                .map(|k| (k as f64 * 0.7311).sin() * 40.0)
                .collect(),
        )
        .unwrap();
        let cy = Mat::from_vec(
            grid,
            grid,
            (0..grid * grid)
                .map(|k| (k as f64 * 1.137).cos() * 40.0)
                .collect(),
        )
        .unwrap();
        ElasticTransform::new(intervals, cx, cy)
    }

    fn identity_transform(intervals: usize, size: ImageSize) -> ElasticTransform {
        let grid = intervals + 3;
        let mut cx = Mat::zeros(grid, grid);
        let mut cy = Mat::zeros(grid, grid);
        for i in 0..grid {
            let y = (i as f64 - 1.0) * (size.height - 1) as f64 / intervals as f64;
            for j in 0..grid {
                let x = (j as f64 - 1.0) * (size.width - 1) as f64 / intervals as f64;
                cx[(i, j)] = x;
                cy[(i, j)] = y;
            }
        }
        ElasticTransform::new(intervals, cx, cy)
    }

    #[test]
    fn test_round_trip_full_precision() {
        let transform = arbitrary_transform(4);
        let mut buf = Vec::new();
        transform.write_to(&mut buf).unwrap();
        let parsed = ElasticTransform::read_from(buf.as_slice()).unwrap();
        assert_eq!(parsed, transform);
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("elastic_transf.txt");
        let transform = arbitrary_transform(2);
        transform.save(&path).unwrap();
        let loaded = ElasticTransform::load(&path).unwrap();
        assert_eq!(loaded, transform);
    }

    #[test]
    fn test_malformed_reports_line_number() {
        // Break the coefficient count on the first cx row (line 4).
        let transform = arbitrary_transform(2);
        let mut buf = Vec::new();
        transform.write_to(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let broken: Vec<&str> = text.lines().collect();
        let mut bad = broken.clone();
        bad[3] = "1.0 2.0";
        let err = ElasticTransform::read_from(bad.join("\n").as_bytes()).unwrap_err();
        match err {
            RegistrationError::TransformParse { line, .. } => assert_eq!(line, 4),
            other => panic!("unexpected error: {other}"),
        }

        let mut bad = broken.clone();
        bad[0] = "no intervals here";
        assert!(matches!(
            ElasticTransform::read_from(bad.join("\n").as_bytes()),
            Err(RegistrationError::TransformParse { line: 1, .. })
        ));
    }

    #[test]
    fn test_identity_field() {
        let size = ImageSize {
            width: 33,
            height: 17,
        };
        let transform = identity_transform(4, size);
        let (map_x, map_y) = transform.sample_field(size);
        let mut k = 0;
        for v in 0..size.height {
            for u in 0..size.width {
                assert_relative_eq!(map_x[k], u as f64, epsilon = 1e-9);
                assert_relative_eq!(map_y[k], v as f64, epsilon = 1e-9);
                k += 1;
            }
        }
        let p = transform.map_point(size, 8.5, 3.25);
        assert_relative_eq!(p[0], 8.5, epsilon = 1e-9);
        assert_relative_eq!(p[1], 3.25, epsilon = 1e-9);
    }

    #[test]
    fn test_warp_through_identity_reproduces_source() {
        let size = ImageSize {
            width: 16,
            height: 16,
        };
        let data: Vec<f64> = (0..256).map(|k| (k as f64 * 0.13).sin()).collect();
        let img = Image::new(size, data.clone()).unwrap();
        let model = ImageModel::build(img, ImageRole::Source, 0, &CancelToken::new());
        let transform = identity_transform(2, size);
        let warped = transform.warp(&model, size);
        for (a, b) in warped.as_slice().iter().zip(&data) {
            assert_relative_eq!(a, b, epsilon = 1e-6);
        }
    }
}
