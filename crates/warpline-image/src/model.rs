use warpline_spline::{
    samples_to_coefficients, symmetric_fir_mirror_off_bounds, tap_set, Boundary, PrecomputedTaps,
    SplineDegree, TapSet,
};

use crate::cancel::CancelToken;
use crate::image::Image;

/// No pyramid level may fall below this side length.
const MIN_IMAGE_SIZE: usize = 4;

/// Whether an image is the moving (source) or the fixed (target) side of
/// a registration. Only the target carries an intensity pyramid; the
/// source is always sampled through its spline coefficients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageRole {
    /// The moving image, warped into the target frame.
    Source,
    /// The fixed image the registration converges towards.
    Target,
}

/// Which resolution the interpolation reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The current pyramid level (coarse during early scales).
    Current,
    /// The full-resolution coefficient array.
    Full,
}

#[derive(Debug, Clone)]
struct PyramidLevel {
    width: usize,
    height: usize,
    data: Vec<f64>,
}

/// Four-tap interpolation state at one point of a model.
#[derive(Debug, Clone)]
pub struct ModelTaps {
    /// Taps along the x axis.
    pub x: TapSet,
    /// Taps along the y axis.
    pub y: TapSet,
    /// Resolution the taps were prepared for.
    pub resolution: Resolution,
}

/// Cubic B-spline model of one raster.
///
/// Owns the full-resolution coefficient array, a coefficient pyramid
/// (coarsest level popped first) and, for the registration target, a
/// parallel intensity pyramid. The "current" level is a cursor advanced
/// one level at a time by [`ImageModel::pop_from_pyramid`]; once the
/// pyramid is exhausted the cursor rests at full resolution.
#[derive(Debug, Clone)]
pub struct ImageModel {
    width: usize,
    height: usize,
    role: ImageRole,
    mirrored: bool,

    image: Vec<f64>,
    coefficient: Vec<f64>,

    coeff_pyramid: Vec<PyramidLevel>,
    image_pyramid: Vec<PyramidLevel>,
    current_coeff: Option<PyramidLevel>,
    current_image: Option<PyramidLevel>,

    pyramid_depth: usize,
    current_depth: usize,
}

impl ImageModel {
    /// Convert a raster into its spline model and build the pyramids.
    ///
    /// The full-resolution sample-to-coefficient conversion is not
    /// interruptible (multiresolution setup depends on it); pyramid
    /// construction polls `cancel` between filter passes and levels and
    /// stops early with a truncated pyramid when cancelled. The
    /// requested depth silently clamps to the level at which either
    /// dimension would drop below 4 samples.
    pub fn build(image: Image, role: ImageRole, pyramid_depth: usize, cancel: &CancelToken) -> Self {
        let width = image.width();
        let height = image.height();
        let depth = clamp_depth(width, height, pyramid_depth);
        let image_data = image.into_data();

        let mut coefficient = image_data.clone();
        coefficients_in_place(&mut coefficient, width, height);

        let mut model = Self {
            width,
            height,
            role,
            mirrored: true,
            image: image_data,
            coefficient,
            coeff_pyramid: Vec::new(),
            image_pyramid: Vec::new(),
            current_coeff: None,
            current_image: None,
            pyramid_depth: depth,
            current_depth: depth + 1,
        };
        model.build_coefficient_pyramid(cancel);
        if role == ImageRole::Target {
            model.build_image_pyramid(cancel);
        }
        log::debug!(
            "built {:?} model {}x{} with pyramid depth {}",
            role,
            width,
            height,
            model.coeff_pyramid.len()
        );
        model
    }

    /// Wrap an existing coefficient grid, typically one component of a
    /// deformation field. No pyramid, no mirror extension: taps falling
    /// outside the control lattice are skipped.
    pub fn from_coefficients(width: usize, height: usize, coefficients: Vec<f64>) -> Self {
        debug_assert_eq!(coefficients.len(), width * height);
        Self {
            width,
            height,
            role: ImageRole::Source,
            mirrored: false,
            image: Vec::new(),
            coefficient: coefficients,
            coeff_pyramid: Vec::new(),
            image_pyramid: Vec::new(),
            current_coeff: None,
            current_image: None,
            pyramid_depth: 0,
            current_depth: 0,
        }
    }

    /// Replace the coefficient array in place (same shape).
    pub fn set_coefficients(&mut self, coefficients: &[f64]) {
        self.coefficient.copy_from_slice(coefficients);
    }

    /// Full-resolution width.
    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    /// Full-resolution height.
    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    /// Width at the current pyramid level.
    #[inline]
    pub fn current_width(&self) -> usize {
        self.current_coeff.as_ref().map_or(self.width, |l| l.width)
    }

    /// Height at the current pyramid level.
    #[inline]
    pub fn current_height(&self) -> usize {
        self.current_coeff.as_ref().map_or(self.height, |l| l.height)
    }

    /// Ratio between the current width and the full width.
    #[inline]
    pub fn factor_width(&self) -> f64 {
        self.current_width() as f64 / self.width as f64
    }

    /// Ratio between the current height and the full height.
    #[inline]
    pub fn factor_height(&self) -> f64 {
        self.current_height() as f64 / self.height as f64
    }

    /// Levels built into the pyramid (the full-size level not counted).
    #[inline]
    pub fn pyramid_depth(&self) -> usize {
        self.pyramid_depth
    }

    /// How many pops remain until full resolution.
    #[inline]
    pub fn current_depth(&self) -> usize {
        self.current_depth
    }

    /// True once the cursor cannot advance any further.
    #[inline]
    pub fn is_finest(&self) -> bool {
        self.coeff_pyramid.is_empty()
    }

    /// The full-resolution samples this model was built from.
    #[inline]
    pub fn image(&self) -> &[f64] {
        &self.image
    }

    /// The intensity raster at the current pyramid level. For a source
    /// model this is always the full-resolution raster.
    #[inline]
    pub fn current_image(&self) -> &[f64] {
        self.current_image.as_ref().map_or(&self.image, |l| &l.data)
    }

    /// Nearest-sample intensity lookup on the current pyramid level.
    #[inline]
    pub fn pixel_from_pyramid(&self, x: usize, y: usize) -> f64 {
        self.current_image()[y * self.current_width() + x]
    }

    /// Advance the current cursor one level finer. Once the pyramid is
    /// exhausted this is a no-op that leaves the cursor at full
    /// resolution.
    pub fn pop_from_pyramid(&mut self) {
        self.current_coeff = self.coeff_pyramid.pop();
        if self.current_depth > 0 {
            self.current_depth -= 1;
        }
        if self.role == ImageRole::Target {
            self.current_image = self.image_pyramid.pop();
            if let (Some(c), Some(i)) = (&self.current_coeff, &self.current_image) {
                debug_assert_eq!((c.width, c.height), (i.width, i.height));
            }
        }
    }

    /// Prepare the four-tap interpolation state at `(x, y)`.
    ///
    /// Coordinates are expressed on the pixel grid of the chosen
    /// resolution. Out-of-range taps are folded back (mirrored models)
    /// or skipped (coefficient-grid models) rather than rejected.
    pub fn taps(&self, x: f64, y: f64, resolution: Resolution) -> ModelTaps {
        let (w, h) = match resolution {
            Resolution::Current => (self.current_width(), self.current_height()),
            Resolution::Full => (self.width, self.height),
        };
        let boundary = if self.mirrored {
            Boundary::Mirror
        } else {
            Boundary::Skip
        };
        ModelTaps {
            x: tap_set(x, w, boundary),
            y: tap_set(y, h, boundary),
            resolution,
        }
    }

    #[inline]
    fn array_for(&self, resolution: Resolution) -> (&[f64], usize) {
        match resolution {
            Resolution::Full => (&self.coefficient, self.width),
            Resolution::Current => self
                .current_coeff
                .as_ref()
                .map_or((&self.coefficient[..], self.width), |l| {
                    (&l.data[..], l.width)
                }),
        }
    }

    /// Spline value at the prepared point.
    pub fn interpolate(&self, taps: &ModelTaps) -> f64 {
        let (coeffs, w) = self.array_for(taps.resolution);
        let mut value = 0.0;
        for j in 0..4 {
            if let Some(iy) = taps.y.index[j] {
                let p = iy * w;
                let mut s = 0.0;
                for i in 0..4 {
                    if let Some(ix) = taps.x.index[i] {
                        s += taps.x.weight[i] * coeffs[p + ix];
                    }
                }
                value += taps.y.weight[j] * s;
            }
        }
        value
    }

    /// First derivatives `[d/dx, d/dy]` at the prepared point.
    pub fn interpolate_derivatives(&self, taps: &ModelTaps) -> [f64; 2] {
        let (coeffs, w) = self.array_for(taps.resolution);
        let mut d = [0.0; 2];
        for j in 0..4 {
            if let Some(iy) = taps.y.index[j] {
                let p = iy * w;
                let (mut sx, mut sy) = (0.0, 0.0);
                for i in 0..4 {
                    if let Some(ix) = taps.x.index[i] {
                        let c = coeffs[p + ix];
                        sx += taps.x.d_weight[i] * c;
                        sy += taps.x.weight[i] * c;
                    }
                }
                d[0] += taps.y.weight[j] * sx;
                d[1] += taps.y.d_weight[j] * sy;
            }
        }
        d
    }

    /// Second derivatives `[d2/dxdy, d2/dx2, d2/dy2]` at the prepared
    /// point.
    pub fn interpolate_second_derivatives(&self, taps: &ModelTaps) -> [f64; 3] {
        let (coeffs, w) = self.array_for(taps.resolution);
        let mut d2 = [0.0; 3];
        for j in 0..4 {
            if let Some(iy) = taps.y.index[j] {
                let p = iy * w;
                let (mut sxy, mut sxx, mut syy) = (0.0, 0.0, 0.0);
                for i in 0..4 {
                    if let Some(ix) = taps.x.index[i] {
                        let c = coeffs[p + ix];
                        sxy += taps.x.d_weight[i] * c;
                        sxx += taps.x.d2_weight[i] * c;
                        syy += taps.x.weight[i] * c;
                    }
                }
                d2[0] += taps.y.d_weight[j] * sxy;
                d2[1] += taps.y.weight[j] * sxx;
                d2[2] += taps.y.d2_weight[j] * syy;
            }
        }
        d2
    }

    /// Spline value at grid position `(u, v)` through precomputed taps.
    ///
    /// The precomputed path always reads the full-resolution coefficient
    /// array; it exists for deformation grids, which have no pyramid.
    pub fn interpolate_grid(&self, pre: &PrecomputedTaps, u: usize, v: usize) -> f64 {
        let w = self.width;
        let (tx, ty) = (pre.x(u), pre.y(v));
        let mut value = 0.0;
        for j in 0..4 {
            if let Some(iy) = ty.index[j] {
                let p = iy * w;
                let mut s = 0.0;
                for i in 0..4 {
                    if let Some(ix) = tx.index[i] {
                        s += tx.weight[i] * self.coefficient[p + ix];
                    }
                }
                value += ty.weight[j] * s;
            }
        }
        value
    }

    /// First derivatives at grid position `(u, v)` through precomputed
    /// taps.
    pub fn interpolate_grid_derivatives(
        &self,
        pre: &PrecomputedTaps,
        u: usize,
        v: usize,
    ) -> [f64; 2] {
        let w = self.width;
        let (tx, ty) = (pre.x(u), pre.y(v));
        let mut d = [0.0; 2];
        for j in 0..4 {
            if let Some(iy) = ty.index[j] {
                let p = iy * w;
                let (mut sx, mut sy) = (0.0, 0.0);
                for i in 0..4 {
                    if let Some(ix) = tx.index[i] {
                        let c = self.coefficient[p + ix];
                        sx += tx.d_weight[i] * c;
                        sy += tx.weight[i] * c;
                    }
                }
                d[0] += ty.weight[j] * sx;
                d[1] += ty.d_weight[j] * sy;
            }
        }
        d
    }

    /// Second derivatives at grid position `(u, v)` through precomputed
    /// taps.
    pub fn interpolate_grid_second_derivatives(
        &self,
        pre: &PrecomputedTaps,
        u: usize,
        v: usize,
    ) -> [f64; 3] {
        let w = self.width;
        let (tx, ty) = (pre.x(u), pre.y(v));
        let mut d2 = [0.0; 3];
        for j in 0..4 {
            if let Some(iy) = ty.index[j] {
                let p = iy * w;
                let (mut sxy, mut sxx, mut syy) = (0.0, 0.0, 0.0);
                for i in 0..4 {
                    if let Some(ix) = tx.index[i] {
                        let c = self.coefficient[p + ix];
                        sxy += tx.d_weight[i] * c;
                        sxx += tx.d2_weight[i] * c;
                        syy += tx.weight[i] * c;
                    }
                }
                d2[0] += ty.d_weight[j] * sxy;
                d2[1] += ty.weight[j] * sxx;
                d2[2] += ty.d2_weight[j] * syy;
            }
        }
        d2
    }

    fn build_coefficient_pyramid(&mut self, cancel: &CancelToken) {
        let mut full_dual = vec![0.0; self.width * self.height];
        basic_to_cardinal_2d(
            &self.coefficient,
            &mut full_dual,
            self.width,
            self.height,
            SplineDegree::Septic,
            cancel,
        );
        let mut half_width = self.width;
        let mut half_height = self.height;
        for _ in 1..=self.pyramid_depth {
            if cancel.is_cancelled() {
                break;
            }
            let full_width = half_width;
            let full_height = half_height;
            half_width /= 2;
            half_height /= 2;
            let half_dual = half_dual_2d(&full_dual, full_width, full_height, cancel);
            let data =
                basic_from_cardinal_2d(&half_dual, half_width, half_height, SplineDegree::Septic, cancel);
            self.coeff_pyramid.push(PyramidLevel {
                width: half_width,
                height: half_height,
                data,
            });
            full_dual = half_dual;
        }
    }

    fn build_image_pyramid(&mut self, cancel: &CancelToken) {
        let mut full_dual = vec![0.0; self.width * self.height];
        cardinal_to_dual_2d(&self.image, &mut full_dual, self.width, self.height, cancel);
        let mut half_width = self.width;
        let mut half_height = self.height;
        for _ in 1..=self.pyramid_depth {
            if cancel.is_cancelled() {
                break;
            }
            let full_width = half_width;
            let full_height = half_height;
            half_width /= 2;
            half_height /= 2;
            let half_dual = half_dual_2d(&full_dual, full_width, full_height, cancel);
            let mut data = vec![0.0; half_width * half_height];
            dual_to_cardinal_2d(&half_dual, &mut data, half_width, half_height, cancel);
            self.image_pyramid.push(PyramidLevel {
                width: half_width,
                height: half_height,
                data,
            });
            full_dual = half_dual;
        }
    }
}

/// Build the source and target models concurrently and wait for both.
///
/// This join is the one hard synchronization point of a registration
/// run: the affine bootstrap needs both models at their coarsest level.
pub fn build_model_pair(
    source: Image,
    target: Image,
    pyramid_depth: usize,
    cancel: &CancelToken,
) -> (ImageModel, ImageModel) {
    let source_cancel = cancel.clone();
    let target_cancel = cancel.clone();
    rayon::join(
        move || ImageModel::build(source, ImageRole::Source, pyramid_depth, &source_cancel),
        move || ImageModel::build(target, ImageRole::Target, pyramid_depth, &target_cancel),
    )
}

fn clamp_depth(width: usize, height: usize, proposed: usize) -> usize {
    let mut w = width;
    let mut h = height;
    let mut scale = 0usize;
    while w >= MIN_IMAGE_SIZE && h >= MIN_IMAGE_SIZE {
        w /= 2;
        h /= 2;
        scale += 1;
    }
    proposed.min(scale.saturating_sub(1))
}

fn extract_column(array: &[f64], width: usize, x: usize, column: &mut [f64]) {
    let mut idx = x;
    for c in column.iter_mut() {
        *c = array[idx];
        idx += width;
    }
}

fn put_column(array: &mut [f64], width: usize, x: usize, column: &[f64]) {
    let mut idx = x;
    for c in column {
        array[idx] = *c;
        idx += width;
    }
}

/// Full-size sample-to-coefficient conversion, one IIR pass per axis.
fn coefficients_in_place(data: &mut [f64], width: usize, height: usize) {
    let mut line = vec![0.0; width];
    for y in 0..height {
        line.copy_from_slice(&data[y * width..(y + 1) * width]);
        samples_to_coefficients(&mut line, SplineDegree::Cubic);
        data[y * width..(y + 1) * width].copy_from_slice(&line);
    }
    let mut column = vec![0.0; height];
    for x in 0..width {
        extract_column(data, width, x, &mut column);
        samples_to_coefficients(&mut column, SplineDegree::Cubic);
        put_column(data, width, x, &column);
    }
}

fn basic_from_cardinal_2d(
    cardinal: &[f64],
    width: usize,
    height: usize,
    degree: SplineDegree,
    cancel: &CancelToken,
) -> Vec<f64> {
    let mut basic = vec![0.0; width * height];
    let mut line = vec![0.0; width];
    for y in 0..height {
        if cancel.is_cancelled() {
            break;
        }
        line.copy_from_slice(&cardinal[y * width..(y + 1) * width]);
        samples_to_coefficients(&mut line, degree);
        basic[y * width..(y + 1) * width].copy_from_slice(&line);
    }
    let mut column = vec![0.0; height];
    for x in 0..width {
        if cancel.is_cancelled() {
            break;
        }
        extract_column(&basic, width, x, &mut column);
        samples_to_coefficients(&mut column, degree);
        put_column(&mut basic, width, x, &column);
    }
    basic
}

fn basic_to_cardinal_2d(
    basic: &[f64],
    cardinal: &mut [f64],
    width: usize,
    height: usize,
    degree: SplineDegree,
    cancel: &CancelToken,
) {
    let taps = degree.sample_taps();
    let mut line = vec![0.0; width];
    for y in 0..height {
        if cancel.is_cancelled() {
            break;
        }
        symmetric_fir_mirror_off_bounds(taps, &basic[y * width..(y + 1) * width], &mut line);
        cardinal[y * width..(y + 1) * width].copy_from_slice(&line);
    }
    let mut column = vec![0.0; height];
    let mut filtered = vec![0.0; height];
    for x in 0..width {
        if cancel.is_cancelled() {
            break;
        }
        extract_column(cardinal, width, x, &mut column);
        symmetric_fir_mirror_off_bounds(taps, &column, &mut filtered);
        put_column(cardinal, width, x, &filtered);
    }
}

/// cardinal -> dual: refit as cubic coefficients, resample as septic.
fn cardinal_to_dual_2d(
    cardinal: &[f64],
    dual: &mut [f64],
    width: usize,
    height: usize,
    cancel: &CancelToken,
) {
    let basic = basic_from_cardinal_2d(cardinal, width, height, SplineDegree::Cubic, cancel);
    basic_to_cardinal_2d(&basic, dual, width, height, SplineDegree::Septic, cancel);
}

/// dual -> cardinal: refit as septic coefficients, resample as cubic.
fn dual_to_cardinal_2d(
    dual: &[f64],
    cardinal: &mut [f64],
    width: usize,
    height: usize,
    cancel: &CancelToken,
) {
    let basic = basic_from_cardinal_2d(dual, width, height, SplineDegree::Septic, cancel);
    basic_to_cardinal_2d(&basic, cardinal, width, height, SplineDegree::Cubic, cancel);
}

fn half_dual_2d(
    full_dual: &[f64],
    full_width: usize,
    full_height: usize,
    cancel: &CancelToken,
) -> Vec<f64> {
    let half_width = full_width / 2;
    let half_height = full_height / 2;
    let mut demi = vec![0.0; half_width * full_height];
    let mut half_row = vec![0.0; half_width];
    for y in 0..full_height {
        if cancel.is_cancelled() {
            break;
        }
        warpline_spline::reduce_dual(
            &full_dual[y * full_width..(y + 1) * full_width],
            &mut half_row,
        );
        demi[y * half_width..(y + 1) * half_width].copy_from_slice(&half_row);
    }
    let mut half = vec![0.0; half_width * half_height];
    let mut column = vec![0.0; full_height];
    let mut half_column = vec![0.0; half_height];
    for x in 0..half_width {
        if cancel.is_cancelled() {
            break;
        }
        extract_column(&demi, half_width, x, &mut column);
        warpline_spline::reduce_dual(&column, &mut half_column);
        put_column(&mut half, half_width, x, &half_column);
    }
    half
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ImageSize;
    use approx::assert_relative_eq;

    fn ramp_image(width: usize, height: usize) -> Image {
        let data = (0..width * height)
            .map(|k| (k % width) as f64 + 2.0 * (k / width) as f64)
            .collect();
        Image::new(ImageSize { width, height }, data).unwrap()
    }

    #[test]
    fn test_pyramid_monotonicity() {
        let img = Image::from_size_val(
            ImageSize {
                width: 64,
                height: 48,
            },
            1.0,
        );
        let mut model = ImageModel::build(img, ImageRole::Target, 3, &CancelToken::new());
        assert_eq!(model.pyramid_depth(), 3);
        let mut expected = (64usize, 48usize);
        let mut sizes = Vec::new();
        for _ in 0..=3 {
            model.pop_from_pyramid();
            sizes.push((model.current_width(), model.current_height()));
        }
        // Coarsest first, each level exactly double the previous.
        sizes.reverse();
        for (w, h) in sizes {
            assert_eq!((w, h), expected);
            expected = (expected.0 / 2, expected.1 / 2);
        }
    }

    #[test]
    fn test_depth_clamps_at_min_size() {
        let img = Image::from_size_val(
            ImageSize {
                width: 16,
                height: 64,
            },
            0.0,
        );
        // 16 -> 8 -> 4 -> 2: only two halvings keep both sides >= 4.
        let model = ImageModel::build(img, ImageRole::Source, 10, &CancelToken::new());
        assert_eq!(model.pyramid_depth(), 2);
        assert_eq!(model.current_depth(), 3);
    }

    #[test]
    fn test_interpolation_reproduces_samples() {
        let img = ramp_image(16, 12);
        let samples = img.as_slice().to_vec();
        let model = ImageModel::build(img, ImageRole::Source, 0, &CancelToken::new());
        for y in 0..12 {
            for x in 0..16 {
                let taps = model.taps(x as f64, y as f64, Resolution::Full);
                assert_relative_eq!(
                    model.interpolate(&taps),
                    samples[y * 16 + x],
                    epsilon = 1e-8
                );
            }
        }
    }

    #[test]
    fn test_derivatives_of_ramp() {
        // f(x, y) = x + 2y away from the mirror borders.
        let model = ImageModel::build(ramp_image(16, 16), ImageRole::Source, 0, &CancelToken::new());
        for y in 4..12 {
            for x in 4..12 {
                let taps = model.taps(x as f64 + 0.3, y as f64 + 0.7, Resolution::Full);
                let d = model.interpolate_derivatives(&taps);
                assert_relative_eq!(d[0], 1.0, epsilon = 1e-6);
                assert_relative_eq!(d[1], 2.0, epsilon = 1e-6);
                let d2 = model.interpolate_second_derivatives(&taps);
                for v in d2 {
                    assert_relative_eq!(v, 0.0, epsilon = 1e-6);
                }
            }
        }
    }

    #[test]
    fn test_pop_past_finest_is_full_resolution() {
        let img = Image::from_size_val(
            ImageSize {
                width: 32,
                height: 32,
            },
            5.0,
        );
        let mut model = ImageModel::build(img, ImageRole::Target, 2, &CancelToken::new());
        for _ in 0..5 {
            model.pop_from_pyramid();
        }
        assert!(model.is_finest());
        assert_eq!(model.current_width(), 32);
        assert_eq!(model.current_depth(), 0);
        assert_eq!(model.pixel_from_pyramid(3, 3), 5.0);
    }

    #[test]
    fn test_target_gets_image_pyramid() {
        let img = Image::from_size_val(
            ImageSize {
                width: 32,
                height: 32,
            },
            2.5,
        );
        let mut model = ImageModel::build(img, ImageRole::Target, 1, &CancelToken::new());
        model.pop_from_pyramid();
        assert_eq!(model.current_width(), 16);
        assert_eq!(model.current_image().len(), 16 * 16);
        // A constant image stays constant across pyramid levels.
        for v in model.current_image() {
            assert_relative_eq!(*v, 2.5, epsilon = 1e-8);
        }
    }

    #[test]
    fn test_coefficient_grid_skips_outside_taps() {
        // A deformation-style grid: no mirroring, outside taps ignored.
        let model = ImageModel::from_coefficients(4, 4, vec![1.0; 16]);
        let taps = model.taps(0.0, 0.0, Resolution::Full);
        assert!(taps.x.index.iter().any(|i| i.is_none()));
        // The value is smaller than 1.0 because a border tap is dropped.
        assert!(model.interpolate(&taps) < 1.0);
    }

    #[test]
    fn test_precomputed_matches_per_call() {
        let grid = 7; // intervals = 4
        let coeffs: Vec<f64> = (0..grid * grid).map(|k| (k as f64 * 0.37).sin()).collect();
        let model = ImageModel::from_coefficients(grid, grid, coeffs);
        let pre = PrecomputedTaps::new(20, 15, 4);
        for v in [0usize, 7, 14] {
            for u in [0usize, 10, 19] {
                let tu = (u * 4) as f64 / 19.0 + 1.0;
                let tv = (v * 4) as f64 / 14.0 + 1.0;
                let taps = model.taps(tu, tv, Resolution::Full);
                assert_relative_eq!(
                    model.interpolate_grid(&pre, u, v),
                    model.interpolate(&taps),
                    epsilon = 1e-12
                );
                let a = model.interpolate_grid_derivatives(&pre, u, v);
                let b = model.interpolate_derivatives(&taps);
                assert_relative_eq!(a[0], b[0], epsilon = 1e-12);
                assert_relative_eq!(a[1], b[1], epsilon = 1e-12);
                let a2 = model.interpolate_grid_second_derivatives(&pre, u, v);
                let b2 = model.interpolate_second_derivatives(&taps);
                for (x, y) in a2.iter().zip(&b2) {
                    assert_relative_eq!(x, y, epsilon = 1e-12);
                }
            }
        }
    }

    #[test]
    fn test_cancelled_build_truncates_pyramid() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let img = Image::from_size_val(
            ImageSize {
                width: 64,
                height: 64,
            },
            1.0,
        );
        let model = ImageModel::build(img, ImageRole::Target, 3, &cancel);
        // The full-size coefficients exist but no level was added.
        assert!(model.is_finest());
        assert_eq!(model.current_width(), 64);
    }

    #[test]
    fn test_build_pair_joins_both() {
        let source = ramp_image(32, 32);
        let target = ramp_image(32, 32);
        let (s, t) = build_model_pair(source, target, 2, &CancelToken::new());
        assert_eq!(s.pyramid_depth(), 2);
        assert_eq!(t.pyramid_depth(), 2);
        assert!(!s.is_finest());
    }
}
