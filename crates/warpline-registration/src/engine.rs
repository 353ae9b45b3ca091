//! The multiresolution registration engine.
//!
//! A run starts from the coarsest pyramid level of both image models,
//! seeds the deformation from an affine bootstrap, then walks a small
//! state machine over deformation scale and image detail: refine the
//! control grid, refine the image, and finally advance the remaining
//! image levels without touching the grid resolution. At every step
//! the landmark residues are re-fitted and, when the image term is
//! active, the coefficients are polished by the optimizer.

use warpline_image::{build_model_pair, CancelToken, Image, ImageModel, Mask, Resolution};
use warpline_linalg::{pseudo_inverse, svd, Mat, MACHINE_EPSILON};
use warpline_spline::{bspline_3, CUBIC_TWO_SCALE};

use crate::config::RegistrationConfig;
use crate::error::RegistrationError;
use crate::landmarks::Landmark;
use crate::optimizer::optimize_coefficients;
use crate::regularization::RegularizationOperator;
use crate::similarity::EvalContext;
use crate::transform::ElasticTransform;

/// Advisory progress callback: `(done, total)` in workload units.
pub type ProgressCallback = Box<dyn FnMut(u64, u64) + Send>;

/// Workload units budgeted per optimizer run at pyramid depth zero;
/// deeper (coarser) levels get proportionally more.
const WORKLOAD_PER_LEVEL: u64 = 300;

pub(crate) struct ProgressTracker {
    done: u64,
    total: u64,
    callback: Option<ProgressCallback>,
}

impl ProgressTracker {
    fn new(total: u64, callback: Option<ProgressCallback>) -> Self {
        Self {
            done: 0,
            total,
            callback,
        }
    }

    pub(crate) fn step(&mut self, units: u64) {
        self.done += units;
        if let Some(callback) = &mut self.callback {
            callback(self.done, self.total);
        }
    }

    pub(crate) fn skip(&mut self, units: u64) {
        self.step(units);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    RefineDeformation,
    RefineImage,
    FinalImageOnly,
    Done,
}

/// Outcome of a registration run.
#[derive(Debug)]
pub struct RegistrationResult {
    /// The fitted deformation.
    pub transform: ElasticTransform,
    /// Energy of the last optimizer evaluation, when the image term ran.
    pub energy: Option<f64>,
    /// True when the run was cut short by cancellation; the transform
    /// holds the best coefficients obtained so far.
    pub cancelled: bool,
}

/// Elastic registration of a source image onto a target image.
pub struct ElasticRegistration {
    source: ImageModel,
    target: ImageModel,
    source_mask: Mask,
    target_mask: Mask,
    landmarks: Vec<Landmark>,
    config: RegistrationConfig,
    cancel: CancelToken,
    progress: Option<ProgressCallback>,
}

impl ElasticRegistration {
    /// Create an engine over prebuilt models and masks.
    ///
    /// # Errors
    ///
    /// Rejects invalid configurations and masks that are not aligned to
    /// their raster.
    pub fn new(
        source: ImageModel,
        target: ImageModel,
        source_mask: Mask,
        target_mask: Mask,
        landmarks: Vec<Landmark>,
        config: RegistrationConfig,
    ) -> Result<Self, RegistrationError> {
        config.validate()?;
        for (mask, model) in [(&source_mask, &source), (&target_mask, &target)] {
            if mask.width() != model.width() || mask.height() != model.height() {
                return Err(RegistrationError::MaskSizeMismatch {
                    width: model.width(),
                    height: model.height(),
                    got_width: mask.width(),
                    got_height: mask.height(),
                });
            }
        }
        Ok(Self {
            source,
            target,
            source_mask,
            target_mask,
            landmarks,
            config,
            cancel: CancelToken::new(),
            progress: None,
        })
    }

    /// Ingest two rasters, build both models concurrently (whole-image
    /// masks) and set up the engine.
    pub fn from_images(
        source: Image,
        target: Image,
        landmarks: Vec<Landmark>,
        config: RegistrationConfig,
    ) -> Result<Self, RegistrationError> {
        config.validate()?;
        let source_mask = Mask::all_inside(source.width(), source.height());
        let target_mask = Mask::all_inside(target.width(), target.height());
        let cancel = CancelToken::new();
        let (source, target) = build_model_pair(source, target, config.pyramid_depth(), &cancel);
        let mut engine = Self::new(source, target, source_mask, target_mask, landmarks, config)?;
        engine.cancel = cancel;
        Ok(engine)
    }

    /// Use an externally shared cancellation token.
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Attach an advisory progress callback.
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Replace the source mask.
    pub fn with_source_mask(mut self, mask: Mask) -> Self {
        self.source_mask = mask;
        self
    }

    /// Replace the target mask.
    pub fn with_target_mask(mut self, mask: Mask) -> Self {
        self.target_mask = mask;
        self
    }

    /// Run the registration to completion (or cancellation) and return
    /// the fitted transform.
    pub fn run(self) -> RegistrationResult {
        let Self {
            mut source,
            mut target,
            source_mask,
            target_mask,
            landmarks,
            config,
            cancel,
            progress,
        } = self;

        // Bring the coarsest level into play.
        source.pop_from_pyramid();
        target.pop_from_pyramid();
        let mut tcw = target.current_width();
        let mut tch = target.current_height();
        let mut fw = target.factor_width();
        let mut fh = target.factor_height();

        let mut intervals = 1usize << config.min_scale_deformation;
        let mut cx = Mat::zeros(intervals + 3, intervals + 3);
        let mut cy = Mat::zeros(intervals + 3, intervals + 3);

        let mut operator = RegularizationOperator::build(
            intervals,
            tcw,
            tch,
            config.div_weight,
            config.curl_weight,
        );

        // The bootstrap transform is folded into the spline seed; when
        // landmarks carry their own energy term the seed stays identity
        // and the optimizer pulls them in instead.
        let affine = if config.landmark_weight == 0.0 {
            affine_from_landmarks(&landmarks, &source, &target, fw, fh)
        } else {
            [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]
        };
        for i in 0..intervals + 3 {
            let v = (i as f64 - 1.0) * (tch as f64 - 1.0) / intervals as f64;
            let xv = affine[0][2] + affine[0][1] * v;
            let yv = affine[1][2] + affine[1][1] * v;
            for j in 0..intervals + 3 {
                let u = (j as f64 - 1.0) * (tcw as f64 - 1.0) / intervals as f64;
                cx[(i, j)] = xv + affine[0][0] * u;
                cy[(i, j)] = yv + affine[1][0] * u;
            }
        }

        let mut dx = vec![0.0; landmarks.len()];
        let mut dy = vec![0.0; landmarks.len()];
        let mut tracker = ProgressTracker::new(
            total_workload(&config, target.current_depth()),
            progress,
        );

        let mut state = if config.min_scale_deformation == config.max_scale_deformation {
            State::RefineImage
        } else {
            State::RefineDeformation
        };
        let mut s = config.min_scale_deformation;
        let mut step = 0usize;
        let mut stop_threshold = config.stop_threshold;
        let mut last_energy = None;

        while state != State::Done {
            if cancel.is_cancelled() {
                break;
            }
            let current_depth = target.current_depth();
            log::debug!(
                "state {state:?}: scale {s}, intervals {intervals}, image depth {current_depth}"
            );

            if matches!(state, State::RefineDeformation | State::RefineImage) {
                if !landmarks.is_empty() {
                    let mut new_cx = Mat::zeros(intervals + 3, intervals + 3);
                    let mut new_cy = Mat::zeros(intervals + 3, intervals + 3);
                    scale_residues(
                        &landmarks, intervals, &cx, &cy, tcw, tch, fw, fh, &mut dx, &mut dy,
                    );
                    let regularized = config.div_weight != 0.0 || config.curl_weight != 0.0;
                    let underconstrained = if regularized {
                        fit_landmarks_regularized(
                            &landmarks, intervals, tcw, tch, fw, fh, &dx, &dy, &operator,
                            &mut new_cx, &mut new_cy,
                        )
                    } else {
                        fit_landmarks(
                            &landmarks, intervals, tcw, tch, fw, fh, &dx, &dy, &mut new_cx,
                            &mut new_cy,
                        )
                    };
                    // The penalty restores the rank of the regularized
                    // system, so its result is always usable. The exact
                    // fit only lands past the coarsest step when the
                    // landmarks pin down every coefficient.
                    if regularized || !underconstrained || step == 0 {
                        for (c, n) in cx.as_slice_mut().iter_mut().zip(new_cx.as_slice()) {
                            *c += n;
                        }
                        for (c, n) in cy.as_slice_mut().iter_mut().zip(new_cy.as_slice()) {
                            *c += n;
                        }
                    } else {
                        log::warn!("skipping underconstrained landmark fit at scale {s}");
                    }
                }

                if config.image_weight != 0.0 {
                    let ctx = EvalContext {
                        source: &source,
                        target: &target,
                        source_mask: &source_mask,
                        target_mask: &target_mask,
                        landmarks: &landmarks,
                        config: &config,
                        operator: &operator,
                        intervals,
                        target_current_width: tcw,
                        target_current_height: tch,
                        factor_width: fw,
                        factor_height: fh,
                    };
                    last_energy = Some(optimize_coefficients(
                        &ctx,
                        stop_threshold,
                        &mut cx,
                        &mut cy,
                        &cancel,
                        &mut tracker,
                    ));
                }
            }

            step += 1;
            match state {
                State::RefineDeformation => {
                    if s < config.max_scale_deformation {
                        cx = propagate_to_next_level(intervals, &cx);
                        cy = propagate_to_next_level(intervals, &cy);
                        s += 1;
                        intervals *= 2;
                        operator = RegularizationOperator::build(
                            intervals,
                            tcw,
                            tch,
                            config.div_weight,
                            config.curl_weight,
                        );
                        state = if current_depth > config.min_scale_image {
                            State::RefineImage
                        } else {
                            State::RefineDeformation
                        };
                    } else {
                        state = if current_depth > config.min_scale_image {
                            State::RefineImage
                        } else {
                            State::FinalImageOnly
                        };
                    }
                }
                State::RefineImage | State::FinalImageOnly => {
                    let next = if state == State::RefineImage {
                        if s == config.max_scale_deformation
                            && current_depth == config.min_scale_image
                        {
                            State::FinalImageOnly
                        } else if s == config.max_scale_deformation {
                            State::RefineImage
                        } else {
                            State::RefineDeformation
                        }
                    } else if current_depth == 0 {
                        State::Done
                    } else {
                        State::FinalImageOnly
                    };
                    state = next;

                    if current_depth != 0 {
                        let old_w = tcw as f64;
                        let old_h = tch as f64;
                        source.pop_from_pyramid();
                        target.pop_from_pyramid();
                        tcw = target.current_width();
                        tch = target.current_height();
                        fw = target.factor_width();
                        fh = target.factor_height();

                        // Re-express the deformation in the finer frame.
                        let factor_x = (tcw as f64 - 1.0) / (old_w - 1.0);
                        let factor_y = (tch as f64 - 1.0) / (old_h - 1.0);
                        for c in cx.as_slice_mut() {
                            *c *= factor_x;
                        }
                        for c in cy.as_slice_mut() {
                            *c *= factor_y;
                        }
                        operator = RegularizationOperator::build(
                            intervals,
                            tcw,
                            tch,
                            config.div_weight,
                            config.curl_weight,
                        );
                    }
                }
                State::Done => {}
            }

            if matches!(state, State::RefineDeformation | State::RefineImage)
                && s == config.max_scale_deformation
                && current_depth == config.min_scale_image + 1
                && config.accurate_mode
            {
                stop_threshold /= 10.0;
            }
        }

        let cancelled = cancel.is_cancelled();
        RegistrationResult {
            transform: ElasticTransform::new(intervals, cx, cy),
            energy: last_energy,
            cancelled,
        }
    }
}

/// Simulate the state walk to price the whole run in workload units.
fn total_workload(config: &RegistrationConfig, initial_depth: usize) -> u64 {
    let mut state = if config.min_scale_deformation == config.max_scale_deformation {
        State::RefineImage
    } else {
        State::RefineDeformation
    };
    let mut s = config.min_scale_deformation;
    let mut depth = initial_depth;
    let mut workload = 0u64;
    while state != State::Done {
        if matches!(state, State::RefineDeformation | State::RefineImage)
            && config.image_weight != 0.0
        {
            workload += WORKLOAD_PER_LEVEL * (depth as u64 + 1);
        }
        match state {
            State::RefineDeformation => {
                if s < config.max_scale_deformation {
                    s += 1;
                    state = if depth > config.min_scale_image {
                        State::RefineImage
                    } else {
                        State::RefineDeformation
                    };
                } else {
                    state = if depth > config.min_scale_image {
                        State::RefineImage
                    } else {
                        State::FinalImageOnly
                    };
                }
            }
            State::RefineImage | State::FinalImageOnly => {
                let next = if state == State::RefineImage {
                    if s == config.max_scale_deformation && depth == config.min_scale_image {
                        State::FinalImageOnly
                    } else if s == config.max_scale_deformation {
                        State::RefineImage
                    } else {
                        State::RefineDeformation
                    }
                } else if depth == 0 {
                    State::Done
                } else {
                    State::FinalImageOnly
                };
                state = next;
                if depth != 0 {
                    depth -= 1;
                }
            }
            State::Done => {}
        }
    }
    workload
}

type Affine = [[f64; 3]; 2];

/// Bootstrap transform from the landmark count: identity with centering
/// for none, translation for one, a similarity through a synthesized
/// third point for two, and an affine least-squares fit (with rotation
/// fallback on a singular system) for three or more.
fn affine_from_landmarks(
    landmarks: &[Landmark],
    source: &ImageModel,
    target: &ImageModel,
    fw: f64,
    fh: f64,
) -> Affine {
    let mut src: Vec<[f64; 2]> = landmarks
        .iter()
        .map(|lm| [fw * lm.source[0] as f64, fh * lm.source[1] as f64])
        .collect();
    let mut tgt: Vec<[f64; 2]> = landmarks
        .iter()
        .map(|lm| [fw * lm.target[0] as f64, fh * lm.target[1] as f64])
        .collect();

    match src.len() {
        0 => [
            [
                1.0,
                0.0,
                (source.current_width() as f64 - target.current_width() as f64) / 2.0,
            ],
            [
                0.0,
                1.0,
                (source.current_height() as f64 - target.current_height() as f64) / 2.0,
            ],
        ],
        1 => [
            [1.0, 0.0, src[0][0] - tgt[0][0]],
            [0.0, 1.0, src[0][1] - tgt[0][1]],
        ],
        _ => {
            if src.len() == 2 {
                // A third point at right angles turns the fit into a
                // similarity (rotation plus scale).
                let ([x0, y0], [x1, y1]) = (src[0], src[1]);
                let ([u0, v0], [u1, v1]) = (tgt[0], tgt[1]);
                src.push([x1 + y0 - y1, x1 + y1 - x0]);
                tgt.push([u1 + v0 - v1, u1 + v1 - u0]);
            }
            affine_least_squares(&src, &tgt)
        }
    }
}

fn affine_least_squares(src: &[[f64; 2]], tgt: &[[f64; 2]]) -> Affine {
    let mut h = Mat::zeros(3, 3);
    let mut d = Mat::zeros(3, 3);
    for (s, t) in src.iter().zip(tgt) {
        let [sx, sy] = *s;
        let [tx, ty] = *t;
        h[(0, 0)] += tx * sx;
        h[(0, 1)] += tx * sy;
        h[(0, 2)] += tx;
        h[(1, 0)] += ty * sx;
        h[(1, 1)] += ty * sy;
        h[(1, 2)] += ty;
        h[(2, 0)] += sx;
        h[(2, 1)] += sy;
        h[(2, 2)] += 1.0;
        d[(0, 0)] += sx * sx;
        d[(0, 1)] += sx * sy;
        d[(0, 2)] += sx;
        d[(1, 0)] += sy * sx;
        d[(1, 1)] += sy * sy;
        d[(1, 2)] += sy;
        d[(2, 0)] += sx;
        d[(2, 1)] += sy;
        d[(2, 2)] += 1.0;
    }

    let dec = svd(h);
    if dec.w.iter().any(|w| w.abs() < MACHINE_EPSILON) {
        log::debug!("affine bootstrap singular, falling back to a rotation fit");
        return rotation_least_squares(src, tgt);
    }

    let mut v = dec.v.clone();
    for i in 0..3 {
        for j in 0..3 {
            v[(i, j)] /= dec.w[j];
        }
    }
    let mut dv = Mat::zeros(3, 3);
    for i in 0..3 {
        for j in 0..3 {
            let mut sum = 0.0;
            for k in 0..3 {
                sum += d[(i, k)] * v[(k, j)];
            }
            dv[(i, j)] = sum;
        }
    }
    let mut x = [[0.0; 3]; 2];
    for (i, row) in x.iter_mut().enumerate() {
        for (j, out) in row.iter_mut().enumerate() {
            let mut sum = 0.0;
            for k in 0..3 {
                sum += dv[(i, k)] * dec.u[(j, k)];
            }
            *out = sum;
        }
    }
    x
}

fn rotation_least_squares(src: &[[f64; 2]], tgt: &[[f64; 2]]) -> Affine {
    let n = src.len();
    match n {
        0 => [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
        1 => [
            [1.0, 0.0, src[0][0] - tgt[0][0]],
            [0.0, 1.0, src[0][1] - tgt[0][1]],
        ],
        _ => {
            let inv_n = 1.0 / n as f64;
            let (mut sx_avg, mut sy_avg, mut tx_avg, mut ty_avg) = (0.0, 0.0, 0.0, 0.0);
            for (s, t) in src.iter().zip(tgt) {
                sx_avg += s[0];
                sy_avg += s[1];
                tx_avg += t[0];
                ty_avg += t[1];
            }
            sx_avg *= inv_n;
            sy_avg *= inv_n;
            tx_avg *= inv_n;
            ty_avg *= inv_n;

            let mut h = Mat::zeros(2, 2);
            for (s, t) in src.iter().zip(tgt) {
                let (csx, csy) = (s[0] - sx_avg, s[1] - sy_avg);
                let (ctx, cty) = (t[0] - tx_avg, t[1] - ty_avg);
                h[(0, 0)] += ctx * csx;
                h[(0, 1)] += ctx * csy;
                h[(1, 0)] += cty * csx;
                h[(1, 1)] += cty * csy;
            }
            let dec = svd(h);
            let mut v = dec.v.clone();
            let det_u = dec.u[(0, 0)] * dec.u[(1, 1)] - dec.u[(0, 1)] * dec.u[(1, 0)];
            let det_v = v[(0, 0)] * v[(1, 1)] - v[(0, 1)] * v[(1, 0)];
            if det_u * det_v < 0.0 {
                // Reflection: flip the column of the smaller singular
                // value.
                let col = if dec.w[0] < dec.w[1] { 0 } else { 1 };
                v[(0, col)] = -v[(0, col)];
                v[(1, col)] = -v[(1, col)];
            }
            let mut x = [[0.0; 3]; 2];
            for i in 0..2 {
                for j in 0..2 {
                    let mut sum = 0.0;
                    for k in 0..2 {
                        sum += v[(i, k)] * dec.u[(j, k)];
                    }
                    x[i][j] = sum;
                }
            }
            x[0][2] = sx_avg - x[0][0] * tx_avg - x[0][1] * ty_avg;
            x[1][2] = sy_avg - x[1][0] * tx_avg - x[1][1] * ty_avg;
            x
        }
    }
}

/// Cubic weights of every control column at one coordinate, including
/// the two border-extension columns.
fn spline_weights(coord: f64, intervals: usize, extent: usize) -> Vec<f64> {
    let inter = intervals as f64 / (extent - 1) as f64;
    (-1..=intervals as i64 + 1)
        .map(|j| bspline_3(coord * inter - j as f64))
        .collect()
}

/// Landmark residues under the current deformation: source position
/// minus the transformed target position, in current-level coordinates.
#[allow(clippy::too_many_arguments)]
fn scale_residues(
    landmarks: &[Landmark],
    intervals: usize,
    cx: &Mat,
    cy: &Mat,
    tcw: usize,
    tch: usize,
    fw: f64,
    fh: f64,
    dx: &mut [f64],
    dy: &mut [f64],
) {
    let grid = intervals + 3;
    let swx = ImageModel::from_coefficients(grid, grid, cx.as_slice().to_vec());
    let swy = ImageModel::from_coefficients(grid, grid, cy.as_slice().to_vec());
    for (k, lm) in landmarks.iter().enumerate() {
        let u = fw * lm.target[0] as f64;
        let v = fh * lm.target[1] as f64;
        let tu = u * intervals as f64 / (tcw - 1) as f64 + 1.0;
        let tv = v * intervals as f64 / (tch - 1) as f64 + 1.0;
        let taps = swx.taps(tu, tv, Resolution::Full);
        dx[k] = fw * lm.source[0] as f64 - swx.interpolate(&taps);
        dy[k] = fh * lm.source[1] as f64 - swy.interpolate(&taps);
    }
}

/// Rows are landmarks, columns the spline basis evaluated at each
/// landmark's target position.
fn landmark_matrix(
    landmarks: &[Landmark],
    intervals: usize,
    tcw: usize,
    tch: usize,
    fw: f64,
    fh: f64,
) -> Mat {
    let grid = intervals + 3;
    let mut b = Mat::zeros(landmarks.len(), grid * grid);
    for (k, lm) in landmarks.iter().enumerate() {
        let x = fw * lm.target[0] as f64;
        let y = fh * lm.target[1] as f64;
        let bx = spline_weights(x, intervals, tcw);
        let by = spline_weights(y, intervals, tch);
        for i in 0..grid {
            for j in 0..grid {
                b[(k, grid * i + j)] = by[i] * bx[j];
            }
        }
    }
    b
}

/// Exact landmark interpolation through the SVD pseudo-inverse.
/// Returns whether the system was underconstrained.
#[allow(clippy::too_many_arguments)]
fn fit_landmarks(
    landmarks: &[Landmark],
    intervals: usize,
    tcw: usize,
    tch: usize,
    fw: f64,
    fh: f64,
    dx: &[f64],
    dy: &[f64],
    new_cx: &mut Mat,
    new_cy: &mut Mat,
) -> bool {
    if landmarks.is_empty() {
        return false;
    }
    let grid = intervals + 3;
    let b = landmark_matrix(landmarks, intervals, tcw, tch, fw, fh);
    let p = pseudo_inverse(b);

    let mut ij = 0;
    for i in 0..grid {
        for j in 0..grid {
            let (mut sx, mut sy) = (0.0, 0.0);
            for (k, (dxk, dyk)) in dx.iter().zip(dy).enumerate() {
                sx += p.inverse[(ij, k)] * dxk;
                sy += p.inverse[(ij, k)] * dyk;
            }
            new_cx[(i, j)] = sx;
            new_cy[(i, j)] = sy;
            ij += 1;
        }
    }
    p.underconstrained
}

/// Regularized joint fit of both axes: `(2BᵗB + P)·c = 2Bᵗd`, with `P`
/// assembled from P11/P22/P12.
#[allow(clippy::too_many_arguments)]
fn fit_landmarks_regularized(
    landmarks: &[Landmark],
    intervals: usize,
    tcw: usize,
    tch: usize,
    fw: f64,
    fh: f64,
    dx: &[f64],
    dy: &[f64],
    operator: &RegularizationOperator,
    new_cx: &mut Mat,
    new_cy: &mut Mat,
) -> bool {
    if landmarks.is_empty() {
        return true;
    }
    let grid = intervals + 3;
    let m2 = grid * grid;
    let b = landmark_matrix(landmarks, intervals, tcw, tch, fw, fh);

    let mut a = Mat::zeros(2 * m2, 2 * m2);
    let mut rhs = vec![0.0; 2 * m2];

    // 2·BᵗB into both diagonal blocks.
    for i in 0..m2 {
        for j in i..m2 {
            let mut dot = 0.0;
            for l in 0..landmarks.len() {
                dot += b[(l, i)] * b[(l, j)];
            }
            dot *= 2.0;
            a[(i, j)] = dot;
            a[(j, i)] = dot;
            a[(m2 + i, m2 + j)] = dot;
            a[(m2 + j, m2 + i)] = dot;
        }
    }

    // 2·Bᵗd on the right-hand side.
    for i in 0..m2 {
        let (mut bx, mut by) = (0.0, 0.0);
        for (l, (dxl, dyl)) in dx.iter().zip(dy).enumerate() {
            bx += b[(l, i)] * dxl;
            by += b[(l, i)] * dyl;
        }
        rhs[i] = 2.0 * bx;
        rhs[m2 + i] = 2.0 * by;
    }

    // Symmetrized penalty blocks.
    for i in 0..m2 {
        for j in 0..m2 {
            let p11 = operator.p11[(i, j)];
            a[(i, j)] += p11;
            a[(j, i)] += p11;
            let p22 = operator.p22[(i, j)];
            a[(m2 + i, m2 + j)] += p22;
            a[(m2 + j, m2 + i)] += p22;
        }
    }
    for i in 0..m2 {
        for j in 0..m2 {
            a[(i, m2 + j)] = operator.p12[(i, j)];
            a[(m2 + i, j)] = operator.p12[(j, i)];
        }
    }

    let p = pseudo_inverse(a);
    let mut ij = 0;
    for i in 0..grid {
        for j in 0..grid {
            let (mut sx, mut sy) = (0.0, 0.0);
            for (l, r) in rhs.iter().enumerate() {
                sx += p.inverse[(ij, l)] * r;
                sy += p.inverse[(m2 + ij, l)] * r;
            }
            new_cx[(i, j)] = sx;
            new_cy[(i, j)] = sy;
            ij += 1;
        }
    }
    p.underconstrained
}

/// Re-express a coefficient grid on the doubled control lattice via the
/// cubic two-scale relation: zero-stuff, filter both axes, crop the two
/// border coefficients.
fn propagate_to_next_level(intervals: usize, c: &Mat) -> Mat {
    let next = intervals * 2;
    let sz = next + 7;
    let kh = 2i64;

    let mut expand = Mat::zeros(sz, sz);
    for i in (1..sz).step_by(2) {
        for j in (1..sz).step_by(2) {
            expand[(i, j)] = c[((i - 1) / 2, (j - 1) / 2)];
        }
    }

    // Even rows are entirely zero; only odd rows need the row pass.
    let mut aux = Mat::zeros(sz, sz);
    for i in (1..sz).step_by(2) {
        for j in 0..sz {
            let mut sum = 0.0;
            for k in -kh..=kh {
                let jj = j as i64 + k;
                if jj >= 0 && jj < sz as i64 {
                    sum += CUBIC_TWO_SCALE[(k + kh) as usize] * expand[(i, jj as usize)];
                }
            }
            aux[(i, j)] = sum;
        }
    }

    let mut out = Mat::zeros(sz, sz);
    for i in 0..sz {
        for j in 0..sz {
            let mut sum = 0.0;
            for k in -kh..=kh {
                let ii = i as i64 + k;
                if ii >= 0 && ii < sz as i64 {
                    sum += CUBIC_TWO_SCALE[(k + kh) as usize] * aux[(ii as usize, j)];
                }
            }
            out[(i, j)] = sum;
        }
    }

    let mut refined = Mat::zeros(next + 3, next + 3);
    for i in 0..next + 3 {
        for j in 0..next + 3 {
            refined[(i, j)] = out[(i + 2, j + 2)];
        }
    }
    refined
}
