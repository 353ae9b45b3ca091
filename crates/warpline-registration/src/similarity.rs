//! Energy and gradient evaluation for the optimizer.
//!
//! The energy is the weighted sum of three terms: the masked mean
//! squared intensity difference, the landmark residual and the
//! divergence/curl quadratic form. Each term contributes an analytic
//! gradient with respect to the flattened deformation coefficients
//! (x component first, then y).

use warpline_image::{ImageModel, Mask, Resolution};
use warpline_linalg::MACHINE_EPSILON;
use warpline_spline::PrecomputedTaps;

use crate::config::RegistrationConfig;
use crate::landmarks::Landmark;
use crate::regularization::RegularizationOperator;
use crate::transform::ElasticTransform;

/// Everything the evaluator reads but never writes.
pub(crate) struct EvalContext<'a> {
    pub source: &'a ImageModel,
    pub target: &'a ImageModel,
    pub source_mask: &'a Mask,
    pub target_mask: &'a Mask,
    pub landmarks: &'a [Landmark],
    pub config: &'a RegistrationConfig,
    pub operator: &'a RegularizationOperator,
    pub intervals: usize,
    pub target_current_width: usize,
    pub target_current_height: usize,
    pub factor_width: f64,
    pub factor_height: f64,
}

/// Evaluate the energy at coefficients `c` and write its gradient.
///
/// `swx`/`swy` are the two deformation interpolators; their coefficient
/// arrays are refreshed from `c` on entry. With `only_image` the
/// regularization and landmark terms are left out of the returned
/// energy (used for reporting, not for optimization).
pub(crate) fn evaluate_energy(
    ctx: &EvalContext,
    swx: &mut ImageModel,
    swy: &mut ImageModel,
    pre: &PrecomputedTaps,
    c: &[f64],
    grad: &mut [f64],
    only_image: bool,
) -> f64 {
    let cydim = ctx.intervals + 3;
    let nk = cydim * cydim;
    let twice_nk = 2 * nk;
    debug_assert_eq!(c.len(), twice_nk);
    debug_assert_eq!(grad.len(), twice_nk);

    swx.set_coefficients(&c[..nk]);
    swy.set_coefficients(&c[nk..]);

    grad.fill(0.0);
    let mut grad_reg = vec![0.0; twice_nk];
    let mut grad_landmark = vec![0.0; twice_nk];

    let xdim = ctx.target_current_width;
    let ydim = ctx.target_current_height;

    // Image term: accumulate over every target pixel covered by both
    // masks; uncovered pixels contribute neither energy nor count.
    let mut image_energy = 0.0;
    let mut covered = 0usize;
    if ctx.config.image_weight != 0.0 {
        let target_image = ctx.target.current_image();
        let mut uv = 0usize;
        for v in 0..ydim {
            for u in 0..xdim {
                let (fu, fv) = (u as f64 / ctx.factor_width, v as f64 / ctx.factor_height);
                if ctx.target_mask.contains(fu, fv) {
                    let i2 = target_image[uv];

                    // Map through the current deformation.
                    let x = swx.interpolate_grid(pre, u, v);
                    let y = swy.interpolate_grid(pre, u, v);

                    if ctx
                        .source_mask
                        .contains(x / ctx.factor_width, y / ctx.factor_height)
                    {
                        let taps = ctx.source.taps(x, y, Resolution::Current);
                        let i1 = ctx.source.interpolate(&taps);
                        let d1 = ctx.source.interpolate_derivatives(&taps);

                        let error = i2 - i1;
                        image_energy += error * error;

                        // Chain rule through the deformation basis
                        // weights and the source derivatives.
                        for l in 0..4 {
                            let Some(iy) = pre.y(v).index[l] else { continue };
                            for m in 0..4 {
                                let Some(ix) = pre.x(u).index[m] else { continue };
                                let weight = pre.weight(l, m, u, v);
                                let k = iy * cydim + ix;
                                let aux = -error * weight;
                                grad[k] += aux * d1[0];
                                grad[k + nk] += aux * d1[1];
                            }
                        }
                        covered += 1;
                    }
                }
                uv += 1;
            }
        }
    }

    if covered != 0 {
        image_energy *= ctx.config.image_weight / covered as f64;
        // The factor of two deferred from the squared-error derivative.
        let aux = ctx.config.image_weight * 2.0 / covered as f64;
        for g in grad.iter_mut() {
            *g *= aux;
        }
    } else if ctx.config.image_weight == 0.0 {
        image_energy = 0.0;
    } else {
        image_energy = 1.0 / MACHINE_EPSILON;
    }

    // Regularization term.
    let mut regularization = 0.0;
    if !only_image {
        let op = ctx.operator;
        for i in 0..nk {
            for j in 0..nk {
                regularization += c[i] * op.p11[(i, j)] * c[j]
                    + c[nk + i] * op.p22[(i, j)] * c[nk + j]
                    + c[i] * op.p12[(i, j)] * c[nk + j];
                grad_reg[i] += 2.0 * op.p11[(i, j)] * c[j] + op.p12[(i, j)] * c[nk + j];
                grad_reg[nk + i] += 2.0 * op.p22[(i, j)] * c[nk + j] + op.p12[(j, i)] * c[j];
            }
        }
        let area = (xdim * ydim) as f64;
        regularization /= area;
        for g in grad_reg.iter_mut() {
            *g /= area;
        }
    }

    // Landmark term.
    let mut landmark_energy = 0.0;
    let k_count = ctx.landmarks.len();
    if ctx.config.landmark_weight != 0.0 {
        for lm in ctx.landmarks {
            let u = ctx.factor_width * lm.target[0] as f64;
            let v = ctx.factor_height * lm.target[1] as f64;

            // Express the target point in spline units.
            let tu = u * ctx.intervals as f64 / (xdim - 1) as f64 + 1.0;
            let tv = v * ctx.intervals as f64 / (ydim - 1) as f64 + 1.0;

            let taps = swx.taps(tu, tv, Resolution::Full);
            let x = swx.interpolate(&taps);
            let y = swy.interpolate(&taps);

            let dx = ctx.factor_width * lm.source[0] as f64 - x;
            let dy = ctx.factor_height * lm.source[1] as f64 - y;
            landmark_energy += dx * dx + dy * dy;

            for l in 0..4 {
                let Some(iy) = taps.y.index[l] else { continue };
                for m in 0..4 {
                    let Some(ix) = taps.x.index[m] else { continue };
                    let k = iy * cydim + ix;
                    let weight = taps.y.weight[l] * taps.x.weight[m];
                    grad_landmark[k] -= dx * weight;
                    grad_landmark[k + nk] -= dy * weight;
                }
            }
        }
    }
    if k_count != 0 {
        landmark_energy *= ctx.config.landmark_weight / k_count as f64;
        let aux = 2.0 * ctx.config.landmark_weight / k_count as f64;
        for g in grad_landmark.iter_mut() {
            *g *= aux;
        }
    }
    if only_image {
        landmark_energy = 0.0;
    }

    for ((g, gr), gl) in grad.iter_mut().zip(&grad_reg).zip(&grad_landmark) {
        *g += gr + gl;
    }

    log::debug!(
        "energy: image {image_energy:.6e} landmark {landmark_energy:.6e} regularization {regularization:.6e}"
    );
    image_energy + landmark_energy + regularization
}

/// Mean masked squared intensity difference under a fitted transform.
///
/// Reporting helper: maps every target pixel inside the target mask
/// through `transform` and averages the squared difference against the
/// source, skipping pixels either mask excludes.
pub fn evaluate_image_similarity(
    transform: &ElasticTransform,
    source: &ImageModel,
    target: &ImageModel,
    source_mask: &Mask,
    target_mask: &Mask,
) -> f64 {
    let intervals = transform.intervals;
    let grid = intervals + 3;
    let nk = grid * grid;

    let config = RegistrationConfig::default();
    let operator = RegularizationOperator::build(
        intervals,
        target.current_width(),
        target.current_height(),
        0.0,
        0.0,
    );
    let ctx = EvalContext {
        source,
        target,
        source_mask,
        target_mask,
        landmarks: &[],
        config: &config,
        operator: &operator,
        intervals,
        target_current_width: target.current_width(),
        target_current_height: target.current_height(),
        factor_width: target.factor_width(),
        factor_height: target.factor_height(),
    };

    let mut c = vec![0.0; 2 * nk];
    c[..nk].copy_from_slice(transform.cx.as_slice());
    c[nk..].copy_from_slice(transform.cy.as_slice());

    let mut swx = ImageModel::from_coefficients(grid, grid, transform.cx.as_slice().to_vec());
    let mut swy = ImageModel::from_coefficients(grid, grid, transform.cy.as_slice().to_vec());
    let pre = PrecomputedTaps::new(
        target.current_width(),
        target.current_height(),
        intervals,
    );

    let mut grad = vec![0.0; 2 * nk];
    evaluate_energy(&ctx, &mut swx, &mut swy, &pre, &c, &mut grad, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use warpline_image::{CancelToken, Image, ImageRole, ImageSize};
    use warpline_linalg::Mat;

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

    fn eval_with_masks(
        transform: &ElasticTransform,
        source: &Image,
        target: &Image,
        target_mask: &Mask,
    ) -> (f64, Vec<f64>) {
        let cancel = CancelToken::new();
        let source_model = ImageModel::build(source.clone(), ImageRole::Source, 0, &cancel);
        let target_model = ImageModel::build(target.clone(), ImageRole::Target, 0, &cancel);
        let source_mask = Mask::all_inside(source.width(), source.height());

        let grid = transform.intervals + 3;
        let nk = grid * grid;
        let config = RegistrationConfig::default();
        let operator = RegularizationOperator::build(
            transform.intervals,
            target.width(),
            target.height(),
            0.0,
            0.0,
        );
        let ctx = EvalContext {
            source: &source_model,
            target: &target_model,
            source_mask: &source_mask,
            target_mask,
            landmarks: &[],
            config: &config,
            operator: &operator,
            intervals: transform.intervals,
            target_current_width: target.width(),
            target_current_height: target.height(),
            factor_width: 1.0,
            factor_height: 1.0,
        };

        let mut c = vec![0.0; 2 * nk];
        c[..nk].copy_from_slice(transform.cx.as_slice());
        c[nk..].copy_from_slice(transform.cy.as_slice());
        let mut swx =
            ImageModel::from_coefficients(grid, grid, transform.cx.as_slice().to_vec());
        let mut swy =
            ImageModel::from_coefficients(grid, grid, transform.cy.as_slice().to_vec());
        let pre = PrecomputedTaps::new(target.width(), target.height(), transform.intervals);
        let mut grad = vec![0.0; 2 * nk];
        let energy = evaluate_energy(&ctx, &mut swx, &mut swy, &pre, &c, &mut grad, false);
        (energy, grad)
    }

    #[test]
    fn test_masked_out_pixels_never_contribute() {
        // Perturbing intensities outside the target mask must change
        // neither the energy nor the gradient.
        let size = ImageSize {
            width: 16,
            height: 16,
        };
        let source_data: Vec<f64> = (0..256).map(|k| (k as f64 * 0.31).sin() * 10.0).collect();
        let source = Image::new(size, source_data.clone()).unwrap();
        let target = Image::new(size, source_data.clone()).unwrap();

        // Mask out the left half of the target.
        let mut target_mask = Mask::all_inside(16, 16);
        for v in 0..16 {
            for u in 0..8 {
                target_mask.set(u, v, false);
            }
        }

        let transform = identity_transform(1, size);
        let (energy_a, grad_a) = eval_with_masks(&transform, &source, &target, &target_mask);

        let mut perturbed = source_data;
        for v in 0..16usize {
            for u in 0..8usize {
                perturbed[v * 16 + u] += 50.0 * rand::random::<f64>();
            }
        }
        let target_perturbed = Image::new(size, perturbed).unwrap();
        let (energy_b, grad_b) =
            eval_with_masks(&transform, &source, &target_perturbed, &target_mask);

        assert_eq!(energy_a, energy_b);
        assert_eq!(grad_a, grad_b);
    }

    #[test]
    fn test_identity_similarity_of_equal_images_is_zero() {
        let size = ImageSize {
            width: 16,
            height: 16,
        };
        let data: Vec<f64> = (0..256).map(|k| (k as f64 * 0.17).cos() * 5.0).collect();
        let source = Image::new(size, data.clone()).unwrap();
        let target = Image::new(size, data).unwrap();
        let cancel = CancelToken::new();
        let source_model = ImageModel::build(source, ImageRole::Source, 0, &cancel);
        let target_model = ImageModel::build(target, ImageRole::Target, 0, &cancel);

        let similarity = evaluate_image_similarity(
            &identity_transform(1, size),
            &source_model,
            &target_model,
            &Mask::all_inside(16, 16),
            &Mask::all_inside(16, 16),
        );
        assert!(similarity.abs() < 1e-12, "got {similarity}");
    }
}
