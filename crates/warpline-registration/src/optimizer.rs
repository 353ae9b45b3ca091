//! Damped quasi-Newton optimization of the deformation coefficients.
//!
//! Levenberg-style damping around a BFGS-updated Hessian estimate:
//! `(H + λ·diag(H))·Δx = g` is solved each iteration, improvements are
//! accepted (shrinking λ), regressions roll the state back (growing λ).
//! A five-entry window of recent improvements detects plateaus, and
//! above 35 parameters the update is restricted to the components with
//! the largest gradient magnitudes to keep the dense solve tractable.

use warpline_image::{CancelToken, ImageModel};
use warpline_linalg::{linear_least_squares, Mat, MACHINE_EPSILON};
use warpline_spline::PrecomputedTaps;

use crate::engine::ProgressTracker;
use crate::similarity::{evaluate_energy, EvalContext};

const MAX_ITER_PER_LEVEL: usize = 300;
const WINDOW_SIZE: usize = 5;
const MAX_ACTIVE_PARAMETERS: usize = 35;
const FIRST_LAMBDA: f64 = 1.0;
const MIN_LAMBDA: f64 = 1e-4;
const CURVATURE_EPS: f64 = 3.0e-8;

/// Fixed-size moving window that tracks the sum of its entries.
pub(crate) struct CumulativeWindow {
    buf: Vec<f64>,
    read: usize,
    write: usize,
    len: usize,
    sum: f64,
}

impl CumulativeWindow {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0.0; capacity],
            read: 0,
            write: 0,
            len: 0,
            sum: 0.0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn sum(&self) -> f64 {
        self.sum
    }

    pub(crate) fn push_back(&mut self, value: f64) {
        if self.len == self.buf.len() {
            self.pop_front();
        }
        self.buf[self.write] = value;
        self.len += 1;
        self.sum += value;
        self.write = (self.write + 1) % self.buf.len();
    }

    fn pop_front(&mut self) -> f64 {
        if self.len == 0 {
            return 0.0;
        }
        let value = self.buf[self.read];
        self.len -= 1;
        self.sum -= value;
        self.read = (self.read + 1) % self.buf.len();
        value
    }
}

/// One damped step: solve `(H + λ·diag(H))·Δx = g` on the active
/// components and apply `x ← x − Δx`.
///
/// When the parameter count exceeds the cap, only the components with
/// the largest gradient magnitudes move this step; the rest stay
/// frozen. This subsampling keeps the dense solve bounded at fine
/// deformation scales.
fn marquardt_step(x: &mut [f64], gradient: &[f64], hessian: &[f64], lambda: f64) {
    let m = x.len();
    let m_used = m.min(MAX_ACTIVE_PARAMETERS);
    let mut active = vec![true; m];

    if m > MAX_ACTIVE_PARAMETERS {
        let mut sorted: Vec<f64> = gradient.iter().map(|g| g.abs()).collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let threshold = sorted[m - MAX_ACTIVE_PARAMETERS];

        let mut taken = 0;
        let mut i = 0;
        while i < m {
            if gradient[i].abs() >= threshold {
                taken += 1;
                if taken == m_used {
                    break;
                }
            } else {
                active[i] = false;
            }
            i += 1;
        }
        for a in active.iter_mut().skip(i + 1) {
            *a = false;
        }
    }

    let lambda = lambda + 1.0;

    let mut u = Mat::zeros(m_used, m_used);
    let mut g = vec![0.0; m_used];
    let mut iw = 0;
    for ir in 0..m {
        if !active[ir] {
            continue;
        }
        let mut jw = 0;
        for jr in 0..m {
            if active[jr] {
                u[(iw, jw)] = hessian[ir * m + jr];
                jw += 1;
            }
        }
        g[iw] = gradient[ir];
        u[(iw, iw)] *= lambda;
        iw += 1;
    }

    let update = linear_least_squares(&u, &g);

    let mut kr = 0;
    for (xi, is_active) in x.iter_mut().zip(&active) {
        if *is_active {
            *xi -= update[kr];
            kr += 1;
        }
    }
}

/// Optimize the deformation coefficients in place and return the last
/// evaluated energy.
///
/// The iteration budget grows with the source pyramid depth (coarser
/// levels are cheap, so they get more iterations). Cancellation is
/// polled at the top of every iteration; on observing it the last
/// accepted state is kept.
pub(crate) fn optimize_coefficients(
    ctx: &EvalContext,
    stop_threshold: f64,
    cx: &mut Mat,
    cy: &mut Mat,
    cancel: &CancelToken,
    progress: &mut ProgressTracker,
) -> f64 {
    if cancel.is_cancelled() {
        return 0.0;
    }

    let tiny = MACHINE_EPSILON;
    let grid = ctx.intervals + 3;
    let half_m = grid * grid;
    let m = 2 * half_m;

    let mut x = vec![0.0; m];
    x[..half_m].copy_from_slice(cx.as_slice());
    x[half_m..].copy_from_slice(cy.as_slice());

    let mut swx = ImageModel::from_coefficients(grid, grid, x[..half_m].to_vec());
    let mut swy = ImageModel::from_coefficients(grid, grid, x[half_m..].to_vec());
    let pre = PrecomputedTaps::new(
        ctx.target_current_width,
        ctx.target_current_height,
        ctx.intervals,
    );

    let mut grad = vec![0.0; m];
    let mut f = evaluate_energy(ctx, &mut swx, &mut swy, &pre, &x, &mut grad, false);
    log::debug!("f(1)={f}");

    let mut hessian = vec![0.0; m * m];
    for i in 0..m {
        hessian[i * m + i] = 1.0;
    }

    let mut rescued_f = f;
    let mut rescued_x = x.clone();
    let mut rescued_grad = grad.clone();
    let mut rescued_hessian = hessian.clone();

    let mut diff_x = vec![0.0; m];
    let mut diff_grad = vec![0.0; m];
    let mut h_dx = vec![0.0; m];
    let mut proposed = vec![0.0; m * m];

    let mut lambda = FIRST_LAMBDA;
    let mut window = CumulativeWindow::new(WINDOW_SIZE);
    let max_iter = MAX_ITER_PER_LEVEL * (ctx.source.current_depth() + 1);
    let mut iter = 1usize;
    progress.step(1);

    while iter < max_iter && !cancel.is_cancelled() {
        marquardt_step(&mut x, &grad, &hessian, lambda);

        // Relative parameter change since the last accepted state.
        let mut improvement = 0.0;
        let mut max_norm = 0.0;
        for i in 0..m {
            diff_x[i] = x[i] - rescued_x[i];
            improvement += diff_x[i] * diff_x[i];
            let dominant = if rescued_x[i].abs() < x[i].abs() {
                x[i]
            } else {
                rescued_x[i]
            };
            max_norm += dominant * dominant;
        }
        if max_norm > tiny {
            improvement /= max_norm;
        }
        let improvement = improvement.sqrt().sqrt();
        if improvement < tiny.sqrt() {
            break;
        }

        f = evaluate_energy(ctx, &mut swx, &mut swy, &pre, &x, &mut grad, false);
        iter += 1;
        log::debug!("f({iter})={f} lambda={lambda}");
        progress.step(1);

        if rescued_f > f {
            // Plateau detection over the recent improvements.
            window.push_back(rescued_f - f);
            if window.len() == WINDOW_SIZE && window.sum() / f < stop_threshold {
                break;
            }

            for i in 0..m {
                diff_grad[i] = grad[i] - rescued_grad[i];
            }
            for i in 0..m {
                let row = &hessian[i * m..(i + 1) * m];
                h_dx[i] = row.iter().zip(&diff_x).map(|(h, d)| h * d).sum();
            }

            let mut dg_dx = 0.0;
            let mut dx_h_dx = 0.0;
            let mut sum_dg = 0.0;
            let mut sum_dx = 0.0;
            let mut skip_update = true;
            for i in 0..m {
                dg_dx += diff_grad[i] * diff_x[i];
                dx_h_dx += diff_x[i] * h_dx[i];
                sum_dg += diff_grad[i] * diff_grad[i];
                sum_dx += diff_x[i] * diff_x[i];
                let gmax = grad[i].abs().max(rescued_grad[i].abs());
                if gmax != 0.0 && (diff_grad[i] - h_dx[i]).abs() > CURVATURE_EPS.sqrt() * gmax {
                    skip_update = false;
                }
            }

            // Secant update, skipped unless the curvature is
            // sufficiently positive.
            if dg_dx > (CURVATURE_EPS * sum_dg * sum_dx).sqrt() && !skip_update {
                let fae = 1.0 / dx_h_dx;
                let fac = 1.0 / dg_dx;
                for i in 0..m {
                    for j in 0..m {
                        let p = i * m + j;
                        if i <= j {
                            proposed[p] =
                                hessian[p] + fac * diff_grad[i] * diff_grad[j] - fae * h_dx[i] * h_dx[j];
                        } else {
                            proposed[p] = proposed[j * m + i];
                        }
                    }
                }
                hessian.copy_from_slice(&proposed);
            } else {
                log::debug!("hessian update skipped: curvature not sufficiently positive");
            }

            rescued_f = f;
            rescued_x.copy_from_slice(&x);
            rescued_grad.copy_from_slice(&grad);
            rescued_hessian.copy_from_slice(&hessian);
            if lambda > MIN_LAMBDA {
                lambda /= 10.0;
            }
        } else {
            // Worse: roll back and stiffen the damping.
            x.copy_from_slice(&rescued_x);
            grad.copy_from_slice(&rescued_grad);
            hessian.copy_from_slice(&rescued_hessian);
            if lambda < 1.0 / tiny {
                lambda *= 10.0;
            } else {
                break;
            }
            if lambda < FIRST_LAMBDA {
                lambda = FIRST_LAMBDA;
            }
        }
    }

    cx.as_slice_mut().copy_from_slice(&x[..half_m]);
    cy.as_slice_mut().copy_from_slice(&x[half_m..]);

    progress.skip(max_iter.saturating_sub(iter) as u64);
    f
}
