//! BFGS quasi-Newton minimization with a backtracking line search
//!
//! The driver keeps a dense approximation of the inverse Hessian, seeded with
//! the identity and rescaled after the first accepted step. Each iteration
//! searches along `-H g`, accepts the first step length that satisfies the
//! sufficient-decrease condition, and applies the secant update only when the
//! curvature condition also holds.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::optimization::{GeneralizedState, GeneralizedVector, Objective, OptimizationError};

const EPSILON: f64 = 1e-10;

/// How the per-iteration energy improvement is compared to the threshold
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImprovementCriterion {
    /// `previous - current < required_improvement`
    #[default]
    Absolute,
    /// `previous - current < required_improvement * |previous|`
    Relative,
}

/// Convergence parameters for the quasi-Newton driver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuasiNewtonParams {
    /// Maximum number of BFGS iterations
    pub max_steps: usize,

    /// Stop once an iteration improves the energy by less than this
    pub required_improvement: f64,

    pub improvement_criterion: ImprovementCriterion,

    /// Stop once the gradient norm falls below this
    pub gradient_tolerance: f64,

    /// First step length tried along each search direction
    pub initial_step: f64,

    /// Sufficient-decrease parameter (c1)
    pub armijo_c1: f64,

    /// Curvature parameter (c2) gating the inverse Hessian update
    pub wolfe_c2: f64,

    /// Step length shrink factor between line search trials
    pub step_multiplier: f64,

    /// Line search trials per iteration, independent of `max_steps`
    pub max_line_search_trials: usize,
}

impl Default for QuasiNewtonParams {
    fn default() -> Self {
        Self {
            max_steps: 1000,
            required_improvement: 1e-5,
            improvement_criterion: ImprovementCriterion::Absolute,
            gradient_tolerance: 1e-5,
            initial_step: 1.0,
            armijo_c1: 1e-4,
            wolfe_c2: 0.9,
            step_multiplier: 0.5,
            max_line_search_trials: 10,
        }
    }
}

impl QuasiNewtonParams {
    pub fn validate(&self) -> Result<(), OptimizationError> {
        let invalid = |msg: String| Err(OptimizationError::InvalidParameters(msg));

        if !(self.required_improvement >= 0.0 && self.required_improvement.is_finite()) {
            return invalid(format!("required_improvement {}", self.required_improvement));
        }
        if !(self.gradient_tolerance >= 0.0 && self.gradient_tolerance.is_finite()) {
            return invalid(format!("gradient_tolerance {}", self.gradient_tolerance));
        }
        if !(self.initial_step > 0.0 && self.initial_step.is_finite()) {
            return invalid(format!("initial_step {}", self.initial_step));
        }
        if !(0.0 < self.armijo_c1 && self.armijo_c1 < self.wolfe_c2 && self.wolfe_c2 < 1.0) {
            return invalid(format!(
                "need 0 < armijo_c1 ({}) < wolfe_c2 ({}) < 1",
                self.armijo_c1, self.wolfe_c2
            ));
        }
        if !(0.0 < self.step_multiplier && self.step_multiplier < 1.0) {
            return invalid(format!("step_multiplier {}", self.step_multiplier));
        }
        if self.max_line_search_trials == 0 {
            return invalid("max_line_search_trials must be at least 1".to_string());
        }
        Ok(())
    }

    fn improvement_too_small(&self, previous: f64, current: f64) -> bool {
        let improvement = previous - current;
        match self.improvement_criterion {
            ImprovementCriterion::Absolute => improvement < self.required_improvement,
            ImprovementCriterion::Relative => {
                improvement < self.required_improvement * previous.abs().max(f64::MIN_POSITIVE)
            }
        }
    }
}

/// Why the driver stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// The last iteration improved the energy by less than required
    Converged,
    /// The gradient norm dropped below tolerance (or stopped being finite)
    GradientVanished,
    /// No acceptable step along the search direction; the best pose is kept
    LineSearchFailed,
    /// The iteration budget ran out
    MaxSteps,
}

/// Outcome of one minimization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Minimum {
    pub energy: f64,
    pub iterations: usize,
    pub evaluations: usize,
    pub termination: Termination,
}

/// Minimize `objective` starting from `x`.
///
/// On success `x` holds the final state and `g` the gradient there. On error
/// `x` is restored to its starting value.
pub fn bfgs<S, F>(
    objective: &F,
    x: &mut S,
    g: &mut S::Change,
    params: &QuasiNewtonParams,
) -> Result<Minimum, OptimizationError>
where
    S: GeneralizedState,
    F: Objective<S> + ?Sized,
{
    let n = x.degrees_of_freedom();
    if g.len() != n {
        return Err(OptimizationError::GradientSizeMismatch {
            expected: n,
            actual: g.len(),
        });
    }

    let x_orig = x.clone();
    let res = run(objective, x, g, params, &x_orig);
    if res.is_err() {
        x.clone_from(&x_orig);
    }
    res
}

fn run<S, F>(
    objective: &F,
    x: &mut S,
    g: &mut S::Change,
    params: &QuasiNewtonParams,
    x_orig: &S,
) -> Result<Minimum, OptimizationError>
where
    S: GeneralizedState,
    F: Objective<S> + ?Sized,
{
    let n = x.degrees_of_freedom();
    let mut h = DMatrix::<f64>::identity(n, n);

    let mut f0 = objective.evaluate(x, g)?;
    let mut evaluations = 1;
    let f_orig = f0;
    let g_orig = g.clone();

    let mut x_new = x.clone();
    let mut g_new = g.clone();
    let mut p = g.clone();
    let mut iterations = 0;

    let mut termination = if gradient_vanished(g, params) {
        Termination::GradientVanished
    } else {
        Termination::MaxSteps
    };

    if termination == Termination::MaxSteps {
        for step in 0..params.max_steps {
            let gv = g.to_dvector();
            let mut pv = -(&h * &gv);
            let mut pg = pv.dot(&gv);
            if !(pg < 0.0) {
                // Not a descent direction; fall back to steepest descent
                h.fill_with_identity();
                pv = -gv.clone();
                pg = pv.dot(&gv);
            }
            p.assign(&pv);

            let accepted = line_search(
                objective,
                x,
                f0,
                &p,
                pg,
                &mut x_new,
                &mut g_new,
                params,
                &mut evaluations,
            )?;
            let Some((alpha, f1)) = accepted else {
                termination = Termination::LineSearchFailed;
                break;
            };

            iterations = step + 1;
            let y: DVector<f64> = g_new.to_dvector() - &gv;
            let curvature_ok = g_new.dot(&p) >= params.wolfe_c2 * pg;

            let previous = f0;
            f0 = f1;
            std::mem::swap(x, &mut x_new);
            std::mem::swap(g, &mut g_new);

            log::trace!(
                "bfgs step {}: energy {:.6} (alpha {:.3e})",
                iterations,
                f0,
                alpha
            );

            if step == 0 {
                let yy = y.dot(&y);
                let scale = alpha * y.dot(&pv) / yy;
                if yy.abs() > EPSILON && scale > 0.0 {
                    h = DMatrix::identity(n, n) * scale;
                }
            }
            if curvature_ok && !bfgs_update(&mut h, &pv, &y, alpha) {
                log::trace!("bfgs step {}: secant update skipped", iterations);
            }

            if params.improvement_too_small(previous, f0) {
                termination = Termination::Converged;
                break;
            }
            if gradient_vanished(g, params) {
                termination = Termination::GradientVanished;
                break;
            }
        }
    }

    if !(f0 <= f_orig) {
        f0 = f_orig;
        x.clone_from(x_orig);
        g.clone_from(&g_orig);
    }

    log::debug!(
        "bfgs finished after {} steps and {} evaluations ({:?}): energy {:.6}",
        iterations,
        evaluations,
        termination,
        f0
    );

    Ok(Minimum {
        energy: f0,
        iterations,
        evaluations,
        termination,
    })
}

fn gradient_vanished<V: GeneralizedVector>(g: &V, params: &QuasiNewtonParams) -> bool {
    // Also true for NaN
    !(g.dot(g).sqrt() >= params.gradient_tolerance)
}

/// Backtracking search for a step satisfying the sufficient-decrease condition.
///
/// Returns `(alpha, energy)` of the accepted trial, whose state and gradient
/// are left in `x_new` and `g_new`, or `None` once the trial budget is spent.
#[allow(clippy::too_many_arguments)]
fn line_search<S, F>(
    objective: &F,
    x: &S,
    f0: f64,
    p: &S::Change,
    pg: f64,
    x_new: &mut S,
    g_new: &mut S::Change,
    params: &QuasiNewtonParams,
    evaluations: &mut usize,
) -> Result<Option<(f64, f64)>, OptimizationError>
where
    S: GeneralizedState,
    F: Objective<S> + ?Sized,
{
    let mut alpha = params.initial_step;
    for _ in 0..params.max_line_search_trials {
        x_new.clone_from(x);
        x_new.increment(p, alpha);
        let f1 = objective.evaluate(x_new, g_new)?;
        *evaluations += 1;

        // NaN energies fail this test and shrink the step
        if f1 - f0 < params.armijo_c1 * alpha * pg {
            return Ok(Some((alpha, f1)));
        }
        alpha *= params.step_multiplier;
    }
    Ok(None)
}

/// Secant update of the inverse Hessian from step `alpha * p` and gradient change `y`.
///
/// Returns `false` without touching `h` when `y . s` is too small.
fn bfgs_update(h: &mut DMatrix<f64>, p: &DVector<f64>, y: &DVector<f64>, alpha: f64) -> bool {
    let yp = y.dot(p);
    if alpha * yp < EPSILON {
        return false;
    }

    let minus_hy = -(&*h * y);
    let yhy = -y.dot(&minus_hy);
    let r = 1.0 / (alpha * yp);
    let n = p.len();

    for i in 0..n {
        for j in i..n {
            let v = alpha * r * (minus_hy[i] * p[j] + minus_hy[j] * p[i])
                + alpha * alpha * (r * r * yhy + r) * p[i] * p[j];
            h[(i, j)] += v;
            if i != j {
                h[(j, i)] += v;
            }
        }
    }
    true
}
