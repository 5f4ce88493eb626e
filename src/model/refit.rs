//! Profiled re-estimation of (β, θ, σ) from a response vector.
//!
//! For a fixed θ the optimal β and the penalized residual sum of squares come
//! out of a blocked Cholesky solve:
//! ```text
//! L Lᵀ      = ΛᵀZᵀZΛ + I
//! c_u       = L⁻¹ ΛᵀZᵀy
//! R_ZX      = L⁻¹ ΛᵀZᵀX
//! R_X R_Xᵀ  = XᵀX − R_ZXᵀ R_ZX
//! β         = (R_X R_Xᵀ)⁻¹ (Xᵀy − R_ZXᵀ c_u)
//! r²        = yᵀy − ‖c_u‖² − (Xᵀy − R_ZXᵀ c_u)ᵀ β
//! ```
//! leaving a scalar objective in θ alone, minimized with Nelder–Mead.

use std::cell::RefCell;
use std::f64::consts::PI;

use argmin::core::{CostFunction, Error as ArgminError, Executor, State, TerminationReason, TerminationStatus};
use argmin::solver::neldermead::NelderMead;
use log::debug;
use nalgebra::{Cholesky, DMatrix, DVector, Dyn};
use serde::{Deserialize, Serialize};

use super::{LinearMixedModel, Method, Structure};
use crate::error::FitError;
use crate::transform::{rectify, term_block};

/// Optimizer settings for a single refit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RefitOptions {
    /// Iteration budget of the simplex search.
    pub max_iter: u64,
    /// Stop once the standard deviation of the simplex objective values is below this.
    pub ftol: f64,
    /// Edge length of the initial simplex, relative to `max(|θᵢ|, 1)`.
    pub initial_step: f64,
    /// Bounded components closer than this to their bound are tried at the bound.
    pub zero_tol: f64,
}

impl Default for RefitOptions {
    fn default() -> Self {
        Self {
            max_iter: 2_000,
            ftol: 1e-8,
            initial_step: 0.5,
            zero_tol: 1e-3,
        }
    }
}

impl RefitOptions {
    /// Sets the simplex iteration budget.
    #[must_use]
    pub fn with_max_iter(mut self, max_iter: u64) -> Self {
        self.max_iter = max_iter;
        self
    }

    /// Sets the convergence tolerance on the simplex objective values.
    #[must_use]
    pub fn with_ftol(mut self, ftol: f64) -> Self {
        self.ftol = ftol;
        self
    }

    /// Sets the initial simplex edge, relative to the start.
    #[must_use]
    pub fn with_initial_step(mut self, initial_step: f64) -> Self {
        self.initial_step = initial_step;
        self
    }

    /// Sets the distance within which a bounded component is tried at its bound.
    #[must_use]
    pub fn with_zero_tol(mut self, zero_tol: f64) -> Self {
        self.zero_tol = zero_tol;
        self
    }
}

/// Per-task scratch: the covariance factor buffer, the cross-products of the
/// current response, and the warm start.
///
/// Every worker owns one; it is never shared between concurrent refits.
#[derive(Debug, Clone)]
pub struct Workspace {
    theta_start: Vec<f64>,
    lambda: DMatrix<f64>,
    zty: DVector<f64>,
    xty: DVector<f64>,
    yty: f64,
}

impl Workspace {
    /// Empty scratch sized for `structure`, warm-started at `theta_start`.
    pub fn new(structure: &Structure, theta_start: &[f64]) -> Self {
        let q = structure.q();
        Self {
            theta_start: theta_start.to_vec(),
            lambda: DMatrix::zeros(q, q),
            zty: DVector::zeros(q),
            xty: DVector::zeros(structure.p()),
            yty: 0.0,
        }
    }

    /// θ the optimizer starts from.
    pub fn theta_start(&self) -> &[f64] {
        &self.theta_start
    }

    pub(crate) fn load_response(&mut self, model: &LinearMixedModel, y: &DVector<f64>) {
        self.zty = model.z.tr_mul(y);
        self.xty = model.x.tr_mul(y);
        self.yty = y.norm_squared();
    }

    // Structural zeros of Λ are never written, so only the lower triangle of
    // each diagonal block is refreshed.
    fn fill_lambda(&mut self, structure: &Structure, theta: &[f64]) {
        for term in structure.terms() {
            let block = term_block(theta, term);
            let dim = term.dim();
            for level in 0..term.levels() {
                let base = term.z_offset() + level * dim;
                for col in 0..dim {
                    for row in col..dim {
                        self.lambda[(base + row, base + col)] = block[(row, col)];
                    }
                }
            }
        }
    }
}

/// Penalized least-squares solution at a fixed θ.
#[derive(Debug, Clone)]
pub struct Pls {
    /// Conditional estimate of the fixed effects.
    pub beta: DVector<f64>,
    /// Penalized residual sum of squares.
    pub pwrss: f64,
    /// Profiled residual standard deviation.
    pub sigma: f64,
    /// Profiled objective.
    pub objective: f64,
}

/// Outcome of one profiled refit.
#[derive(Debug, Clone, PartialEq)]
pub struct Refit {
    /// Fixed effects at the optimum.
    pub beta: Vec<f64>,
    /// Residual standard deviation.
    pub sigma: f64,
    /// Rectified covariance parameters.
    pub theta: Vec<f64>,
    /// Profiled objective at the optimum.
    pub objective: f64,
    /// False when the iteration budget ran out first.
    pub converged: bool,
    /// Simplex iterations used.
    pub iterations: u64,
}

pub(crate) fn factor(m: DMatrix<f64>, stage: &'static str) -> Result<Cholesky<f64, Dyn>, FitError> {
    Cholesky::new(m)
        .filter(|chol| chol.l_dirty().diagonal().iter().all(|&d| d > 0.0))
        .ok_or(FitError::NotPositiveDefinite { stage })
}

fn log_diag_sq(factor: &DMatrix<f64>) -> f64 {
    2.0 * factor.diagonal().iter().map(|d| d.ln()).sum::<f64>()
}

/// Profiled objective at `theta` for the response loaded into `workspace`.
pub(crate) fn evaluate(
    model: &LinearMixedModel,
    workspace: &mut Workspace,
    theta: &[f64],
) -> Result<Pls, FitError> {
    let structure = &model.structure;
    workspace.fill_lambda(structure, theta);
    let lambda = &workspace.lambda;
    let cross = &model.cross;

    let mut m = lambda.tr_mul(&cross.ztz) * lambda;
    for i in 0..m.nrows() {
        m[(i, i)] += 1.0;
    }
    let l = factor(m, "random-effects")?.l();

    let cu = l
        .solve_lower_triangular(&lambda.tr_mul(&workspace.zty))
        .ok_or(FitError::NotPositiveDefinite { stage: "random-effects" })?;
    let rzx = l
        .solve_lower_triangular(&lambda.tr_mul(&cross.ztx))
        .ok_or(FitError::NotPositiveDefinite { stage: "random-effects" })?;

    let rx = factor(&cross.xtx - rzx.tr_mul(&rzx), "fixed-effects")?;
    let rhs = &workspace.xty - rzx.tr_mul(&cu);
    let beta = rx.solve(&rhs);

    let pwrss = workspace.yty - cu.norm_squared() - rhs.dot(&beta);
    if !pwrss.is_finite() || pwrss <= 0.0 {
        return Err(FitError::DegenerateResidual(pwrss));
    }

    let n = structure.nobs() as f64;
    let ld_l = log_diag_sq(&l);
    let (objective, dof) = match structure.method() {
        Method::Ml => (ld_l + n * (1.0 + (2.0 * PI * pwrss / n).ln()), n),
        Method::Reml => {
            let dof = n - structure.p() as f64;
            let ld_x = log_diag_sq(&rx.l());
            (ld_l + ld_x + dof * (1.0 + (2.0 * PI * pwrss / dof).ln()), dof)
        }
    };

    Ok(Pls {
        beta,
        pwrss,
        sigma: (pwrss / dof).sqrt(),
        objective,
    })
}

struct ProfiledObjective<'a> {
    model: &'a LinearMixedModel,
    workspace: RefCell<&'a mut Workspace>,
}

// A θ where the factorization breaks down costs +∞, so the simplex moves away
// from it. The solver unwraps every cost of its start simplex.
impl CostFunction for ProfiledObjective<'_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, theta: &Self::Param) -> Result<Self::Output, ArgminError> {
        let mut workspace = self.workspace.borrow_mut();
        Ok(match evaluate(self.model, &mut **workspace, theta) {
            Ok(pls) if pls.objective.is_finite() => pls.objective,
            _ => f64::INFINITY,
        })
    }
}

fn initial_simplex(start: &[f64], step: f64) -> Vec<Vec<f64>> {
    let mut simplex = vec![start.to_vec()];
    for i in 0..start.len() {
        let mut vertex = start.to_vec();
        vertex[i] += step * start[i].abs().max(1.0);
        simplex.push(vertex);
    }
    simplex
}

fn into_fit_error(err: ArgminError) -> FitError {
    match err.downcast::<FitError>() {
        Ok(fit) => fit,
        Err(other) => FitError::Optimizer(other.to_string()),
    }
}

fn minimize(
    model: &LinearMixedModel,
    workspace: &mut Workspace,
    options: &RefitOptions,
) -> Result<(Vec<f64>, bool, u64), FitError> {
    let start = workspace.theta_start.clone();
    evaluate(model, workspace, &start)?;
    let solver = NelderMead::new(initial_simplex(&start, options.initial_step))
        .with_sd_tolerance(options.ftol)
        .map_err(into_fit_error)?;
    let problem = ProfiledObjective {
        model,
        workspace: RefCell::new(workspace),
    };

    let result = Executor::new(problem, solver)
        .configure(|state| state.max_iters(options.max_iter))
        .run()
        .map_err(into_fit_error)?;
    let state = result.state();
    let converged = matches!(
        state.get_termination_status(),
        TerminationStatus::Terminated(TerminationReason::SolverConverged)
    );
    let theta = state.get_best_param().cloned().unwrap_or(start);
    Ok((theta, converged, state.get_iter()))
}

// Bounded components that stopped just short of their bound are moved onto it
// whenever that does not increase the objective.
fn polish_boundary(
    model: &LinearMixedModel,
    workspace: &mut Workspace,
    theta: &mut Vec<f64>,
    pls: &mut Pls,
    zero_tol: f64,
) {
    let lowerbd = model.structure.lowerbd();
    for i in 0..theta.len() {
        let lb = lowerbd[i];
        if !lb.is_finite() || theta[i] == lb || (theta[i] - lb).abs() >= zero_tol {
            continue;
        }
        let mut trial = theta.clone();
        trial[i] = lb;
        if let Ok(at_bound) = evaluate(model, workspace, &trial) {
            if at_bound.objective <= pls.objective {
                debug!("θ[{i}] = {:.3e} moved onto its bound", theta[i]);
                *theta = trial;
                *pls = at_bound;
            }
        }
    }
}

pub(crate) fn refit(
    model: &LinearMixedModel,
    workspace: &mut Workspace,
    y: &DVector<f64>,
    options: &RefitOptions,
) -> Result<Refit, FitError> {
    workspace.load_response(model, y);
    let (mut theta, converged, iterations) = minimize(model, workspace, options)?;

    rectify(&mut theta, model.structure.terms());
    let mut pls = evaluate(model, workspace, &theta)?;
    polish_boundary(model, workspace, &mut theta, &mut pls, options.zero_tol);

    Ok(Refit {
        beta: pls.beta.iter().copied().collect(),
        sigma: pls.sigma,
        theta,
        objective: pls.objective,
        converged,
        iterations,
    })
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use nalgebra::{DMatrix, DVector};

    use super::*;
    use crate::model::fixtures::{random_intercept, term_columns};
    use crate::model::{MixedModelFit, ReTerm};

    fn grouped(y: Vec<f64>, levels: usize, x: DMatrix<f64>, method: Method) -> LinearMixedModel {
        let n = y.len();
        let per = n / levels;
        let groups: Vec<usize> = (0..n).map(|i| i / per).collect();
        let z = term_columns(&groups, levels, &DMatrix::from_element(n, 1, 1.0));
        let names = (0..x.ncols()).map(|j| format!("x{j}")).collect();
        LinearMixedModel::new(
            DVector::from_vec(y),
            x,
            z,
            names,
            vec![ReTerm::intercept("g", levels)],
            method,
        )
        .unwrap()
    }

    #[test]
    fn zero_theta_reduces_to_least_squares() {
        let y = vec![1.0, 3.0, 2.0, 5.0, 4.0, 6.0, 8.0, 7.0];
        let x = DMatrix::from_fn(8, 2, |i, j| if j == 0 { 1.0 } else { i as f64 });
        let model = grouped(y.clone(), 4, x.clone(), Method::Ml);

        let mut ws = Workspace::new(&model.structure, &[0.0]);
        ws.load_response(&model, &model.y);
        let pls = evaluate(&model, &mut ws, &[0.0]).unwrap();

        let ols = (x.tr_mul(&x)).try_inverse().unwrap() * x.tr_mul(&DVector::from_vec(y));
        assert_relative_eq!(pls.beta[0], ols[0], epsilon = 1e-10);
        assert_relative_eq!(pls.beta[1], ols[1], epsilon = 1e-10);
        assert_relative_eq!(pls.sigma, (pls.pwrss / 8.0).sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn reml_uses_residual_degrees_of_freedom() {
        let y = vec![1.0, 3.0, 2.0, 5.0, 4.0, 6.0, 8.0, 7.0];
        let x = DMatrix::from_fn(8, 2, |i, j| if j == 0 { 1.0 } else { i as f64 });
        let ml = grouped(y.clone(), 4, x.clone(), Method::Ml);
        let reml = grouped(y, 4, x, Method::Reml);

        let mut ws = Workspace::new(&ml.structure, &[0.7]);
        ws.load_response(&ml, &ml.y);
        let a = evaluate(&ml, &mut ws, &[0.7]).unwrap();
        ws.load_response(&reml, &reml.y);
        let b = evaluate(&reml, &mut ws, &[0.7]).unwrap();

        assert_relative_eq!(a.pwrss, b.pwrss, epsilon = 1e-10);
        assert_relative_eq!(b.sigma * b.sigma * 6.0, a.sigma * a.sigma * 8.0, epsilon = 1e-10);
    }

    #[test]
    fn identical_group_means_fit_on_the_boundary() {
        // Every group holds the same values, so the between-group variance is zero.
        let y: Vec<f64> = (0..5).flat_map(|_| [1.0, 2.0, 4.0]).collect();
        let x = DMatrix::from_element(15, 1, 1.0);
        let fitted = grouped(y, 5, x, Method::Ml)
            .fit(&RefitOptions::default())
            .unwrap();

        assert_eq!(fitted.estimates().theta, vec![0.0]);
        assert_relative_eq!(fitted.estimates().beta[0], 7.0 / 3.0, epsilon = 1e-8);
    }

    #[test]
    fn degenerate_theta_costs_infinity() {
        let fitted = random_intercept(Method::Ml);
        let mut ws = fitted.workspace(&[1.0]);
        let y = fitted.model().y().map(|v| v * f64::INFINITY);
        ws.load_response(fitted.model(), &y);
        let problem = ProfiledObjective {
            model: fitted.model(),
            workspace: RefCell::new(&mut ws),
        };

        assert_eq!(problem.cost(&vec![1.0]).unwrap(), f64::INFINITY);
    }

    #[test]
    fn degenerate_start_fails_without_running_the_simplex() {
        let fitted = random_intercept(Method::Ml);
        let mut ws = fitted.workspace(&[1.0]);
        let y = DVector::from_element(fitted.model().y().len(), f64::MAX);

        let err = fitted.refit(&mut ws, &y, &RefitOptions::default()).unwrap_err();
        assert!(matches!(err, FitError::DegenerateResidual(_)));
    }

    #[test]
    fn zero_response_fails_the_fit() {
        let y = vec![0.0; 8];
        let x = DMatrix::from_fn(8, 2, |i, j| if j == 0 { 1.0 } else { i as f64 });
        let err = grouped(y, 4, x, Method::Ml)
            .fit(&RefitOptions::default())
            .unwrap_err();

        assert_eq!(err, FitError::DegenerateResidual(0.0));
    }

    #[test]
    fn non_finite_response_fails_the_refit() {
        let fitted = random_intercept(Method::Ml);
        let mut ws = fitted.workspace(&fitted.estimates().theta);
        let mut y = fitted.model().y().clone();
        y[3] = f64::NAN;

        let err = fitted.refit(&mut ws, &y, &RefitOptions::default()).unwrap_err();
        assert!(matches!(err, FitError::DegenerateResidual(r) if r.is_nan()));
    }

    #[test]
    fn refit_of_observed_response_reproduces_the_fit() {
        let fitted = random_intercept(Method::Reml);
        let mut ws = fitted.workspace(&fitted.estimates().theta);
        let again = fitted
            .refit(&mut ws, fitted.model().y(), &RefitOptions::default())
            .unwrap();

        assert!(again.objective <= fitted.objective() + 1e-5);
        assert_relative_eq!(again.theta[0], fitted.estimates().theta[0], epsilon = 1e-2);
        assert_relative_eq!(again.sigma, fitted.estimates().sigma, epsilon = 1e-2);
    }

    #[test]
    fn exhausted_budget_is_reported_not_fatal() {
        let fitted = random_intercept(Method::Ml);
        let mut ws = fitted.workspace(&[3.0]);
        let options = RefitOptions::default().with_max_iter(2);
        let refit = fitted.refit(&mut ws, fitted.model().y(), &options).unwrap();

        assert!(!refit.converged);
        assert!(refit.theta[0] >= 0.0);
        assert!(refit.sigma > 0.0);
    }

    #[test]
    fn initial_simplex_scales_with_start() {
        let simplex = initial_simplex(&[0.0, 4.0], 0.5);
        assert_eq!(simplex, vec![vec![0.0, 4.0], vec![0.5, 4.0], vec![0.0, 6.0]]);
    }
}
