//! Fitted-model contract.
//!
//! A [`MixedModelFit`] is everything the bootstrap needs from a fitted linear
//! mixed model: the structural metadata that gives θ its meaning, the
//! estimates to simulate from, and the ability to simulate and refit.
//! [`FittedModel`] is the dense implementation over already-built design
//! matrices.

mod refit;
mod simulate;

pub use refit::{Pls, Refit, RefitOptions, Workspace};
pub use simulate::simulate;

use log::{info, warn};
use nalgebra::{DMatrix, DVector};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{BootstrapError, FitError, Result};

/// Estimation criterion of the original fit. Refits always use the same one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Method {
    /// Maximum likelihood.
    #[default]
    Ml,
    /// Restricted (residual) maximum likelihood.
    Reml,
}

/// One random-effects grouping term.
///
/// The term owns a `dim × dim` lower-triangular block λ of the relative
/// covariance factor. Its θ entries are the lower triangle of λ stored
/// column by column, and its Z columns are laid out level by level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReTerm {
    name: String,
    coefs: Vec<String>,
    levels: usize,
    id: usize,
    theta_offset: usize,
    z_offset: usize,
}

impl ReTerm {
    /// Term named after its grouping factor, with one random coefficient per
    /// entry of `coefs`, observed over `levels` groups.
    pub fn new(name: impl Into<String>, coefs: Vec<String>, levels: usize) -> Self {
        Self {
            name: name.into(),
            coefs,
            levels,
            id: 0,
            theta_offset: 0,
            z_offset: 0,
        }
    }

    /// Random-intercept term.
    pub fn intercept(name: impl Into<String>, levels: usize) -> Self {
        Self::new(name, vec!["(Intercept)".to_string()], levels)
    }

    /// Position of the term within its [`Structure`].
    pub fn id(&self) -> usize {
        self.id
    }

    /// Grouping factor name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Names of the random coefficients.
    pub fn coefs(&self) -> &[String] {
        &self.coefs
    }

    /// Block size.
    pub fn dim(&self) -> usize {
        self.coefs.len()
    }

    /// Number of groups.
    pub fn levels(&self) -> usize {
        self.levels
    }

    /// Offset of the term's first entry in θ.
    pub fn theta_offset(&self) -> usize {
        self.theta_offset
    }

    /// Number of θ entries owned by the term.
    pub fn theta_len(&self) -> usize {
        let d = self.dim();
        d * (d + 1) / 2
    }

    /// Absolute position in θ of `λ[(row, col)]`, `row >= col`.
    pub fn theta_index(&self, row: usize, col: usize) -> usize {
        debug_assert!(row >= col && row < self.dim());
        let d = self.dim();
        self.theta_offset + col * d - col * col.saturating_sub(1) / 2 + (row - col)
    }

    /// First column of the term in Z.
    pub fn z_offset(&self) -> usize {
        self.z_offset
    }

    /// Number of Z columns (and random effects) owned by the term.
    pub fn z_cols(&self) -> usize {
        self.levels * self.dim()
    }
}

/// Structural metadata of a fitted model: what is needed to interpret θ.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Structure {
    fixef_names: Vec<String>,
    terms: Vec<ReTerm>,
    lowerbd: Vec<f64>,
    nobs: usize,
    method: Method,
}

impl Structure {
    /// Resolves term offsets and lower bounds.
    ///
    /// # Errors
    /// `InvalidModel` when there are no fixed effects, no terms, an empty or
    /// level-less term, or too few observations for the estimation method.
    pub fn new(
        fixef_names: Vec<String>,
        terms: Vec<ReTerm>,
        nobs: usize,
        method: Method,
    ) -> Result<Self> {
        if fixef_names.is_empty() {
            return Err(BootstrapError::InvalidModel(
                "model has no fixed-effects columns".into(),
            ));
        }
        if terms.is_empty() {
            return Err(BootstrapError::InvalidModel(
                "model has no random-effects terms".into(),
            ));
        }
        if nobs <= fixef_names.len() {
            return Err(BootstrapError::InvalidModel(format!(
                "{nobs} observations cannot identify {} fixed effects",
                fixef_names.len()
            )));
        }

        let mut terms = terms;
        let mut lowerbd = Vec::new();
        let mut z_offset = 0;
        for (id, term) in terms.iter_mut().enumerate() {
            if term.dim() == 0 || term.levels == 0 {
                return Err(BootstrapError::InvalidModel(format!(
                    "term `{}` has {} coefficients over {} levels",
                    term.name,
                    term.dim(),
                    term.levels
                )));
            }
            term.id = id;
            term.theta_offset = lowerbd.len();
            term.z_offset = z_offset;
            z_offset += term.z_cols();
            for col in 0..term.dim() {
                lowerbd.push(0.0);
                lowerbd.extend(std::iter::repeat_n(f64::NEG_INFINITY, term.dim() - col - 1));
            }
        }

        Ok(Self {
            fixef_names,
            terms,
            lowerbd,
            nobs,
            method,
        })
    }

    /// Names of the fixed-effects coefficients.
    pub fn fixef_names(&self) -> &[String] {
        &self.fixef_names
    }

    /// Number of fixed effects.
    pub fn p(&self) -> usize {
        self.fixef_names.len()
    }

    /// Random-effects terms in θ order.
    pub fn terms(&self) -> &[ReTerm] {
        &self.terms
    }

    /// Lower bounds on θ: zero for diagonal elements of λ, −∞ otherwise.
    pub fn lowerbd(&self) -> &[f64] {
        &self.lowerbd
    }

    /// Length of θ.
    pub fn theta_len(&self) -> usize {
        self.lowerbd.len()
    }

    /// Total number of random effects (columns of Z).
    pub fn q(&self) -> usize {
        self.terms.iter().map(ReTerm::z_cols).sum()
    }

    /// Number of observations.
    pub fn nobs(&self) -> usize {
        self.nobs
    }

    /// Estimation criterion.
    pub fn method(&self) -> Method {
        self.method
    }

    /// Canonical optimizer start: identity λ in every term.
    pub fn initial_theta(&self) -> Vec<f64> {
        self.lowerbd
            .iter()
            .map(|lb| if lb.is_finite() { 1.0 } else { 0.0 })
            .collect()
    }

    /// Rejects parameter values that cannot generate data from this structure.
    ///
    /// # Errors
    /// `DimensionMismatch` for wrongly sized β or θ, `InvalidModel` for a
    /// non-positive σ or a θ that is non-finite or violates its bounds.
    pub fn check_estimates(&self, estimates: &Estimates) -> Result<()> {
        if estimates.beta.len() != self.p() {
            return Err(BootstrapError::DimensionMismatch {
                expected: self.p(),
                got: estimates.beta.len(),
                context: "β",
            });
        }
        if estimates.theta.len() != self.theta_len() {
            return Err(BootstrapError::DimensionMismatch {
                expected: self.theta_len(),
                got: estimates.theta.len(),
                context: "θ",
            });
        }
        if !(estimates.sigma.is_finite() && estimates.sigma > 0.0) {
            return Err(BootstrapError::InvalidModel(format!(
                "residual scale must be positive, got {}",
                estimates.sigma
            )));
        }
        if estimates.beta.iter().any(|b| !b.is_finite()) {
            return Err(BootstrapError::InvalidModel("β is not finite".into()));
        }
        for (i, (&t, &lb)) in estimates.theta.iter().zip(&self.lowerbd).enumerate() {
            if !t.is_finite() || t < lb {
                return Err(BootstrapError::InvalidModel(format!(
                    "θ[{i}] = {t} violates lower bound {lb}"
                )));
            }
        }
        Ok(())
    }
}

/// Point estimates (β, σ, θ) of a linear mixed model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Estimates {
    /// Fixed effects.
    pub beta: Vec<f64>,
    /// Residual standard deviation.
    pub sigma: f64,
    /// Relative covariance factor parameters.
    pub theta: Vec<f64>,
}

/// Read-only view of a fitted model that can be simulated from and refit.
///
/// Implementations are shared across worker threads; anything a refit
/// mutates must live in the [`Workspace`] handed to it.
pub trait MixedModelFit: Sync {
    /// Structural metadata needed to interpret θ.
    fn structure(&self) -> &Structure;

    /// The fitted estimates.
    fn estimates(&self) -> &Estimates;

    /// Private scratch space for one worker, warm-started at `theta_start`.
    fn workspace(&self, theta_start: &[f64]) -> Workspace;

    /// Draws one response vector from the model with parameters `params`.
    fn simulate<R: Rng>(&self, rng: &mut R, params: &Estimates) -> DVector<f64>;

    /// Re-estimates all parameters from the response `y`.
    ///
    /// # Errors
    /// A [`FitError`] when an intermediate factorization degenerates.
    fn refit(
        &self,
        workspace: &mut Workspace,
        y: &DVector<f64>,
        options: &RefitOptions,
    ) -> std::result::Result<Refit, FitError>;
}

#[derive(Debug, Clone)]
pub(crate) struct CrossProducts {
    pub(crate) ztz: DMatrix<f64>,
    pub(crate) ztx: DMatrix<f64>,
    pub(crate) xtx: DMatrix<f64>,
}

/// Linear mixed model over dense design matrices, not yet fitted.
#[derive(Debug, Clone)]
pub struct LinearMixedModel {
    pub(crate) x: DMatrix<f64>,
    pub(crate) z: DMatrix<f64>,
    pub(crate) y: DVector<f64>,
    pub(crate) structure: Structure,
    pub(crate) cross: CrossProducts,
}

impl LinearMixedModel {
    /// Assembles a model from its response, fixed-effects matrix `x`,
    /// random-effects matrix `z` and term descriptors.
    ///
    /// # Errors
    /// `DimensionMismatch` when the matrices disagree with each other or with
    /// the terms, `InvalidModel` for non-finite data, a rank-deficient `x` or
    /// an unusable structure.
    pub fn new(
        y: DVector<f64>,
        x: DMatrix<f64>,
        z: DMatrix<f64>,
        fixef_names: Vec<String>,
        terms: Vec<ReTerm>,
        method: Method,
    ) -> Result<Self> {
        let n = y.len();
        if x.nrows() != n {
            return Err(BootstrapError::DimensionMismatch {
                expected: n,
                got: x.nrows(),
                context: "rows of X",
            });
        }
        if z.nrows() != n {
            return Err(BootstrapError::DimensionMismatch {
                expected: n,
                got: z.nrows(),
                context: "rows of Z",
            });
        }
        if fixef_names.len() != x.ncols() {
            return Err(BootstrapError::DimensionMismatch {
                expected: x.ncols(),
                got: fixef_names.len(),
                context: "fixed-effects names",
            });
        }
        let structure = Structure::new(fixef_names, terms, n, method)?;
        if z.ncols() != structure.q() {
            return Err(BootstrapError::DimensionMismatch {
                expected: structure.q(),
                got: z.ncols(),
                context: "columns of Z",
            });
        }
        if y.iter().chain(x.iter()).chain(z.iter()).any(|v| !v.is_finite()) {
            return Err(BootstrapError::InvalidModel(
                "response and design matrices must be finite".into(),
            ));
        }

        let cross = CrossProducts {
            ztz: z.tr_mul(&z),
            ztx: z.tr_mul(&x),
            xtx: x.tr_mul(&x),
        };
        if refit::factor(cross.xtx.clone(), "fixed-effects").is_err() {
            return Err(BootstrapError::InvalidModel(
                "fixed-effects matrix is rank deficient".into(),
            ));
        }
        Ok(Self {
            x,
            z,
            y,
            structure,
            cross,
        })
    }

    /// Fixed-effects model matrix.
    pub fn x(&self) -> &DMatrix<f64> {
        &self.x
    }

    /// Random-effects model matrix.
    pub fn z(&self) -> &DMatrix<f64> {
        &self.z
    }

    /// Observed response.
    pub fn y(&self) -> &DVector<f64> {
        &self.y
    }

    /// Structural metadata.
    pub fn structure(&self) -> &Structure {
        &self.structure
    }

    /// Profiled fit of the observed response from the canonical start.
    ///
    /// # Errors
    /// A [`FitError`] when the observed data make the factorization degenerate.
    pub fn fit(self, options: &RefitOptions) -> std::result::Result<FittedModel, FitError> {
        let start = self.structure.initial_theta();
        let mut workspace = Workspace::new(&self.structure, &start);
        let fit = refit::refit(&self, &mut workspace, &self.y, options)?;
        if fit.converged {
            info!(
                "fit converged in {} iterations, objective {:.6}",
                fit.iterations, fit.objective
            );
        } else {
            warn!(
                "fit stopped after {} iterations without converging, objective {:.6}",
                fit.iterations, fit.objective
            );
        }
        Ok(FittedModel {
            estimates: Estimates {
                beta: fit.beta,
                sigma: fit.sigma,
                theta: fit.theta,
            },
            objective: fit.objective,
            converged: fit.converged,
            model: self,
        })
    }

    /// Attaches externally obtained estimates without fitting.
    ///
    /// # Errors
    /// Whatever [`Structure::check_estimates`] rejects, and `InvalidModel`
    /// when the objective cannot be evaluated at the estimates.
    pub fn with_estimates(self, estimates: Estimates) -> Result<FittedModel> {
        self.structure.check_estimates(&estimates)?;
        let mut workspace = Workspace::new(&self.structure, &estimates.theta);
        workspace.load_response(&self, &self.y);
        let objective = refit::evaluate(&self, &mut workspace, &estimates.theta)
            .map_err(|e| BootstrapError::InvalidModel(format!("objective at the estimates: {e}")))?
            .objective;
        Ok(FittedModel {
            estimates,
            objective,
            converged: true,
            model: self,
        })
    }
}

/// A linear mixed model together with its estimates.
#[derive(Debug, Clone)]
pub struct FittedModel {
    model: LinearMixedModel,
    estimates: Estimates,
    objective: f64,
    converged: bool,
}

impl FittedModel {
    /// The underlying data and structure.
    pub fn model(&self) -> &LinearMixedModel {
        &self.model
    }

    /// Objective (−2 log-likelihood, or its REML analogue) at the estimates.
    pub fn objective(&self) -> f64 {
        self.objective
    }

    /// Whether the optimizer met its stopping rule.
    pub fn converged(&self) -> bool {
        self.converged
    }

    /// Lower bounds on θ.
    pub fn lowerbd(&self) -> &[f64] {
        self.model.structure.lowerbd()
    }
}

impl MixedModelFit for FittedModel {
    fn structure(&self) -> &Structure {
        &self.model.structure
    }

    fn estimates(&self) -> &Estimates {
        &self.estimates
    }

    fn workspace(&self, theta_start: &[f64]) -> Workspace {
        Workspace::new(&self.model.structure, theta_start)
    }

    fn simulate<R: Rng>(&self, rng: &mut R, params: &Estimates) -> DVector<f64> {
        simulate(rng, params, &self.model.x, &self.model.z, &self.model.structure)
    }

    fn refit(
        &self,
        workspace: &mut Workspace,
        y: &DVector<f64>,
        options: &RefitOptions,
    ) -> std::result::Result<Refit, FitError> {
        refit::refit(&self.model, workspace, y, options)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use nalgebra::{DMatrix, DVector};
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256PlusPlus;

    use super::*;

    /// Indicator/covariate block for one term: observation `i` belongs to
    /// `groups[i]` and carries covariates `covariates.row(i)`.
    pub(crate) fn term_columns(groups: &[usize], levels: usize, covariates: &DMatrix<f64>) -> DMatrix<f64> {
        let dim = covariates.ncols();
        let mut z = DMatrix::zeros(groups.len(), levels * dim);
        for (i, &g) in groups.iter().enumerate() {
            for k in 0..dim {
                z[(i, g * dim + k)] = covariates[(i, k)];
            }
        }
        z
    }

    /// Random intercept per group plus a slope on `x`, simulated from known
    /// parameters and then fitted.
    pub(crate) fn random_intercept(method: Method) -> FittedModel {
        let (levels, per) = (12, 6);
        let n = levels * per;
        let groups: Vec<usize> = (0..n).map(|i| i / per).collect();
        let x = DMatrix::from_fn(n, 2, |i, j| if j == 0 { 1.0 } else { (i % per) as f64 });
        let z = term_columns(&groups, levels, &DMatrix::from_element(n, 1, 1.0));
        let truth = Estimates {
            beta: vec![2.0, 0.5],
            sigma: 1.0,
            theta: vec![1.5],
        };
        build(x, z, vec![ReTerm::intercept("group", levels)], &truth, method, 11)
    }

    /// Correlated random intercept and slope per subject.
    pub(crate) fn random_slope(method: Method) -> FittedModel {
        let (levels, per) = (10, 8);
        let n = levels * per;
        let groups: Vec<usize> = (0..n).map(|i| i / per).collect();
        let day = |i: usize| (i % per) as f64;
        let x = DMatrix::from_fn(n, 2, |i, j| if j == 0 { 1.0 } else { day(i) });
        let cov = DMatrix::from_fn(n, 2, |i, j| if j == 0 { 1.0 } else { day(i) });
        let z = term_columns(&groups, levels, &cov);
        let term = ReTerm::new("subject", vec!["(Intercept)".into(), "day".into()], levels);
        let truth = Estimates {
            beta: vec![250.0, 10.0],
            sigma: 25.0,
            theta: vec![0.9, 0.05, 0.25],
        };
        build(x, z, vec![term], &truth, method, 29)
    }

    fn build(
        x: DMatrix<f64>,
        z: DMatrix<f64>,
        terms: Vec<ReTerm>,
        truth: &Estimates,
        method: Method,
        seed: u64,
    ) -> FittedModel {
        let names = vec!["(Intercept)".to_string(), "x".to_string()];
        let n = x.nrows();
        let structure = Structure::new(names.clone(), terms.clone(), n, method).unwrap();
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
        let y: DVector<f64> = simulate(&mut rng, truth, &x, &z, &structure);
        LinearMixedModel::new(y, x, z, names, terms, method)
            .unwrap()
            .fit(&RefitOptions::default())
            .unwrap()
    }
}
