//! The materialized result of a bootstrap run.

use serde::Serialize;

use crate::model::Structure;
use crate::singular::{DEFAULT_SINGULAR_TOL, Singular};
use crate::statistics::{CDF, EmpiricalCDF, Interval, ShortestCoverage, Statistic};
use crate::transform::{self, TermSds, VarCorr};

/// Parameters re-estimated from one simulated response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Replicate {
    /// Zero-based logical index; it alone determines the RNG substream.
    pub index: usize,
    /// Fixed effects.
    pub beta: Vec<f64>,
    /// Residual standard deviation.
    pub sigma: f64,
    /// Covariance parameters.
    pub theta: Vec<f64>,
    /// Profiled objective at the refit optimum.
    pub objective: f64,
    /// Whether the refit optimizer converged.
    pub converged: bool,
    /// Simulate-and-refit cycles spent, 1 unless the response was redrawn.
    pub attempts: usize,
}

/// One named scalar that can be read off every replicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Parameter {
    /// Fixed effect `j`.
    Beta(usize),
    /// Residual standard deviation.
    Sigma,
    /// Component `k` of θ.
    Theta(usize),
    /// Standard deviation of coefficient `coef` in term `term`.
    Sd {
        /// Position of the term.
        term: usize,
        /// Coefficient within the term.
        coef: usize,
    },
    /// Correlation `index` (strictly-lower, column-major) in term `term`.
    Rho {
        /// Position of the term.
        term: usize,
        /// Position among the term's correlations.
        index: usize,
    },
}

/// Long-format row: one parameter of one replicate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterRow {
    /// Index of the replicate.
    pub replicate: usize,
    /// One of `β`, `σ`, `ρ`.
    pub kind: &'static str,
    /// Grouping term, `residual` for the residual σ, none for β.
    pub group: Option<String>,
    /// Display name.
    pub name: String,
    /// Parameter value in this replicate.
    pub value: f64,
}

/// Interval for one named parameter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterInterval {
    /// Which column the interval summarizes.
    pub parameter: Parameter,
    /// Display name of the parameter.
    pub name: String,
    /// Shortest interval at the requested level.
    pub interval: Interval<f64>,
}

/// Ordered replicates together with the structure needed to interpret them.
///
/// Standard deviations and correlations are derived from θ on every access
/// and never stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BootstrapSample {
    replicates: Vec<Replicate>,
    structure: Structure,
    requested: usize,
    singular_tol: f64,
}

// (row, col) of the `index`-th strictly-lower entry, column-major.
fn rho_pair(dim: usize, index: usize) -> (usize, usize) {
    let mut k = 0;
    for col in 0..dim {
        for row in col + 1..dim {
            if k == index {
                return (row, col);
            }
            k += 1;
        }
    }
    (dim, dim)
}

impl BootstrapSample {
    pub(crate) fn new(replicates: Vec<Replicate>, structure: Structure, requested: usize) -> Self {
        Self {
            replicates,
            structure,
            requested,
            singular_tol: DEFAULT_SINGULAR_TOL,
        }
    }

    #[must_use]
    pub(crate) fn with_singular_tol(mut self, tol: f64) -> Self {
        self.singular_tol = tol;
        self
    }

    /// Tolerance the run was configured with; used by the summary.
    pub fn singular_tol(&self) -> f64 {
        self.singular_tol
    }

    /// Number of replicates held.
    pub fn len(&self) -> usize {
        self.replicates.len()
    }

    /// Whether no finite points remain.
    pub fn is_empty(&self) -> bool {
        self.replicates.is_empty()
    }

    /// Number of replicates the run was asked for.
    pub fn requested(&self) -> usize {
        self.requested
    }

    /// False only for a run cancelled before all replicates finished.
    pub fn is_complete(&self) -> bool {
        self.replicates.len() == self.requested
    }

    /// Replicates in index order.
    pub fn replicates(&self) -> &[Replicate] {
        &self.replicates
    }

    /// Replicates in index order.
    pub fn iter(&self) -> std::slice::Iter<'_, Replicate> {
        self.replicates.iter()
    }

    /// Replicate by position in the sample.
    pub fn get(&self, i: usize) -> Option<&Replicate> {
        self.replicates.get(i)
    }

    /// Structure of the model the sample was drawn from.
    pub fn structure(&self) -> &Structure {
        &self.structure
    }

    /// Lower bounds on θ, shared by every replicate.
    pub fn lowerbd(&self) -> &[f64] {
        self.structure.lowerbd()
    }

    /// Per-replicate, per-term standard deviations.
    pub fn sigmas(&self) -> Vec<Vec<TermSds>> {
        self.replicates
            .iter()
            .map(|r| transform::sigmas(r.sigma, &r.theta, &self.structure))
            .collect()
    }

    /// Per-replicate, per-term standard deviations and correlations.
    pub fn sigma_rhos(&self) -> Vec<Vec<VarCorr>> {
        self.replicates
            .iter()
            .map(|r| transform::sigma_rhos(r.sigma, &r.theta, &self.structure))
            .collect()
    }

    /// Singularity flag of every replicate.
    pub fn singular(&self, tol: f64) -> Vec<bool> {
        Singular { tol }.compute(self)
    }

    /// Number of replicates flagged singular at `tol`.
    pub fn singular_count(&self, tol: f64) -> usize {
        self.singular(tol).into_iter().filter(|&s| s).count()
    }

    /// Share of singular replicates; NaN for an empty sample.
    pub fn singular_fraction(&self, tol: f64) -> f64 {
        if self.is_empty() {
            return f64::NAN;
        }
        self.singular_count(tol) as f64 / self.len() as f64
    }

    /// Replicates whose optimizer ran out of budget.
    pub fn nonconverged(&self) -> usize {
        self.replicates.iter().filter(|r| !r.converged).count()
    }

    /// Every scalar parameter in display order: β, σ, θ, then per term the
    /// standard deviations followed by the correlations.
    pub fn parameters(&self) -> Vec<Parameter> {
        let s = &self.structure;
        let mut out: Vec<Parameter> = (0..s.p()).map(Parameter::Beta).collect();
        out.push(Parameter::Sigma);
        out.extend((0..s.theta_len()).map(Parameter::Theta));
        for (term, t) in s.terms().iter().enumerate() {
            let dim = t.dim();
            out.extend((0..dim).map(|coef| Parameter::Sd { term, coef }));
            out.extend((0..dim * (dim - 1) / 2).map(|index| Parameter::Rho { term, index }));
        }
        out
    }

    /// Human-readable name of `parameter`.
    pub fn parameter_name(&self, parameter: &Parameter) -> String {
        let s = &self.structure;
        match *parameter {
            Parameter::Beta(j) => s.fixef_names().get(j).cloned().unwrap_or_else(|| format!("β{j}")),
            Parameter::Sigma => "σ".to_string(),
            Parameter::Theta(k) => format!("θ{}", k + 1),
            Parameter::Sd { term, coef } => match s.terms().get(term) {
                Some(t) if coef < t.dim() => format!("σ {}: {}", t.name(), t.coefs()[coef]),
                _ => format!("σ {term}: {coef}"),
            },
            Parameter::Rho { term, index } => match s.terms().get(term) {
                Some(t) if index < t.dim() * (t.dim() - 1) / 2 => {
                    let (row, col) = rho_pair(t.dim(), index);
                    format!("ρ {}: {}, {}", t.name(), t.coefs()[col], t.coefs()[row])
                }
                _ => format!("ρ {term}: {index}"),
            },
        }
    }

    fn value(&self, r: &Replicate, parameter: &Parameter) -> f64 {
        match *parameter {
            Parameter::Beta(j) => r.beta.get(j).copied().unwrap_or(f64::NAN),
            Parameter::Sigma => r.sigma,
            Parameter::Theta(k) => r.theta.get(k).copied().unwrap_or(f64::NAN),
            Parameter::Sd { term, coef } => self
                .structure
                .terms()
                .get(term)
                .filter(|t| coef < t.dim())
                .map_or(f64::NAN, |t| {
                    let lambda = transform::term_block(&r.theta, t);
                    r.sigma * lambda.row(coef).norm()
                }),
            Parameter::Rho { term, index } => self
                .structure
                .terms()
                .get(term)
                .map_or(f64::NAN, |t| {
                    let lambda = transform::term_block(&r.theta, t);
                    VarCorr::from_block(t, r.sigma, &lambda)
                        .rho
                        .get(index)
                        .copied()
                        .unwrap_or(f64::NAN)
                }),
        }
    }

    /// Values of `parameter` across replicates, in index order.
    pub fn column(&self, parameter: &Parameter) -> Vec<f64> {
        self.replicates.iter().map(|r| self.value(r, parameter)).collect()
    }

    /// Applies `statistic` to the column of `parameter`.
    pub fn estimate<T>(&self, parameter: &Parameter, statistic: &impl Statistic<Vec<f64>, T>) -> T {
        statistic.compute(&self.column(parameter))
    }

    /// Empirical distribution of `parameter`; undefined correlations are left out.
    pub fn ecdf(&self, parameter: &Parameter) -> EmpiricalCDF<f64> {
        CDF.compute(&self.column(parameter))
    }

    /// Long-format rows: per replicate β, σ, then per term the standard
    /// deviations and correlations.
    pub fn allpars(&self) -> Vec<ParameterRow> {
        let s = &self.structure;
        let mut rows = Vec::new();
        for r in &self.replicates {
            for (name, &value) in s.fixef_names().iter().zip(&r.beta) {
                rows.push(ParameterRow {
                    replicate: r.index,
                    kind: "β",
                    group: None,
                    name: name.clone(),
                    value,
                });
            }
            for vc in transform::sigma_rhos(r.sigma, &r.theta, s) {
                for (coef, &sd) in vc.coefs.iter().zip(&vc.sd) {
                    rows.push(ParameterRow {
                        replicate: r.index,
                        kind: "σ",
                        group: Some(vc.term.clone()),
                        name: coef.clone(),
                        value: sd,
                    });
                }
                for (index, &rho) in vc.rho.iter().enumerate() {
                    let (row, col) = rho_pair(vc.coefs.len(), index);
                    rows.push(ParameterRow {
                        replicate: r.index,
                        kind: "ρ",
                        group: Some(vc.term.clone()),
                        name: format!("{}, {}", vc.coefs[col], vc.coefs[row]),
                        value: rho,
                    });
                }
            }
            rows.push(ParameterRow {
                replicate: r.index,
                kind: "σ",
                group: Some("residual".to_string()),
                name: String::new(),
                value: r.sigma,
            });
        }
        rows
    }

    /// Shortest-coverage intervals at `level` for β, σ and the per-term
    /// standard deviations and correlations.
    pub fn confint(&self, level: f64) -> Vec<ParameterInterval> {
        let statistic = ShortestCoverage::new(level);
        self.parameters()
            .into_iter()
            .filter(|p| !matches!(p, Parameter::Theta(_)))
            .map(|parameter| ParameterInterval {
                name: self.parameter_name(&parameter),
                interval: statistic.compute(&self.ecdf(&parameter)),
                parameter,
            })
            .collect()
    }
}

impl<'a> IntoIterator for &'a BootstrapSample {
    type Item = &'a Replicate;
    type IntoIter = std::slice::Iter<'a, Replicate>;

    fn into_iter(self) -> Self::IntoIter {
        self.replicates.iter()
    }
}
