//! Boundary (singular fit) detection.
//!
//! A fit is singular when some bounded component of θ sits on its lower
//! bound, i.e. a variance collapsed to zero or a covariance factor lost rank.
//! Only θ and the bounds are consulted.

use crate::sample::BootstrapSample;
use crate::statistics::Statistic;

/// Absolute tolerance used when none is configured.
pub const DEFAULT_SINGULAR_TOL: f64 = 1e-6;

/// True iff some `i` with a finite bound has `|θᵢ − lowerbdᵢ| ≤ tol`.
///
/// `theta` and `lowerbd` must have the same length.
pub fn is_singular(theta: &[f64], lowerbd: &[f64], tol: f64) -> bool {
    debug_assert_eq!(theta.len(), lowerbd.len(), "θ and its lower bounds differ in length");
    theta
        .iter()
        .zip(lowerbd)
        .any(|(&t, &lb)| lb.is_finite() && (t - lb).abs() <= tol)
}

/// Per-replicate singularity flags over a whole sample.
#[derive(Debug, Clone, Copy)]
pub struct Singular {
    /// Absolute distance from the bound.
    pub tol: f64,
}

impl Default for Singular {
    fn default() -> Self {
        Self {
            tol: DEFAULT_SINGULAR_TOL,
        }
    }
}

impl Statistic<BootstrapSample, Vec<bool>> for Singular {
    fn compute(&self, sample: &BootstrapSample) -> Vec<bool> {
        let lowerbd = sample.lowerbd();
        sample
            .iter()
            .map(|r| is_singular(&r.theta, lowerbd, self.tol))
            .collect()
    }
}
