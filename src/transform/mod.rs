//! θ → block covariance structures.
//!
//! Each grouping term owns a lower-triangular factor λ. With residual scale σ
//! the term's random-effects covariance is `σ² λ λᵀ`; the views below are
//! always recomputed from θ and never cached.

use nalgebra::DMatrix;
use serde::Serialize;

use crate::model::{ReTerm, Structure};

/// Lower-triangular covariance factor of one grouping term.
#[derive(Debug, Clone, PartialEq)]
pub struct TermBlock {
    /// Position of the term in the structure.
    pub id: usize,
    /// Display name.
    pub name: String,
    /// Lower-triangular relative covariance factor.
    pub lambda: DMatrix<f64>,
}

/// Builds λ for `term` from the full θ vector.
pub fn term_block(theta: &[f64], term: &ReTerm) -> DMatrix<f64> {
    let dim = term.dim();
    let mut lambda = DMatrix::zeros(dim, dim);
    for col in 0..dim {
        for row in col..dim {
            lambda[(row, col)] = theta[term.theta_index(row, col)];
        }
    }
    lambda
}

/// λ for every term of `structure`, in term order.
pub fn to_blocks(theta: &[f64], structure: &Structure) -> Vec<TermBlock> {
    structure
        .terms()
        .iter()
        .map(|term| TermBlock {
            id: term.id(),
            name: term.name().to_string(),
            lambda: term_block(theta, term),
        })
        .collect()
}

/// Negates every column of λ whose diagonal is negative.
///
/// `λ λᵀ` and the profiled objective are unchanged, and afterwards every
/// diagonal element satisfies its zero lower bound.
pub fn rectify(theta: &mut [f64], terms: &[ReTerm]) {
    for term in terms {
        for col in 0..term.dim() {
            if theta[term.theta_index(col, col)] < 0.0 {
                for row in col..term.dim() {
                    let i = term.theta_index(row, col);
                    theta[i] = -theta[i];
                }
            }
        }
    }
}

/// Standard deviations of one term's random effects.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TermSds {
    /// Grouping term name.
    pub term: String,
    /// Coefficient names of the term.
    pub coefs: Vec<String>,
    /// One standard deviation per coefficient.
    pub sd: Vec<f64>,
}

/// Standard deviations and correlations of one term's random effects.
///
/// `rho` holds the strictly-lower correlations in column-major order: one
/// value for a two-coefficient term, none for a scalar term. An entry is NaN
/// when either of its standard deviations is zero.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VarCorr {
    /// Grouping term name.
    pub term: String,
    /// Coefficient names of the term.
    pub coefs: Vec<String>,
    /// One standard deviation per coefficient.
    pub sd: Vec<f64>,
    /// Correlations in column-major lower-triangle order; NaN where undefined.
    pub rho: Vec<f64>,
}

fn row_sds(sigma: f64, lambda: &DMatrix<f64>) -> Vec<f64> {
    lambda.row_iter().map(|row| sigma * row.norm()).collect()
}

impl VarCorr {
    /// Derives the view from a term's factor.
    pub fn from_block(term: &ReTerm, sigma: f64, lambda: &DMatrix<f64>) -> Self {
        let sd = row_sds(sigma, lambda);
        let cov = lambda * lambda.transpose() * (sigma * sigma);
        let dim = sd.len();

        let mut rho = Vec::with_capacity(dim * dim.saturating_sub(1) / 2);
        for col in 0..dim {
            for row in col + 1..dim {
                let scale = sd[row] * sd[col];
                rho.push(if scale == 0.0 || !scale.is_finite() {
                    f64::NAN
                } else {
                    (cov[(row, col)] / scale).clamp(-1.0, 1.0)
                });
            }
        }

        Self {
            term: term.name().to_string(),
            coefs: term.coefs().to_vec(),
            sd,
            rho,
        }
    }

    /// Whether the term has a single random coefficient.
    pub fn is_scalar(&self) -> bool {
        self.sd.len() == 1
    }

    /// Full correlation matrix; undefined entries stay NaN.
    pub fn correlation_matrix(&self) -> DMatrix<f64> {
        let dim = self.sd.len();
        let mut r = DMatrix::identity(dim, dim);
        let mut k = 0;
        for col in 0..dim {
            for row in col + 1..dim {
                r[(row, col)] = self.rho[k];
                r[(col, row)] = self.rho[k];
                k += 1;
            }
        }
        r
    }

    /// Covariance `D R D` reassembled from the standard deviations and
    /// correlations. An undefined correlation only occurs next to a zero
    /// standard deviation, where the covariance is zero.
    pub fn covariance(&self) -> DMatrix<f64> {
        let dim = self.sd.len();
        let r = self.correlation_matrix();
        DMatrix::from_fn(dim, dim, |i, j| {
            if i == j {
                self.sd[i] * self.sd[i]
            } else if r[(i, j)].is_nan() {
                0.0
            } else {
                r[(i, j)] * self.sd[i] * self.sd[j]
            }
        })
    }
}

/// Per-term standard deviations (σs).
pub fn sigmas(sigma: f64, theta: &[f64], structure: &Structure) -> Vec<TermSds> {
    structure
        .terms()
        .iter()
        .map(|term| TermSds {
            term: term.name().to_string(),
            coefs: term.coefs().to_vec(),
            sd: row_sds(sigma, &term_block(theta, term)),
        })
        .collect()
}

/// Per-term standard deviations and correlations (σρs).
pub fn sigma_rhos(sigma: f64, theta: &[f64], structure: &Structure) -> Vec<VarCorr> {
    structure
        .terms()
        .iter()
        .map(|term| VarCorr::from_block(term, sigma, &term_block(theta, term)))
        .collect()
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::model::Method;

    fn structure() -> Structure {
        Structure::new(
            vec!["(Intercept)".into()],
            vec![
                ReTerm::new("subj", vec!["a".into(), "b".into(), "c".into()], 3),
                ReTerm::intercept("item", 4),
                ReTerm::new("site", vec!["a".into(), "b".into()], 2),
            ],
            40,
            Method::Ml,
        )
        .unwrap()
    }

    #[test]
    fn blocks_are_lower_triangular_in_term_order() {
        let s = structure();
        let theta = [1.0, 0.2, -0.3, 0.8, 0.1, 0.5, 2.0, 0.7, 0.4, 0.9];
        let blocks = to_blocks(&theta, &s);

        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].name, "subj");
        assert_eq!(
            blocks[0].lambda,
            DMatrix::from_row_slice(3, 3, &[1.0, 0.0, 0.0, 0.2, 0.8, 0.0, -0.3, 0.1, 0.5])
        );
        assert_eq!(blocks[1].lambda, DMatrix::from_element(1, 1, 2.0));
        assert_eq!(blocks[2].id, 2);
        assert_eq!(
            blocks[2].lambda,
            DMatrix::from_row_slice(2, 2, &[0.7, 0.0, 0.4, 0.9])
        );
    }

    #[test]
    fn sds_are_scaled_row_norms() {
        let s = structure();
        let theta = [1.0, 0.2, -0.3, 0.8, 0.1, 0.5, 2.0, 0.7, 0.4, 0.9];
        let sds = sigmas(1.5, &theta, &s);

        assert_relative_eq!(sds[0].sd[0], 1.5, epsilon = 1e-12);
        assert_relative_eq!(sds[0].sd[1], 1.5 * (0.04_f64 + 0.64).sqrt(), epsilon = 1e-12);
        assert_relative_eq!(sds[1].sd[0], 3.0, epsilon = 1e-12);
        assert_eq!(sds[2].coefs, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn var_corr_round_trips_to_the_factor_covariance() {
        let s = structure();
        let sigma = 0.8;
        let grid = [
            [1.0, 0.2, -0.3, 0.8, 0.1, 0.5, 2.0, 0.7, 0.4, 0.9],
            [0.3, -1.2, 0.6, 0.05, 2.0, 1.1, 0.01, 1.0, -0.9, 0.2],
            [2.5, 0.0, 0.0, 1.0, 0.0, 0.4, 1.0, 0.2, 3.0, 0.0001],
        ];
        for theta in grid {
            for (term, vc) in s.terms().iter().zip(sigma_rhos(sigma, &theta, &s)) {
                let lambda = term_block(&theta, term);
                let direct = &lambda * lambda.transpose() * (sigma * sigma);
                let rebuilt = vc.covariance();
                for (a, b) in direct.iter().zip(rebuilt.iter()) {
                    assert_relative_eq!(a, b, epsilon = 1e-10, max_relative = 1e-10);
                }
            }
        }
    }

    #[test]
    fn scalar_terms_have_no_correlation() {
        let s = structure();
        let theta = [1.0, 0.2, -0.3, 0.8, 0.1, 0.5, 2.0, 0.7, 0.4, 0.9];
        let vcs = sigma_rhos(1.0, &theta, &s);

        assert!(vcs[1].is_scalar());
        assert!(vcs[1].rho.is_empty());
        assert_eq!(vcs[0].rho.len(), 3);
        assert_eq!(vcs[2].rho.len(), 1);
    }

    #[test]
    fn zero_sd_gives_undefined_correlation() {
        let s = structure();
        // Second coefficient of `site` has an all-zero row.
        let theta = [1.0, 0.2, -0.3, 0.8, 0.1, 0.5, 2.0, 0.7, 0.0, 0.0];
        let vc = &sigma_rhos(1.0, &theta, &s)[2];

        assert_eq!(vc.sd[1], 0.0);
        assert!(vc.rho[0].is_nan());
        assert_eq!(vc.covariance()[(0, 1)], 0.0);
    }

    #[test]
    fn perfectly_aligned_rows_clamp_to_unit_correlation() {
        let s = structure();
        // Rank-one `site` block: the correlation is ±1 up to rounding.
        let theta = [1.0, 0.2, -0.3, 0.8, 0.1, 0.5, 2.0, 0.3, 0.7, 0.0];
        let rho = sigma_rhos(1.0, &theta, &s)[2].rho[0];
        assert!(rho <= 1.0);
        assert_relative_eq!(rho, 1.0, epsilon = 1e-12);

        let theta = [1.0, 0.2, -0.3, 0.8, 0.1, 0.5, 2.0, 0.3, -0.7, 0.0];
        let rho = sigma_rhos(1.0, &theta, &s)[2].rho[0];
        assert!(rho >= -1.0);
        assert_relative_eq!(rho, -1.0, epsilon = 1e-12);
    }

    #[test]
    fn rectify_preserves_covariance() {
        let s = structure();
        let original = [-1.0, 0.2, -0.3, -0.8, 0.1, 0.5, -2.0, 0.7, 0.4, -0.9];
        let mut theta = original;
        rectify(&mut theta, s.terms());

        for (t, lb) in theta.iter().zip(s.lowerbd()) {
            assert!(t >= lb);
        }
        for term in s.terms() {
            let before = term_block(&original, term);
            let after = term_block(&theta, term);
            let a = &before * before.transpose();
            let b = &after * after.transpose();
            for (x, y) in a.iter().zip(b.iter()) {
                assert_relative_eq!(x, y, epsilon = 1e-12);
            }
        }
    }
}
