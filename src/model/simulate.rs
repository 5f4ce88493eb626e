use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand_distr::StandardNormal;

use super::{Estimates, Structure};
use crate::transform::term_block;

/// Draws one response from the model with parameters `params`.
///
/// Draw order is fixed: the spherical random effects `u` first (term by term,
/// level by level, coefficient by coefficient), then one residual per
/// observation. So for a given RNG state the result is reproducible bit for bit.
/// ```text
/// b = σ Λ(θ) u,   y = Xβ + Zb + σε,   u ~ N(0, I_q),  ε ~ N(0, I_n)
/// ```
pub fn simulate<R: Rng>(
    rng: &mut R,
    params: &Estimates,
    x: &DMatrix<f64>,
    z: &DMatrix<f64>,
    structure: &Structure,
) -> DVector<f64> {
    let mut b: DVector<f64> = DVector::zeros(structure.q());
    for term in structure.terms() {
        let lambda = term_block(&params.theta, term) * params.sigma;
        let dim = term.dim();
        let mut u: DVector<f64> = DVector::zeros(dim);
        for level in 0..term.levels() {
            for k in 0..dim {
                u[k] = rng.sample(StandardNormal);
            }
            b.rows_mut(term.z_offset() + level * dim, dim)
                .copy_from(&(&lambda * &u));
        }
    }

    let mut y = x * DVector::from_column_slice(&params.beta) + z * b;
    for yi in y.iter_mut() {
        let e: f64 = rng.sample(StandardNormal);
        *yi += params.sigma * e;
    }
    y
}
