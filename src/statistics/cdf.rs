use std::cmp::Ordering;

use num_traits::Float;

use super::Statistic;

/// Empirical cumulative distribution function, Fₙ(x) = (1/n) Σᵢ I(Xᵢ ≤ x).
///
/// NaN values are dropped on construction. Correlation columns use NaN for
/// "undefined", and those replicates simply do not enter the distribution.
#[derive(Debug, Clone, PartialEq)]
pub struct EmpiricalCDF<T> {
    sorted: Vec<T>,
}

impl<T: Float> EmpiricalCDF<T> {
    /// Sorts `data`, dropping NaN.
    pub fn from_float_slice(data: &[T]) -> Self {
        let mut sorted: Vec<T> = data.iter().copied().filter(|x| !x.is_nan()).collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
        Self { sorted }
    }

    /// Fₙ(x); NaN for a NaN argument or an empty distribution.
    #[inline]
    pub fn eval_float(&self, x: &T) -> f64 {
        if x.is_nan() || self.sorted.is_empty() {
            return f64::NAN;
        }
        let idx = self.sorted.partition_point(|v| v <= x);
        idx as f64 / self.sorted.len() as f64
    }

    /// Number of non-NaN points.
    #[inline]
    pub fn n(&self) -> usize {
        self.sorted.len()
    }

    /// Points in ascending order.
    #[inline]
    pub fn points(&self) -> &[T] {
        &self.sorted
    }

    /// Whether no finite points remain.
    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }
}

/// ECDF statistic constructor.
#[derive(Debug, Clone, Copy, Default)]
pub struct CDF;

impl<D, T> Statistic<D, EmpiricalCDF<T>> for CDF
where
    D: AsRef<[T]>,
    T: Float,
{
    #[inline]
    fn compute(&self, data: &D) -> EmpiricalCDF<T> {
        EmpiricalCDF::from_float_slice(data.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nan_points_are_dropped() {
        let ecdf: EmpiricalCDF<f64> = CDF.compute(&vec![0.3, f64::NAN, -0.2, 0.9, f64::NAN]);
        assert_eq!(ecdf.n(), 3);
        assert_eq!(ecdf.points(), &[-0.2, 0.3, 0.9]);
    }

    #[test]
    fn step_function_counts_ties() {
        let ecdf = EmpiricalCDF::from_float_slice(&[0.0, 0.0, 0.0, 1.5]);
        assert_eq!(ecdf.eval_float(&-1.0), 0.0);
        assert_eq!(ecdf.eval_float(&0.0), 0.75);
        assert_eq!(ecdf.eval_float(&2.0), 1.0);
        assert!(ecdf.eval_float(&f64::NAN).is_nan());
    }

    #[test]
    fn empty_distribution_evaluates_to_nan() {
        let ecdf = EmpiricalCDF::from_float_slice(&[f64::NAN]);
        assert!(ecdf.is_empty());
        assert!(ecdf.eval_float(&0.0).is_nan());
    }
}
