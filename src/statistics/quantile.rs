use num_traits::Float;

use super::{EmpiricalCDF, Interval, Statistic};

/// Discrete quantile (inverse ECDF), `Q(p) = inf { x : Fₙ(x) ≥ p }`.
///
/// R's type 1: no interpolation, the result is always a replicate value.
#[derive(Debug, Clone, Copy)]
pub struct Quantile {
    p: f64,
}

impl Quantile {
    /// Quantile at probability `p ∈ [0, 1]`.
    #[inline]
    pub fn new(p: f64) -> Self {
        debug_assert!((0.0..=1.0).contains(&p), "Quantile p must be in [0,1]");
        Self { p }
    }

    /// The 0.5 quantile.
    #[inline]
    pub fn median() -> Self {
        Self { p: 0.5 }
    }
}

// i = ceil(n·p) − 1, clamped to [0, n − 1].
#[inline]
fn order_index(n: usize, p: f64) -> usize {
    ((n as f64 * p).ceil() as usize).saturating_sub(1).min(n - 1)
}

impl<T: Float> Statistic<EmpiricalCDF<T>, T> for Quantile {
    #[inline]
    fn compute(&self, ecdf: &EmpiricalCDF<T>) -> T {
        if ecdf.is_empty() {
            return T::nan();
        }
        ecdf.points()[order_index(ecdf.n(), self.p)]
    }
}

/// Equal-tailed interval `[Q(lower), Q(upper)]`.
#[derive(Debug, Clone, Copy)]
pub struct QuantileInterval {
    lower: f64,
    upper: f64,
}

impl QuantileInterval {
    /// Interval between the `lower` and `upper` quantiles.
    #[inline]
    pub fn new(lower: f64, upper: f64) -> Self {
        debug_assert!((0.0..=1.0).contains(&lower));
        debug_assert!((0.0..=1.0).contains(&upper));
        debug_assert!(lower <= upper);
        Self { lower, upper }
    }

    /// Percentile interval at coverage `confidence`.
    #[inline]
    pub fn percentile(confidence: f64) -> Self {
        let alpha = 1.0 - confidence;
        Self::new(alpha / 2.0, 1.0 - alpha / 2.0)
    }

    fn confidence(&self) -> f64 {
        self.upper - self.lower
    }
}

impl<T: Float> Statistic<EmpiricalCDF<T>, Interval<T>> for QuantileInterval {
    #[inline]
    fn compute(&self, ecdf: &EmpiricalCDF<T>) -> Interval<T> {
        if ecdf.is_empty() {
            return Interval::nan();
        }
        let points = ecdf.points();
        let n = ecdf.n();
        Interval::new(points[order_index(n, self.lower)], points[order_index(n, self.upper)])
            .confidence(self.confidence())
    }
}
