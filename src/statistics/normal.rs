use statrs::distribution::{ContinuousCDF, Normal};

use super::{Interval, Mean, Statistic, Variance};

/// Normal-approximation interval `center ± z₁₋α/₂ · sd`.
///
/// `sd` is the bootstrap standard error (the column's sample standard
/// deviation). The interval is centred on the column mean unless an explicit
/// centre, usually the original estimate, is supplied.
#[derive(Debug, Clone, Copy)]
pub struct NormalInterval {
    confidence: f64,
    center: Option<f64>,
}

impl NormalInterval {
    /// Two-sided interval at `confidence`.
    pub fn new(confidence: f64) -> Self {
        debug_assert!(confidence > 0.0 && confidence < 1.0);
        Self {
            confidence,
            center: None,
        }
    }

    /// Centres the interval on `center` instead of the mean of the data.
    #[must_use]
    pub fn centered_at(mut self, center: f64) -> Self {
        self.center = Some(center);
        self
    }

    fn z(&self) -> f64 {
        let alpha = 1.0 - self.confidence;
        Normal::new(0.0, 1.0).map_or(f64::NAN, |n| n.inverse_cdf(1.0 - alpha / 2.0))
    }
}

impl<D: AsRef<[f64]>> Statistic<D, Interval<f64>> for NormalInterval {
    fn compute(&self, data: &D) -> Interval<f64> {
        let values: Vec<f64> = data.as_ref().iter().copied().filter(|x| !x.is_nan()).collect();
        let center: f64 = self.center.unwrap_or_else(|| Mean.compute(&values));
        let var: f64 = Variance::default().compute(&values);
        let half = self.z() * var.sqrt();
        if !half.is_finite() {
            return Interval::nan();
        }
        Interval::new(center - half, center + half)
            .estimate(center)
            .confidence(self.confidence)
    }
}
