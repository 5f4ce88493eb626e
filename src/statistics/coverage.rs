use num_traits::Float;

use super::{EmpiricalCDF, Interval, Statistic};

/// Shortest interval spanning `ceil(n · level)` consecutive order statistics.
///
/// Unlike the percentile interval this one is not equal-tailed, which suits
/// variance components piled up against zero. On ties in width the leftmost
/// window wins.
#[derive(Debug, Clone, Copy)]
pub struct ShortestCoverage {
    level: f64,
}

impl ShortestCoverage {
    /// Interval covering `level` of the points, 0 < level < 1.
    #[inline]
    pub fn new(level: f64) -> Self {
        debug_assert!(level > 0.0 && level < 1.0, "coverage level must be in (0, 1)");
        Self { level }
    }
}

impl Default for ShortestCoverage {
    fn default() -> Self {
        Self::new(0.95)
    }
}

impl<T: Float> Statistic<EmpiricalCDF<T>, Interval<T>> for ShortestCoverage {
    fn compute(&self, ecdf: &EmpiricalCDF<T>) -> Interval<T> {
        let v = ecdf.points();
        let n = v.len();
        if n == 0 {
            return Interval::nan();
        }
        let len = ((n as f64 * self.level).ceil() as usize).clamp(1, n);

        let mut best = 0;
        for i in 1..=n - len {
            if v[i + len - 1] - v[i] < v[best + len - 1] - v[best] {
                best = i;
            }
        }
        Interval::new(v[best], v[best + len - 1]).confidence(self.level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_the_dense_window() {
        // Nine points crowded near zero, one far outlier.
        let mut data: Vec<f64> = (0..9).map(|i| f64::from(i) * 0.01).collect();
        data.push(5.0);
        let ci = ShortestCoverage::new(0.9).compute(&EmpiricalCDF::from_float_slice(&data));
        assert_eq!((ci.lower, ci.upper), (0.0, 0.08));
    }

    #[test]
    fn is_never_wider_than_the_percentile_interval() {
        use crate::statistics::QuantileInterval;

        let data: Vec<f64> = (0..200).map(|i| (f64::from(i) / 20.0).exp()).collect();
        let ecdf = EmpiricalCDF::from_float_slice(&data);
        let short = ShortestCoverage::new(0.9).compute(&ecdf);
        let pct = QuantileInterval::percentile(0.9).compute(&ecdf);
        assert!(short.width() <= pct.width());
    }

    #[test]
    fn single_point() {
        let ci = ShortestCoverage::default().compute(&EmpiricalCDF::from_float_slice(&[2.0]));
        assert_eq!((ci.lower, ci.upper), (2.0, 2.0));
    }
}
