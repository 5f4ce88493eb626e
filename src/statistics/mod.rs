//! Reductions over bootstrap columns.
//!
//! Everything here implements [`Statistic`]: a value computed from borrowed
//! data. Estimators compose through tuples, so `(Mean, Variance::default())`
//! is itself a statistic returning both.

mod cdf;
mod ci;
mod coverage;
mod mean;
mod normal;
mod quantile;

pub use cdf::{CDF, EmpiricalCDF};
pub use ci::Interval;
pub use coverage::ShortestCoverage;
pub use mean::{Mean, Variance};
pub use normal::NormalInterval;
pub use quantile::{Quantile, QuantileInterval};

/// A quantity computed from `D`.
pub trait Statistic<D, T> {
    /// Evaluates the statistic on `data`.
    fn compute(&self, data: &D) -> T;
}

impl<D, T1, S1> Statistic<D, (T1,)> for (S1,)
where
    S1: Statistic<D, T1>,
{
    #[inline]
    fn compute(&self, data: &D) -> (T1,) {
        (self.0.compute(data),)
    }
}

impl<D, T1, T2, S1, S2> Statistic<D, (T1, T2)> for (S1, S2)
where
    S1: Statistic<D, T1>,
    S2: Statistic<D, T2>,
{
    #[inline]
    fn compute(&self, data: &D) -> (T1, T2) {
        (self.0.compute(data), self.1.compute(data))
    }
}

impl<D, T1, T2, T3, S1, S2, S3> Statistic<D, (T1, T2, T3)> for (S1, S2, S3)
where
    S1: Statistic<D, T1>,
    S2: Statistic<D, T2>,
    S3: Statistic<D, T3>,
{
    #[inline]
    fn compute(&self, data: &D) -> (T1, T2, T3) {
        (
            self.0.compute(data),
            self.1.compute(data),
            self.2.compute(data),
        )
    }
}

impl<D, T1, T2, T3, T4, S1, S2, S3, S4> Statistic<D, (T1, T2, T3, T4)> for (S1, S2, S3, S4)
where
    S1: Statistic<D, T1>,
    S2: Statistic<D, T2>,
    S3: Statistic<D, T3>,
    S4: Statistic<D, T4>,
{
    #[inline]
    fn compute(&self, data: &D) -> (T1, T2, T3, T4) {
        (
            self.0.compute(data),
            self.1.compute(data),
            self.2.compute(data),
            self.3.compute(data),
        )
    }
}
