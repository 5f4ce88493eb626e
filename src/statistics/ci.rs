use std::fmt;
use std::ops::Sub;

use num_traits::Float;
use serde::Serialize;

/// Interval with optional point estimate and coverage level.
#[derive(Clone, Copy, PartialEq, Debug, Serialize)]
pub struct Interval<T> {
    /// Lower end.
    pub lower: T,
    /// Upper end.
    pub upper: T,
    /// Point estimate, when attached.
    pub estimate: Option<T>,
    /// Nominal coverage level.
    pub confidence: Option<f64>,
}

impl<T: PartialOrd + Copy> Interval<T> {
    /// Bare interval without estimate or level.
    #[inline]
    pub const fn new(lower: T, upper: T) -> Self {
        Self {
            lower,
            upper,
            estimate: None,
            confidence: None,
        }
    }

    /// Fluent builder: attach point estimate.
    #[must_use]
    pub const fn estimate(mut self, estimate: T) -> Self {
        self.estimate = Some(estimate);
        self
    }

    /// Fluent builder: attach coverage level (0 < level < 1).
    #[must_use]
    pub const fn confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    /// Whether `value` lies within `[lower, upper]`.
    #[inline]
    pub fn contains(&self, value: &T) -> bool {
        self.lower <= *value && *value <= self.upper
    }

    /// `upper - lower`.
    #[inline]
    pub fn width(&self) -> T
    where
        T: Sub<Output = T>,
    {
        self.upper - self.lower
    }
}

impl<T: Float> Interval<T> {
    /// `(lower + upper) / 2`.
    #[inline]
    pub fn midpoint(&self) -> T {
        (self.lower + self.upper) / (T::one() + T::one())
    }

    /// Interval with NaN bounds, for columns with no defined values.
    pub fn nan() -> Self {
        Self::new(T::nan(), T::nan())
    }

    /// Whether either end is NaN.
    pub fn is_nan(&self) -> bool {
        self.lower.is_nan() || self.upper.is_nan()
    }
}

impl<T: Float + fmt::Display> fmt::Display for Interval<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let precision = f.precision().unwrap_or(4);
        if let Some(est) = self.estimate {
            write!(f, "{est:.precision$} ∈ ")?;
        }
        write!(f, "[{:.precision$}, {:.precision$}]", self.lower, self.upper)?;
        if let Some(conf) = self.confidence {
            write!(f, " with {conf:.2}")?;
        }
        Ok(())
    }
}
