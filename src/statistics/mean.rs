use num_traits::{Float, FromPrimitive};

use super::Statistic;

/// Arithmetic mean with Kahan-compensated summation.
///
/// Bootstrap columns are long and can mix large fixed effects with tiny
/// variance components, so the compensation term is kept throughout.
#[derive(Debug, Clone, Copy, Default)]
pub struct Mean;

fn kahan_sum<T: Float>(values: impl Iterator<Item = T>) -> T {
    let mut sum = T::zero();
    let mut c = T::zero();
    for x in values {
        let y = x - c;
        let t = sum + y;
        c = (t - sum) - y;
        sum = t;
    }
    sum
}

impl<D, T> Statistic<D, T> for Mean
where
    D: AsRef<[T]>,
    T: Float + FromPrimitive,
{
    fn compute(&self, data: &D) -> T {
        let slice = data.as_ref();
        match T::from_usize(slice.len()) {
            Some(n) if !slice.is_empty() => kahan_sum(slice.iter().copied()) / n,
            _ => T::nan(),
        }
    }
}

/// Sample variance with `ddof` degrees of freedom removed.
#[derive(Debug, Clone, Copy)]
pub struct Variance {
    /// Delta degrees of freedom; 1 gives the unbiased estimator.
    pub ddof: usize,
}

impl Variance {
    /// - `ddof = 0`: population variance
    /// - `ddof = 1`: unbiased sample variance (the default)
    pub fn new(ddof: usize) -> Self {
        Variance { ddof }
    }
}

impl Default for Variance {
    fn default() -> Self {
        Variance { ddof: 1 }
    }
}

impl<D, T> Statistic<D, T> for Variance
where
    D: AsRef<[T]>,
    T: Float + FromPrimitive,
{
    fn compute(&self, data: &D) -> T {
        let slice = data.as_ref();
        if slice.len() <= self.ddof || slice.len() < 2 {
            return T::nan();
        }
        let mean: T = Mean.compute(data);
        let sq_sum = kahan_sum(slice.iter().map(|&x| (x - mean) * (x - mean)));
        T::from_usize(slice.len() - self.ddof).map_or_else(T::nan, |dof| sq_sum / dof)
    }
}
