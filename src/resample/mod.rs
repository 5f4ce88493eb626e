pub use rand::Rng;

/// A resampling scheme: an endless stream of replicates derived from `T`.
pub trait Re<T> {
    /// One replicate, or the error that produced none.
    type Item;
    /// Replicates 0, 1, 2, … drawn from `t`.
    fn re(&self, t: &T) -> impl Iterator<Item = Self::Item>;
}

mod parametric;

pub use parametric::{BootstrapConfig, CancelToken, FailurePolicy, ParametricBootstrap, substream};
