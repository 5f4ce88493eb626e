use thiserror::Error;

/// Failure of a single profiled refit.
///
/// These are recoverable at the run level: the scheduler may redraw the
/// response for the replicate that produced them.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitError {
    /// A Cholesky factor has a non-positive pivot.
    #[error("{stage} cross-product is not positive definite")]
    NotPositiveDefinite {
        /// Which block failed, `random-effects` or `fixed-effects`.
        stage: &'static str,
    },

    /// The penalized residual sum of squares is not positive and finite.
    #[error("penalized residual sum of squares is degenerate ({0})")]
    DegenerateResidual(f64),

    /// The optimizer itself failed.
    #[error("optimizer failed: {0}")]
    Optimizer(String),
}

/// Fatal error of a bootstrap run. No sample is produced.
#[derive(Error, Debug)]
pub enum BootstrapError {
    /// Zero replicates were requested.
    #[error("number of replicates must be at least 1")]
    NoReplicates,

    /// A length disagrees with the model structure.
    #[error("dimension mismatch in {context}: expected {expected}, got {got}")]
    DimensionMismatch {
        /// Length the structure requires.
        expected: usize,
        /// Length supplied.
        got: usize,
        /// What was being checked.
        context: &'static str,
    },

    /// Input that violates the model contract.
    #[error("invalid model: {0}")]
    InvalidModel(String),

    /// A replicate exhausted its attempts.
    #[error("replicate {replicate} failed after {attempts} attempt(s): {source}")]
    Refit {
        /// Index of the failing replicate.
        replicate: usize,
        /// Responses drawn before giving up.
        attempts: usize,
        /// Error of the last attempt.
        #[source]
        source: FitError,
    },

    /// Cancellation or timeout under the abort policy.
    #[error("run cancelled after {completed} of {requested} replicates")]
    Cancelled {
        /// Replicates finished before the stop.
        completed: usize,
        /// Replicates asked for.
        requested: usize,
    },

    /// The dedicated worker pool could not be built.
    #[error("could not build worker pool: {0}")]
    ThreadPool(String),
}

impl BootstrapError {
    /// Index of the replicate that caused the error, when there is one.
    pub fn replicate(&self) -> Option<usize> {
        match self {
            Self::Refit { replicate, .. } => Some(*replicate),
            _ => None,
        }
    }
}

/// Result of a bootstrap run or of model construction.
pub type Result<T, E = BootstrapError> = std::result::Result<T, E>;
