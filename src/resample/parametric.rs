//! Parametric bootstrap scheduler.
//!
//! Replicate `i` draws every random number it needs from
//! [`substream(seed, i)`](substream), so its result depends only on the seed,
//! the index and the model. Sequential and parallel runs therefore produce the
//! same replicates, and the sample is always assembled in index order.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use super::Re;
use crate::error::{BootstrapError, Result};
use crate::model::{Estimates, MixedModelFit, RefitOptions, Workspace};
use crate::sample::{BootstrapSample, Replicate};
use crate::singular::DEFAULT_SINGULAR_TOL;

/// Independent random stream for replicate `index`.
///
/// A pure function of `(seed, index)`; every ChaCha stream holds 2⁶⁴ blocks,
/// far more than one replicate consumes even with redraws.
pub fn substream(seed: u64, index: usize) -> ChaCha8Rng {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    rng.set_stream(index as u64);
    rng
}

/// What to do when a refit degenerates numerically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailurePolicy {
    /// Draw a fresh response from the same substream, at most `max_retries`
    /// more times, then fail the run.
    Redraw {
        /// Extra draws allowed after the first failure.
        max_retries: usize,
    },
    /// Fail the run on the first degenerate refit.
    Abort,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self::Redraw { max_retries: 5 }
    }
}

impl FailurePolicy {
    fn max_attempts(self) -> usize {
        match self {
            Self::Redraw { max_retries } => max_retries.saturating_add(1),
            Self::Abort => 1,
        }
    }
}

/// Shared flag that stops a running bootstrap.
///
/// Replicates already in flight finish; none are started afterwards.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Fresh token, not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a stop. Idempotent.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Whether [`cancel`](Self::cancel) was called.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Settings of a bootstrap run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootstrapConfig {
    /// Number of replicates, at least 1.
    pub replicates: usize,
    /// Base seed of the replicate substreams.
    pub seed: u64,
    /// Run replicates on the rayon pool (needs the `rayon` feature).
    pub parallel: bool,
    /// Reaction to a degenerate refit.
    pub policy: FailurePolicy,
    /// Absolute tolerance of the singularity summary.
    pub singular_tol: f64,
    /// Optimizer settings of every refit.
    pub refit: RefitOptions,
    /// Size of a dedicated worker pool; the global pool when `None`.
    pub threads: Option<usize>,
    /// Wall-clock budget after which no new replicate is started.
    pub time_limit: Option<Duration>,
    /// Generating parameters; the fitted estimates when `None`.
    pub params: Option<Estimates>,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            replicates: 1_000,
            seed: 0,
            parallel: false,
            policy: FailurePolicy::default(),
            singular_tol: DEFAULT_SINGULAR_TOL,
            refit: RefitOptions::default(),
            threads: None,
            time_limit: None,
            params: None,
        }
    }
}

/// Parametric bootstrap of a fitted linear mixed model.
///
/// ```ignore
/// let sample = ParametricBootstrap::new(1_000, 42)
///     .with_parallel(true)
///     .run(&fitted)?;
/// println!("{sample}");
/// ```
#[derive(Debug, Clone, Default)]
pub struct ParametricBootstrap {
    config: BootstrapConfig,
    cancel: Option<CancelToken>,
}

impl ParametricBootstrap {
    /// `replicates` draws from `seed` with the remaining settings at their defaults.
    pub fn new(replicates: usize, seed: u64) -> Self {
        Self::from_config(BootstrapConfig {
            replicates,
            seed,
            ..BootstrapConfig::default()
        })
    }

    /// Bootstrap with the given settings and no cancel token.
    pub fn from_config(config: BootstrapConfig) -> Self {
        Self { config, cancel: None }
    }

    /// Spreads replicates over the rayon pool.
    #[must_use]
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.config.parallel = parallel;
        self
    }

    /// Sets the reaction to a degenerate refit.
    #[must_use]
    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.config.policy = policy;
        self
    }

    /// Tolerance the finished sample uses for its singularity flags.
    #[must_use]
    pub fn with_singular_tol(mut self, tol: f64) -> Self {
        self.config.singular_tol = tol;
        self
    }

    /// Overrides the optimizer settings of every refit.
    #[must_use]
    pub fn with_refit_options(mut self, options: RefitOptions) -> Self {
        self.config.refit = options;
        self
    }

    /// Runs parallel work on a dedicated pool of `threads` workers.
    #[must_use]
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.config.threads = Some(threads);
        self
    }

    /// Stops starting replicates once `limit` has elapsed.
    #[must_use]
    pub fn with_time_limit(mut self, limit: Duration) -> Self {
        self.config.time_limit = Some(limit);
        self
    }

    /// Simulate from `params` instead of the fitted estimates.
    #[must_use]
    pub fn with_params(mut self, params: Estimates) -> Self {
        self.config.params = Some(params);
        self
    }

    /// Shares `token` so another thread can stop the run.
    #[must_use]
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Current settings.
    pub fn config(&self) -> &BootstrapConfig {
        &self.config
    }

    fn generating<'a, M: MixedModelFit>(&'a self, model: &'a M) -> &'a Estimates {
        self.config.params.as_ref().unwrap_or_else(|| model.estimates())
    }

    fn cancelled(&self, started: Instant) -> bool {
        self.cancel.as_ref().is_some_and(CancelToken::is_cancelled)
            || self.config.time_limit.is_some_and(|limit| started.elapsed() >= limit)
    }

    /// Simulates and refits replicate `index`, redrawing per the failure policy.
    ///
    /// # Errors
    /// `Refit` once the policy's attempts are used up.
    pub fn replicate<M: MixedModelFit>(
        &self,
        model: &M,
        params: &Estimates,
        workspace: &mut Workspace,
        index: usize,
    ) -> Result<Replicate> {
        let mut rng = substream(self.config.seed, index);
        let max_attempts = self.config.policy.max_attempts();
        let mut attempts = 0;
        loop {
            attempts += 1;
            let y = model.simulate(&mut rng, params);
            match model.refit(workspace, &y, &self.config.refit) {
                Ok(fit) => {
                    if !fit.converged {
                        warn!(
                            "replicate {index}: optimizer stopped after {} iterations without converging",
                            fit.iterations
                        );
                    }
                    debug!(
                        "replicate {index}: objective {:.6}, σ {:.6}, {attempts} attempt(s)",
                        fit.objective, fit.sigma
                    );
                    return Ok(Replicate {
                        index,
                        beta: fit.beta,
                        sigma: fit.sigma,
                        theta: fit.theta,
                        objective: fit.objective,
                        converged: fit.converged,
                        attempts,
                    });
                }
                Err(source) if attempts < max_attempts => {
                    warn!("replicate {index}: {source}; redrawing the response (attempt {attempts})");
                }
                Err(source) => {
                    return Err(BootstrapError::Refit {
                        replicate: index,
                        attempts,
                        source,
                    });
                }
            }
        }
    }

    fn validate<M: MixedModelFit>(&self, model: &M) -> Result<()> {
        if self.config.replicates == 0 {
            return Err(BootstrapError::NoReplicates);
        }
        model.structure().check_estimates(self.generating(model))
    }

    /// Runs all replicates and collects them into a sample.
    ///
    /// # Errors
    /// Invalid input is rejected before any replicate starts. A replicate
    /// that exhausts the failure policy fails the whole run, and so does
    /// cancellation under [`FailurePolicy::Abort`]. Under
    /// [`FailurePolicy::Redraw`] a cancelled run returns the finished
    /// replicates as an incomplete sample.
    pub fn run<M: MixedModelFit>(&self, model: &M) -> Result<BootstrapSample> {
        self.validate(model)?;
        let n = self.config.replicates;
        let started = Instant::now();
        info!(
            "parametric bootstrap: {n} replicates, seed {}, {}",
            self.config.seed,
            if self.config.parallel { "parallel" } else { "sequential" }
        );

        let slots = if self.config.parallel {
            self.run_parallel(model, started)?
        } else {
            self.run_sequential(model, started)?
        };

        let replicates: Vec<Replicate> = slots.into_iter().flatten().collect();
        if replicates.len() < n {
            warn!("bootstrap cancelled after {} of {n} replicates", replicates.len());
            if self.config.policy == FailurePolicy::Abort {
                return Err(BootstrapError::Cancelled {
                    completed: replicates.len(),
                    requested: n,
                });
            }
        }

        let sample = BootstrapSample::new(replicates, model.structure().clone(), n)
            .with_singular_tol(self.config.singular_tol);
        info!(
            "bootstrap finished in {:.2?}: {} replicates, {} singular, {} not converged",
            started.elapsed(),
            sample.len(),
            sample.singular_count(self.config.singular_tol),
            sample.nonconverged()
        );
        Ok(sample)
    }

    fn run_sequential<M: MixedModelFit>(
        &self,
        model: &M,
        started: Instant,
    ) -> Result<Vec<Option<Replicate>>> {
        let params = self.generating(model);
        let mut workspace = model.workspace(&params.theta);
        let mut slots = Vec::with_capacity(self.config.replicates);
        for index in 0..self.config.replicates {
            if self.cancelled(started) {
                break;
            }
            slots.push(Some(self.replicate(model, params, &mut workspace, index)?));
        }
        Ok(slots)
    }

    #[cfg(not(feature = "rayon"))]
    fn run_parallel<M: MixedModelFit>(
        &self,
        model: &M,
        started: Instant,
    ) -> Result<Vec<Option<Replicate>>> {
        warn!("parallel bootstrap requested but the `rayon` feature is disabled; running sequentially");
        self.run_sequential(model, started)
    }

    #[cfg(feature = "rayon")]
    fn run_parallel<M: MixedModelFit>(
        &self,
        model: &M,
        started: Instant,
    ) -> Result<Vec<Option<Replicate>>> {
        use std::sync::atomic::AtomicUsize;

        use rayon::prelude::*;

        let params = self.generating(model);
        // Lowest failing index seen so far. Higher indices are skipped once it
        // is set, lower ones still run, so the reported failure is always the
        // lowest failing index, as in a sequential run.
        let first_failure = AtomicUsize::new(usize::MAX);

        let job = || {
            (0..self.config.replicates)
                .into_par_iter()
                .map_init(
                    || model.workspace(&params.theta),
                    |workspace, index| {
                        if index > first_failure.load(Ordering::Relaxed) || self.cancelled(started) {
                            return Ok(None);
                        }
                        self.replicate(model, params, workspace, index)
                            .map(Some)
                            .inspect_err(|_| {
                                first_failure.fetch_min(index, Ordering::Relaxed);
                            })
                    },
                )
                .collect::<Vec<Result<Option<Replicate>>>>()
        };

        let slots = match self.config.threads {
            Some(threads) => rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build()
                .map_err(|e| BootstrapError::ThreadPool(e.to_string()))?
                .install(job),
            None => job(),
        };
        slots.into_iter().collect()
    }
}

impl<M: MixedModelFit> Re<M> for ParametricBootstrap {
    type Item = Result<Replicate>;

    /// Endless replicate stream 0, 1, 2, … on the calling thread.
    ///
    /// Invalid generating parameters yield a single error and end the stream.
    fn re(&self, model: &M) -> impl Iterator<Item = Self::Item> {
        let params = self.generating(model).clone();
        let mut invalid = model.structure().check_estimates(&params).err();
        let mut workspace = model.workspace(&params.theta);
        let mut index = 0;
        let mut done = false;
        std::iter::from_fn(move || {
            if done {
                return None;
            }
            if let Some(err) = invalid.take() {
                done = true;
                return Some(Err(err));
            }
            let next = self.replicate(model, &params, &mut workspace, index);
            index += 1;
            Some(next)
        })
    }
}
