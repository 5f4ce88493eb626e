//! Parametric bootstrap for fitted linear mixed-effects models.
//!
//! Starting from a fitted model, every replicate simulates a new response
//! from the estimated parameters, re-estimates (β, σ, θ) by profiled
//! likelihood and records the result. The collected [`BootstrapSample`]
//! derives standard deviations, correlations, singularity flags and
//! intervals on demand.
//!
//! ```ignore
//! use lmmboot::*;
//!
//! let fitted = LinearMixedModel::new(y, x, z, names, terms, Method::Reml)?
//!     .fit(&RefitOptions::default())?;
//! let sample = ParametricBootstrap::new(1_000, 1234)
//!     .with_parallel(true)
//!     .run(&fitted)?;
//! println!("{sample}");
//! ```

mod display;
mod error;
mod model;
mod resample;
mod sample;
mod singular;
mod statistics;
mod transform;

pub use crate::error::{BootstrapError, FitError, Result};
pub use crate::model::{
    Estimates, FittedModel, LinearMixedModel, Method, MixedModelFit, Pls, ReTerm, Refit,
    RefitOptions, Structure, Workspace, simulate,
};
pub use crate::resample::*;
pub use crate::sample::{BootstrapSample, Parameter, ParameterInterval, ParameterRow, Replicate};
pub use crate::singular::{DEFAULT_SINGULAR_TOL, Singular, is_singular};
pub use crate::statistics::*;
pub use crate::transform::{TermBlock, TermSds, VarCorr, rectify, sigma_rhos, sigmas, term_block, to_blocks};
pub use rand;
