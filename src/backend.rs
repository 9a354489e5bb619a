//! Sampling backends behind one call.
//!
//! [`sample`] runs the configured number of steps on a [`Posterior`] and hands
//! back a [`ChainResult`] in the round-robin layout that
//! [`reshape`](crate::chain::reshape) expects, whichever backend produced it.

use indexmap::IndexMap;
use indicatif::ProgressBar;
use ndarray::Array2;
use rand::prelude::*;
use std::fmt;
use thiserror::Error;
use tracing::{debug, info};

use crate::chain::ChainResult;
use crate::config::RunConfiguration;
use crate::core::ChainRunner;
use crate::distributions::IsotropicGaussian;
use crate::ensemble::{EnsembleError, EnsembleSampler};
use crate::metropolis_hastings::MetropolisHastings;
use crate::model::Posterior;

/// Starting scale of the random-walk proposal; adapted during warmup.
pub const INITIAL_STEP: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Independent adaptive random-walk Metropolis–Hastings chains.
    MetropolisHastings,
    /// One affine-invariant ensemble; every walker is a chain.
    Ensemble,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::MetropolisHastings => write!(f, "Metropolis-Hastings"),
            Backend::Ensemble => write!(f, "ensemble"),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum SamplerError {
    #[error("expected {expected} initial states, got {got}")]
    InitialCount { expected: usize, got: usize },
    #[error("initial state {chain} has no value for parameter '{name}'")]
    InitialValue { chain: usize, name: String },
    #[error("chain {0} starts outside the support of the posterior")]
    InvalidStart(usize),
    #[error(transparent)]
    Ensemble(#[from] EnsembleError),
}

/// Stacks per-chain starting points into a `[chains, ndim]` array with columns
/// ordered as `names`.
pub fn initial_array(
    names: &[String],
    states: &[IndexMap<String, f64>],
) -> Result<Array2<f64>, SamplerError> {
    let mut out = Array2::zeros((states.len(), names.len()));
    for (j, state) in states.iter().enumerate() {
        for (i, name) in names.iter().enumerate() {
            out[[j, i]] = *state.get(name).ok_or_else(|| SamplerError::InitialValue {
                chain: j,
                name: name.clone(),
            })?;
        }
    }
    Ok(out)
}

/// Runs `backend` for `config.n_steps()` steps from `initial` (`[chains, ndim]`).
///
/// Without a seed the run draws one from entropy.
pub fn sample(
    backend: Backend,
    posterior: Posterior,
    config: &RunConfiguration,
    initial: Array2<f64>,
    seed: Option<u64>,
    progress: bool,
) -> Result<ChainResult, SamplerError> {
    if initial.nrows() != config.chains {
        return Err(SamplerError::InitialCount {
            expected: config.chains,
            got: initial.nrows(),
        });
    }
    let seed = seed.unwrap_or_else(|| thread_rng().gen());
    let n_steps = config.n_steps();
    info!(
        "Sampling {} chains of {} steps ({} warmup) with the {backend} backend",
        config.chains, n_steps, config.warmup
    );

    match backend {
        Backend::MetropolisHastings => {
            if let Some(bad) = initial
                .rows()
                .into_iter()
                .position(|row| !posterior.ln_posterior(&row.to_vec()).is_finite())
            {
                return Err(SamplerError::InvalidStart(bad));
            }
            let proposal = IsotropicGaussian::new(INITIAL_STEP);
            let mut mh =
                MetropolisHastings::new(posterior, proposal, initial, config.warmup).set_seed(seed);
            let runs = if progress {
                mh.run_progress(n_steps)
            } else {
                mh.run(n_steps)
            };
            debug!("acceptance rates: {:?}", mh.acceptance_rates());
            Ok(ChainResult::from_chain_runs(&config.names, &runs))
        }
        Backend::Ensemble => {
            let mut sampler = EnsembleSampler::new(posterior, initial)?.set_seed(seed);
            let pb = progress.then(|| ProgressBar::new(n_steps as u64));
            let steps = sampler.run(n_steps, pb.as_ref());
            debug!("acceptance rate: {:.3}", sampler.acceptance_rate());
            Ok(ChainResult::from_ensemble_steps(&config.names, &steps))
        }
    }
}
