/*!
# Metropolis–Hastings Sampler

A generic Metropolis–Hastings sampler that works with any target `D` and
proposal `Q` implementing [`Target`] and [`Proposal`]. It runs several
independent Markov chains in parallel, each starting from its own initial state.
A global seed makes runs reproducible: chain `i` is seeded with `seed + i`.

During the first `warmup` steps of every chain the proposal is allowed to adapt
(see [`Proposal::adapt`]); afterwards the kernel is frozen so the post-warmup
draws come from a proper Markov chain.

## Example Usage

```rust
use simplified_mc::core::ChainRunner;
use simplified_mc::distributions::IsotropicGaussian;
use simplified_mc::metropolis_hastings::MetropolisHastings;
use ndarray::arr2;

// Standard normal target, two chains with different starting points.
let target = IsotropicGaussian::new(1.0);
let proposal = IsotropicGaussian::new(0.5);
let init = arr2(&[[1.0, 1.0], [-1.0, -1.0]]);

let mut mh = MetropolisHastings::new(target, proposal, init, 100).set_seed(42);
let runs = mh.run(500);

assert_eq!(runs.len(), 2);
assert_eq!(runs[0].dim(), (500, 2));
```
*/

use ndarray::Array2;
use num_traits::Float;
use rand::prelude::*;
use std::marker::PhantomData;

use crate::core::{HasChains, MarkovChain};
use crate::distributions::{Proposal, Target};

/**
The Metropolis–Hastings sampler: proposes moves with `Q` and accepts them with
the Metropolis–Hastings criterion for `D`.

# Type Parameters
- `T`: The floating-point type (e.g. `f32` or `f64`).
- `D`: The target distribution type. Must implement [`Target`].
- `Q`: The proposal distribution type. Must implement [`Proposal`].
*/
#[derive(Debug, Clone)]
pub struct MetropolisHastings<T: Float, D: Clone, Q: Clone> {
    /// The target distribution we want to sample from.
    pub target: D,
    /// The proposal distribution used to generate candidate states.
    pub proposal: Q,
    /// The vector of independent Markov chains.
    pub chains: Vec<MHMarkovChain<T, D, Q>>,
    /// The global random seed.
    pub seed: u64,
}

/// A single Markov chain for the Metropolis–Hastings algorithm.
///
/// Each chain stores its own copy of the target and proposal distributions,
/// maintains its current state, and uses a chain-specific random number generator.
#[derive(Debug, Clone)]
pub struct MHMarkovChain<T, D, Q> {
    /// The target distribution to sample from.
    pub target: D,
    /// The proposal distribution used to generate candidate states.
    pub proposal: Q,
    /// The current state of the chain.
    pub current_state: Vec<T>,
    /// The chain-specific random seed.
    pub seed: u64,
    /// The random number generator for this chain.
    pub rng: SmallRng,
    /// Number of leading steps during which the proposal adapts.
    pub warmup: usize,
    current_lp: Option<T>,
    n_steps: usize,
    n_accepted: usize,
    phantom: PhantomData<T>,
}

impl<T, D, Q> MetropolisHastings<T, D, Q>
where
    D: Target<T> + Clone + Send,
    Q: Proposal<T> + Clone + Send,
    T: Float + Send,
    rand_distr::Standard: rand_distr::Distribution<T>,
{
    /**
    Constructs a sampler with one chain per row of `initial_states`
    (shape `[chains, ndim]`). The proposal adapts during the first `warmup`
    steps of each chain.
    */
    pub fn new(target: D, proposal: Q, initial_states: Array2<T>, warmup: usize) -> Self {
        let chains = initial_states
            .rows()
            .into_iter()
            .map(|row| {
                let state: Vec<T> = row.to_vec();
                MHMarkovChain::new(target.clone(), proposal.clone(), &state, warmup)
            })
            .collect();
        let seed = thread_rng().gen::<u64>();

        Self {
            target,
            proposal,
            chains,
            seed,
        }
    }

    /**
    Sets a new global seed and updates the seed for each chain accordingly.

    Each chain receives a unique seed `seed + i`, where `i` is the chain index;
    its proposal is reseeded from the same value.

    ```rust
    use simplified_mc::distributions::IsotropicGaussian;
    use simplified_mc::metropolis_hastings::MetropolisHastings;
    use ndarray::arr2;

    let init = arr2(&[[0.0, 0.0], [1.0, 1.0]]);
    let mh = MetropolisHastings::new(
        IsotropicGaussian::new(1.0),
        IsotropicGaussian::new(1.0),
        init,
        0,
    )
    .set_seed(42);
    assert_eq!(mh.chains[0].seed, 42);
    assert_eq!(mh.chains[1].seed, 43);
    ```
    */
    pub fn set_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        for (i, chain) in self.chains.iter_mut().enumerate() {
            let chain_seed = seed.wrapping_add(i as u64);
            chain.seed = chain_seed;
            chain.rng = SmallRng::seed_from_u64(chain_seed);
            chain.proposal = chain.proposal.clone().set_seed(chain_seed.wrapping_mul(31));
        }
        self
    }

    /// Fraction of accepted proposals per chain, warmup included.
    pub fn acceptance_rates(&self) -> Vec<f64> {
        self.chains.iter().map(MHMarkovChain::acceptance_rate).collect()
    }
}

impl<T, D, Q> HasChains<T> for MetropolisHastings<T, D, Q>
where
    D: Target<T> + Clone + Send,
    Q: Proposal<T> + Clone + Send,
    T: Float + Send,
    rand_distr::Standard: rand_distr::Distribution<T>,
{
    type Chain = MHMarkovChain<T, D, Q>;

    fn chains_mut(&mut self) -> &mut Vec<Self::Chain> {
        &mut self.chains
    }
}

impl<T, D, Q> MHMarkovChain<T, D, Q>
where
    D: Target<T> + Clone,
    Q: Proposal<T> + Clone,
    T: Float,
    rand_distr::Standard: rand_distr::Distribution<T>,
{
    /// Creates a new Metropolis–Hastings chain starting at `initial_state`.
    pub fn new(target: D, proposal: Q, initial_state: &[T], warmup: usize) -> Self {
        let seed = thread_rng().gen::<u64>();
        Self {
            target,
            proposal,
            current_state: initial_state.to_vec(),
            seed,
            rng: SmallRng::seed_from_u64(seed),
            warmup,
            current_lp: None,
            n_steps: 0,
            n_accepted: 0,
            phantom: PhantomData,
        }
    }

    pub fn acceptance_rate(&self) -> f64 {
        if self.n_steps == 0 {
            0.0
        } else {
            self.n_accepted as f64 / self.n_steps as f64
        }
    }
}

impl<T, D, Q> MarkovChain<T> for MHMarkovChain<T, D, Q>
where
    D: Target<T> + Clone,
    Q: Proposal<T> + Clone,
    T: Float,
    rand_distr::Standard: rand_distr::Distribution<T>,
{
    /**
    Performs one Metropolis–Hastings update.

    The acceptance ratio in log-space is

    \[
    \log \alpha = \left[\log p(\text{proposed}) + \log q(\text{current} \mid \text{proposed})\right]
                  - \left[\log p(\text{current}) + \log q(\text{proposed} \mid \text{current})\right]
    \]

    and the proposal is accepted when \(\log u < \log \alpha\) for
    \(u \sim \text{Uniform}(0, 1)\). The log-density of the current state is
    cached between steps.
    */
    fn step(&mut self) -> &[T] {
        let current_lp = match self.current_lp {
            Some(lp) => lp,
            None => self.target.unnorm_log_prob(&self.current_state),
        };
        let proposed: Vec<T> = self.proposal.sample(&self.current_state);
        let proposed_lp = self.target.unnorm_log_prob(&proposed);
        let log_q_forward = self.proposal.log_prob(&self.current_state, &proposed);
        let log_q_backward = self.proposal.log_prob(&proposed, &self.current_state);
        let log_accept_ratio = (proposed_lp + log_q_backward) - (current_lp + log_q_forward);

        let u: T = self.rng.gen();
        let accepted = log_accept_ratio > u.ln();
        if accepted {
            self.current_state = proposed;
            self.current_lp = Some(proposed_lp);
            self.n_accepted += 1;
        } else {
            self.current_lp = Some(current_lp);
        }

        if self.n_steps < self.warmup {
            self.proposal.adapt(accepted, self.n_steps);
        }
        self.n_steps += 1;

        &self.current_state
    }

    fn current_state(&self) -> &[T] {
        &self.current_state
    }
}
