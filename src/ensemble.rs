//! Affine-invariant ensemble sampler (Goodman & Weare stretch move).
//!
//! The walkers are split into two halves. Each half is moved in turn, proposing
//! `y = c + z (x - c)` for every walker `x` with `c` drawn from the other half and
//! `z ~ g(z) ∝ 1/sqrt(z)` on `[1/a, a]`; the move is accepted with probability
//! `min(1, z^(d-1) p(y) / p(x))`. Proposals of one half are evaluated in parallel.
//!
//! Goodman, J., & Weare, J. (2010). Ensemble samplers with affine invariance.
//! Communications in Applied Mathematics and Computational Science, 5(1), 65-80.

use indicatif::ProgressBar;
use ndarray::{s, Array1, Array2, ArrayView1};
use rand::prelude::*;
use rayon::prelude::*;
use std::ops::Range;
use thiserror::Error;

use crate::core::progress_style;
use crate::distributions::Target;

#[derive(Debug, Error, PartialEq)]
pub enum EnsembleError {
    #[error("the stretch scale must be > 1, got {0}")]
    Scale(f64),
    #[error("the ensemble needs at least {needed} walkers (twice the {ndim} dimensions), got {got}")]
    TooFewWalkers {
        needed: usize,
        ndim: usize,
        got: usize,
    },
    #[error("walker {0} starts outside the support of the target")]
    InvalidStart(usize),
}

/// Stretch move proposal with scale `a`.
#[derive(Debug, Clone, Copy)]
pub struct StretchMove {
    pub a: f64,
}

impl Default for StretchMove {
    fn default() -> Self {
        Self { a: 2.0 }
    }
}

impl StretchMove {
    pub fn new(a: f64) -> Result<Self, EnsembleError> {
        if a <= 1.0 {
            return Err(EnsembleError::Scale(a));
        }
        Ok(Self { a })
    }

    /// Draws a stretch factor by inverting the CDF of g(z): `z = ((a-1)u + 1)^2 / a`.
    pub fn sample_z<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        let u: f64 = rng.gen();
        ((self.a - 1.0) * u + 1.0).powi(2) / self.a
    }

    /// Log of the acceptance ratio of a stretch move in `ndim` dimensions.
    pub fn log_accept_ratio(&self, z: f64, ndim: usize, lp_old: f64, lp_new: f64) -> f64 {
        if !lp_new.is_finite() {
            return f64::NEG_INFINITY;
        }
        (ndim as f64 - 1.0) * z.ln() + (lp_new - lp_old)
    }

    pub fn propose<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        current: ArrayView1<f64>,
        complementary: &Array2<f64>,
    ) -> (Array1<f64>, f64) {
        let z = self.sample_z(rng);
        let other = complementary.row(rng.gen_range(0..complementary.nrows()));
        (&other + &((&current - &other) * z), z)
    }
}

/// An ensemble of walkers exploring a target together.
#[derive(Debug, Clone)]
pub struct EnsembleSampler<D> {
    pub target: D,
    pub stretch: StretchMove,
    pub positions: Array2<f64>,
    log_probs: Array1<f64>,
    n_accepted: Array1<usize>,
    n_proposed: usize,
    rng: SmallRng,
}

impl<D> EnsembleSampler<D>
where
    D: Target<f64> + Sync,
{
    /// Creates an ensemble with one walker per row of `initial` (shape
    /// `[walkers, ndim]`). Every walker must start where the target is finite.
    pub fn new(target: D, initial: Array2<f64>) -> Result<Self, EnsembleError> {
        let (n_walkers, ndim) = initial.dim();
        if n_walkers < 2 * ndim || n_walkers < 2 {
            return Err(EnsembleError::TooFewWalkers {
                needed: (2 * ndim).max(2),
                ndim,
                got: n_walkers,
            });
        }

        let starts: Vec<Vec<f64>> = initial.rows().into_iter().map(|r| r.to_vec()).collect();
        let log_probs: Vec<f64> = starts
            .par_iter()
            .map(|theta| target.unnorm_log_prob(theta))
            .collect();
        if let Some(bad) = log_probs.iter().position(|lp| !lp.is_finite()) {
            return Err(EnsembleError::InvalidStart(bad));
        }

        Ok(Self {
            target,
            stretch: StretchMove::default(),
            positions: initial,
            log_probs: Array1::from(log_probs),
            n_accepted: Array1::zeros(n_walkers),
            n_proposed: 0,
            rng: SmallRng::from_entropy(),
        })
    }

    pub fn set_seed(mut self, seed: u64) -> Self {
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }

    pub fn n_walkers(&self) -> usize {
        self.positions.nrows()
    }

    /// Mean acceptance fraction over all walkers.
    pub fn acceptance_rate(&self) -> f64 {
        if self.n_proposed == 0 {
            return 0.0;
        }
        self.n_accepted.sum() as f64 / (self.n_proposed * self.n_walkers()) as f64
    }

    /// Moves every walker once.
    pub fn step(&mut self) -> &Array2<f64> {
        let n = self.n_walkers();
        let half = n / 2;
        self.update_group(0..half, half..n);
        self.update_group(half..n, 0..half);
        self.n_proposed += 1;
        &self.positions
    }

    /// Runs `n_steps` and returns the positions after every step, each of shape
    /// `[walkers, ndim]`.
    pub fn run(&mut self, n_steps: usize, progress: Option<&ProgressBar>) -> Vec<Array2<f64>> {
        if let Some(pb) = progress {
            pb.set_style(progress_style());
            pb.set_prefix("Ensemble");
            pb.set_length(n_steps as u64);
        }
        let mut out = Vec::with_capacity(n_steps);
        for _ in 0..n_steps {
            out.push(self.step().clone());
            if let Some(pb) = progress {
                pb.inc(1);
            }
        }
        if let Some(pb) = progress {
            pb.finish_with_message("Done!");
        }
        out
    }

    fn update_group(&mut self, active: Range<usize>, complementary: Range<usize>) {
        let others = self.positions.slice(s![complementary, ..]).to_owned();
        let proposals: Vec<(Array1<f64>, f64)> = active
            .clone()
            .map(|i| {
                self.stretch
                    .propose(&mut self.rng, self.positions.row(i), &others)
            })
            .collect();

        let target = &self.target;
        let new_lps: Vec<f64> = proposals
            .par_iter()
            .map(|(y, _)| target.unnorm_log_prob(y.as_slice().expect("contiguous proposal")))
            .collect();

        let ndim = self.positions.ncols();
        for (i, ((y, z), lp_new)) in active.zip(proposals.into_iter().zip(new_lps)) {
            let log_ratio = self
                .stretch
                .log_accept_ratio(z, ndim, self.log_probs[i], lp_new);
            let u: f64 = self.rng.gen();
            if u.ln() < log_ratio {
                self.positions.row_mut(i).assign(&y);
                self.log_probs[i] = lp_new;
                self.n_accepted[i] += 1;
            }
        }
    }
}
