/*!
Target and proposal distributions used by the sampling backends.

A [`Target`] supplies the (unnormalized) log-density the chains explore; for the
command-line pipeline this is always a model posterior, see
[`crate::model::Posterior`]. A [`Proposal`] generates candidate states for the
Metropolis–Hastings backend.

The traits are generic over the floating-point precision through
[`num_traits::Float`].

# Examples

```rust
use simplified_mc::distributions::{IsotropicGaussian, Proposal, Target};

// A standard normal target in two dimensions.
let target = IsotropicGaussian::new(1.0_f64);
let lp = target.unnorm_log_prob(&[0.5, -0.5]);
assert!((lp + 0.25).abs() < 1e-12);

// The same type works as a random-walk proposal.
let mut proposal = IsotropicGaussian::new(0.5_f64).set_seed(7);
let candidate = proposal.sample(&[0.0, 0.0]);
assert_eq!(candidate.len(), 2);
```
*/

use num_traits::Float;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use std::f64::consts::PI;

/// A continuous distribution we want to draw samples from.
pub trait Target<T: Float> {
    /// Returns the log of the unnormalized density at `theta`.
    ///
    /// Points outside the support return negative infinity.
    fn unnorm_log_prob(&self, theta: &[T]) -> T;
}

/// A proposal kernel q(x' | x) for Metropolis–Hastings style samplers.
pub trait Proposal<T: Float> {
    /// Samples a new point from q(x' | x).
    fn sample(&mut self, current: &[T]) -> Vec<T>;

    /// Evaluates log q(to | from).
    fn log_prob(&self, from: &[T], to: &[T]) -> T;

    /// Returns a new instance of this proposal seeded with `seed`.
    fn set_seed(self, seed: u64) -> Self;

    /// Tunes the kernel after a warmup step. `iteration` counts from zero.
    ///
    /// The default kernel is not adaptive.
    fn adapt(&mut self, _accepted: bool, _iteration: usize) {}
}

/// Acceptance rate the adaptive random walk aims for during warmup.
pub const TARGET_ACCEPTANCE: f64 = 0.234;

/**
An isotropic Gaussian: independent noise with mean 0 and standard deviation `std`
in every coordinate.

As a [`Proposal`] it is a symmetric random walk whose scale follows a
Robbins–Monro schedule during warmup, nudging the acceptance rate towards
[`TARGET_ACCEPTANCE`]. As a [`Target`] it is a centred Gaussian, handy in tests.

# Examples

```rust
use simplified_mc::distributions::{IsotropicGaussian, Proposal};

let mut proposal = IsotropicGaussian::new(1.0_f64).set_seed(42);
let before = proposal.std;
// A long streak of rejections shrinks the step.
for i in 0..10 {
    proposal.adapt(false, i);
}
assert!(proposal.std < before);
```
*/
#[derive(Debug, Clone)]
pub struct IsotropicGaussian<T: Float> {
    pub std: T,
    rng: SmallRng,
}

impl<T: Float> IsotropicGaussian<T> {
    /// Creates a new isotropic Gaussian with the specified standard deviation.
    pub fn new(std: T) -> Self {
        Self {
            std,
            rng: SmallRng::from_entropy(),
        }
    }
}

impl<T: Float> Proposal<T> for IsotropicGaussian<T>
where
    rand_distr::StandardNormal: Distribution<T>,
{
    fn sample(&mut self, current: &[T]) -> Vec<T> {
        let normal = Normal::new(T::zero(), self.std)
            .expect("Expecting creation of normal distribution to succeed.");
        normal
            .sample_iter(&mut self.rng)
            .zip(current)
            .map(|(eps, &x)| x + eps)
            .collect()
    }

    fn log_prob(&self, from: &[T], to: &[T]) -> T {
        let half = T::from(0.5).unwrap();
        let var = self.std * self.std;
        let d = T::from(from.len()).unwrap();
        let sq: T = from
            .iter()
            .zip(to)
            .map(|(&f, &t)| (t - f) * (t - f))
            .fold(T::zero(), |acc, x| acc + x);
        -half * sq / var - half * d * (T::from(2.0 * PI).unwrap() * var).ln()
    }

    fn set_seed(mut self, seed: u64) -> Self {
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }

    fn adapt(&mut self, accepted: bool, iteration: usize) {
        let gain = T::from(1.0 / ((iteration + 1) as f64).powf(0.6)).unwrap();
        let hit = if accepted { T::one() } else { T::zero() };
        let log_std = self.std.ln() + gain * (hit - T::from(TARGET_ACCEPTANCE).unwrap());
        self.std = log_std.exp();
    }
}

impl<T: Float> Target<T> for IsotropicGaussian<T> {
    fn unnorm_log_prob(&self, theta: &[T]) -> T {
        let sum = theta.iter().fold(T::zero(), |acc, &x| acc + x * x);
        -T::from(0.5).unwrap() * sum / (self.std * self.std)
    }
}

#[cfg(test)]
mod distributions_tests {
    use super::*;

    /**
    Turns the unnormalized log density of an isotropic Gaussian into a density value.
    */
    fn normalize_isogauss(x: f64, d: usize, std: f64) -> f64 {
        let log_normalizer = -((d as f64) / 2.0) * ((2.0_f64).ln() + PI.ln() + 2.0 * std.ln());
        (x + log_normalizer).exp()
    }

    #[test]
    fn iso_gauss_unnorm_log_prob_test_1() {
        let distr = IsotropicGaussian::new(1.0);
        let p = normalize_isogauss(distr.unnorm_log_prob(&[1.0]), 1, distr.std);
        let true_p = 0.24197072451914337;
        let diff = (p - true_p).abs();
        assert!(
            diff < 1e-7,
            "Expected diff < 1e-7, got {diff} with p={p} (expected ~{true_p})."
        );
    }

    #[test]
    fn iso_gauss_unnorm_log_prob_test_2() {
        let distr = IsotropicGaussian::new(2.0);
        let p = normalize_isogauss(distr.unnorm_log_prob(&[0.42, 9.6]), 2, distr.std);
        let true_p = 3.864661987252467e-7;
        let diff = (p - true_p).abs();
        assert!(
            diff < 1e-15,
            "Expected diff < 1e-15, got {diff} with p={p} (expected ~{true_p})"
        );
    }

    #[test]
    fn proposal_log_prob_is_symmetric_and_normalized() {
        let q = IsotropicGaussian::new(1.5_f64);
        let a = [0.3, -1.2];
        let b = [1.1, 0.4];
        assert!((q.log_prob(&a, &b) - q.log_prob(&b, &a)).abs() < 1e-12);
        // log N(0 | 0, 1.5^2) in 2D
        let expected = -(2.0 * PI * 2.25).ln();
        assert!((q.log_prob(&a, &a) - expected).abs() < 1e-12);
    }

    #[test]
    fn seeded_proposals_are_reproducible() {
        let mut q1 = IsotropicGaussian::new(1.0_f64).set_seed(3);
        let mut q2 = IsotropicGaussian::new(1.0_f64).set_seed(3);
        assert_eq!(q1.sample(&[0.0, 1.0, 2.0]), q2.sample(&[0.0, 1.0, 2.0]));
    }

    #[test]
    fn adaptation_grows_scale_when_everything_is_accepted() {
        let mut q = IsotropicGaussian::new(0.1_f64);
        for i in 0..20 {
            q.adapt(true, i);
        }
        assert!(q.std > 0.1, "std = {}", q.std);
    }
}
