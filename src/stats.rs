//! Convergence diagnostics for a [`StepArray`]: Gelman–Rubin R-hat, effective
//! sample size, and a per-parameter summary that the pipeline logs.

use ndarray::prelude::*;
use ndarray_stats::QuantileExt;
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::error::Error;
use tracing::{info, warn};

use crate::chain::StepArray;

/// R-hat above this value is reported as a convergence problem.
pub const RHAT_WARNING: f64 = 1.1;

/// Streaming Gelman–Rubin statistic over several chains. Feed it one
/// `[chains, params]` slice per step.
#[derive(Debug, Clone, PartialEq)]
pub struct RhatMulti {
    n: usize,
    mean: Array2<f64>,    // n_chains x n_params
    mean_sq: Array2<f64>, // n_chains x n_params
}

impl RhatMulti {
    pub fn new(n_chains: usize, n_params: usize) -> Self {
        Self {
            n: 0,
            mean: Array2::<f64>::zeros((n_chains, n_params)),
            mean_sq: Array2::<f64>::zeros((n_chains, n_params)),
        }
    }

    pub fn step(&mut self, x: ArrayView2<f64>) -> Result<(), Box<dyn Error>> {
        if x.dim() != self.mean.dim() {
            return Err(format!(
                "Expected a step of shape {:?}, got {:?}",
                self.mean.dim(),
                x.dim()
            )
            .into());
        }
        self.n += 1;
        let n = self.n as f64;

        self.mean.zip_mut_with(&x, |m, &v| *m += (v - *m) / n);
        self.mean_sq.zip_mut_with(&x, |m, &v| *m += (v * v - *m) / n);
        Ok(())
    }

    pub fn all(&self) -> Result<Array1<f64>, Box<dyn Error>> {
        let n_chains = self.mean.nrows() as f64;
        if n_chains < 2.0 || self.n < 2 {
            return Err("R-hat needs at least two chains of at least two steps".into());
        }
        let mean_chain = self
            .mean
            .mean_axis(Axis(0))
            .ok_or("Mean reduction across chains for mean failed.")?;
        let n = self.n as f64;
        let fac = n / (n_chains - 1.0);
        let between = (&self.mean - &mean_chain.insert_axis(Axis(0)))
            .pow2()
            .sum_axis(Axis(0))
            * fac;
        let sm2 = (&self.mean_sq - &self.mean.pow2()) * n / (n - 1.0);
        let within = sm2
            .mean_axis(Axis(0))
            .ok_or("Mean reduction across chains for mean of squares failed.")?;
        let var = &within * ((n - 1.0) / n) + between * (1.0 / n);
        Ok((var / within).sqrt())
    }

    pub fn max(&self) -> Result<f64, Box<dyn Error>> {
        let all = self.all()?;
        Ok(*all.max()?)
    }
}

/// R-hat of every parameter over the post-warmup part of `steps`.
pub fn rhat(steps: &StepArray, warmup: usize) -> Result<Array1<f64>, Box<dyn Error>> {
    let (_, chains, ndim) = steps.dim();
    let mut psr = RhatMulti::new(chains, ndim);
    for step in steps.slice(s![warmup.., .., ..]).outer_iter() {
        psr.step(step)?;
    }
    psr.all()
}

/// Biased autocovariance of `x` at every lag, computed with a zero-padded FFT.
fn autocovariance(x: ArrayView1<f64>) -> Array1<f64> {
    let n = x.len();
    let m = (2 * n).next_power_of_two();
    let mean = x.mean().unwrap_or(0.0);

    let mut buffer: Vec<Complex<f64>> = x
        .iter()
        .map(|&v| Complex::new(v - mean, 0.0))
        .chain(std::iter::repeat(Complex::new(0.0, 0.0)))
        .take(m)
        .collect();

    let mut planner = FftPlanner::<f64>::new();
    planner.plan_fft_forward(m).process(&mut buffer);
    buffer.iter_mut().for_each(|c| *c = Complex::new(c.norm_sqr(), 0.0));
    planner.plan_fft_inverse(m).process(&mut buffer);

    // rustfft leaves the inverse unnormalized.
    buffer[..n].iter().map(|c| c.re / (m as f64 * n as f64)).collect()
}

/// Effective sample size of one parameter from its `[steps, chains]` draws,
/// using Geyer's initial monotone sequence on the multi-chain autocorrelation.
fn ess_single(draws: ArrayView2<f64>) -> f64 {
    let (n, m) = draws.dim();
    if n < 5 {
        return f64::NAN;
    }
    let acov: Vec<Array1<f64>> = draws.axis_iter(Axis(1)).map(autocovariance).collect();
    let nf = n as f64;

    let chain_means: Array1<f64> = draws.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(m));
    let mean_var = acov.iter().map(|a| a[0] * nf / (nf - 1.0)).sum::<f64>() / m as f64;
    let mut var_plus = mean_var * (nf - 1.0) / nf;
    if m > 1 {
        var_plus += chain_means.var(1.0);
    }
    if !(var_plus > 0.0) {
        return f64::NAN;
    }

    let mean_acov = |t: usize| acov.iter().map(|a| a[t]).sum::<f64>() / m as f64;
    let rho = |t: usize| 1.0 - (mean_var - mean_acov(t)) / var_plus;

    let mut rho_hat = vec![0.0; n];
    rho_hat[0] = 1.0;
    let mut rho_even = 1.0;
    let mut rho_odd = rho(1);
    rho_hat[1] = rho_odd;

    let total = (n * m) as f64;
    let mut t = 1;
    while t < n - 3 && rho_even + rho_odd > 0.0 {
        rho_even = rho(t + 1);
        rho_odd = rho(t + 2);
        if rho_even + rho_odd >= 0.0 {
            rho_hat[t + 1] = rho_even;
            rho_hat[t + 2] = rho_odd;
        }
        t += 2;
    }
    if t < 3 {
        // Anti-correlated from the first lag on.
        return total;
    }
    let max_t = t - 2;
    if rho_even > 0.0 {
        rho_hat[max_t + 1] = rho_even;
    }

    // Enforce a monotonically decreasing sequence of pair sums.
    let mut t = 1;
    while t + 2 <= max_t {
        let previous = rho_hat[t - 1] + rho_hat[t];
        if rho_hat[t + 1] + rho_hat[t + 2] > previous {
            rho_hat[t + 1] = previous / 2.0;
            rho_hat[t + 2] = previous / 2.0;
        }
        t += 2;
    }

    let tau = -1.0 + 2.0 * rho_hat[..=max_t].iter().sum::<f64>() + rho_hat[max_t + 1];
    total / tau.max(1.0 / total.log10())
}

/// Effective sample size of every parameter over the post-warmup part of `steps`.
pub fn ess(steps: &StepArray, warmup: usize) -> Array1<f64> {
    let kept = steps.slice(s![warmup.., .., ..]);
    kept.axis_iter(Axis(2)).map(ess_single).collect()
}

/// Posterior summary of one parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSummary {
    pub name: String,
    pub mean: f64,
    pub std: f64,
    pub rhat: f64,
    pub ess: f64,
}

/// Mean, standard deviation, R-hat and ESS of every parameter. R-hat is NaN
/// when it is undefined (a single chain).
pub fn summarize(steps: &StepArray, names: &[String], warmup: usize) -> Vec<ParameterSummary> {
    let (_, chains, ndim) = steps.dim();
    let rhats = rhat(steps, warmup).unwrap_or_else(|_| Array1::from_elem(ndim, f64::NAN));
    let esses = ess(steps, warmup);
    let kept = steps.slice(s![warmup.., .., ..]);
    let ddof = if kept.len_of(Axis(0)) * chains > 1 { 1.0 } else { 0.0 };

    names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let draws = kept.index_axis(Axis(2), i);
            ParameterSummary {
                name: name.clone(),
                mean: draws.mean().unwrap_or(f64::NAN),
                std: draws.var(ddof).sqrt(),
                rhat: rhats[i],
                ess: esses[i],
            }
        })
        .collect()
}

/// Logs the summary table, warning about parameters that have not converged.
pub fn log_summary(summary: &[ParameterSummary]) {
    for p in summary {
        info!(
            "{:>12}: mean = {:.4}, std = {:.4}, R-hat = {:.4}, ESS = {:.0}",
            p.name, p.mean, p.std, p.rhat, p.ess
        );
        if p.rhat > RHAT_WARNING {
            warn!(
                "R-hat of '{}' is {:.3} (> {RHAT_WARNING}): the chains have not converged",
                p.name, p.rhat
            );
        }
    }
}
