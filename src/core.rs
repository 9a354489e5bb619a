//! Chain-running machinery shared by the sampling backends.
//!
//! A backend implements [`MarkovChain`] for a single chain and [`HasChains`] for
//! the set of chains it owns; [`ChainRunner`] then runs all chains in parallel
//! (with or without progress bars) and returns one `[steps, ndim]` matrix per
//! chain, warmup included.

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use ndarray::Array2;
use num_traits::Zero;
use rayon::prelude::*;

pub trait MarkovChain<T> {
    /// Does one iteration of the chain, returning the new current state.
    fn step(&mut self) -> &[T];

    /// Get the current state without stepping.
    fn current_state(&self) -> &[T];
}

/// Runs `chain` for `n_steps` and records every state, one row per step.
pub fn run_chain<T, M>(chain: &mut M, n_steps: usize) -> Array2<T>
where
    M: MarkovChain<T>,
    T: Clone + Zero,
{
    let dim = chain.current_state().len();
    let mut out = Array2::<T>::zeros((n_steps, dim));

    for mut row in out.rows_mut() {
        let state = chain.step();
        row.iter_mut()
            .zip(state)
            .for_each(|(dst, src)| *dst = src.clone());
    }

    out
}

pub fn run_chain_with_progress<T, M>(chain: &mut M, n_steps: usize, pb: &ProgressBar) -> Array2<T>
where
    M: MarkovChain<T>,
    T: Clone + Zero,
{
    let dim = chain.current_state().len();
    let mut out = Array2::<T>::zeros((n_steps, dim));

    pb.set_length(n_steps as u64);

    for mut row in out.rows_mut() {
        let state = chain.step();
        row.iter_mut()
            .zip(state)
            .for_each(|(dst, src)| *dst = src.clone());

        pb.inc(1);
    }

    out
}

/// Style of the per-chain progress bars.
pub fn progress_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{prefix} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
        .expect("Expected the progress bar template to be valid")
        .progress_chars("##-")
}

/// A trait for "anything that owns multiple MarkovChains".
/// - `T` is the state element type (e.g. f64).
/// - `Chain` is the MarkovChain type stored by this struct.
pub trait HasChains<T> {
    type Chain: MarkovChain<T> + Send;

    /// Returns a mutable reference to the vector of chains.
    fn chains_mut(&mut self) -> &mut Vec<Self::Chain>;
}

pub trait ChainRunner<T>: HasChains<T>
where
    T: Clone + Zero + Send + Sync + 'static,
{
    /// Runs all chains in parallel for `n_steps` each. Element `j` of the result
    /// holds chain `j`'s trajectory.
    fn run(&mut self, n_steps: usize) -> Vec<Array2<T>> {
        self.chains_mut()
            .par_iter_mut()
            .map(|chain| run_chain(chain, n_steps))
            .collect()
    }

    /// Same as [`ChainRunner::run`], with one progress bar per chain.
    fn run_progress(&mut self, n_steps: usize) -> Vec<Array2<T>> {
        let multi = MultiProgress::new();
        let pb_style = progress_style();

        self.chains_mut()
            .par_iter_mut()
            .enumerate()
            .map(|(i, chain)| {
                let pb = multi.add(ProgressBar::new(n_steps as u64));
                pb.set_prefix(format!("Chain {i}"));
                pb.set_style(pb_style.clone());

                let samples = run_chain_with_progress(chain, n_steps, &pb);

                pb.finish_with_message("Done!");
                samples
            })
            .collect()
    }
}

impl<T, C> ChainRunner<T> for C
where
    T: Clone + Zero + Send + Sync + 'static,
    C: HasChains<T>,
{
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deterministic chain that adds `inc` to every coordinate per step.
    struct Counter {
        state: Vec<f64>,
        inc: f64,
    }

    impl MarkovChain<f64> for Counter {
        fn step(&mut self) -> &[f64] {
            self.state.iter_mut().for_each(|x| *x += self.inc);
            &self.state
        }

        fn current_state(&self) -> &[f64] {
            &self.state
        }
    }

    struct Counters(Vec<Counter>);

    impl HasChains<f64> for Counters {
        type Chain = Counter;

        fn chains_mut(&mut self) -> &mut Vec<Counter> {
            &mut self.0
        }
    }

    #[test]
    fn run_chain_records_every_step() {
        let mut chain = Counter {
            state: vec![0.0, 10.0],
            inc: 1.0,
        };
        let out = run_chain(&mut chain, 3);
        assert_eq!(out, ndarray::arr2(&[[1.0, 11.0], [2.0, 12.0], [3.0, 13.0]]));
    }

    #[test]
    fn runner_keeps_chain_order() {
        let mut chains = Counters(vec![
            Counter {
                state: vec![0.0],
                inc: 1.0,
            },
            Counter {
                state: vec![0.0],
                inc: -1.0,
            },
        ]);
        let out = chains.run(4);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].column(0).to_vec(), vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(out[1].column(0).to_vec(), vec![-1.0, -2.0, -3.0, -4.0]);
    }
}
