/*!
Sampler output and the arrays derived from it.

A backend hands back a [`ChainResult`]: one flat series per parameter in which
the chains are interleaved round-robin, i.e. the value of step `t` of chain `j`
sits at index `t * chains + j`. [`reshape`] turns that into the
`[step, chain, parameter]` [`StepArray`], and [`flatten`] drops the warmup and
stacks the chains into the `[sample, parameter]` [`FlatSampleArray`].

```rust
use simplified_mc::chain::{flatten, reshape, ChainResult};

// Two chains, three steps, one parameter: chain 0 counts 0, 1, 2 and
// chain 1 counts 10, 11, 12.
let raw = ChainResult::from_series(2, [("x", vec![0.0, 10.0, 1.0, 11.0, 2.0, 12.0])]);
let names = vec!["x".to_string()];
let steps = reshape(&raw, &names, 2, 1, 2, 1).unwrap();
assert_eq!(steps[[2, 1, 0]], 12.0);

let flat = flatten(&steps, 1, 2, 1);
assert_eq!(flat.column(0).to_vec(), vec![1.0, 2.0, 11.0, 12.0]);
```
*/

use indexmap::IndexMap;
use ndarray::{s, Array2, Array3, Axis};
use thiserror::Error;

/// `[samples + warmup, chains, ndim]`
pub type StepArray = Array3<f64>;

/// `[samples * chains, ndim]`
pub type FlatSampleArray = Array2<f64>;

#[derive(Debug, Error, PartialEq)]
pub enum ChainError {
    #[error("sampler output has no series for parameter '{0}'")]
    MissingParameter(String),
    #[error("series for '{name}' has {got} values, expected {expected} ({chains} chains x {steps} steps)")]
    Length {
        name: String,
        got: usize,
        expected: usize,
        chains: usize,
        steps: usize,
    },
    #[error("{names} parameter names given for {ndim} dimensions")]
    Dimension { names: usize, ndim: usize },
}

/// Raw sampler output, interleaved by chain.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChainResult {
    chains: usize,
    series: IndexMap<String, Vec<f64>>,
}

impl ChainResult {
    pub fn from_series<I, S>(chains: usize, series: I) -> Self
    where
        I: IntoIterator<Item = (S, Vec<f64>)>,
        S: Into<String>,
    {
        Self {
            chains,
            series: series.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    /// Interleaves per-chain trajectories (`[steps, ndim]` each) round-robin.
    pub fn from_chain_runs(names: &[String], runs: &[Array2<f64>]) -> Self {
        let n_steps = runs.first().map_or(0, |a| a.nrows());
        let series = names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let mut flat = Vec::with_capacity(n_steps * runs.len());
                for t in 0..n_steps {
                    flat.extend(runs.iter().map(|run| run[[t, i]]));
                }
                (name.clone(), flat)
            })
            .collect();
        Self {
            chains: runs.len(),
            series,
        }
    }

    /// Collects ensemble snapshots (`[walkers, ndim]` per step); walkers play the
    /// role of chains.
    pub fn from_ensemble_steps(names: &[String], steps: &[Array2<f64>]) -> Self {
        let walkers = steps.first().map_or(0, |a| a.nrows());
        let series = names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let flat: Vec<f64> = steps
                    .iter()
                    .flat_map(|snapshot| snapshot.column(i).to_vec())
                    .collect();
                (name.clone(), flat)
            })
            .collect();
        Self {
            chains: walkers,
            series,
        }
    }

    pub fn chains(&self) -> usize {
        self.chains
    }

    pub fn get(&self, name: &str) -> Option<&[f64]> {
        self.series.get(name).map(Vec::as_slice)
    }
}

/// De-interleaves `raw` into a `[samples + warmup, chains, ndim]` array.
pub fn reshape(
    raw: &ChainResult,
    names: &[String],
    samples: usize,
    warmup: usize,
    chains: usize,
    ndim: usize,
) -> Result<StepArray, ChainError> {
    if names.len() != ndim {
        return Err(ChainError::Dimension {
            names: names.len(),
            ndim,
        });
    }
    let n_steps = samples + warmup;
    let mut steps = StepArray::zeros((n_steps, chains, ndim));

    for (i, name) in names.iter().enumerate() {
        let series = raw
            .get(name)
            .ok_or_else(|| ChainError::MissingParameter(name.clone()))?;
        if series.len() != n_steps * chains {
            return Err(ChainError::Length {
                name: name.clone(),
                got: series.len(),
                expected: n_steps * chains,
                chains,
                steps: n_steps,
            });
        }
        for j in 0..chains {
            let column = series.iter().skip(j).step_by(chains);
            steps
                .slice_mut(s![.., j, i])
                .iter_mut()
                .zip(column)
                .for_each(|(dst, &src)| *dst = src);
        }
    }

    Ok(steps)
}

/// Drops the first `warmup` steps of every chain and concatenates the chains:
/// row `j * samples + t` holds post-warmup step `t` of chain `j`.
pub fn flatten(steps: &StepArray, warmup: usize, chains: usize, ndim: usize) -> FlatSampleArray {
    let samples = steps.len_of(Axis(0)).saturating_sub(warmup);
    let mut flat = FlatSampleArray::zeros((samples * chains, ndim));

    for j in 0..chains {
        flat.slice_mut(s![j * samples..(j + 1) * samples, ..])
            .assign(&steps.slice(s![warmup.., j, ..]));
    }

    flat
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    fn names(n: &[&str]) -> Vec<String> {
        n.iter().map(|s| s.to_string()).collect()
    }

    /// Value encodes (parameter, step, chain) so misplaced entries are obvious.
    fn code(i: usize, t: usize, j: usize) -> f64 {
        (100 * i + 10 * t + j) as f64
    }

    fn synthetic(samples: usize, warmup: usize, chains: usize, ndim: usize) -> ChainResult {
        let steps = samples + warmup;
        let series = (0..ndim).map(|i| {
            let flat: Vec<f64> = (0..steps * chains)
                .map(|k| code(i, k / chains, k % chains))
                .collect();
            (format!("p{i}"), flat)
        });
        ChainResult::from_series(chains, series)
    }

    #[test]
    fn reshape_deinterleaves_by_chain() {
        let (samples, warmup, chains, ndim) = (3, 2, 4, 2);
        let raw = synthetic(samples, warmup, chains, ndim);
        let steps = reshape(&raw, &names(&["p0", "p1"]), samples, warmup, chains, ndim).unwrap();
        assert_eq!(steps.dim(), (5, 4, 2));
        for t in 0..5 {
            for j in 0..chains {
                for i in 0..ndim {
                    assert_eq!(steps[[t, j, i]], code(i, t, j));
                }
            }
        }
    }

    #[test]
    fn flatten_drops_warmup_and_stacks_chains() {
        let (samples, warmup, chains, ndim) = (2, 1, 2, 2);
        let raw = synthetic(samples, warmup, chains, ndim);
        let steps = reshape(&raw, &names(&["p0", "p1"]), samples, warmup, chains, ndim).unwrap();
        let flat = flatten(&steps, warmup, chains, ndim);

        let expected = arr2(&[
            [code(0, 1, 0), code(1, 1, 0)],
            [code(0, 2, 0), code(1, 2, 0)],
            [code(0, 1, 1), code(1, 1, 1)],
            [code(0, 2, 1), code(1, 2, 1)],
        ]);
        assert_eq!(flat, expected);
    }

    #[test]
    fn flatten_without_warmup_keeps_everything() {
        let raw = synthetic(4, 0, 3, 1);
        let steps = reshape(&raw, &names(&["p0"]), 4, 0, 3, 1).unwrap();
        assert_eq!(flatten(&steps, 0, 3, 1).nrows(), 12);
    }

    #[test]
    fn reshape_reports_wrong_lengths_and_missing_names() {
        let raw = synthetic(3, 1, 2, 1);
        assert_eq!(
            reshape(&raw, &names(&["p0"]), 3, 2, 2, 1).unwrap_err(),
            ChainError::Length {
                name: "p0".into(),
                got: 8,
                expected: 10,
                chains: 2,
                steps: 5
            }
        );
        assert_eq!(
            reshape(&raw, &names(&["q"]), 3, 1, 2, 1).unwrap_err(),
            ChainError::MissingParameter("q".into())
        );
    }

    #[test]
    fn chain_runs_and_ensemble_steps_share_the_layout() {
        let names = names(&["a", "b"]);
        let run0 = arr2(&[[1.0, 2.0], [3.0, 4.0]]);
        let run1 = arr2(&[[5.0, 6.0], [7.0, 8.0]]);
        let from_runs = ChainResult::from_chain_runs(&names, &[run0, run1]);

        let step0 = arr2(&[[1.0, 2.0], [5.0, 6.0]]);
        let step1 = arr2(&[[3.0, 4.0], [7.0, 8.0]]);
        let from_steps = ChainResult::from_ensemble_steps(&names, &[step0, step1]);

        assert_eq!(from_runs, from_steps);
        assert_eq!(from_runs.get("a").unwrap(), &[1.0, 5.0, 3.0, 7.0]);
        assert_eq!(from_runs.chains(), 2);
    }
}
