/*!
The model contract and the built-in models.

A model provides a log-prior (negative infinity outside its support) and a
log-likelihood over a [`Dataset`]. The pipeline never calls them directly: it
wraps them in a [`Posterior`], which is the [`Target`] every sampling backend
draws from.

```rust
use simplified_mc::data::Dataset;
use simplified_mc::distributions::Target;
use simplified_mc::model::{model_by_name, Posterior};
use std::sync::Arc;

let model = model_by_name("gaussian").unwrap();
let data = Arc::new(Dataset::from_columns([("value", vec![4.0, 5.0, 6.0])]));
let posterior = Posterior::new(model, data);

// Inside the prior support the posterior is finite...
assert!(posterior.unnorm_log_prob(&[5.0, 2.0]).is_finite());
// ...and outside it is -inf, without ever touching the likelihood.
assert_eq!(posterior.unnorm_log_prob(&[50.0, 2.0]), f64::NEG_INFINITY);
```
*/

use ndarray::{Array2, ArrayView2, Axis};
use rayon::prelude::*;
use std::f64::consts::PI;
use std::sync::Arc;
use thiserror::Error;

use crate::data::{DataError, Dataset};
use crate::distributions::Target;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("unknown model '{name}' (available: {available})")]
    Unknown { name: String, available: String },
    #[error("model '{model}' has {expected} parameters but {got} names were configured")]
    Dimension {
        model: &'static str,
        expected: usize,
        got: usize,
    },
    #[error(transparent)]
    Data(#[from] DataError),
}

/// A user model: log-prior and log-likelihood over a dataset.
pub trait Model: Send + Sync {
    /// Registry name of the model.
    fn name(&self) -> &'static str;

    /// Number of parameters `theta` holds.
    fn ndim(&self) -> usize;

    /// Log of the prior density; negative infinity outside the support.
    fn ln_prior(&self, theta: &[f64]) -> f64;

    /// Log-likelihood of every observation in `data`.
    fn ln_likelihood_pointwise(&self, theta: &[f64], data: &Dataset) -> Result<Vec<f64>, DataError>;

    /// Total log-likelihood of `data`.
    fn ln_likelihood(&self, theta: &[f64], data: &Dataset) -> Result<f64, DataError> {
        Ok(self.ln_likelihood_pointwise(theta, data)?.iter().sum())
    }

    /// Checks that the model can be evaluated on `data` with `n_names` parameters.
    fn check(&self, n_names: usize, data: &Dataset) -> Result<(), ModelError>;
}

/// Combines a model and its data into the log-posterior the samplers target.
#[derive(Clone)]
pub struct Posterior {
    model: Arc<dyn Model>,
    data: Arc<Dataset>,
}

impl Posterior {
    pub fn new(model: Arc<dyn Model>, data: Arc<Dataset>) -> Self {
        Self { model, data }
    }

    pub fn model(&self) -> &dyn Model {
        self.model.as_ref()
    }

    pub fn data(&self) -> &Dataset {
        &self.data
    }

    /// `ln_prior + ln_likelihood` when the prior is finite, `-inf` otherwise.
    pub fn ln_posterior(&self, theta: &[f64]) -> f64 {
        let prior = self.model.ln_prior(theta);
        if !prior.is_finite() {
            return f64::NEG_INFINITY;
        }
        // Data columns are validated by `Model::check` before sampling starts.
        match self.model.ln_likelihood(theta, &self.data) {
            Ok(ll) if ll.is_nan() => f64::NEG_INFINITY,
            Ok(ll) => prior + ll,
            Err(_) => f64::NEG_INFINITY,
        }
    }

    /// Log-likelihood of every observation for every draw, shape
    /// `[draws, observations]`. Rows are evaluated in parallel.
    pub fn pointwise_log_likelihood(&self, draws: ArrayView2<f64>) -> Result<Array2<f64>, DataError> {
        let thetas: Vec<Vec<f64>> = draws.axis_iter(Axis(0)).map(|row| row.to_vec()).collect();
        let rows: Vec<Vec<f64>> = thetas
            .par_iter()
            .map(|theta| self.model.ln_likelihood_pointwise(theta, &self.data))
            .collect::<Result<_, _>>()?;

        let n_obs = self.data.len();
        let flat: Vec<f64> = rows.into_iter().flatten().collect();
        Ok(Array2::from_shape_vec((draws.nrows(), n_obs), flat)
            .expect("Expected every draw to produce one value per observation"))
    }
}

impl Target<f64> for Posterior {
    fn unnorm_log_prob(&self, theta: &[f64]) -> f64 {
        self.ln_posterior(theta)
    }
}

fn ln_normal(x: f64, mu: f64, sigma: f64) -> f64 {
    let z = (x - mu) / sigma;
    -0.5 * z * z - sigma.ln() - 0.5 * (2.0 * PI).ln()
}

fn check_dimension(model: &dyn Model, n_names: usize) -> Result<(), ModelError> {
    if model.ndim() != n_names {
        return Err(ModelError::Dimension {
            model: model.name(),
            expected: model.ndim(),
            got: n_names,
        });
    }
    Ok(())
}

/// Mean `mu` and standard deviation `sigma` of the column `value`, with flat
/// priors on `-10 < mu < 10` and `1 < sigma < 10`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Gaussian;

impl Model for Gaussian {
    fn name(&self) -> &'static str {
        "gaussian"
    }

    fn ndim(&self) -> usize {
        2
    }

    fn ln_prior(&self, theta: &[f64]) -> f64 {
        let (mu, sigma) = (theta[0], theta[1]);
        if -10.0 < mu && mu < 10.0 && 1.0 < sigma && sigma < 10.0 {
            0.0
        } else {
            f64::NEG_INFINITY
        }
    }

    fn ln_likelihood_pointwise(&self, theta: &[f64], data: &Dataset) -> Result<Vec<f64>, DataError> {
        let (mu, sigma) = (theta[0], theta[1]);
        Ok(data
            .column("value")?
            .iter()
            .map(|&x| ln_normal(x, mu, sigma))
            .collect())
    }

    fn check(&self, n_names: usize, data: &Dataset) -> Result<(), ModelError> {
        check_dimension(self, n_names)?;
        data.column("value")?;
        Ok(())
    }
}

/// Straight line `y = m x + b` with Gaussian scatter `sigma`. Flat priors on
/// `-100 < m, b < 100` and `0 < sigma < 100`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Linear;

impl Model for Linear {
    fn name(&self) -> &'static str {
        "linear"
    }

    fn ndim(&self) -> usize {
        3
    }

    fn ln_prior(&self, theta: &[f64]) -> f64 {
        let (m, b, sigma) = (theta[0], theta[1], theta[2]);
        let in_box = |v: f64| -100.0 < v && v < 100.0;
        if in_box(m) && in_box(b) && 0.0 < sigma && sigma < 100.0 {
            0.0
        } else {
            f64::NEG_INFINITY
        }
    }

    fn ln_likelihood_pointwise(&self, theta: &[f64], data: &Dataset) -> Result<Vec<f64>, DataError> {
        let (m, b, sigma) = (theta[0], theta[1], theta[2]);
        let x = data.column("x")?;
        let y = data.column("y")?;
        Ok(x.iter()
            .zip(y)
            .map(|(&xi, &yi)| ln_normal(yi, m * xi + b, sigma))
            .collect())
    }

    fn check(&self, n_names: usize, data: &Dataset) -> Result<(), ModelError> {
        check_dimension(self, n_names)?;
        data.column("x")?;
        data.column("y")?;
        Ok(())
    }
}

/// Names accepted by [`model_by_name`].
pub const MODELS: [&str; 2] = ["gaussian", "linear"];

/// Looks up a built-in model. A path such as `models/gaussian.rs` resolves by
/// its file stem.
pub fn model_by_name(name: &str) -> Result<Arc<dyn Model>, ModelError> {
    let stem = std::path::Path::new(name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(name);
    match stem {
        "gaussian" => Ok(Arc::new(Gaussian)),
        "linear" => Ok(Arc::new(Linear)),
        _ => Err(ModelError::Unknown {
            name: name.to_string(),
            available: MODELS.join(", "),
        }),
    }
}
