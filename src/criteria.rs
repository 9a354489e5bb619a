/*!
Model-selection criteria computed from the pointwise log-likelihood.

Both estimators work on a `[draws, observations]` matrix of `log p(y_i | θ_s)`
and report the expected log pointwise predictive density (elpd) with its
standard error:

- **WAIC**: `elpd_waic = Σ_i [log mean_s exp(ll_si) - var_s(ll_si)]`.
- **PSIS-LOO-CV**: leave-one-out cross-validation by importance sampling, with
  the importance ratios `exp(-ll_si)` stabilized by Pareto smoothing. The
  fitted Pareto shape `k` of every observation is a reliability diagnostic.

Vehtari, A., Gelman, A., & Gabry, J. (2017). Practical Bayesian model
evaluation using leave-one-out cross-validation and WAIC. Statistics and
Computing, 27(5), 1413-1432.

AIC, BIC and DIC can be requested but are not implemented.
*/

use ndarray::{Array1, ArrayView2, Axis};
use std::io::{self, Write};
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::CriteriaFlags;
use crate::report::Destination;

/// Observations whose Pareto `k` exceeds this are flagged as unreliable.
pub const PARETO_K_WARNING: f64 = 0.7;

/// Header of a criteria log file.
pub const CRITERIA_HEADER: &str = "## criteria.log\n# model selection criteria\n\n";

#[derive(Debug, Error)]
pub enum CriteriaError {
    #[error("{0} was requested but no pointwise log-likelihood is available")]
    MissingLogLikelihood(&'static str),
    #[error("{criterion} needs at least {needed} draws, got {got}")]
    TooFewDraws {
        criterion: &'static str,
        needed: usize,
        got: usize,
    },
    #[error("the log-likelihood of observation {observation} is not finite for draw {draw}")]
    NonFinite { draw: usize, observation: usize },
    #[error("failed to write criteria to {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// `log Σ exp(x)`, stable for large magnitudes.
pub fn logsumexp(x: &[f64]) -> f64 {
    let max = x.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    max + x.iter().map(|&v| (v - max).exp()).sum::<f64>().ln()
}

fn log_mean_exp(x: &[f64]) -> f64 {
    logsumexp(x) - (x.len() as f64).ln()
}

fn sample_var(x: &[f64], ddof: f64) -> f64 {
    let n = x.len() as f64;
    let mean = x.iter().sum::<f64>() / n;
    x.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - ddof)
}

/// `sqrt(n var(x))`: standard error of a sum of `n` pointwise terms.
fn sum_se(pointwise: &[f64]) -> f64 {
    (pointwise.len() as f64 * sample_var(pointwise, 0.0)).sqrt()
}

fn check_input(ll: ArrayView2<f64>, criterion: &'static str, needed: usize) -> Result<(), CriteriaError> {
    if ll.nrows() < needed {
        return Err(CriteriaError::TooFewDraws {
            criterion,
            needed,
            got: ll.nrows(),
        });
    }
    if let Some(((draw, observation), _)) = ll.indexed_iter().find(|(_, v)| !v.is_finite()) {
        return Err(CriteriaError::NonFinite { draw, observation });
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct Waic {
    pub elpd: f64,
    pub se: f64,
    /// Effective number of parameters.
    pub p_waic: f64,
    pub pointwise: Array1<f64>,
}

/// Widely applicable information criterion on the log scale.
pub fn waic(ll: ArrayView2<f64>) -> Result<Waic, CriteriaError> {
    check_input(ll, "WAIC", 2)?;

    let mut penalty = 0.0;
    let pointwise: Vec<f64> = ll
        .axis_iter(Axis(1))
        .map(|column| {
            let column = column.to_vec();
            let var = sample_var(&column, 1.0);
            penalty += var;
            log_mean_exp(&column) - var
        })
        .collect();

    Ok(Waic {
        elpd: pointwise.iter().sum(),
        se: sum_se(&pointwise),
        p_waic: penalty,
        pointwise: Array1::from(pointwise),
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct Loo {
    pub elpd: f64,
    pub se: f64,
    /// Effective number of parameters.
    pub p_loo: f64,
    pub pointwise: Array1<f64>,
    /// Pareto shape estimate of every observation.
    pub pareto_k: Array1<f64>,
}

impl Loo {
    /// Number of observations whose Pareto `k` exceeds [`PARETO_K_WARNING`].
    pub fn n_bad_k(&self) -> usize {
        self.pareto_k.iter().filter(|&&k| k > PARETO_K_WARNING).count()
    }
}

/// Pareto-smoothed importance sampling leave-one-out cross-validation.
pub fn psis_loo(ll: ArrayView2<f64>) -> Result<Loo, CriteriaError> {
    check_input(ll, "PSIS-LOO-CV", 2)?;

    let mut lppd = 0.0;
    let mut pointwise = Vec::with_capacity(ll.ncols());
    let mut pareto_k = Vec::with_capacity(ll.ncols());

    for column in ll.axis_iter(Axis(1)) {
        let column = column.to_vec();
        let mut log_weights: Vec<f64> = column.iter().map(|v| -v).collect();
        let k = psis_smooth(&mut log_weights);
        let weighted: Vec<f64> = log_weights.iter().zip(&column).map(|(w, v)| w + v).collect();

        pointwise.push(logsumexp(&weighted));
        pareto_k.push(k);
        lppd += log_mean_exp(&column);
    }

    let elpd: f64 = pointwise.iter().sum();
    let loo = Loo {
        elpd,
        se: sum_se(&pointwise),
        p_loo: lppd - elpd,
        pointwise: Array1::from(pointwise),
        pareto_k: Array1::from(pareto_k),
    };

    let bad = loo.n_bad_k();
    if bad > 0 {
        warn!(
            "{bad} of {} observations have a Pareto k above {PARETO_K_WARNING}; the PSIS-LOO-CV estimate may be unreliable",
            loo.pareto_k.len()
        );
    }
    Ok(loo)
}

/// Pareto-smooths the log importance weights of one observation in place and
/// normalizes them so that they sum to one. Returns the fitted Pareto shape;
/// it is infinite when the tail is too short to fit.
pub fn psis_smooth(log_weights: &mut [f64]) -> f64 {
    let n = log_weights.len();
    let max = log_weights.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    log_weights.iter_mut().for_each(|w| *w -= max);

    let tail_len_target = (0.2 * n as f64).min(3.0 * (n as f64).sqrt()).ceil() as usize;
    let mut sorted = log_weights.to_vec();
    sorted.sort_by(f64::total_cmp);
    let cutoff_index = n.saturating_sub(tail_len_target + 1);
    let cutoff = sorted[cutoff_index].max(f64::MIN_POSITIVE.ln());
    let exp_cutoff = cutoff.exp();

    let mut tail: Vec<usize> = (0..n).filter(|&i| log_weights[i] > cutoff).collect();
    let k = if tail.len() <= 4 {
        f64::INFINITY
    } else {
        tail.sort_by(|&a, &b| log_weights[a].total_cmp(&log_weights[b]));
        let excess: Vec<f64> = tail.iter().map(|&i| log_weights[i].exp() - exp_cutoff).collect();
        let (k, sigma) = gpd_fit(&excess);
        if k.is_finite() {
            let m = tail.len() as f64;
            for (rank, &i) in tail.iter().enumerate() {
                let p = (rank as f64 + 0.5) / m;
                log_weights[i] = (gpd_inv(p, k, sigma) + exp_cutoff).ln().min(0.0);
            }
        }
        k
    };
    debug!("Pareto tail of {} draws, k = {k:.3}", tail.len());

    let norm = logsumexp(log_weights);
    log_weights.iter_mut().for_each(|w| *w -= norm);
    k
}

/// Fits a generalized Pareto distribution to sorted positive exceedances with
/// the empirical Bayes estimator of Zhang & Stephens (2009), shrinking `k`
/// towards 0.5. Returns `(k, sigma)`.
pub fn gpd_fit(sorted: &[f64]) -> (f64, f64) {
    const PRIOR_BS: f64 = 3.0;
    const PRIOR_K: f64 = 10.0;

    let n = sorted.len();
    let nf = n as f64;
    let m_est = 30 + nf.sqrt() as usize;
    let quartile = sorted[((nf / 4.0 + 0.5) as usize).saturating_sub(1)];
    let largest = sorted[n - 1];

    let b: Vec<f64> = (1..=m_est)
        .map(|j| {
            let raw = 1.0 - (m_est as f64 / (j as f64 - 0.5)).sqrt();
            raw / (PRIOR_BS * quartile) + 1.0 / largest
        })
        .collect();
    let mean_log1p = |bi: f64| sorted.iter().map(|&x| (-bi * x).ln_1p()).sum::<f64>() / nf;
    let len_scale: Vec<f64> = b
        .iter()
        .map(|&bi| {
            let k = mean_log1p(bi);
            nf * ((-(bi / k)).ln() - k - 1.0)
        })
        .collect();

    let mut weights: Vec<(f64, f64)> = len_scale
        .iter()
        .zip(&b)
        .map(|(&li, &bi)| {
            let denom: f64 = len_scale.iter().map(|&lj| (lj - li).exp()).sum();
            (1.0 / denom, bi)
        })
        .filter(|(w, _)| *w >= 10.0 * f64::EPSILON)
        .collect();
    let total: f64 = weights.iter().map(|(w, _)| w).sum();
    weights.iter_mut().for_each(|(w, _)| *w /= total);

    let b_post: f64 = weights.iter().map(|(w, bi)| w * bi).sum();
    let k_post = mean_log1p(b_post);
    let sigma = -k_post / b_post;
    let k_post = (nf * k_post + PRIOR_K * 0.5) / (nf + PRIOR_K);
    (k_post, sigma)
}

/// Quantile function of the generalized Pareto distribution.
pub fn gpd_inv(p: f64, k: f64, sigma: f64) -> f64 {
    if sigma <= 0.0 || !(0.0..1.0).contains(&p) || p == 0.0 {
        return f64::NAN;
    }
    if k.abs() < f64::EPSILON {
        -(-p).ln_1p() * sigma
    } else {
        (-k * (-p).ln_1p()).exp_m1() / k * sigma
    }
}

/// Criteria that were computed for a run.
#[derive(Debug, Clone, Default)]
pub struct CriteriaReport {
    pub loo: Option<Loo>,
    pub waic: Option<Waic>,
}

/// Computes the requested criteria and writes one `NAME: value ± error` line
/// each (or `NAME: Not calculated`) to `destination`.
///
/// `pointwise` is the `[draws, observations]` log-likelihood; it is only needed
/// when PSIS-LOO-CV or WAIC is requested.
pub fn criteria(
    flags: &CriteriaFlags,
    pointwise: Option<ArrayView2<f64>>,
    destination: &Destination,
) -> Result<CriteriaReport, CriteriaError> {
    let require = |name: &'static str| pointwise.ok_or(CriteriaError::MissingLogLikelihood(name));

    let loo = flags
        .psis_loo_cv
        .then(|| require("PSIS-LOO-CV").and_then(psis_loo))
        .transpose()?;
    let waic = flags
        .waic
        .then(|| require("WAIC").and_then(waic))
        .transpose()?;

    let mut lines = Vec::new();
    lines.push(match &loo {
        Some(l) => format!("PSIS-LOO-CV: {} ± {}", l.elpd, l.se),
        None => "PSIS-LOO-CV: Not calculated".to_string(),
    });
    lines.push(match &waic {
        Some(w) => format!("WAIC: {} ± {}", w.elpd, w.se),
        None => "WAIC: Not calculated".to_string(),
    });
    for (name, requested) in [("AIC", flags.aic), ("BIC", flags.bic), ("DIC", flags.dic)] {
        if requested {
            let notice = format!("{name}: Not implemented (yet!)");
            if destination.is_file() {
                println!("{notice}");
            }
            lines.push(notice);
        } else {
            lines.push(format!("{name}: Not calculated"));
        }
    }

    write_lines(destination, &lines).map_err(|source| CriteriaError::Write {
        path: destination.path_or_stdout(),
        source,
    })?;

    Ok(CriteriaReport { loo, waic })
}

fn write_lines(destination: &Destination, lines: &[String]) -> io::Result<()> {
    let mut out = destination.open(CRITERIA_HEADER)?;
    for line in lines {
        writeln!(out, "{line}")?;
    }
    out.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, ArrayView1};
    use rand::rngs::SmallRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};
    use std::fs;
    use tempfile::tempdir;

    fn ln_normal(x: f64, mu: f64) -> f64 {
        -0.5 * (x - mu).powi(2) - 0.5 * (2.0 * std::f64::consts::PI).ln()
    }

    /// Pointwise log-likelihood of a unit-variance normal model whose mean is
    /// drawn from its exact posterior under a flat prior.
    fn well_specified(n_obs: usize, n_draws: usize, seed: u64) -> Array2<f64> {
        let mut rng = SmallRng::seed_from_u64(seed);
        let y: Vec<f64> = Normal::new(0.0, 1.0)
            .unwrap()
            .sample_iter(&mut rng)
            .take(n_obs)
            .collect();
        let ybar = y.iter().sum::<f64>() / n_obs as f64;
        let posterior = Normal::new(ybar, 1.0 / (n_obs as f64).sqrt()).unwrap();
        let mus: Vec<f64> = posterior.sample_iter(&mut rng).take(n_draws).collect();
        Array2::from_shape_fn((n_draws, n_obs), |(s, i)| ln_normal(y[i], mus[s]))
    }

    #[test]
    fn logsumexp_is_stable() {
        assert_abs_diff_eq!(logsumexp(&[0.0, 0.0]), 2f64.ln(), epsilon = 1e-12);
        assert_abs_diff_eq!(logsumexp(&[1000.0, 1000.0]), 1000.0 + 2f64.ln(), epsilon = 1e-9);
        assert_eq!(logsumexp(&[f64::NEG_INFINITY]), f64::NEG_INFINITY);
    }

    #[test]
    fn gpd_inv_reduces_to_exponential_at_zero_shape() {
        assert_abs_diff_eq!(gpd_inv(0.5, 0.0, 2.0), 2.0 * 2f64.ln(), epsilon = 1e-12);
        // k = 1: x = sigma * p / (1 - p)
        assert_abs_diff_eq!(gpd_inv(0.75, 1.0, 1.0), 3.0, epsilon = 1e-12);
        assert!(gpd_inv(0.5, 0.2, -1.0).is_nan());
    }

    #[test]
    fn gpd_fit_recovers_the_shape_of_exact_quantiles() {
        let (k_true, sigma_true) = (0.3, 1.5);
        let n = 2_000;
        let sorted: Vec<f64> = (0..n)
            .map(|i| gpd_inv((i as f64 + 0.5) / n as f64, k_true, sigma_true))
            .collect();
        let (k, sigma) = gpd_fit(&sorted);
        assert_abs_diff_eq!(k, k_true, epsilon = 0.05);
        assert_abs_diff_eq!(sigma, sigma_true, epsilon = 0.15);
    }

    #[test]
    fn smoothing_normalizes_the_weights() {
        let mut rng = SmallRng::seed_from_u64(4);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let mut lw: Vec<f64> = normal.sample_iter(&mut rng).take(1_000).collect();
        let k = psis_smooth(&mut lw);
        assert!(k.is_finite() && k < PARETO_K_WARNING, "k = {k}");
        assert_abs_diff_eq!(logsumexp(&lw), 0.0, epsilon = 1e-10);
    }

    #[test]
    fn constant_weights_have_no_tail() {
        let mut lw = vec![-3.0; 100];
        let k = psis_smooth(&mut lw);
        assert!(k.is_infinite());
        for w in lw {
            assert_abs_diff_eq!(w, -(100f64.ln()), epsilon = 1e-12);
        }
    }

    #[test]
    fn waic_and_loo_agree_on_a_well_specified_model() {
        let ll = well_specified(40, 4_000, 12);
        let loo = psis_loo(ll.view()).unwrap();
        let waic = waic(ll.view()).unwrap();

        assert_abs_diff_eq!(loo.elpd, waic.elpd, epsilon = 0.5);
        assert_abs_diff_eq!(loo.se, waic.se, epsilon = 0.5);
        // One free parameter.
        assert_abs_diff_eq!(loo.p_loo, 1.0, epsilon = 0.5);
        assert_abs_diff_eq!(waic.p_waic, 1.0, epsilon = 0.5);
        assert_eq!(loo.n_bad_k(), 0);
        assert_eq!(loo.pareto_k.len(), 40);
        assert!(loo.elpd < 0.0);
    }

    #[test]
    fn elpd_is_the_sum_of_its_pointwise_terms() {
        let ll = well_specified(10, 500, 3);
        let w = waic(ll.view()).unwrap();
        assert_abs_diff_eq!(w.elpd, w.pointwise.sum(), epsilon = 1e-9);

        // Observation 0 only: log mean exp - sample variance.
        let col: ArrayView1<f64> = ll.column(0);
        let expected = log_mean_exp(&col.to_vec()) - sample_var(&col.to_vec(), 1.0);
        assert_abs_diff_eq!(w.pointwise[0], expected, epsilon = 1e-12);
    }

    #[test]
    fn invalid_inputs_are_rejected() {
        let mut ll = Array2::<f64>::zeros((10, 3));
        ll[[4, 2]] = f64::NAN;
        assert!(matches!(
            waic(ll.view()),
            Err(CriteriaError::NonFinite {
                draw: 4,
                observation: 2
            })
        ));
        assert!(matches!(
            psis_loo(Array2::<f64>::zeros((1, 3)).view()),
            Err(CriteriaError::TooFewDraws { got: 1, .. })
        ));
    }

    #[test]
    fn criteria_file_lists_every_criterion() {
        let dir = tempdir().expect("Could not create temp dir");
        let path = dir.path().join("criteria.log");
        let ll = well_specified(20, 1_000, 7);
        let flags = CriteriaFlags {
            psis_loo_cv: true,
            waic: false,
            aic: true,
            bic: false,
            dic: false,
        };

        let report = criteria(&flags, Some(ll.view()), &Destination::File(path.clone())).unwrap();
        let loo = report.loo.unwrap();
        assert!(report.waic.is_none());

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with(CRITERIA_HEADER));
        let lines: Vec<&str> = text[CRITERIA_HEADER.len()..].lines().collect();
        assert_eq!(
            lines,
            vec![
                format!("PSIS-LOO-CV: {} ± {}", loo.elpd, loo.se).as_str(),
                "WAIC: Not calculated",
                "AIC: Not implemented (yet!)",
                "BIC: Not calculated",
                "DIC: Not calculated",
            ]
        );
    }

    #[test]
    fn requested_criteria_need_a_log_likelihood() {
        let flags = CriteriaFlags {
            waic: true,
            ..Default::default()
        };
        assert!(matches!(
            criteria(&flags, None, &Destination::Stdout),
            Err(CriteriaError::MissingLogLikelihood("WAIC"))
        ));
        // Nothing requested: nothing is needed.
        let report = criteria(&CriteriaFlags::default(), None, &Destination::Stdout).unwrap();
        assert!(report.loo.is_none() && report.waic.is_none());
    }
}
