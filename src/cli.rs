/*!
The command line shared by the `smc-mh` and `smc-ensemble` binaries.

A run reads the configuration (command line over YAML file), samples the
posterior of the chosen model with one backend, and fills the output directory:

```text
<output>/
  log/config.yml      # effective configuration
  log/criteria.log    # PSIS-LOO-CV, WAIC, ...
  log/run.log         # version, elapsed time, finish date
  plots/timeseries.png
  plots/khat.png      # only with PSIS-LOO-CV
  chain.csv           # or chain.parquet, only with --save-chain
```
*/

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use crate::backend::{initial_array, sample, Backend};
use crate::chain::{flatten, reshape, StepArray};
use crate::config::{ConfigFile, CriteriaFlags, OutputFlags, Overrides, RunConfiguration};
use crate::criteria::criteria;
use crate::data::Dataset;
use crate::io::csv::save_csv;
use crate::model::{model_by_name, Posterior};
use crate::plot;
use crate::report::{runlog, Destination};
use crate::stats::{log_summary, summarize};

#[derive(Parser, Debug, Clone)]
#[command(version, about = "Run an MCMC sampler on a model and dataset")]
pub struct Args {
    /// Model to sample (`gaussian` or `linear`)
    #[arg(long)]
    pub model: String,

    /// CSV file with the observations
    #[arg(long)]
    pub data: PathBuf,

    /// Directory receiving logs, plots and chains
    #[arg(long)]
    pub output: PathBuf,

    /// YAML configuration file; command-line values take precedence
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Parameter names, e.g. "[mu, sigma]"
    #[arg(long)]
    pub names: Option<String>,

    /// Plot labels, one per name
    #[arg(long)]
    pub labels: Option<String>,

    /// Initial condition per name, e.g. "{mu: 0, sigma: 'uniform(1, 2)'}"
    #[arg(long)]
    pub initial: Option<String>,

    /// Reference values drawn on the plots, e.g. "{mu: 5, sigma: None}"
    #[arg(long)]
    pub markers: Option<String>,

    #[arg(long)]
    pub samples: Option<usize>,

    #[arg(long)]
    pub warmup: Option<usize>,

    /// Defaults to the number of available processors
    #[arg(long)]
    pub chains: Option<usize>,

    #[arg(long = "PSIS_LOO_CV")]
    pub psis_loo_cv: bool,

    #[arg(long = "WAIC")]
    pub waic: bool,

    #[arg(long = "AIC")]
    pub aic: bool,

    #[arg(long = "BIC")]
    pub bic: bool,

    #[arg(long = "DIC")]
    pub dic: bool,

    /// Allow writing into a non-empty output directory
    #[arg(long)]
    pub overwrite: bool,

    #[arg(long)]
    pub save_chain: bool,

    /// Save the chain as ZSTD-compressed Parquet instead of CSV
    #[arg(long)]
    pub compress: bool,

    /// Skip the terminal preview of the traces
    #[arg(long)]
    pub hide_plots: bool,

    /// Seed for the initial conditions and the sampler
    #[arg(long)]
    pub seed: Option<u64>,

    #[arg(long, default_value = "info")]
    pub log_level: tracing::Level,

    /// Disable progress bars
    #[arg(long)]
    pub no_progress: bool,
}

impl Args {
    /// The values given on the command line, for reconciliation with the file.
    pub fn overrides(&self) -> Overrides {
        Overrides {
            names: self.names.clone(),
            labels: self.labels.clone(),
            initial: self.initial.clone(),
            markers: self.markers.clone(),
            samples: self.samples,
            warmup: self.warmup,
            chains: self.chains,
            seed: self.seed,
            criteria: CriteriaFlags {
                psis_loo_cv: self.psis_loo_cv,
                waic: self.waic,
                aic: self.aic,
                bic: self.bic,
                dic: self.dic,
            },
            output: OutputFlags {
                overwrite: self.overwrite,
                save_chain: self.save_chain,
                compress: self.compress,
                hide_plots: self.hide_plots,
            },
        }
    }
}

pub fn init_logging(level: tracing::Level) {
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();
}

/// Creates `<output>/log` and `<output>/plots`. An existing non-empty output
/// directory is only reused with `overwrite`.
pub fn prepare_output(output: &Path, overwrite: bool) -> Result<(PathBuf, PathBuf)> {
    if output.is_dir() {
        let occupied = fs::read_dir(output)
            .with_context(|| format!("cannot list {}", output.display()))?
            .next()
            .is_some();
        if occupied && !overwrite {
            bail!(
                "output directory {} is not empty (use --overwrite to reuse it)",
                output.display()
            );
        }
    }
    let log_dir = output.join("log");
    let plot_dir = output.join("plots");
    for dir in [&log_dir, &plot_dir] {
        fs::create_dir_all(dir).with_context(|| format!("cannot create {}", dir.display()))?;
    }
    Ok((log_dir, plot_dir))
}

fn save_chain(steps: &StepArray, names: &[String], output: &Path, compress: bool) -> Result<PathBuf> {
    if compress {
        #[cfg(feature = "parquet")]
        {
            let path = output.join("chain.parquet");
            crate::io::parquet::save_parquet(steps, names, &path)
                .map_err(|e| anyhow!("cannot write {}: {e}", path.display()))?;
            return Ok(path);
        }
        #[cfg(not(feature = "parquet"))]
        bail!("--compress needs the `parquet` feature");
    }
    let path = output.join("chain.csv");
    save_csv(steps, names, &path).map_err(|e| anyhow!("cannot write {}: {e}", path.display()))?;
    Ok(path)
}

/// Runs the whole pipeline with `backend`.
pub fn run(args: Args, backend: Backend) -> Result<()> {
    let started = Instant::now();

    let file = match &args.config {
        Some(path) => ConfigFile::from_path(path)?,
        None => ConfigFile::default(),
    };
    let config =
        RunConfiguration::reconcile(&args.overrides(), file).context("invalid configuration")?;
    debug!("{config:?}");

    let (log_dir, plot_dir) = prepare_output(&args.output, config.output.overwrite)?;

    let model = model_by_name(&args.model)?;
    let data = Dataset::from_csv(&args.data)?;
    model
        .check(config.ndim(), &data)
        .with_context(|| format!("model '{}' does not fit the configuration", args.model))?;
    let posterior = Posterior::new(model, Arc::new(data));
    info!(
        "Loaded {} observations for model '{}'",
        posterior.data().len(),
        posterior.model().name()
    );

    let mut rng = match config.seed {
        Some(seed) => SmallRng::seed_from_u64(seed),
        None => SmallRng::from_entropy(),
    };
    let states = config.initial_states(&mut rng)?;
    let initial = initial_array(&config.names, &states)?;

    let raw = sample(
        backend,
        posterior.clone(),
        &config,
        initial,
        config.seed,
        !args.no_progress,
    )
    .context("sampling failed")?;
    let steps = reshape(
        &raw,
        &config.names,
        config.samples,
        config.warmup,
        config.chains,
        config.ndim(),
    )?;
    let flat = flatten(&steps, config.warmup, config.chains, config.ndim());

    log_summary(&summarize(&steps, &config.names, config.warmup));

    config.save(&log_dir.join("config.yml"))?;

    let needs_pointwise = config.criteria.psis_loo_cv || config.criteria.waic;
    let pointwise = if needs_pointwise {
        info!("Evaluating the pointwise log-likelihood of {} draws", flat.nrows());
        Some(posterior.pointwise_log_likelihood(flat.view())?)
    } else {
        None
    };
    let report = criteria(
        &config.criteria,
        pointwise.as_ref().map(|ll| ll.view()),
        &Destination::file(log_dir.join("criteria.log")),
    )?;
    if let Some(loo) = &report.loo {
        info!("PSIS-LOO-CV: {:.3} ± {:.3} (p_loo = {:.2})", loo.elpd, loo.se, loo.p_loo);
        let path = plot_dir.join("khat.png");
        plot::khat(loo.pareto_k.view(), &path)
            .map_err(|e| anyhow!("cannot draw {}: {e}", path.display()))?;
    }
    if let Some(waic) = &report.waic {
        info!("WAIC: {:.3} ± {:.3} (p_waic = {:.2})", waic.elpd, waic.se, waic.p_waic);
    }

    let path = plot_dir.join("timeseries.png");
    plot::timeseries(
        &steps,
        &config.names,
        &config.labels,
        &config.markers,
        config.warmup,
        &path,
        !config.output.hide_plots,
    )
    .map_err(|e| anyhow!("cannot draw {}: {e}", path.display()))?;

    if config.output.save_chain {
        let path = save_chain(&steps, &config.names, &args.output, config.output.compress)?;
        info!("Saved the chain to {}", path.display());
    }

    let elapsed = started.elapsed();
    runlog(elapsed, &Destination::file(log_dir.join("run.log"))).context("cannot write run.log")?;
    runlog(elapsed, &Destination::Stdout)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec!["smc", "--model", "gaussian", "--data", "d.csv", "--output", "out"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn flags_map_onto_overrides() {
        let args = parse(&[
            "--names",
            "[mu, sigma]",
            "--samples",
            "100",
            "--warmup",
            "0",
            "--PSIS_LOO_CV",
            "--DIC",
            "--save-chain",
            "--hide-plots",
            "--seed",
            "9",
        ]);
        let cli = args.overrides();
        assert_eq!(cli.names.as_deref(), Some("[mu, sigma]"));
        assert_eq!(cli.samples, Some(100));
        assert_eq!(cli.warmup, Some(0));
        assert_eq!(cli.chains, None);
        assert_eq!(cli.seed, Some(9));
        assert!(cli.criteria.psis_loo_cv && cli.criteria.dic);
        assert!(!cli.criteria.waic);
        assert!(cli.output.save_chain && cli.output.hide_plots);
        assert!(!cli.output.compress);
        assert_eq!(args.log_level, tracing::Level::INFO);
    }

    #[test]
    fn model_data_and_output_are_required() {
        assert!(Args::try_parse_from(["smc", "--model", "gaussian"]).is_err());
        assert!(Args::try_parse_from(["smc", "--data", "d.csv", "--output", "o"]).is_err());
    }

    #[test]
    fn output_directory_must_be_empty_unless_overwriting() {
        let dir = tempdir().expect("Could not create temp dir");
        let out = dir.path().join("run");

        let (log_dir, plot_dir) = prepare_output(&out, false).unwrap();
        assert!(log_dir.is_dir() && plot_dir.is_dir());

        let err = prepare_output(&out, false).unwrap_err();
        assert!(err.to_string().contains("not empty"));
        assert!(prepare_output(&out, true).is_ok());
    }

    #[test]
    fn chain_is_saved_as_csv_by_default() {
        let dir = tempdir().expect("Could not create temp dir");
        let steps = StepArray::from_elem((3, 2, 1), 0.5);
        let path = save_chain(&steps, &["x".to_string()], dir.path(), false).unwrap();
        assert_eq!(path, dir.path().join("chain.csv"));
        assert!(path.is_file());
    }

    #[cfg(feature = "parquet")]
    #[test]
    fn compressed_chain_is_parquet() {
        let dir = tempdir().expect("Could not create temp dir");
        let steps = StepArray::from_elem((3, 2, 1), 0.5);
        let path = save_chain(&steps, &["x".to_string()], dir.path(), true).unwrap();
        assert_eq!(path, dir.path().join("chain.parquet"));
        assert!(path.is_file());
    }
}
