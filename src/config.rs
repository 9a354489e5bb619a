/*!
Run configuration: command-line values reconciled with a YAML file.

Every setting can come from the command line or from the configuration file;
the command line wins. List and mapping settings are given on the command line
as flow literals, e.g. `--names "['mu', 'sigma']"` or
`--initial "{'mu': 'uniform(-5, 5)', 'sigma': 'uniform(1, 10)'}"`.

```rust
use simplified_mc::config::{ConfigFile, Overrides, RunConfiguration};

let file = ConfigFile::from_yaml(
    "names: [mu, sigma]\n\
     initial: {mu: 0, sigma: 'uniform(1, 2)'}\n\
     samples: 1000\n\
     warmup: 100\n\
     chains: 2\n",
)
.unwrap();
let cli = Overrides {
    samples: Some(5000),
    ..Default::default()
};
let config = RunConfiguration::reconcile(&cli, file).unwrap();
assert_eq!(config.samples, 5000);
assert_eq!(config.labels, config.names);
assert_eq!(config.markers["mu"], None);
```
*/

use indexmap::IndexMap;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

use crate::init::{InitError, InitialExpr};

/// Comment block at the top of a configuration backup.
pub const SAVE_HEADER: &str = "## config.yml\n# backup of the configuration arguments used for this run\n\n";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("could not parse the value of {flag} ('{value}'): {source}")]
    Literal {
        flag: &'static str,
        value: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("missing '{key}': pass {flag} or set '{key}' in the configuration file")]
    Missing {
        key: &'static str,
        flag: &'static str,
    },
    #[error("number of dimensions mismatch: len(names) = {names}, len(labels) = {labels}, len(initial) = {initial}")]
    Mismatch {
        names: usize,
        labels: usize,
        initial: usize,
    },
    #[error("parameter '{0}' is listed more than once in names")]
    DuplicateName(String),
    #[error("no initial condition given for parameter '{0}'")]
    MissingInitial(String),
    #[error("invalid initial condition for '{name}': {source}")]
    Initial {
        name: String,
        #[source]
        source: InitError,
    },
    #[error("marker for '{name}' must be a number or None, got {value}")]
    Marker { name: String, value: String },
    #[error("samples must be greater than zero")]
    ZeroSamples,
    #[error("chains must be at least 1")]
    ZeroChains,
    #[error("failed to serialize the configuration: {0}")]
    Serialize(#[from] serde_yaml::Error),
    #[error("failed to write configuration backup {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Which model-selection criteria to compute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CriteriaFlags {
    pub psis_loo_cv: bool,
    pub waic: bool,
    pub aic: bool,
    pub bic: bool,
    pub dic: bool,
}

/// What to do with the run's outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OutputFlags {
    pub overwrite: bool,
    pub save_chain: bool,
    pub compress: bool,
    pub hide_plots: bool,
}

/// Values supplied on the command line. List and mapping values are kept as
/// their raw literal text; booleans are `true` when the flag was passed.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub names: Option<String>,
    pub labels: Option<String>,
    pub initial: Option<String>,
    pub markers: Option<String>,
    pub samples: Option<usize>,
    pub warmup: Option<usize>,
    pub chains: Option<usize>,
    pub seed: Option<u64>,
    pub criteria: CriteriaFlags,
    pub output: OutputFlags,
}

/// An initial condition as written in YAML: a bare number or an expression.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum InitialValue {
    Number(f64),
    Expr(String),
}

impl InitialValue {
    fn into_expr(self, name: &str) -> Result<InitialExpr, ConfigError> {
        match self {
            InitialValue::Number(v) => Ok(InitialExpr::constant(v)),
            InitialValue::Expr(src) => InitialExpr::parse(&src).map_err(|source| ConfigError::Initial {
                name: name.to_string(),
                source,
            }),
        }
    }
}

/// The configuration file as read from disk. Every key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    pub names: Option<Vec<String>>,
    pub labels: Option<Vec<String>>,
    pub initial: Option<IndexMap<String, InitialValue>>,
    pub markers: Option<IndexMap<String, Value>>,
    pub samples: Option<usize>,
    pub warmup: Option<usize>,
    pub chains: Option<usize>,
    pub seed: Option<u64>,
    #[serde(rename = "PSIS-LOO-CV")]
    pub psis_loo_cv: Option<bool>,
    #[serde(rename = "WAIC")]
    pub waic: Option<bool>,
    #[serde(rename = "AIC")]
    pub aic: Option<bool>,
    #[serde(rename = "BIC")]
    pub bic: Option<bool>,
    #[serde(rename = "DIC")]
    pub dic: Option<bool>,
    pub overwrite: Option<bool>,
    #[serde(rename = "save-chain")]
    pub save_chain: Option<bool>,
    pub compress: Option<bool>,
    #[serde(rename = "hide-plots")]
    pub hide_plots: Option<bool>,
}

impl ConfigFile {
    /// Parses a YAML document. An empty or comment-only document is an empty
    /// configuration.
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        let blank = text
            .lines()
            .map(str::trim)
            .all(|line| line.is_empty() || line.starts_with('#'));
        if blank {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str::<Option<Self>>(text)?.unwrap_or_default())
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// The reconciled, validated settings of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfiguration {
    pub names: Vec<String>,
    pub labels: Vec<String>,
    pub initial: IndexMap<String, InitialExpr>,
    pub markers: IndexMap<String, Option<f64>>,
    pub samples: usize,
    pub warmup: usize,
    pub chains: usize,
    pub criteria: CriteriaFlags,
    pub output: OutputFlags,
    pub seed: Option<u64>,
}

/// Number of chains used when neither the command line nor the file sets one.
pub fn default_chains() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get())
}

/// Parses a flow literal given on the command line, wrapping it in `open`/`close`
/// when the brackets were left out.
fn parse_literal<T: DeserializeOwned>(
    flag: &'static str,
    text: &str,
    open: char,
    close: char,
) -> Result<T, ConfigError> {
    let trimmed = text.trim();
    let wrapped = if trimmed.starts_with(open) {
        trimmed.to_string()
    } else {
        format!("{open}{trimmed}{close}")
    };
    serde_yaml::from_str(&wrapped).map_err(|source| ConfigError::Literal {
        flag,
        value: text.to_string(),
        source,
    })
}

fn marker_value(name: &str, value: Value) -> Result<Option<f64>, ConfigError> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => n.as_f64().map(Some).ok_or_else(|| ConfigError::Marker {
            name: name.to_string(),
            value: n.to_string(),
        }),
        Value::String(s) if matches!(s.trim(), "None" | "none" | "null" | "~" | "") => Ok(None),
        Value::String(s) => s.trim().parse::<f64>().map(Some).map_err(|_| ConfigError::Marker {
            name: name.to_string(),
            value: s,
        }),
        other => Err(ConfigError::Marker {
            name: name.to_string(),
            value: format!("{other:?}"),
        }),
    }
}

impl RunConfiguration {
    /// Merges `cli` over `file`; a missing chain count defaults to the number of
    /// available processors.
    pub fn reconcile(cli: &Overrides, file: ConfigFile) -> Result<Self, ConfigError> {
        Self::reconcile_with(cli, file, default_chains())
    }

    pub fn reconcile_with(
        cli: &Overrides,
        file: ConfigFile,
        default_chains: usize,
    ) -> Result<Self, ConfigError> {
        let names: Vec<String> = match &cli.names {
            Some(text) => parse_literal("--names", text, '[', ']')?,
            None => file.names.ok_or(ConfigError::Missing {
                key: "names",
                flag: "--names",
            })?,
        };
        let labels: Vec<String> = match &cli.labels {
            Some(text) => parse_literal("--labels", text, '[', ']')?,
            None => file.labels.unwrap_or_else(|| names.clone()),
        };
        let initial: IndexMap<String, InitialValue> = match &cli.initial {
            Some(text) => parse_literal("--initial", text, '{', '}')?,
            None => file.initial.ok_or(ConfigError::Missing {
                key: "initial",
                flag: "--initial",
            })?,
        };
        let explicit_markers: IndexMap<String, Value> = match &cli.markers {
            Some(text) => parse_literal("--markers", text, '{', '}')?,
            None => file.markers.unwrap_or_default(),
        };

        let samples = cli.samples.or(file.samples).ok_or(ConfigError::Missing {
            key: "samples",
            flag: "--samples",
        })?;
        let warmup = cli.warmup.or(file.warmup).ok_or(ConfigError::Missing {
            key: "warmup",
            flag: "--warmup",
        })?;
        let chains = cli.chains.or(file.chains).unwrap_or(default_chains);
        let seed = cli.seed.or(file.seed);

        if names.len() != labels.len() || names.len() != initial.len() {
            return Err(ConfigError::Mismatch {
                names: names.len(),
                labels: labels.len(),
                initial: initial.len(),
            });
        }
        let mut seen = HashSet::new();
        if let Some(dup) = names.iter().find(|n| !seen.insert(n.as_str())) {
            return Err(ConfigError::DuplicateName(dup.clone()));
        }
        if samples == 0 {
            return Err(ConfigError::ZeroSamples);
        }
        if chains == 0 {
            return Err(ConfigError::ZeroChains);
        }

        let mut initial = initial;
        let mut exprs = IndexMap::with_capacity(names.len());
        for name in &names {
            let value = initial
                .swap_remove(name)
                .ok_or_else(|| ConfigError::MissingInitial(name.clone()))?;
            exprs.insert(name.clone(), value.into_expr(name)?);
        }

        let mut markers: IndexMap<String, Option<f64>> =
            names.iter().map(|n| (n.clone(), None)).collect();
        for (name, value) in explicit_markers {
            if !markers.contains_key(&name) {
                warn!("marker given for unknown parameter '{name}'");
            }
            let value = marker_value(&name, value)?;
            markers.insert(name, value);
        }

        let flag = |cli: bool, file: Option<bool>| cli || file.unwrap_or(false);
        let criteria = CriteriaFlags {
            psis_loo_cv: flag(cli.criteria.psis_loo_cv, file.psis_loo_cv),
            waic: flag(cli.criteria.waic, file.waic),
            aic: flag(cli.criteria.aic, file.aic),
            bic: flag(cli.criteria.bic, file.bic),
            dic: flag(cli.criteria.dic, file.dic),
        };
        let output = OutputFlags {
            overwrite: flag(cli.output.overwrite, file.overwrite),
            save_chain: flag(cli.output.save_chain, file.save_chain),
            compress: flag(cli.output.compress, file.compress),
            hide_plots: flag(cli.output.hide_plots, file.hide_plots),
        };

        Ok(Self {
            names,
            labels,
            initial: exprs,
            markers,
            samples,
            warmup,
            chains,
            criteria,
            output,
            seed,
        })
    }

    pub fn ndim(&self) -> usize {
        self.names.len()
    }

    /// Total number of steps every chain runs.
    pub fn n_steps(&self) -> usize {
        self.samples + self.warmup
    }

    /// Draws one starting point per chain by evaluating every initial
    /// expression anew.
    pub fn initial_states<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
    ) -> Result<Vec<IndexMap<String, f64>>, ConfigError> {
        (0..self.chains)
            .map(|_| {
                self.initial
                    .iter()
                    .map(|(name, expr)| {
                        expr.eval(rng)
                            .map(|v| (name.clone(), v))
                            .map_err(|source| ConfigError::Initial {
                                name: name.clone(),
                                source,
                            })
                    })
                    .collect::<Result<IndexMap<_, _>, _>>()
            })
            .collect()
    }

    /// Renders the configuration backup: header, then one key per block in a
    /// fixed order.
    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        let initial: IndexMap<&str, &str> = self
            .initial
            .iter()
            .map(|(k, v)| (k.as_str(), v.source()))
            .collect();

        let mut entries: Vec<(&str, Value)> = vec![
            ("names", serde_yaml::to_value(&self.names)?),
            ("labels", serde_yaml::to_value(&self.labels)?),
            ("initial", serde_yaml::to_value(&initial)?),
            ("markers", serde_yaml::to_value(&self.markers)?),
            ("samples", serde_yaml::to_value(self.samples)?),
            ("warmup", serde_yaml::to_value(self.warmup)?),
            ("chains", serde_yaml::to_value(self.chains)?),
            ("PSIS-LOO-CV", Value::from(self.criteria.psis_loo_cv)),
            ("WAIC", Value::from(self.criteria.waic)),
            ("AIC", Value::from(self.criteria.aic)),
            ("BIC", Value::from(self.criteria.bic)),
            ("DIC", Value::from(self.criteria.dic)),
            ("overwrite", Value::from(self.output.overwrite)),
            ("save-chain", Value::from(self.output.save_chain)),
            ("compress", Value::from(self.output.compress)),
            ("hide-plots", Value::from(self.output.hide_plots)),
        ];
        if let Some(seed) = self.seed {
            entries.push(("seed", serde_yaml::to_value(seed)?));
        }

        let mut out = String::from(SAVE_HEADER);
        for (key, value) in entries {
            let mut block = Mapping::new();
            block.insert(Value::from(key), value);
            out.push_str(&serde_yaml::to_string(&block)?);
            out.push('\n');
        }
        Ok(out)
    }

    /// Writes the configuration backup to `path`.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let text = self.to_yaml()?;
        fs::write(path, text).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }
}
