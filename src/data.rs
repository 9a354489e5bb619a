//! Datasets: named numeric columns read from a CSV file with a header row.

use indexmap::IndexMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DataError {
    #[error("failed to read data file {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("data file {path}, line {line}, column '{column}': '{value}' is not a number")]
    NotANumber {
        path: PathBuf,
        line: u64,
        column: String,
        value: String,
    },
    #[error("data file {0} contains no rows")]
    Empty(PathBuf),
    #[error("dataset has no column named '{name}' (columns: {available})")]
    MissingColumn { name: String, available: String },
}

/// Column-oriented numeric dataset.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Dataset {
    columns: IndexMap<String, Vec<f64>>,
}

impl Dataset {
    pub fn from_columns<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = (S, Vec<f64>)>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    /// Reads a comma-separated file. Every cell must parse as `f64`; surrounding
    /// whitespace is ignored.
    pub fn from_csv(path: &Path) -> Result<Self, DataError> {
        let csv_err = |source| DataError::Csv {
            path: path.to_path_buf(),
            source,
        };
        let mut rdr = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .comment(Some(b'#'))
            .from_path(path)
            .map_err(csv_err)?;

        let headers: Vec<String> = rdr
            .headers()
            .map_err(csv_err)?
            .iter()
            .map(str::to_string)
            .collect();
        let mut columns: IndexMap<String, Vec<f64>> =
            headers.iter().map(|h| (h.clone(), Vec::new())).collect();

        for record in rdr.records() {
            let record = record.map_err(csv_err)?;
            let line = record.position().map_or(0, |p| p.line());
            for (header, cell) in headers.iter().zip(record.iter()) {
                let value = cell.parse::<f64>().map_err(|_| DataError::NotANumber {
                    path: path.to_path_buf(),
                    line,
                    column: header.clone(),
                    value: cell.to_string(),
                })?;
                columns[header.as_str()].push(value);
            }
        }

        let dataset = Self { columns };
        if dataset.is_empty() {
            return Err(DataError::Empty(path.to_path_buf()));
        }
        Ok(dataset)
    }

    pub fn column(&self, name: &str) -> Result<&[f64], DataError> {
        self.columns
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| DataError::MissingColumn {
                name: name.to_string(),
                available: self.column_names().collect::<Vec<_>>().join(", "),
            })
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    /// Number of rows (observations).
    pub fn len(&self) -> usize {
        self.columns.values().next().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
