/*!
# Saving chains to CSV

The full `[step, chain, parameter]` array of a run is written as one row per
(step, chain) pair, with the columns `step`, `chain` and one column per
parameter name. Warmup steps are included; `step` counts from zero.
*/

use csv::{ReaderBuilder, Writer};
use ndarray::Axis;
use std::error::Error;
use std::fs::File;
use std::path::Path;

use crate::chain::StepArray;

/**
Saves a step array as a CSV file.

# Arguments

* `steps` - The `[step, chain, parameter]` array of the run.
* `names` - One column name per parameter.
* `filename` - The file path where the CSV data will be written.

# Returns

Returns `Ok(())` if successful, or an error if any I/O or CSV formatting
issue occurs.

# Examples

```rust
use simplified_mc::io::csv::save_csv;
use ndarray::arr3;

// 2 steps of 1 chain over the parameters mu and sigma.
let steps = arr3(&[[[1.0, 2.0]], [[3.0, 4.0]]]);
let names = vec!["mu".to_string(), "sigma".to_string()];

let file = tempfile::NamedTempFile::new()?;
save_csv(&steps, &names, file.path())?;
let text = std::fs::read_to_string(file.path())?;
assert_eq!(text, "step,chain,mu,sigma\n0,0,1,2\n1,0,3,4\n");
# Ok::<(), Box<dyn std::error::Error>>(())
```
*/
pub fn save_csv(steps: &StepArray, names: &[String], filename: impl AsRef<Path>) -> Result<(), Box<dyn Error>> {
    let n_dims = steps.len_of(Axis(2));
    if names.len() != n_dims {
        return Err(format!("Got {} names for {} parameters", names.len(), n_dims).into());
    }
    let mut wtr = Writer::from_writer(File::create(filename)?);

    let mut header: Vec<String> = vec!["step".to_string(), "chain".to_string()];
    header.extend(names.iter().cloned());
    wtr.write_record(&header)?;

    for (step_idx, step) in steps.axis_iter(Axis(0)).enumerate() {
        for (chain_idx, state) in step.axis_iter(Axis(0)).enumerate() {
            let mut row = vec![step_idx.to_string(), chain_idx.to_string()];
            row.extend(state.iter().map(|v| v.to_string()));
            wtr.write_record(&row)?;
        }
    }

    wtr.flush()?;
    Ok(())
}

/// Reads back a file written by [`save_csv`], returning the step array and the
/// parameter names.
pub fn load_csv(filename: impl AsRef<Path>) -> Result<(StepArray, Vec<String>), Box<dyn Error>> {
    let mut rdr = ReaderBuilder::new().from_path(filename)?;
    let header = rdr.headers()?.clone();
    if header.len() < 2 || &header[0] != "step" || &header[1] != "chain" {
        return Err("Expected the columns to start with 'step,chain'".into());
    }
    let names: Vec<String> = header.iter().skip(2).map(str::to_string).collect();

    let mut rows: Vec<(usize, usize, Vec<f64>)> = Vec::new();
    for record in rdr.records() {
        let record = record?;
        let step: usize = record[0].parse()?;
        let chain: usize = record[1].parse()?;
        let values = record
            .iter()
            .skip(2)
            .map(str::parse::<f64>)
            .collect::<Result<Vec<_>, _>>()?;
        rows.push((step, chain, values));
    }

    let n_steps = rows.iter().map(|r| r.0 + 1).max().unwrap_or(0);
    let n_chains = rows.iter().map(|r| r.1 + 1).max().unwrap_or(0);
    if rows.len() != n_steps * n_chains {
        return Err(format!(
            "Expected {} rows for {n_steps} steps of {n_chains} chains, found {}",
            n_steps * n_chains,
            rows.len()
        )
        .into());
    }

    let mut steps = StepArray::zeros((n_steps, n_chains, names.len()));
    for (step, chain, values) in rows {
        for (i, v) in values.into_iter().enumerate() {
            steps[[step, chain, i]] = v;
        }
    }
    Ok((steps, names))
}
