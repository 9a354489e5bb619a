//! Runs the command-line pipeline into a temporary output directory.

use clap::Parser;
use simplified_mc::backend::Backend;
use simplified_mc::cli::{run, Args};

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    #[ignore = "requires system fonts"]
    fn gaussian_run_fills_the_output_directory() {
        let dir = tempdir().expect("Could not create temp dir");
        let data = dir.path().join("data.csv");
        let values: String = (0..50).map(|i| format!("{}\n", 2.0 + (i % 7) as f64)).collect();
        fs::write(&data, format!("value\n{values}")).unwrap();
        let output = dir.path().join("out");

        let args = Args::try_parse_from([
            "smc-mh",
            "--model",
            "gaussian",
            "--data",
            data.to_str().unwrap(),
            "--output",
            output.to_str().unwrap(),
            "--names",
            "[mu, sigma]",
            "--initial",
            "{mu: 'uniform(4, 6)', sigma: 'uniform(1.5, 2.5)'}",
            "--markers",
            "{mu: 5}",
            "--samples",
            "500",
            "--warmup",
            "200",
            "--chains",
            "2",
            "--PSIS_LOO_CV",
            "--WAIC",
            "--AIC",
            "--save-chain",
            "--hide-plots",
            "--no-progress",
            "--seed",
            "1",
        ])
        .unwrap();
        run(args.clone(), Backend::MetropolisHastings).unwrap();

        for file in [
            "log/config.yml",
            "log/criteria.log",
            "log/run.log",
            "plots/timeseries.png",
            "plots/khat.png",
            "chain.csv",
        ] {
            assert!(output.join(file).is_file(), "missing {file}");
        }
        let criteria = fs::read_to_string(output.join("log/criteria.log")).unwrap();
        assert!(criteria.contains("AIC: Not implemented (yet!)"));
        assert!(criteria.contains("BIC: Not calculated"));

        // A second run into the same directory needs --overwrite.
        assert!(run(args, Backend::MetropolisHastings).is_err());
    }
}
