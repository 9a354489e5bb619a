//! `smc-mh`: adaptive random-walk Metropolis–Hastings, one chain per initial state.
//!
//! ```bash
//! smc-mh --model gaussian --data data.csv --output out/gaussian-mh \
//!     --config config.yml --chains 4 --WAIC --PSIS_LOO_CV
//! ```

use clap::Parser;
use simplified_mc::backend::Backend;
use simplified_mc::cli::{self, Args};

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    cli::init_logging(args.log_level);
    cli::run(args, Backend::MetropolisHastings)
}
