//! `smc-ensemble`: affine-invariant ensemble sampling; every chain is a walker,
//! so at least twice as many chains as parameters are needed.
//!
//! ```bash
//! smc-ensemble --model linear --data line.csv --output out/linear-ensemble \
//!     --config config.yml --chains 16 --save-chain --compress
//! ```

use clap::Parser;
use simplified_mc::backend::Backend;
use simplified_mc::cli::{self, Args};

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    cli::init_logging(args.log_level);
    cli::run(args, Backend::Ensemble)
}
