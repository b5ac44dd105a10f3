use std::str::FromStr;

use venue_collector::cli::{self, Opts};
use venue_collector::error::CollectorError;
use venue_collector::{logging, orchestrator};

#[tokio::main]
async fn main() {
    let opts = Opts::parse_from_env();

    let level = tracing::metadata::LevelFilter::from_str(&opts.log_level).unwrap_or(tracing::metadata::LevelFilter::INFO);
    if let Err(e) = logging::init(level) {
        eprintln!("Warning: failed to initialize logging: {e}");
    }

    let exit_code = match run(opts).await {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("Error: {err}");
            err.exit_code()
        }
    };

    std::process::exit(exit_code);
}

async fn run(opts: Opts) -> Result<(), CollectorError> {
    let targets = cli::expand_targets(&opts.targets)?;
    orchestrator::run(targets, opts.books, opts.trades, opts.id).await?;
    Ok(())
}
