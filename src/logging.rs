//! Stderr diagnostics: a timestamped `tracing` subscriber plus the
//! `Warning:`/`Error:` prefixing convention consumed by the aggregator and
//! the venue adapters.

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Installs the process-wide tracing subscriber. Output goes to stderr so it
/// never interleaves with the normalized record stream on stdout.
pub fn init(level: tracing::metadata::LevelFilter) -> eyre::Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_span_events(FmtSpan::NONE)
        .with_target(false)
        .try_init()
        .map_err(|e| eyre::eyre!("failed to install tracing subscriber: {e}"))
}

/// Logs a protocol gap warning tagged by venue, matching the
/// `Warning: <venue> ...` convention read by operators tailing stderr.
pub fn warn_gap(exchange: &str, symbol: &str, message: &str) {
    tracing::warn!(exchange, symbol, "Warning: {exchange} {symbol}: {message}");
}

/// Logs a dropped-frame parse error tagged by venue.
pub fn error_parse(exchange: &str, symbol: &str, message: &str) {
    tracing::error!(exchange, symbol, "Error: {exchange} {symbol}: {message}");
}

pub fn info_starting(exchange: &str, symbol: &str) {
    tracing::info!(exchange, symbol, "Starting listener {exchange} {symbol}");
}

pub fn info_stopping(exchange: &str, symbol: &str) {
    tracing::info!(exchange, symbol, "Stopping listener {exchange} {symbol}");
}
