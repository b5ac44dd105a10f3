//! Command-line surface: argument parsing, target expansion, and the
//! stdin-as-argument-pipe convention. Treated as an ambient collaborator by
//! the core collector, but implemented end to end since a deployable binary
//! needs it.

use std::io::{IsTerminal, Read};

use clap::Parser;

use crate::exchanges::Exchange;

#[derive(thiserror::Error, Debug)]
pub enum CliError {
    #[error("unknown exchange '{0}'")]
    UnknownExchange(String),
    #[error("exchange '{0}' is reserved but not yet implemented")]
    NotImplemented(String),
    #[error("missing symbol in target '{0}'")]
    MissingSymbol(String),
    #[error("no targets specified")]
    NoTargets,
}

/// A name recognized by the CLI, including venues reserved for the future.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecognizedExchange {
    Binance,
    Bitfinex,
    Kraken,
    Huobi,
}

impl RecognizedExchange {
    fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "binance" => Some(RecognizedExchange::Binance),
            "bitfinex" => Some(RecognizedExchange::Bitfinex),
            "kraken" => Some(RecognizedExchange::Kraken),
            "huobi" => Some(RecognizedExchange::Huobi),
            _ => None,
        }
    }

    fn into_exchange(self, raw: &str) -> Result<Exchange, CliError> {
        match self {
            RecognizedExchange::Binance => Ok(Exchange::Binance),
            RecognizedExchange::Bitfinex => Ok(Exchange::Bitfinex),
            RecognizedExchange::Kraken => Ok(Exchange::Kraken),
            RecognizedExchange::Huobi => Err(CliError::NotImplemented(raw.to_string())),
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "venue-collector")]
pub struct Opts {
    /// `EXCHANGE:SYMBOL` or bare `SYMBOL` (applies to every recognized venue).
    pub targets: Vec<String>,

    /// Emit order-book updates.
    #[arg(long, short = 'B', default_value_t = true)]
    pub books: bool,

    /// Emit trades.
    #[arg(long, short = 'T', default_value_t = true)]
    pub trades: bool,

    /// Experiment tag prepended to every output record as `<N>,`.
    #[arg(long)]
    pub id: Option<u64>,

    /// Log level: trace, debug, info, warn, error.
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Path to write a CPU profile to, for local perf sessions.
    #[arg(long)]
    pub cpuprofile: Option<std::path::PathBuf>,
}

impl Opts {
    /// Parses `std::env::args()` merged with any stdin-piped arguments.
    pub fn parse_from_env() -> Self {
        Opts::parse_from(full_args())
    }
}

/// `std::env::args()` extended with shell-word-tokenized stdin content when
/// stdin is not a terminal.
fn full_args() -> Vec<String> {
    let mut args: Vec<String> = std::env::args().collect();
    if let Some(piped) = read_piped_args() {
        args.extend(piped);
    }
    args
}

fn read_piped_args() -> Option<Vec<String>> {
    let mut stdin = std::io::stdin();
    if stdin.is_terminal() {
        return None;
    }
    let mut buf = String::new();
    stdin.read_to_string(&mut buf).ok()?;
    shell_words::split(buf.trim()).ok()
}

#[derive(Debug, Clone)]
pub struct Target {
    pub exchange: Exchange,
    pub symbol: String,
}

/// Expands CLI positionals into concrete (exchange, symbol) targets. A bare
/// symbol expands to every recognized exchange; `EXCHANGE:SYMBOL` restricts
/// to one.
pub fn expand_targets(raw_targets: &[String]) -> Result<Vec<Target>, CliError> {
    if raw_targets.is_empty() {
        return Err(CliError::NoTargets);
    }

    let mut targets = Vec::new();
    for raw in raw_targets {
        match raw.split_once(':') {
            Some((exchange_name, symbol)) => {
                if symbol.is_empty() {
                    return Err(CliError::MissingSymbol(raw.clone()));
                }
                let recognized = RecognizedExchange::parse(exchange_name)
                    .ok_or_else(|| CliError::UnknownExchange(exchange_name.to_string()))?;
                let exchange = recognized.into_exchange(exchange_name)?;
                targets.push(Target {
                    exchange,
                    symbol: symbol.to_string(),
                });
            }
            None => {
                for exchange in Exchange::ALL {
                    targets.push(Target {
                        exchange: *exchange,
                        symbol: raw.clone(),
                    });
                }
            }
        }
    }
    Ok(targets)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_symbol_expands_to_every_exchange() {
        let targets = expand_targets(&["btcusd".to_string()]).unwrap();
        assert_eq!(targets.len(), Exchange::ALL.len());
    }

    #[test]
    fn qualified_target_restricts_to_one_exchange() {
        let targets = expand_targets(&["binance:btcusdt".to_string()]).unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].exchange, Exchange::Binance);
        assert_eq!(targets[0].symbol, "btcusdt");
    }

    #[test]
    fn huobi_is_recognized_but_rejected() {
        let err = expand_targets(&["huobi:btcusdt".to_string()]).unwrap_err();
        assert!(matches!(err, CliError::NotImplemented(_)));
    }

    #[test]
    fn unknown_exchange_is_rejected() {
        let err = expand_targets(&["coinbase:btcusd".to_string()]).unwrap_err();
        assert!(matches!(err, CliError::UnknownExchange(_)));
    }

    #[test]
    fn empty_targets_is_rejected() {
        let err = expand_targets(&[]).unwrap_err();
        assert!(matches!(err, CliError::NoTargets));
    }

    #[test]
    fn missing_symbol_is_rejected() {
        let err = expand_targets(&["binance:".to_string()]).unwrap_err();
        assert!(matches!(err, CliError::MissingSymbol(_)));
    }
}
