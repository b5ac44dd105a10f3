use crate::cli::CliError;
use crate::listener::DialError;

#[derive(thiserror::Error, Debug)]
pub enum CollectorError {
    #[error("configuration error: {0}")]
    Configuration(#[from] CliError),
    #[error("listener failed to start: {0}")]
    ListenerStart(#[from] DialError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CollectorError {
    /// Maps an error to the process exit code described in the CLI contract.
    pub fn exit_code(&self) -> i32 {
        match self {
            CollectorError::Configuration(_) => 1,
            CollectorError::ListenerStart(_) => 2,
            CollectorError::Io(_) => 2,
        }
    }
}
