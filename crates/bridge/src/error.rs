use std::io;
use std::path::PathBuf;

use micro_exchange::protocol::{ExchangeError, ServerError};
use micro_pipeline::CallError;
use thiserror::Error;

/// Failure while adapting an exchange.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("blocking stream adapter `{operation}` requested on an I/O thread")]
    BlockingOnIoThread { operation: &'static str },

    #[error("exchange error: {source}")]
    Exchange {
        #[from]
        source: ExchangeError,
    },
}

impl BridgeError {
    pub fn blocking_on_io_thread(operation: &'static str) -> Self {
        Self::BlockingOnIoThread { operation }
    }
}

impl From<BridgeError> for CallError {
    fn from(e: BridgeError) -> Self {
        CallError::engine(e)
    }
}

/// Failure while starting an engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid engine configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("can't read tls material {}: {source}", .path.display())]
    TlsMaterial { path: PathBuf, source: io::Error },

    #[error("engine is already running")]
    AlreadyStarted,

    #[error("server error: {source}")]
    Server {
        #[from]
        source: ServerError,
    },
}

impl EngineError {
    pub fn invalid_config<S: ToString>(str: S) -> Self {
        Self::InvalidConfig { reason: str.to_string() }
    }
}
