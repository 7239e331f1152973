use std::error::Error;
use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Error type crossing the application boundary.
pub type BoxError = Box<dyn Error + Send + Sync>;

/// Why a byte channel stopped.
///
/// The first cause recorded on a channel is the one both ends observe.
#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,

    #[error("channel cancelled: {reason}")]
    Cancelled { reason: String },

    #[error("io error: {source}")]
    Io { source: Arc<io::Error> },
}

impl ChannelError {
    pub fn cancelled<S: ToString>(str: S) -> Self {
        Self::Cancelled { reason: str.to_string() }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: Arc::new(e.into()) }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ChannelError::Cancelled { .. })
    }
}

impl From<io::Error> for ChannelError {
    fn from(e: io::Error) -> Self {
        Self::io(e)
    }
}

impl From<ChannelError> for io::Error {
    fn from(e: ChannelError) -> Self {
        match e {
            ChannelError::Closed => io::Error::from(io::ErrorKind::BrokenPipe),
            ChannelError::Cancelled { reason } => io::Error::new(io::ErrorKind::Interrupted, reason),
            ChannelError::Io { source } => io::Error::new(source.kind(), source.to_string()),
        }
    }
}

/// Misuse of, or failure behind, an [`ApplicationCall`](crate::ApplicationCall).
#[derive(Debug, Error)]
pub enum CallError {
    #[error("request body has already been consumed")]
    BodyConsumed,

    #[error("response has already been committed")]
    AlreadyCommitted,

    #[error("response has been upgraded")]
    AlreadyUpgraded,

    #[error("channel error: {source}")]
    Channel {
        #[from]
        source: ChannelError,
    },

    #[error("response body error: {reason}")]
    Body { reason: String },

    #[error("engine error: {reason}")]
    Engine { reason: String },
}

impl CallError {
    pub fn body<S: ToString>(str: S) -> Self {
        Self::Body { reason: str.to_string() }
    }

    pub fn engine<S: ToString>(str: S) -> Self {
        Self::Engine { reason: str.to_string() }
    }
}
