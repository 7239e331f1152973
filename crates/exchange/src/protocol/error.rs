use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Failure while serving one connection.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request error: {source}")]
    RequestError {
        #[from]
        source: ParseError,
    },

    #[error("response error: {source}")]
    ResponseError {
        #[from]
        source: SendError,
    },
}

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("header size too large, current: {current_size} exceed the limit {max_size}")]
    TooLargeHeader { current_size: usize, max_size: usize },

    #[error("header number exceed the limit {max_num}")]
    TooManyHeaders { max_num: usize },

    #[error("invalid header: {reason}")]
    InvalidHeader { reason: String },

    #[error("invalid http version: {0:?}")]
    InvalidVersion(Option<u8>),

    #[error("invalid http method")]
    InvalidMethod,

    #[error("invalid http uri")]
    InvalidUri,

    #[error("invalid content-length header: {reason}")]
    InvalidContentLength { reason: String },

    #[error("invalid body: {reason}")]
    InvalidBody { reason: String },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl ParseError {
    pub fn too_large_header(current_size: usize, max_size: usize) -> Self {
        Self::TooLargeHeader { current_size, max_size }
    }

    pub fn too_many_headers(max_num: usize) -> Self {
        Self::TooManyHeaders { max_num }
    }

    pub fn invalid_header<S: ToString>(str: S) -> Self {
        Self::InvalidHeader { reason: str.to_string() }
    }

    pub fn invalid_body<S: ToString>(str: S) -> Self {
        Self::InvalidBody { reason: str.to_string() }
    }

    pub fn invalid_content_length<S: ToString>(str: S) -> Self {
        Self::InvalidContentLength { reason: str.to_string() }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }
}

#[derive(Error, Debug)]
pub enum SendError {
    #[error("invalid body: {reason}")]
    InvalidBody { reason: String },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl SendError {
    pub fn invalid_body<S: ToString>(str: S) -> Self {
        Self::InvalidBody { reason: str.to_string() }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }
}

/// Misuse of, or failure behind, an [`Exchange`](crate::exchange::Exchange) primitive.
#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error("blocking operation `{operation}` attempted on an I/O thread")]
    BlockingOnIoThread { operation: &'static str },

    #[error("exchange is not in blocking mode, call start_blocking first")]
    NotBlocking,

    #[error("the {stream} stream has already been taken")]
    StreamTaken { stream: &'static str },

    #[error("response has already started")]
    ResponseStarted,

    #[error("connection closed before the exchange could complete")]
    ConnectionClosed,
}

impl ExchangeError {
    pub fn blocking_on_io_thread(operation: &'static str) -> Self {
        Self::BlockingOnIoThread { operation }
    }

    pub fn stream_taken(stream: &'static str) -> Self {
        Self::StreamTaken { stream }
    }
}

/// Failure while building, starting or stopping a [`Server`](crate::server::Server).
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("invalid server configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("failed to resolve listener address {address}")]
    Resolve { address: String },

    #[error("failed to bind {address}: {source}")]
    Bind { address: SocketAddr, source: io::Error },

    #[error("invalid tls material: {reason}")]
    Tls { reason: String },

    #[error("failed to build {name} runtime: {source}")]
    Runtime { name: &'static str, source: io::Error },

    #[error("server has already been started")]
    AlreadyStarted,

    #[error("server has been stopped")]
    Stopped,
}

impl ServerError {
    pub fn invalid_config<S: ToString>(str: S) -> Self {
        Self::InvalidConfig { reason: str.to_string() }
    }

    pub fn tls<S: ToString>(str: S) -> Self {
        Self::Tls { reason: str.to_string() }
    }
}
