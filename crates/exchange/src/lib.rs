//! An event-driven HTTP/1.1 server that hands every request to its handler as an
//! [`Exchange`](exchange::Exchange).
//!
//! The server runs two thread pools. The I/O pool accepts connections, performs TLS handshakes
//! and parses requests; handlers are invoked there and must not block. The worker pool is
//! where handlers [`dispatch`](exchange::Exchange::dispatch) anything that may block, such as
//! reading the request body through [`ExchangeInputStream`](exchange::ExchangeInputStream) or
//! writing the response through [`ExchangeOutputStream`](exchange::ExchangeOutputStream).
//!
//! # Architecture
//!
//! - [`server`]: listeners, TLS, runtimes and accept loops
//! - [`connection`]: the per-connection request loop
//! - [`exchange`]: the exchange handle, its blocking streams and upgrade takeover
//! - [`handler`]: the [`ExchangeHandler`](handler::ExchangeHandler) callback contract
//! - [`codec`]: HTTP/1.1 request decoding and response encoding
//! - [`protocol`]: heads, body frames and error types
//!
//! # Limitations
//!
//! - HTTP/1.1 only
//! - Maximum header size: 8KB
//! - Maximum number of headers: 64

pub mod codec;
pub mod connection;
pub mod exchange;
pub mod handler;
pub mod protocol;
pub mod server;

mod date;
mod runtime;
mod utils;

pub use runtime::is_io_thread;
pub(crate) use utils::ensure;
