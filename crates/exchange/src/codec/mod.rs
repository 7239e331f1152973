//! HTTP/1.1 wire codecs used by the connection driver.
//!
//! - [`RequestDecoder`] turns bytes into a request head followed by body frames
//! - [`ResponseEncoder`] turns a response head plus body frames into bytes
//!
//! Both are [`tokio_util::codec`] codecs and plug into `FramedRead`/`FramedWrite`.

mod body;
mod header;
mod request_decoder;
mod response_encoder;

pub use header::{MAX_HEADER_BYTES, MAX_HEADER_NUM};
pub use request_decoder::RequestDecoder;
pub use response_encoder::ResponseEncoder;
