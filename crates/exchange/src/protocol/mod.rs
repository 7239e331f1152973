//! HTTP/1.1 protocol types shared by the codec, the connection driver and the exchange.
//!
//! - [`Message`], [`PayloadItem`] and [`PayloadSize`] describe heads and body frames
//! - [`RequestHeader`] and [`ResponseHead`] are the parsed/encodable heads
//! - [`HttpError`], [`ParseError`], [`SendError`] cover the wire,
//!   [`ExchangeError`] covers exchange misuse and [`ServerError`] the server lifecycle

mod message;
pub use message::Message;
pub use message::PayloadItem;
pub use message::PayloadSize;

mod request;
pub use request::RequestHeader;

mod response;
pub use response::ResponseHead;

mod error;
pub use error::ExchangeError;
pub use error::HttpError;
pub use error::ParseError;
pub use error::SendError;
pub use error::ServerError;
