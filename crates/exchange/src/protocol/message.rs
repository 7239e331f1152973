use bytes::{Buf, Bytes};
use http::HeaderMap;
use http::header::CONTENT_LENGTH;

/// A decoded or encodable HTTP/1.1 message unit.
///
/// `T` is the head type (request head when decoding, response head when encoding);
/// payload frames follow the head until [`PayloadItem::Eof`].
#[derive(Debug)]
pub enum Message<T, Data: Buf = Bytes> {
    Header(T),
    Payload(PayloadItem<Data>),
}

/// One frame of a message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadItem<Data: Buf = Bytes> {
    Chunk(Data),
    Eof,
}

/// How the body of a message is framed on the wire.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PayloadSize {
    /// `Content-Length: n`
    Length(u64),
    /// `Transfer-Encoding: chunked`
    Chunked,
    /// No body at all
    Empty,
}

impl PayloadSize {
    #[inline]
    pub fn is_empty(&self) -> bool {
        matches!(self, PayloadSize::Empty)
    }

    /// Picks the framing for a response body from the headers the application set.
    ///
    /// A parseable `Content-Length` wins, anything else streams chunked.
    pub fn for_response(headers: &HeaderMap) -> Self {
        let declared = headers
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok());

        match declared {
            Some(0) => PayloadSize::Empty,
            Some(length) => PayloadSize::Length(length),
            None => PayloadSize::Chunked,
        }
    }
}

impl<T> Message<T> {
    /// The body frame, `None` for a head.
    pub fn into_payload_item(self) -> Option<PayloadItem> {
        match self {
            Message::Header(_) => None,
            Message::Payload(item) => Some(item),
        }
    }
}

impl<T> From<Bytes> for Message<T> {
    fn from(bytes: Bytes) -> Self {
        Self::Payload(PayloadItem::Chunk(bytes))
    }
}

impl<D: Buf> PayloadItem<D> {
    #[inline]
    pub fn is_eof(&self) -> bool {
        matches!(self, PayloadItem::Eof)
    }
}

impl PayloadItem {
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            PayloadItem::Chunk(bytes) => Some(bytes),
            PayloadItem::Eof => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn response_framing_follows_content_length() {
        let mut headers = HeaderMap::new();
        assert_eq!(PayloadSize::for_response(&headers), PayloadSize::Chunked);

        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("12"));
        assert_eq!(PayloadSize::for_response(&headers), PayloadSize::Length(12));

        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
        assert_eq!(PayloadSize::for_response(&headers), PayloadSize::Empty);

        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("twelve"));
        assert_eq!(PayloadSize::for_response(&headers), PayloadSize::Chunked);
    }
}
