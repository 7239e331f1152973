//! Streaming request decoding: one head, then body frames until [`PayloadItem::Eof`].

use bytes::BytesMut;
use tokio_util::codec::Decoder;

use crate::codec::body::PayloadDecoder;
use crate::codec::header::HeaderDecoder;
use crate::protocol::{Message, ParseError, PayloadItem, PayloadSize, RequestHeader};

/// Alternates between head parsing and body parsing.
///
/// While `payload_decoder` is `None` the next bytes are expected to be a request head. A head
/// without a body is not followed by any payload frame.
#[derive(Debug, Default)]
pub struct RequestDecoder {
    header_decoder: HeaderDecoder,
    payload_decoder: Option<PayloadDecoder>,
}

impl RequestDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a body is still being decoded.
    pub fn in_body(&self) -> bool {
        self.payload_decoder.is_some()
    }
}

impl Decoder for RequestDecoder {
    type Item = Message<(RequestHeader, PayloadSize)>;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(payload_decoder) = &mut self.payload_decoder {
            let item = payload_decoder.decode(src)?;
            if item.as_ref().is_some_and(PayloadItem::is_eof) {
                self.payload_decoder = None;
            }
            return Ok(item.map(Message::Payload));
        }

        Ok(self.header_decoder.decode(src)?.map(|(header, payload_size)| {
            if !payload_size.is_empty() {
                self.payload_decoder = Some(payload_size.into());
            }
            Message::Header((header, payload_size))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    #[test]
    fn pipelined_requests_decode_in_order() {
        let str = indoc! {r##"
        POST /a HTTP/1.1
        Content-Length: 2

        okGET /b HTTP/1.1

        "##};
        let mut bytes = BytesMut::from(str);
        let mut decoder = RequestDecoder::new();

        let Some(Message::Header((first, PayloadSize::Length(2)))) = decoder.decode(&mut bytes).unwrap() else {
            panic!("expected first head");
        };
        assert_eq!(first.uri().path(), "/a");
        assert!(decoder.in_body());

        let chunk = decoder.decode(&mut bytes).unwrap().and_then(Message::into_payload_item).unwrap();
        assert_eq!(chunk.as_bytes().unwrap().as_ref(), b"ok");
        let eof = decoder.decode(&mut bytes).unwrap().and_then(Message::into_payload_item).unwrap();
        assert!(eof.is_eof());
        assert!(!decoder.in_body());

        let Some(Message::Header((second, PayloadSize::Empty))) = decoder.decode(&mut bytes).unwrap() else {
            panic!("expected second head");
        };
        assert_eq!(second.uri().path(), "/b");
        assert!(!decoder.in_body());
        assert!(decoder.decode(&mut bytes).unwrap().is_none());
    }
}
