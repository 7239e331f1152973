//! Response encoding: a head followed by body frames framed per its [`PayloadSize`].

use std::io::{self, ErrorKind};

use bytes::{Buf, BytesMut};
use tokio_util::codec::Encoder;
use tracing::error;

use crate::codec::body::PayloadEncoder;
use crate::codec::header::HeaderEncoder;
use crate::protocol::{Message, PayloadSize, ResponseHead, SendError};

#[derive(Debug, Default)]
pub struct ResponseEncoder {
    header_encoder: HeaderEncoder,
    payload_encoder: Option<PayloadEncoder>,
}

impl ResponseEncoder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<D: Buf> Encoder<Message<(ResponseHead, PayloadSize), D>> for ResponseEncoder {
    type Error = SendError;

    fn encode(&mut self, item: Message<(ResponseHead, PayloadSize), D>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            Message::Header((head, payload_size)) => {
                if self.payload_encoder.is_some() {
                    error!("expect payload item but receive response head");
                    return Err(io::Error::from(ErrorKind::InvalidInput).into());
                }

                let payload_encoder = PayloadEncoder::from(payload_size);
                if !payload_encoder.is_finish() {
                    self.payload_encoder = Some(payload_encoder);
                }
                self.header_encoder.encode((head, payload_size), dst)
            }

            Message::Payload(payload_item) => {
                let Some(payload_encoder) = &mut self.payload_encoder else {
                    // a finished body tolerates its trailing Eof
                    if payload_item.is_eof() {
                        return Ok(());
                    }
                    error!("expect response header but receive payload item");
                    return Err(io::Error::from(ErrorKind::InvalidInput).into());
                };

                let is_eof = payload_item.is_eof();
                let result = payload_encoder.encode(payload_item, dst);
                if is_eof || payload_encoder.is_finish() {
                    self.payload_encoder = None;
                }
                result
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PayloadItem;
    use bytes::Bytes;
    use http::Response;

    #[test]
    fn payload_before_head_is_rejected() {
        let mut encoder = ResponseEncoder::new();
        let mut dst = BytesMut::new();
        let item: Message<(ResponseHead, PayloadSize)> = Message::Payload(PayloadItem::Chunk(Bytes::from_static(b"x")));
        assert!(encoder.encode(item, &mut dst).is_err());
    }

    #[test]
    fn encoder_is_reusable_after_eof() {
        let mut encoder = ResponseEncoder::new();
        let mut dst = BytesMut::new();

        for _ in 0..2 {
            let head = Response::builder().status(200).body(()).unwrap();
            encoder.encode(Message::<_, Bytes>::Header((head, PayloadSize::Chunked)), &mut dst).unwrap();
            encoder.encode(Message::<(ResponseHead, PayloadSize)>::from(Bytes::from_static(b"abc")), &mut dst).unwrap();
            encoder.encode(Message::<(ResponseHead, PayloadSize)>::Payload(PayloadItem::Eof), &mut dst).unwrap();
        }

        let text = String::from_utf8(dst.to_vec()).unwrap();
        assert_eq!(text.matches("3\r\nabc\r\n0\r\n\r\n").count(), 2);
    }
}
