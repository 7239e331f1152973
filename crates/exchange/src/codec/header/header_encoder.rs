//! Response head encoding.
//!
//! Writes the status line and headers, filling in `Date` when the application did not set one
//! and making `Content-Length`/`Transfer-Encoding` agree with the chosen [`PayloadSize`].

use std::io::{self, ErrorKind, Write};

use bytes::{BufMut, BytesMut};
use http::header::{CONTENT_LENGTH, DATE, TRANSFER_ENCODING};
use http::{HeaderValue, StatusCode, Version};
use tokio_util::codec::Encoder;
use tracing::error;

use crate::date::http_date;
use crate::protocol::{PayloadSize, ResponseHead, SendError};

/// Initial buffer size allocated for header serialization
const INIT_HEADER_SIZE: usize = 4 * 1024;

#[derive(Debug, Default)]
pub struct HeaderEncoder;

impl Encoder<(ResponseHead, PayloadSize)> for HeaderEncoder {
    type Error = SendError;

    fn encode(&mut self, item: (ResponseHead, PayloadSize), dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (mut head, payload_size) = item;

        dst.reserve(INIT_HEADER_SIZE);
        match head.version() {
            Version::HTTP_11 | Version::HTTP_10 => {
                let status = head.status();
                write!((&mut *dst).writer(), "HTTP/1.1 {} {}\r\n", status.as_str(), status.canonical_reason().unwrap_or(""))?;
            }
            v => {
                error!(http_version = ?v, "unsupported http version");
                return Err(io::Error::from(ErrorKind::Unsupported).into());
            }
        }

        let headers = head.headers_mut();
        if !headers.contains_key(DATE) {
            headers.insert(DATE, http_date());
        }

        // informational and 204 responses never carry framing headers
        if has_framing(head.status()) {
            let headers = head.headers_mut();
            match payload_size {
                PayloadSize::Length(n) => {
                    headers.remove(TRANSFER_ENCODING);
                    headers.insert(CONTENT_LENGTH, n.into());
                }
                PayloadSize::Chunked => {
                    headers.remove(CONTENT_LENGTH);
                    headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
                }
                PayloadSize::Empty => {
                    headers.remove(TRANSFER_ENCODING);
                    headers.insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
                }
            }
        }

        for (header_name, header_value) in head.headers() {
            dst.put_slice(header_name.as_ref());
            dst.put_slice(b": ");
            dst.put_slice(header_value.as_ref());
            dst.put_slice(b"\r\n");
        }
        dst.put_slice(b"\r\n");
        Ok(())
    }
}

fn has_framing(status: StatusCode) -> bool {
    !(status.is_informational() || status == StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Response;

    fn encode(head: ResponseHead, payload_size: PayloadSize) -> String {
        let mut dst = BytesMut::new();
        HeaderEncoder.encode((head, payload_size), &mut dst).unwrap();
        String::from_utf8(dst.to_vec()).unwrap()
    }

    #[test]
    fn chunked_replaces_stale_length() {
        let head = Response::builder().status(200).header("content-length", "5").header("x-a", "1").body(()).unwrap();
        let text = encode(head, PayloadSize::Chunked);

        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("transfer-encoding: chunked\r\n"));
        assert!(text.contains("x-a: 1\r\n"));
        assert!(text.contains("date: "));
        assert!(!text.contains("content-length"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn switching_protocols_has_no_framing() {
        let head = Response::builder().status(101).header("upgrade", "test-protocol").body(()).unwrap();
        let text = encode(head, PayloadSize::Empty);

        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(text.contains("upgrade: test-protocol\r\n"));
        assert!(!text.contains("content-length"));
        assert!(!text.contains("transfer-encoding"));
    }

    #[test]
    fn keeps_application_date() {
        let head = Response::builder().status(404).header("date", "Thu, 01 Jan 1970 00:00:00 GMT").body(()).unwrap();
        let text = encode(head, PayloadSize::Empty);

        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.contains("date: Thu, 01 Jan 1970 00:00:00 GMT\r\n"));
        assert!(text.contains("content-length: 0\r\n"));
    }
}
