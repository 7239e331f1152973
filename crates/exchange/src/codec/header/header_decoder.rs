//! Request head decoding.
//!
//! The head is parsed with `httparse`; header names and values are then sliced out of the
//! frozen head bytes so the resulting [`HeaderMap`](http::HeaderMap) shares the read buffer
//! instead of copying every value.
//!
//! Limits: at most [`MAX_HEADER_NUM`] headers and [`MAX_HEADER_BYTES`] bytes of head.

use bytes::BytesMut;
use http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderName, HeaderValue, Request};
use httparse::{Error, Status};
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::ensure;
use crate::protocol::{ParseError, PayloadSize, RequestHeader};

/// Maximum number of headers allowed in a request
pub const MAX_HEADER_NUM: usize = 64;

/// Maximum size in bytes allowed for the entire header section
pub const MAX_HEADER_BYTES: usize = 8 * 1024;

/// Decodes one request head and decides how its body is framed.
#[derive(Debug, Default)]
pub struct HeaderDecoder;

impl Decoder for HeaderDecoder {
    type Item = (RequestHeader, PayloadSize);
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADER_NUM];
        let mut req = httparse::Request::new(&mut headers);

        let status = req.parse(src).map_err(|e| match e {
            Error::TooManyHeaders => ParseError::too_many_headers(MAX_HEADER_NUM),
            e => ParseError::invalid_header(e.to_string()),
        })?;

        let head_len = match status {
            Status::Complete(head_len) => head_len,
            Status::Partial => {
                ensure!(src.len() <= MAX_HEADER_BYTES, ParseError::too_large_header(src.len(), MAX_HEADER_BYTES));
                return Ok(None);
            }
        };

        trace!(head_len, "parsed request head");
        ensure!(head_len <= MAX_HEADER_BYTES, ParseError::too_large_header(head_len, MAX_HEADER_BYTES));

        let version = match req.version {
            Some(0) => http::Version::HTTP_10,
            Some(1) => http::Version::HTTP_11,
            other => return Err(ParseError::InvalidVersion(other)),
        };
        let method = req.method.ok_or(ParseError::InvalidMethod)?;
        let path = req.path.ok_or(ParseError::InvalidUri)?;

        // record where every name/value lives, the parser borrows `src` until we are done here
        let base = src.as_ptr() as usize;
        let ranges = req
            .headers
            .iter()
            .map(|header| {
                let name_start = header.name.as_ptr() as usize - base;
                let value_start = header.value.as_ptr() as usize - base;
                ((name_start, name_start + header.name.len()), (value_start, value_start + header.value.len()))
            })
            .collect::<Vec<_>>();

        let mut builder = Request::builder().method(method).uri(path).version(version);

        let head_bytes = src.split_to(head_len).freeze();
        if let Some(header_map) = builder.headers_mut() {
            header_map.reserve(ranges.len());
            for ((name_start, name_end), (value_start, value_end)) in ranges {
                let name = HeaderName::from_bytes(&head_bytes[name_start..name_end]).map_err(ParseError::invalid_header)?;
                let value = HeaderValue::from_maybe_shared(head_bytes.slice(value_start..value_end))
                    .map_err(ParseError::invalid_header)?;
                header_map.append(name, value);
            }
        }

        let header = RequestHeader::from(builder.body(()).map_err(|e| match e {
            e if e.is::<http::method::InvalidMethod>() => ParseError::InvalidMethod,
            e if e.is::<http::uri::InvalidUri>() => ParseError::InvalidUri,
            e => ParseError::invalid_header(e),
        })?);
        let payload_size = parse_payload(&header)?;

        Ok(Some((header, payload_size)))
    }
}

/// Body framing of a request, see RFC 9112 section 6.3.
fn parse_payload(header: &RequestHeader) -> Result<PayloadSize, ParseError> {
    let te_header = header.headers().get(TRANSFER_ENCODING);
    let cl_header = header.headers().get(CONTENT_LENGTH);

    match (te_header, cl_header) {
        (None, None) => Ok(PayloadSize::Empty),

        (Some(te_value), None) => {
            if is_chunked(te_value) {
                Ok(PayloadSize::Chunked)
            } else {
                Err(ParseError::invalid_header("transfer-encoding without a final chunked coding"))
            }
        }

        (None, Some(cl_value)) => {
            let cl_str = cl_value.to_str().map_err(ParseError::invalid_content_length)?;
            let length = cl_str
                .trim()
                .parse::<u64>()
                .map_err(|e| ParseError::invalid_content_length(format!("value {cl_str} is not u64: {e}")))?;

            Ok(if length == 0 { PayloadSize::Empty } else { PayloadSize::Length(length) })
        }

        (Some(_), Some(_)) => {
            Err(ParseError::invalid_content_length("transfer_encoding and content_length both present in headers"))
        }
    }
}

/// `chunked` has to be the last coding applied.
fn is_chunked(value: &HeaderValue) -> bool {
    value.as_bytes().rsplit(|b| *b == b',').next().is_some_and(|last| last.trim_ascii().eq_ignore_ascii_case(b"chunked"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{Method, Version};
    use indoc::indoc;

    #[test]
    fn check_is_chunked() {
        assert!(is_chunked(&HeaderValue::from_static("chunked")));
        assert!(is_chunked(&HeaderValue::from_static("gzip, chunked")));
        assert!(!is_chunked(&HeaderValue::from_static("chunked, gzip")));
        assert!(!is_chunked(&HeaderValue::from_static("gzip")));
    }

    #[test]
    fn leaves_body_bytes_in_buffer() {
        let str = indoc! {r##"
        POST /upload?name=a%20b HTTP/1.1
        Host: 127.0.0.1:8080
        Content-Length: 3
        Cookie: a=1; b=2

        123"##};

        let mut bytes = BytesMut::from(str);
        let (header, payload_size) = HeaderDecoder.decode(&mut bytes).unwrap().unwrap();

        assert_eq!(header.method(), &Method::POST);
        assert_eq!(header.version(), Version::HTTP_11);
        assert_eq!(header.uri().path(), "/upload");
        assert_eq!(header.uri().query(), Some("name=a%20b"));
        assert_eq!(header.headers().len(), 3);
        assert_eq!(payload_size, PayloadSize::Length(3));
        assert_eq!(&bytes[..], b"123");
    }

    #[test]
    fn keeps_repeated_headers_in_order() {
        let str = indoc! {r##"
        GET / HTTP/1.1
        X-Trace: first
        x-trace: second
        Accept: */*

        "##};

        let mut bytes = BytesMut::from(str);
        let (header, payload_size) = HeaderDecoder.decode(&mut bytes).unwrap().unwrap();

        let values = header.headers().get_all("X-TRACE").iter().collect::<Vec<_>>();
        assert_eq!(values, vec!["first", "second"]);
        assert_eq!(payload_size, PayloadSize::Empty);
        assert!(bytes.is_empty());
    }

    #[test]
    fn partial_head_needs_more_data() {
        let mut bytes = BytesMut::from("GET / HTTP/1.1\r\nHost: exa");
        assert!(HeaderDecoder.decode(&mut bytes).unwrap().is_none());
        assert_eq!(bytes.len(), 25);
    }

    #[test]
    fn rejects_oversized_head() {
        let mut bytes = BytesMut::from("GET / HTTP/1.1\r\nX-Big: ");
        bytes.extend_from_slice(&vec![b'a'; MAX_HEADER_BYTES]);

        assert!(matches!(HeaderDecoder.decode(&mut bytes), Err(ParseError::TooLargeHeader { .. })));
    }

    #[test]
    fn rejects_conflicting_framing() {
        let str = indoc! {r##"
        POST / HTTP/1.1
        Transfer-Encoding: chunked
        Content-Length: 3

        "##};
        let mut bytes = BytesMut::from(str);

        assert!(matches!(HeaderDecoder.decode(&mut bytes), Err(ParseError::InvalidContentLength { .. })));
    }
}
