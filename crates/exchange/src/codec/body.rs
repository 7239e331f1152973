//! Body framing: `Content-Length` and `Transfer-Encoding: chunked`, in both directions.

use std::cmp;
use std::io::Write;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{trace, warn};

use crate::protocol::{ParseError, PayloadItem, PayloadSize, SendError};

/// Largest trailer section accepted after the last chunk.
const MAX_TRAILER_BYTES: usize = 8 * 1024;

/// Decodes the body that follows one request head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadDecoder {
    Length(u64),
    Chunked(ChunkedDecoder),
    Empty,
}

impl From<PayloadSize> for PayloadDecoder {
    fn from(size: PayloadSize) -> Self {
        match size {
            PayloadSize::Length(length) => PayloadDecoder::Length(length),
            PayloadSize::Chunked => PayloadDecoder::Chunked(ChunkedDecoder::default()),
            PayloadSize::Empty => PayloadDecoder::Empty,
        }
    }
}

impl Decoder for PayloadDecoder {
    type Item = PayloadItem;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self {
            PayloadDecoder::Empty | PayloadDecoder::Length(0) => Ok(Some(PayloadItem::Eof)),
            PayloadDecoder::Length(remaining) => {
                if src.is_empty() {
                    return Ok(None);
                }
                let len = cmp::min(*remaining, src.len() as u64) as usize;
                *remaining -= len as u64;
                Ok(Some(PayloadItem::Chunk(src.split_to(len).freeze())))
            }
            PayloadDecoder::Chunked(chunked) => chunked.decode(src),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum ChunkedState {
    #[default]
    Size,
    Data(u64),
    DataEnd,
    Trailers,
    Done,
}

/// Chunked body decoder, sizes are parsed with [`httparse::parse_chunk_size`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChunkedDecoder {
    state: ChunkedState,
}

impl Decoder for ChunkedDecoder {
    type Item = PayloadItem;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state {
                ChunkedState::Size => match httparse::parse_chunk_size(src) {
                    Ok(httparse::Status::Complete((consumed, 0))) => {
                        src.advance(consumed);
                        self.state = ChunkedState::Trailers;
                    }
                    Ok(httparse::Status::Complete((consumed, size))) => {
                        src.advance(consumed);
                        self.state = ChunkedState::Data(size);
                    }
                    Ok(httparse::Status::Partial) => return Ok(None),
                    Err(_) => return Err(ParseError::invalid_body("invalid chunk size line")),
                },

                ChunkedState::Data(remaining) => {
                    if src.is_empty() {
                        return Ok(None);
                    }
                    let len = cmp::min(remaining, src.len() as u64) as usize;
                    let left = remaining - len as u64;
                    self.state = if left == 0 { ChunkedState::DataEnd } else { ChunkedState::Data(left) };
                    trace!(len, "read chunked bytes");
                    return Ok(Some(PayloadItem::Chunk(src.split_to(len).freeze())));
                }

                ChunkedState::DataEnd => {
                    if src.len() < 2 {
                        return Ok(None);
                    }
                    if &src[..2] != b"\r\n" {
                        return Err(ParseError::invalid_body("missing CRLF after chunk data"));
                    }
                    src.advance(2);
                    self.state = ChunkedState::Size;
                }

                ChunkedState::Trailers => {
                    // trailer fields are discarded, the section ends with an empty line
                    let Some(line_end) = src.windows(2).position(|w| w == b"\r\n") else {
                        if src.len() > MAX_TRAILER_BYTES {
                            return Err(ParseError::invalid_body("trailer section too large"));
                        }
                        return Ok(None);
                    };
                    src.advance(line_end + 2);
                    if line_end == 0 {
                        self.state = ChunkedState::Done;
                    }
                }

                ChunkedState::Done => {
                    trace!("finished reading chunked data");
                    return Ok(Some(PayloadItem::Eof));
                }
            }
        }
    }
}

/// Encodes the body of one response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadEncoder {
    Length(u64),
    Chunked { eof: bool },
    Empty,
}

impl From<PayloadSize> for PayloadEncoder {
    fn from(size: PayloadSize) -> Self {
        match size {
            PayloadSize::Length(length) => PayloadEncoder::Length(length),
            PayloadSize::Chunked => PayloadEncoder::Chunked { eof: false },
            PayloadSize::Empty => PayloadEncoder::Empty,
        }
    }
}

impl PayloadEncoder {
    pub fn is_finish(&self) -> bool {
        match self {
            PayloadEncoder::Length(remaining) => *remaining == 0,
            PayloadEncoder::Chunked { eof } => *eof,
            PayloadEncoder::Empty => true,
        }
    }
}

impl<D: Buf> Encoder<PayloadItem<D>> for PayloadEncoder {
    type Error = SendError;

    fn encode(&mut self, item: PayloadItem<D>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match (self, item) {
            (PayloadEncoder::Empty, _) => Ok(()),

            (PayloadEncoder::Length(remaining), PayloadItem::Chunk(mut bytes)) => {
                let len = bytes.remaining() as u64;
                if len > *remaining {
                    warn!(len, remaining = *remaining, "body exceeds declared content-length");
                    return Err(SendError::invalid_body("body exceeds declared content-length"));
                }
                while bytes.has_remaining() {
                    let chunk = bytes.chunk();
                    let n = chunk.len();
                    dst.extend_from_slice(chunk);
                    bytes.advance(n);
                }
                *remaining -= len;
                Ok(())
            }
            (PayloadEncoder::Length(remaining), PayloadItem::Eof) => {
                if *remaining != 0 {
                    return Err(SendError::invalid_body(format!("body ended {remaining} bytes short of content-length")));
                }
                Ok(())
            }

            (PayloadEncoder::Chunked { eof: true }, _) => Ok(()),
            (PayloadEncoder::Chunked { .. }, PayloadItem::Chunk(mut bytes)) => {
                if !bytes.has_remaining() {
                    return Ok(());
                }
                write!((&mut *dst).writer(), "{:X}\r\n", bytes.remaining())?;
                dst.reserve(bytes.remaining() + 2);
                while bytes.has_remaining() {
                    let chunk = bytes.chunk();
                    let n = chunk.len();
                    dst.extend_from_slice(chunk);
                    bytes.advance(n);
                }
                dst.extend_from_slice(b"\r\n");
                Ok(())
            }
            (PayloadEncoder::Chunked { eof }, PayloadItem::Eof) => {
                *eof = true;
                dst.extend_from_slice(b"0\r\n\r\n");
                Ok(())
            }
        }
    }
}
