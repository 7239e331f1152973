use std::io::{self, ErrorKind, Read};

use bytes::{Buf, Bytes};
use tokio::sync::mpsc;

use crate::protocol::{ExchangeError, ParseError, PayloadSize};
use crate::runtime::is_io_thread;

pub(crate) type BodyReceiver = mpsc::Receiver<Result<Bytes, ParseError>>;

/// The request body of one exchange, fed by the connection driver on demand.
#[derive(Debug)]
pub struct RequestBody {
    receiver: Option<BodyReceiver>,
    payload_size: PayloadSize,
}

impl RequestBody {
    pub(crate) fn empty() -> Self {
        Self { receiver: None, payload_size: PayloadSize::Empty }
    }

    pub(crate) fn streaming(receiver: BodyReceiver, payload_size: PayloadSize) -> Self {
        Self { receiver: Some(receiver), payload_size }
    }

    pub fn payload_size(&self) -> PayloadSize {
        self.payload_size
    }

    /// Next body chunk, `None` at the end of the body.
    pub async fn chunk(&mut self) -> Option<Result<Bytes, ParseError>> {
        let chunk = self.receiver.as_mut()?.recv().await;
        if !matches!(chunk, Some(Ok(_))) {
            self.receiver = None;
        }
        chunk
    }

    /// A blocking reader over the body. Refused on I/O threads.
    pub fn into_blocking(self) -> Result<ExchangeInputStream, ExchangeError> {
        if is_io_thread() {
            return Err(ExchangeError::blocking_on_io_thread("request body read"));
        }
        Ok(ExchangeInputStream { receiver: self.receiver, current: Bytes::new() })
    }
}

/// Blocking [`Read`] over a [`RequestBody`].
///
/// Must be used from a thread that is allowed to block, never from inside an async task.
#[derive(Debug)]
pub struct ExchangeInputStream {
    receiver: Option<BodyReceiver>,
    current: Bytes,
}

impl Read for ExchangeInputStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        while self.current.is_empty() {
            let Some(receiver) = self.receiver.as_mut() else {
                return Ok(0);
            };
            match receiver.blocking_recv() {
                Some(Ok(bytes)) => self.current = bytes,
                Some(Err(e)) => {
                    self.receiver = None;
                    return Err(io::Error::new(ErrorKind::InvalidData, e));
                }
                None => self.receiver = None,
            }
        }

        let len = buf.len().min(self.current.len());
        buf[..len].copy_from_slice(&self.current[..len]);
        self.current.advance(len);
        Ok(len)
    }
}
