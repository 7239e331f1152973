use std::io::{self, ErrorKind, Write};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http::header::CONTENT_LENGTH;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::{ResponseFrame, ResponseState, lock};
use crate::protocol::{ExchangeError, PayloadSize};

/// Blocking [`Write`] for the response body.
///
/// The first write commits status and headers: a `Content-Length` set by the application
/// selects fixed-length framing, anything else streams chunked. Closing without writing sends
/// an empty body. Each write is handed to the connection driver as one frame, so the bounded
/// frame channel throttles a writer that outpaces the socket.
#[derive(Debug)]
pub struct ExchangeOutputStream {
    response: Arc<Mutex<ResponseState>>,
    frames: mpsc::Sender<ResponseFrame>,
    framing: Option<PayloadSize>,
    written: u64,
    closed: bool,
}

impl ExchangeOutputStream {
    pub(crate) fn new(response: Arc<Mutex<ResponseState>>, frames: mpsc::Sender<ResponseFrame>) -> Self {
        Self { response, frames, framing: None, written: 0, closed: false }
    }

    /// Finishes the body. Closing twice is a no-op.
    pub fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.commit(self.written == 0)?;
        self.send(ResponseFrame::End)
    }

    /// Gives up on the body without finishing it. The exchange is expected to be aborted.
    pub fn abandon(&mut self) {
        if !self.closed {
            trace!(written = self.written, "response body abandoned");
        }
        self.closed = true;
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    fn commit(&mut self, nothing_written: bool) -> io::Result<PayloadSize> {
        if let Some(payload_size) = self.framing {
            return Ok(payload_size);
        }

        let committed = lock(&self.response).commit(|headers| {
            if nothing_written && !headers.contains_key(CONTENT_LENGTH) {
                PayloadSize::Empty
            } else {
                PayloadSize::for_response(headers)
            }
        });
        let Some((head, payload_size)) = committed else {
            return Err(io::Error::other(ExchangeError::ResponseStarted));
        };

        trace!(status = %head.status(), ?payload_size, "committing response head");
        self.send(ResponseFrame::Head(head, payload_size))?;
        self.framing = Some(payload_size);
        Ok(payload_size)
    }

    fn send(&self, frame: ResponseFrame) -> io::Result<()> {
        self.frames.blocking_send(frame).map_err(|_e| io::Error::from(ErrorKind::BrokenPipe))
    }
}

impl Write for ExchangeOutputStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::Error::from(ErrorKind::BrokenPipe));
        }
        if buf.is_empty() {
            return Ok(0);
        }

        if self.commit(false)?.is_empty() {
            return Err(io::Error::new(ErrorKind::InvalidInput, "response declared an empty body"));
        }
        self.send(ResponseFrame::Chunk(Bytes::copy_from_slice(buf)))?;
        self.written += buf.len() as u64;
        Ok(buf.len())
    }

    /// Every write is already a frame of its own, there is nothing to flush here.
    fn flush(&mut self) -> io::Result<()> {
        if self.closed {
            return Err(io::Error::from(ErrorKind::BrokenPipe));
        }
        Ok(())
    }
}

impl Drop for ExchangeOutputStream {
    fn drop(&mut self) {
        if self.closed || self.framing.is_none() {
            return;
        }
        if let Err(e) = self.frames.try_send(ResponseFrame::End) {
            debug!(cause = %e, "can't finish response body on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn stream() -> (ExchangeOutputStream, mpsc::Receiver<ResponseFrame>, Arc<Mutex<ResponseState>>) {
        let (tx, rx) = mpsc::channel(8);
        let state = Arc::new(Mutex::new(ResponseState::new()));
        (ExchangeOutputStream::new(Arc::clone(&state), tx), rx, state)
    }

    #[test]
    fn abandoned_stream_sends_no_end() {
        let (mut output, mut rx, _state) = stream();
        output.write_all(b"partial").unwrap();
        output.abandon();
        assert!(output.write(b"more").is_err());
        drop(output);

        assert!(matches!(rx.try_recv().unwrap(), ResponseFrame::Head(..)));
        assert!(matches!(rx.try_recv().unwrap(), ResponseFrame::Chunk(_)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn first_write_commits_chunked_head() {
        let (mut output, mut rx, state) = stream();
        output.write_all(b"abc").unwrap();
        output.close().unwrap();
        output.close().unwrap();

        assert!(matches!(rx.try_recv().unwrap(), ResponseFrame::Head(_, PayloadSize::Chunked)));
        assert!(matches!(rx.try_recv().unwrap(), ResponseFrame::Chunk(bytes) if bytes == "abc"));
        assert!(matches!(rx.try_recv().unwrap(), ResponseFrame::End));
        assert!(rx.try_recv().is_err());
        assert!(lock(&state).started);
    }

    #[test]
    fn content_length_selects_fixed_framing() {
        let (mut output, mut rx, state) = stream();
        lock(&state).headers.insert(CONTENT_LENGTH, HeaderValue::from_static("3"));

        output.write_all(b"xyz").unwrap();
        assert!(matches!(rx.try_recv().unwrap(), ResponseFrame::Head(_, PayloadSize::Length(3))));
    }

    #[test]
    fn close_without_writes_sends_empty_body() {
        let (mut output, mut rx, _state) = stream();
        output.close().unwrap();

        assert!(matches!(rx.try_recv().unwrap(), ResponseFrame::Head(_, PayloadSize::Empty)));
        assert!(matches!(rx.try_recv().unwrap(), ResponseFrame::End));
        assert!(output.write(b"late").is_err());
    }
}
