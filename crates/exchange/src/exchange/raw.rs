use std::fmt;
use std::io::{self, ErrorKind, Read, Write};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::protocol::ExchangeError;
use crate::runtime::is_io_thread;

pub(crate) type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The socket of an upgraded connection, with HTTP framing removed.
///
/// `read_ahead` holds bytes the client sent after the upgrade request that were already
/// buffered by the HTTP decoder; they are returned before anything read from the socket.
pub struct RawConnection {
    reader: BoxReader,
    writer: BoxWriter,
    read_ahead: Bytes,
    io: Handle,
    closer: CancellationToken,
}

impl fmt::Debug for RawConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawConnection").field("read_ahead", &self.read_ahead.len()).finish_non_exhaustive()
    }
}

impl RawConnection {
    pub(crate) fn new(reader: BoxReader, writer: BoxWriter, read_ahead: Bytes, io: Handle) -> Self {
        Self { reader, writer, read_ahead, io, closer: CancellationToken::new() }
    }

    /// Cancelling this token unblocks both halves: pending reads see end of stream and
    /// pending writes fail with `BrokenPipe`.
    pub fn closer(&self) -> CancellationToken {
        self.closer.clone()
    }

    /// Splits into blocking halves. Refused on I/O threads.
    pub fn into_blocking(self) -> Result<(RawReader, RawWriter), ExchangeError> {
        if is_io_thread() {
            error!("raw connection opened for blocking use on an I/O thread");
            return Err(ExchangeError::blocking_on_io_thread("raw connection"));
        }

        let reader = RawReader {
            reader: self.reader,
            read_ahead: self.read_ahead,
            io: self.io.clone(),
            closer: self.closer.clone(),
        };
        let writer = RawWriter { writer: self.writer, io: self.io, closer: self.closer };
        Ok((reader, writer))
    }
}

/// Blocking reader half of a [`RawConnection`].
pub struct RawReader {
    reader: BoxReader,
    read_ahead: Bytes,
    io: Handle,
    closer: CancellationToken,
}

impl fmt::Debug for RawReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawReader").field("read_ahead", &self.read_ahead.len()).finish_non_exhaustive()
    }
}

impl Read for RawReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.read_ahead.is_empty() {
            let len = buf.len().min(self.read_ahead.len());
            buf[..len].copy_from_slice(&self.read_ahead[..len]);
            self.read_ahead.advance(len);
            return Ok(len);
        }

        let Self { reader, io, closer, .. } = self;
        io.block_on(async {
            tokio::select! {
                biased;
                () = closer.cancelled() => Ok(0),
                result = reader.read(buf) => result,
            }
        })
    }
}

/// Blocking writer half of a [`RawConnection`].
pub struct RawWriter {
    writer: BoxWriter,
    io: Handle,
    closer: CancellationToken,
}

impl fmt::Debug for RawWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawWriter").finish_non_exhaustive()
    }
}

impl RawWriter {
    /// Shuts the write side of the socket down.
    pub fn shutdown(&mut self) -> io::Result<()> {
        let Self { writer, io, closer } = self;
        let result = io.block_on(async {
            tokio::select! {
                biased;
                () = closer.cancelled() => Ok(()),
                result = writer.shutdown() => result,
            }
        });
        if let Err(e) = &result {
            debug!(cause = %e, "raw connection shutdown failed");
        }
        result
    }
}

impl Write for RawWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let Self { writer, io, closer } = self;
        io.block_on(async {
            tokio::select! {
                biased;
                () = closer.cancelled() => Err(io::Error::from(ErrorKind::BrokenPipe)),
                result = writer.write(buf) => result,
            }
        })
    }

    fn flush(&mut self) -> io::Result<()> {
        let Self { writer, io, closer } = self;
        io.block_on(async {
            tokio::select! {
                biased;
                () = closer.cancelled() => Err(io::Error::from(ErrorKind::BrokenPipe)),
                result = writer.flush() => result,
            }
        })
    }
}
