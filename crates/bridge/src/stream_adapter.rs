//! Blocking streams as suspendable byte channels.
//!
//! The exchange hands out blocking [`Read`]/[`Write`] streams. Each adapter moves bytes between
//! one of them and a bounded channel from a blocking task of the [`WorkerScope`], so the async
//! side only ever suspends:
//!
//! ```text
//! source.read() --> [ chunk | chunk | .. ] --> ByteReadChannel
//! ByteWriteChannel --> [ chunk | chunk | .. ] --> sink.write_all() + flush()
//! ```
//!
//! A full channel parks the reading task, an empty one parks the writing task. I/O failures end
//! the channel with the error as its cause.

use std::io::{self, ErrorKind, Read, Write};

use bytes::Bytes;
use micro_exchange::exchange::{ExchangeOutputStream, RawWriter};
use micro_exchange::is_io_thread;
use micro_pipeline::ChannelError;
use micro_pipeline::io::{
    ByteReadChannel, ByteWriteChannel, ReadChannelProducer, WriteChannelConsumer, WriteCommand, read_channel,
    write_channel,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::{BridgeError, WorkerScope};

/// Size of the buffer each blocking read fills.
pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024;

/// Chunks a channel holds before its producer is suspended.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 8;

/// A blocking byte sink that can be finished, or given up on.
pub trait BlockingSink: Write + Send + 'static {
    /// Finishes the sink after everything was written.
    fn close(&mut self) -> io::Result<()>;

    /// Gives up without finishing, called when the channel was cancelled or failed.
    fn abandon(&mut self) {}
}

impl BlockingSink for ExchangeOutputStream {
    fn close(&mut self) -> io::Result<()> {
        ExchangeOutputStream::close(self)
    }

    fn abandon(&mut self) {
        ExchangeOutputStream::abandon(self);
    }
}

impl BlockingSink for RawWriter {
    fn close(&mut self) -> io::Result<()> {
        self.shutdown()
    }
}

/// Waits for the blocking side of a [`write_to_blocking`] adapter.
#[derive(Debug)]
pub struct WriterHandle {
    join: JoinHandle<Result<(), ChannelError>>,
}

impl WriterHandle {
    /// Resolves once the sink was closed or abandoned.
    ///
    /// Only finishes after the channel ended, close or cancel it first.
    pub async fn finish(self) -> Result<(), ChannelError> {
        self.join.await.map_err(|e| ChannelError::io(io::Error::other(e)))?
    }
}

/// Reads `source` on a blocking task of `scope` into a new channel.
pub fn read_from_blocking<R>(
    source: R,
    scope: &WorkerScope,
    buffer_size: usize,
    capacity: usize,
    token: CancellationToken,
) -> Result<ByteReadChannel, BridgeError>
where
    R: Read + Send + 'static,
{
    ensure_worker_thread("read_from_blocking")?;

    let (producer, channel) = read_channel(capacity, token);
    let buffer_size = buffer_size.max(1);
    drop(scope.spawn_blocking(move || pump(source, producer, buffer_size)));
    Ok(channel)
}

/// Drains a new channel into `sink` on a blocking task of `scope`.
pub fn write_to_blocking<S>(
    sink: S,
    scope: &WorkerScope,
    capacity: usize,
    token: CancellationToken,
) -> Result<(ByteWriteChannel, WriterHandle), BridgeError>
where
    S: BlockingSink,
{
    ensure_worker_thread("write_to_blocking")?;

    let (channel, consumer) = write_channel(capacity, token);
    let join = scope.spawn_blocking(move || drain(sink, consumer));
    Ok((channel, WriterHandle { join }))
}

fn ensure_worker_thread(operation: &'static str) -> Result<(), BridgeError> {
    if is_io_thread() {
        error!(operation, "blocking stream adapter requested on an I/O thread, dispatch to a worker first");
        return Err(BridgeError::blocking_on_io_thread(operation));
    }
    Ok(())
}

fn pump<R: Read>(mut source: R, producer: ReadChannelProducer, buffer_size: usize) {
    let mut buf = vec![0u8; buffer_size];
    loop {
        if producer.is_closed() {
            trace!("reader went away, stop pumping");
            return;
        }

        match source.read(&mut buf) {
            Ok(0) => {
                trace!("source reached end of stream");
                return;
            }
            Ok(n) => {
                if let Err(e) = producer.blocking_send(Bytes::copy_from_slice(&buf[..n])) {
                    trace!(cause = %e, "read channel closed while pumping");
                    return;
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                debug!(cause = %e, "source read failed");
                producer.fail(ChannelError::io(e));
                return;
            }
        }
    }
}

fn drain<S: BlockingSink>(mut sink: S, mut consumer: WriteChannelConsumer) -> Result<(), ChannelError> {
    loop {
        let result = match consumer.blocking_next() {
            Ok(Some(WriteCommand::Data(data))) => {
                if data.is_empty() {
                    continue;
                }
                sink.write_all(&data).and_then(|()| sink.flush())
            }
            Ok(Some(WriteCommand::Flush(ack))) => sink.flush().map(|()| {
                let _ = ack.send(());
            }),
            Ok(None) => {
                trace!("write channel ended, closing sink");
                return sink.flush().and_then(|()| sink.close()).map_err(|e| {
                    debug!(cause = %e, "closing sink failed");
                    ChannelError::io(e)
                });
            }
            Err(cause) => {
                debug!(%cause, "write channel failed, abandoning sink");
                sink.abandon();
                return Err(cause);
            }
        };

        if let Err(e) = result {
            debug!(cause = %e, "sink write failed");
            sink.abandon();
            let cause = ChannelError::io(e);
            consumer.fail(cause.clone());
            return Err(cause);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex, mpsc};
    use std::time::Duration;
    use tokio::runtime::Runtime;

    fn runtime() -> Runtime {
        tokio::runtime::Builder::new_multi_thread().worker_threads(2).enable_all().build().unwrap()
    }

    #[derive(Clone, Default)]
    struct RecordingSink {
        written: Arc<Mutex<Vec<u8>>>,
        closed: Arc<AtomicBool>,
        abandoned: Arc<AtomicBool>,
    }

    impl Write for RecordingSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl BlockingSink for RecordingSink {
        fn close(&mut self) -> io::Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn abandon(&mut self) {
            self.abandoned.store(true, Ordering::SeqCst);
        }
    }

    struct FailingSource {
        served: bool,
    }

    impl Read for FailingSource {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.served {
                return Err(io::Error::from(ErrorKind::ConnectionReset));
            }
            self.served = true;
            buf[..3].copy_from_slice(b"abc");
            Ok(3)
        }
    }

    #[test]
    fn reads_source_in_buffer_sized_chunks() {
        let rt = runtime();
        let scope = WorkerScope::new(rt.handle().clone());
        let source = Cursor::new(vec![7u8; 20_000]);

        let mut channel =
            read_from_blocking(source, &scope, DEFAULT_BUFFER_SIZE, 2, CancellationToken::new()).unwrap();

        let sizes = rt.block_on(async {
            let mut sizes = Vec::new();
            while let Some(chunk) = channel.read_chunk().await.unwrap() {
                sizes.push(chunk.len());
            }
            sizes
        });
        assert_eq!(sizes, vec![8192, 8192, 3616]);
        assert!(channel.is_closed_for_read());
    }

    #[test]
    fn read_failure_becomes_close_cause() {
        let rt = runtime();
        let scope = WorkerScope::new(rt.handle().clone());
        let mut channel =
            read_from_blocking(FailingSource { served: false }, &scope, 16, 2, CancellationToken::new()).unwrap();

        rt.block_on(async {
            assert_eq!(channel.read_chunk().await.unwrap(), Some(Bytes::from_static(b"abc")));
            assert!(matches!(channel.read_chunk().await, Err(ChannelError::Io { .. })));
        });
    }

    #[test]
    fn writes_in_order_then_closes_sink() {
        let rt = runtime();
        let scope = WorkerScope::new(rt.handle().clone());
        let sink = RecordingSink::default();

        let (mut channel, handle) = write_to_blocking(sink.clone(), &scope, 2, CancellationToken::new()).unwrap();
        rt.block_on(async {
            for i in 0..100u8 {
                channel.write_all(&[i; 100]).await.unwrap();
            }
            channel.write_fully(Bytes::new()).await.unwrap();
            channel.flush().await.unwrap();
            channel.close();
            channel.close();
            handle.finish().await.unwrap();
        });

        let written = sink.written.lock().unwrap();
        assert_eq!(written.len(), 10_000);
        assert!(written.chunks(100).enumerate().all(|(i, chunk)| chunk.iter().all(|b| usize::from(*b) == i)));
        assert!(sink.closed.load(Ordering::SeqCst));
        assert!(!sink.abandoned.load(Ordering::SeqCst));
    }

    #[test]
    fn cancellation_abandons_sink() {
        let rt = runtime();
        let scope = WorkerScope::new(rt.handle().clone());
        let sink = RecordingSink::default();
        let token = CancellationToken::new();

        let (mut channel, handle) = write_to_blocking(sink.clone(), &scope, 2, token.clone()).unwrap();
        rt.block_on(async {
            channel.write_all(b"before").await.unwrap();
            token.cancel();
            assert!(matches!(channel.write_all(b"after").await, Err(e) if e.is_cancelled()));
            assert!(matches!(handle.finish().await, Err(e) if e.is_cancelled()));
        });

        assert!(sink.abandoned.load(Ordering::SeqCst));
        assert!(!sink.closed.load(Ordering::SeqCst));
    }

    #[test]
    fn sink_failure_reaches_writer() {
        struct BrokenSink;

        impl Write for BrokenSink {
            fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
                Err(io::Error::from(ErrorKind::BrokenPipe))
            }

            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        impl BlockingSink for BrokenSink {
            fn close(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let rt = runtime();
        let scope = WorkerScope::new(rt.handle().clone());
        let (mut channel, handle) = write_to_blocking(BrokenSink, &scope, 1, CancellationToken::new()).unwrap();

        rt.block_on(async {
            channel.write_all(b"lost").await.unwrap();
            assert!(matches!(handle.finish().await, Err(ChannelError::Io { .. })));
            assert!(matches!(channel.write_all(b"more").await, Err(ChannelError::Io { .. })));
        });
    }

    #[test]
    fn slow_sink_suspends_writer() {
        struct GatedSink {
            gate: mpsc::Receiver<()>,
        }

        impl Write for GatedSink {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                self.gate.recv().map_err(|_e| io::Error::from(ErrorKind::BrokenPipe))?;
                Ok(buf.len())
            }

            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        impl BlockingSink for GatedSink {
            fn close(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let rt = runtime();
        let scope = WorkerScope::new(rt.handle().clone());
        let (gate_tx, gate) = mpsc::channel();
        let (mut channel, handle) = write_to_blocking(GatedSink { gate }, &scope, 1, CancellationToken::new()).unwrap();

        rt.block_on(async {
            let chunk = Bytes::from(vec![0u8; 1024 * 1024]);
            // one chunk held by the sink, one queued
            channel.write_fully(chunk.clone()).await.unwrap();
            channel.write_fully(chunk.clone()).await.unwrap();

            let third = tokio::time::timeout(Duration::from_millis(100), channel.write_fully(chunk.clone())).await;
            assert!(third.is_err(), "writer must be suspended while the sink is stuck");

            for _ in 0..3 {
                gate_tx.send(()).unwrap();
            }
            channel.write_fully(chunk).await.unwrap();
            gate_tx.send(()).unwrap();
            channel.close();
            handle.finish().await.unwrap();
        });
    }
}
