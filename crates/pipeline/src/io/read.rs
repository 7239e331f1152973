use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::{CloseCause, cancelled_error};
use crate::ChannelError;

/// Creates a read channel holding at most `capacity` chunks.
pub fn read_channel(capacity: usize, token: CancellationToken) -> (ReadChannelProducer, ByteReadChannel) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let cause = CloseCause::default();
    let producer = ReadChannelProducer { tx, cause: cause.clone(), token: token.clone() };
    let channel = ByteReadChannel { rx, current: Bytes::new(), cause, token, closed_for_read: false };
    (producer, channel)
}

/// The feeding end of a [`ByteReadChannel`].
///
/// Dropping it ends the stream normally, [`ReadChannelProducer::fail`] ends it with a cause.
#[derive(Debug)]
pub struct ReadChannelProducer {
    tx: mpsc::Sender<Bytes>,
    cause: CloseCause,
    token: CancellationToken,
}

impl ReadChannelProducer {
    /// Pushes one chunk, suspending while the channel is full.
    pub async fn send(&self, chunk: Bytes) -> Result<(), ChannelError> {
        if chunk.is_empty() {
            return Ok(());
        }
        tokio::select! {
            biased;
            () = self.token.cancelled() => Err(cancelled_error()),
            sent = self.tx.send(chunk) => sent.map_err(|_e| self.cause.or_closed()),
        }
    }

    /// [`Self::send`] for threads that may block. Must not be called from async code.
    pub fn blocking_send(&self, chunk: Bytes) -> Result<(), ChannelError> {
        futures::executor::block_on(self.send(chunk))
    }

    /// Ends the stream with `cause`, the reader sees it after the chunks already queued.
    pub fn fail(self, cause: ChannelError) {
        trace!(%cause, "read channel failed by producer");
        self.cause.set(cause);
    }

    /// Whether the reader went away or cancelled.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed() || self.token.is_cancelled()
    }
}

/// Suspendable reads over a stream of chunks.
#[derive(Debug)]
pub struct ByteReadChannel {
    rx: mpsc::Receiver<Bytes>,
    current: Bytes,
    cause: CloseCause,
    token: CancellationToken,
    closed_for_read: bool,
}

impl ByteReadChannel {
    /// An already finished channel.
    pub fn empty() -> Self {
        let (producer, channel) = read_channel(1, CancellationToken::new());
        drop(producer);
        channel
    }

    /// Next chunk, `None` at end of stream.
    pub async fn read_chunk(&mut self) -> Result<Option<Bytes>, ChannelError> {
        if !self.current.is_empty() {
            return Ok(Some(std::mem::take(&mut self.current)));
        }
        if self.closed_for_read {
            return self.cause.get().map_or(Ok(None), Err);
        }

        let received = tokio::select! {
            biased;
            () = self.token.cancelled() => return Err(cancelled_error()),
            received = self.rx.recv() => received,
        };

        match received {
            Some(chunk) => Ok(Some(chunk)),
            None => {
                self.closed_for_read = true;
                self.cause.get().map_or(Ok(None), Err)
            }
        }
    }

    /// Copies whatever is available into `dst`, waiting only if nothing is.
    ///
    /// Returns `None` at end of stream.
    pub async fn read_available(&mut self, dst: &mut [u8]) -> Result<Option<usize>, ChannelError> {
        if dst.is_empty() {
            return Ok(Some(0));
        }
        if self.current.is_empty() {
            match self.read_chunk().await? {
                Some(chunk) => self.current = chunk,
                None => return Ok(None),
            }
        }

        let len = dst.len().min(self.current.len());
        dst[..len].copy_from_slice(&self.current.split_to(len));
        Ok(Some(len))
    }

    /// Reads until end of stream.
    pub async fn read_remaining(&mut self) -> Result<Bytes, ChannelError> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.read_chunk().await? {
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }

    /// Stops reading, the producer sees `cause` on its next send. Idempotent.
    pub fn cancel(&mut self, cause: ChannelError) {
        if self.closed_for_read {
            return;
        }
        self.cause.set(cause);
        self.closed_for_read = true;
        self.current = Bytes::new();
        self.rx.close();
    }

    pub fn is_closed_for_read(&self) -> bool {
        self.closed_for_read && self.current.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn reads_partial_chunks_in_order() {
        let (producer, mut channel) = read_channel(4, CancellationToken::new());
        producer.send(Bytes::from_static(b"hello ")).await.unwrap();
        producer.send(Bytes::new()).await.unwrap();
        producer.send(Bytes::from_static(b"world")).await.unwrap();
        drop(producer);

        let mut buf = [0u8; 4];
        assert_eq!(channel.read_available(&mut buf).await.unwrap(), Some(4));
        assert_eq!(&buf, b"hell");
        assert_eq!(channel.read_remaining().await.unwrap(), Bytes::from_static(b"o world"));
        assert_eq!(channel.read_available(&mut buf).await.unwrap(), None);
        assert!(channel.is_closed_for_read());
    }

    #[tokio::test]
    async fn producer_failure_surfaces_after_queued_chunks() {
        let (producer, mut channel) = read_channel(4, CancellationToken::new());
        producer.send(Bytes::from_static(b"ok")).await.unwrap();
        producer.fail(ChannelError::io(std::io::Error::other("reset")));

        assert_eq!(channel.read_chunk().await.unwrap(), Some(Bytes::from_static(b"ok")));
        assert!(matches!(channel.read_chunk().await, Err(ChannelError::Io { .. })));
        assert!(matches!(channel.read_chunk().await, Err(ChannelError::Io { .. })));
    }

    #[tokio::test]
    async fn cancellation_wakes_waiting_reader() {
        let token = CancellationToken::new();
        let (_producer, mut channel) = read_channel(4, token.clone());

        let reader = tokio::spawn(async move { channel.read_chunk().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), reader).await.unwrap().unwrap();
        assert!(matches!(result, Err(e) if e.is_cancelled()));
    }

    #[tokio::test]
    async fn full_channel_suspends_producer() {
        let (producer, mut channel) = read_channel(1, CancellationToken::new());
        producer.send(Bytes::from_static(b"a")).await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), producer.send(Bytes::from_static(b"b"))).await;
        assert!(blocked.is_err());

        assert_eq!(channel.read_chunk().await.unwrap(), Some(Bytes::from_static(b"a")));
        producer.send(Bytes::from_static(b"b")).await.unwrap();
    }

    #[tokio::test]
    async fn reader_cancel_reaches_producer() {
        let (producer, mut channel) = read_channel(1, CancellationToken::new());
        channel.cancel(ChannelError::cancelled("not interested"));
        channel.cancel(ChannelError::Closed);

        assert!(matches!(producer.send(Bytes::from_static(b"x")).await, Err(e) if e.is_cancelled()));
        assert!(producer.is_closed());
    }
}
