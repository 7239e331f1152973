use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::{CloseCause, cancelled_error};
use crate::ChannelError;

/// What the consumer of a [`ByteWriteChannel`] receives.
#[derive(Debug)]
pub enum WriteCommand {
    Data(Bytes),
    /// Everything before this command is written out; acknowledge by sending `()`.
    Flush(oneshot::Sender<()>),
}

/// Creates a write channel holding at most `capacity` pending commands.
pub fn write_channel(capacity: usize, token: CancellationToken) -> (ByteWriteChannel, WriteChannelConsumer) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let cause = CloseCause::default();
    let channel = ByteWriteChannel { tx: Some(tx), cause: cause.clone(), token: token.clone(), bytes_written: 0 };
    let consumer = WriteChannelConsumer { rx, cause, token };
    (channel, consumer)
}

/// Suspendable writes of byte chunks.
///
/// Dropping or [closing](Self::close) the channel is the normal end of output.
#[derive(Debug)]
pub struct ByteWriteChannel {
    tx: Option<mpsc::Sender<WriteCommand>>,
    cause: CloseCause,
    token: CancellationToken,
    bytes_written: u64,
}

impl ByteWriteChannel {
    /// Queues `data`, suspending while the channel is full.
    pub async fn write_fully(&mut self, data: Bytes) -> Result<(), ChannelError> {
        if data.is_empty() {
            return Ok(());
        }
        let len = data.len() as u64;
        self.send(WriteCommand::Data(data)).await?;
        self.bytes_written += len;
        Ok(())
    }

    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), ChannelError> {
        self.write_fully(Bytes::copy_from_slice(data)).await
    }

    /// Waits until the consumer has written out everything queued so far.
    pub async fn flush(&mut self) -> Result<(), ChannelError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.send(WriteCommand::Flush(ack_tx)).await?;

        tokio::select! {
            biased;
            () = self.token.cancelled() => Err(cancelled_error()),
            acked = ack_rx => acked.map_err(|_e| self.cause.or_closed()),
        }
    }

    /// Ends the output. Idempotent.
    pub fn close(&mut self) {
        if self.tx.take().is_some() {
            trace!(bytes_written = self.bytes_written, "write channel closed");
        }
    }

    /// Ends the output with `cause`. The consumer fails instead of finishing and drops
    /// whatever it has not taken yet.
    pub fn cancel(&mut self, cause: ChannelError) {
        self.cause.set(cause);
        self.tx = None;
    }

    pub fn is_closed_for_write(&self) -> bool {
        self.tx.as_ref().is_none_or(mpsc::Sender::is_closed) || self.token.is_cancelled()
    }

    pub fn close_cause(&self) -> Option<ChannelError> {
        self.cause.get()
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    async fn send(&self, command: WriteCommand) -> Result<(), ChannelError> {
        let Some(tx) = &self.tx else {
            return Err(self.cause.or_closed());
        };
        tokio::select! {
            biased;
            () = self.token.cancelled() => Err(cancelled_error()),
            sent = tx.send(command) => sent.map_err(|_e| self.cause.or_closed()),
        }
    }
}

/// The draining end of a [`ByteWriteChannel`].
#[derive(Debug)]
pub struct WriteChannelConsumer {
    rx: mpsc::Receiver<WriteCommand>,
    cause: CloseCause,
    token: CancellationToken,
}

impl WriteChannelConsumer {
    /// Next command, `None` once the writer closed normally.
    ///
    /// Commands queued before a close are still delivered, a cancel discards them.
    pub async fn next(&mut self) -> Result<Option<WriteCommand>, ChannelError> {
        if let Some(cause) = self.cause.get() {
            return Err(cause);
        }

        let received = tokio::select! {
            biased;
            received = self.rx.recv() => received,
            () = self.token.cancelled() => return Err(cancelled_error()),
        };

        match received {
            Some(command) => Ok(Some(command)),
            None => self.cause.get().map_or(Ok(None), Err),
        }
    }

    /// [`Self::next`] for threads that may block. Must not be called from async code.
    pub fn blocking_next(&mut self) -> Result<Option<WriteCommand>, ChannelError> {
        futures::executor::block_on(self.next())
    }

    /// Stops draining, the writer sees `cause` on its next write.
    pub fn fail(mut self, cause: ChannelError) {
        trace!(%cause, "write channel failed by consumer");
        self.cause.set(cause);
        self.rx.close();
    }
}
