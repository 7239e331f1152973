//! Bounded byte channels between blocking streams and async code.
//!
//! Both directions are a bounded queue of [`Bytes`] chunks: a full queue suspends the producer,
//! an empty one suspends the consumer. Every channel is tied to a [`CancellationToken`];
//! cancelling it wakes whoever is waiting with [`ChannelError::Cancelled`].
//!
//! Either end may close. The first close-with-cause wins and is what the other end observes on
//! its next operation; a plain close looks like end of stream.
//!
//! - [`read_channel`]: a producer pushes chunks, the application reads a [`ByteReadChannel`]
//! - [`write_channel`]: the application writes a [`ByteWriteChannel`], a consumer drains it
//!
//! [`Bytes`]: bytes::Bytes
//! [`CancellationToken`]: tokio_util::sync::CancellationToken
//! [`ChannelError::Cancelled`]: crate::ChannelError::Cancelled

mod read;
mod write;

pub use read::{ByteReadChannel, ReadChannelProducer, read_channel};
pub use write::{ByteWriteChannel, WriteChannelConsumer, WriteCommand, write_channel};

use std::sync::Arc;

use once_cell::sync::OnceCell;

use crate::ChannelError;

/// The close cause shared by both ends of one channel.
#[derive(Debug, Clone, Default)]
pub(crate) struct CloseCause(Arc<OnceCell<ChannelError>>);

impl CloseCause {
    /// Records `cause` unless another one got there first.
    pub(crate) fn set(&self, cause: ChannelError) {
        let _ = self.0.set(cause);
    }

    pub(crate) fn get(&self) -> Option<ChannelError> {
        self.0.get().cloned()
    }

    pub(crate) fn or_closed(&self) -> ChannelError {
        self.get().unwrap_or(ChannelError::Closed)
    }
}

pub(crate) fn cancelled_error() -> ChannelError {
    ChannelError::cancelled("call cancelled")
}
