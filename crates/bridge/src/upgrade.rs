//! Protocol upgrades: the HTTP exchange turns into a raw duplex byte pipe.
//!
//! ```text
//! Initial -> HeadersSent(101) -> ChannelsBound -> HandlerRunning -> Completed
//!                                                               \-> Failed
//! ```
//!
//! The transition is one way. Whatever the session does, both channels and the raw connection
//! are closed when it is over and nothing is propagated to the caller.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use http::StatusCode;
use micro_exchange::exchange::Exchange;
use micro_pipeline::ProtocolUpgrade;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::WorkerScope;
use crate::stream_adapter::{read_from_blocking, write_to_blocking};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradePhase {
    Initial,
    HeadersSent,
    ChannelsBound,
    HandlerRunning,
    Completed,
    Failed,
}

impl fmt::Display for UpgradePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UpgradePhase::Initial => "initial",
            UpgradePhase::HeadersSent => "headers-sent",
            UpgradePhase::ChannelsBound => "channels-bound",
            UpgradePhase::HandlerRunning => "handler-running",
            UpgradePhase::Completed => "completed",
            UpgradePhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Channel sizing of an upgraded session.
#[derive(Debug, Clone, Copy)]
pub(crate) struct UpgradeSettings {
    pub(crate) buffer_size: usize,
    pub(crate) channel_capacity: usize,
}

struct Transitions {
    phase: UpgradePhase,
}

impl Transitions {
    fn advance(&mut self, next: UpgradePhase) {
        trace!(from = %self.phase, to = %next, "upgrade transition");
        self.phase = next;
    }
}

/// Switches `exchange` to the protocol of `upgrade` and runs its session to the end.
///
/// Returns the final phase, [`UpgradePhase::Completed`] or [`UpgradePhase::Failed`].
pub(crate) async fn run_upgrade(
    mut exchange: Exchange,
    upgrade: ProtocolUpgrade,
    scope: &WorkerScope,
    settings: UpgradeSettings,
    token: CancellationToken,
) -> UpgradePhase {
    let mut transitions = Transitions { phase: UpgradePhase::Initial };
    let (headers, handler) = upgrade.into_parts();
    if !exchange.request_header().is_upgrade_request() {
        debug!(uri = %exchange.uri(), "switching protocols for a request that did not ask to upgrade");
    }

    // straight onto the exchange, the response view is committed from here on
    exchange.set_status(StatusCode::SWITCHING_PROTOCOLS);
    exchange.with_response_headers(|response_headers| {
        for (name, value) in &headers {
            response_headers.append(name, value.clone());
        }
    });
    if let Err(e) = exchange.start_blocking() {
        error!(cause = %e, "can't upgrade outside a worker thread");
        exchange.abort().await;
        transitions.advance(UpgradePhase::Failed);
        return transitions.phase;
    }

    let raw = match exchange.upgrade().await {
        Ok(raw) => raw,
        Err(e) => {
            debug!(cause = %e, "upgrade handshake failed");
            transitions.advance(UpgradePhase::Failed);
            return transitions.phase;
        }
    };
    transitions.advance(UpgradePhase::HeadersSent);

    let closer = raw.closer();
    // unblocks the raw socket however this future ends, dropped mid-session included
    let _close_raw = closer.clone().drop_guard();
    let channels = raw.into_blocking().map_err(crate::BridgeError::from).and_then(|(reader, writer)| {
        let input = read_from_blocking(reader, scope, settings.buffer_size, settings.channel_capacity, token.clone())?;
        let (output, writer) = write_to_blocking(writer, scope, settings.channel_capacity, token.clone())?;
        Ok((input, output, writer))
    });
    let (input, output, writer) = match channels {
        Ok(channels) => channels,
        Err(e) => {
            error!(cause = %e, "can't bind upgrade channels");
            transitions.advance(UpgradePhase::Failed);
            return transitions.phase;
        }
    };
    transitions.advance(UpgradePhase::ChannelsBound);

    transitions.advance(UpgradePhase::HandlerRunning);
    let session = AssertUnwindSafe(handler(input, output, token)).catch_unwind().await;

    let outcome = match session {
        Ok(Ok(())) => UpgradePhase::Completed,
        Ok(Err(e)) => {
            warn!(cause = %e, "upgraded session failed");
            UpgradePhase::Failed
        }
        Err(panic) => {
            error!(panic = panic_message(panic.as_ref()), "upgraded session panicked");
            UpgradePhase::Failed
        }
    };

    if outcome == UpgradePhase::Failed {
        closer.cancel();
    }
    // the session dropped its output channel, so the writer flushes and shuts the socket down
    if let Err(e) = writer.finish().await {
        debug!(cause = %e, "upgraded output ended with error");
    }

    transitions.advance(outcome);
    transitions.phase
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_panic_messages() {
        let literal = std::panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(literal.as_ref()), "boom");

        let formatted = std::panic::catch_unwind(|| panic!("code {}", 7)).unwrap_err();
        assert_eq!(panic_message(formatted.as_ref()), "code 7");

        let other = std::panic::catch_unwind(|| std::panic::panic_any(7u8)).unwrap_err();
        assert_eq!(panic_message(other.as_ref()), "non-string panic payload");
    }

    #[test]
    fn phases_display_kebab_case() {
        assert_eq!(UpgradePhase::HeadersSent.to_string(), "headers-sent");
        assert_eq!(UpgradePhase::HandlerRunning.to_string(), "handler-running");
    }
}
