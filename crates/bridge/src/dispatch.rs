use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use micro_exchange::exchange::Exchange;
use micro_exchange::handler::ExchangeHandler;
use micro_pipeline::Pipeline;
use tracing::{Instrument, debug, info_span, trace};

use crate::WorkerScope;
use crate::call::{CallOutcome, CallSettings, ExchangeCall};
use crate::upgrade::panic_message;

/// Root handler of the server: runs the pipeline once per exchange, on the worker pool.
///
/// ```text
/// Accepted -> (dispatch if on an I/O thread) -> Executing -> Finalizing -> Done
/// ```
///
/// Every exchange is completed exactly once, whether the pipeline returns, fails, panics or is
/// cancelled, unless an upgrade took it over.
#[derive(Clone)]
pub struct DispatchHandler {
    pipeline: Arc<dyn Pipeline>,
    scope: WorkerScope,
    settings: CallSettings,
}

impl fmt::Debug for DispatchHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchHandler").field("settings", &self.settings).finish_non_exhaustive()
    }
}

impl DispatchHandler {
    pub fn new(pipeline: Arc<dyn Pipeline>, scope: WorkerScope, settings: CallSettings) -> Self {
        Self { pipeline, scope, settings }
    }

    fn execute(&self, exchange: Exchange) {
        let this = self.clone();
        let span = info_span!("call", method = %exchange.method(), uri = %exchange.uri());
        drop(self.scope.spawn(async move { this.run(exchange).await }.instrument(span)));
    }

    async fn run(self, exchange: Exchange) {
        let closed = exchange.closed_token();
        let token = self.scope.child_token();
        let mut call = ExchangeCall::new(exchange, &self.scope, token.clone(), self.settings);

        trace!("executing pipeline");
        let outcome = {
            let execution = AssertUnwindSafe(self.pipeline.execute(&mut call)).catch_unwind();
            tokio::select! {
                biased;
                () = token.cancelled() => CallOutcome::Cancelled,
                () = closed.cancelled() => {
                    debug!("connection closed while the pipeline was running");
                    CallOutcome::Cancelled
                }
                result = execution => match result {
                    Ok(Ok(())) => CallOutcome::Completed,
                    Ok(Err(e)) => CallOutcome::Failed(e.to_string()),
                    Err(panic) => CallOutcome::Failed(format!("pipeline panicked: {}", panic_message(panic.as_ref()))),
                },
            }
        };

        trace!(?outcome, "finalizing call");
        call.finish(outcome).await;
    }
}

impl ExchangeHandler for DispatchHandler {
    fn handle_request(&self, exchange: Exchange) {
        if exchange.is_in_io_thread() {
            let this = self.clone();
            exchange.dispatch(move |exchange| this.execute(exchange));
            return;
        }
        self.execute(exchange);
    }
}
