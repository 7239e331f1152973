//! The callback contract between the server and whatever serves its exchanges.

use std::fmt;

use crate::exchange::Exchange;

/// Receives every exchange the server accepts.
///
/// `handle_request` runs on an I/O thread and must not block. Work that may block is moved to
/// the worker pool with [`Exchange::dispatch`]. The handler owns the exchange from here on and
/// has to complete it exactly once through [`Exchange::end_exchange`], [`Exchange::abort`] or
/// [`Exchange::upgrade`].
pub trait ExchangeHandler: Send + Sync + 'static {
    fn handle_request(&self, exchange: Exchange);
}

/// Adapts a closure into an [`ExchangeHandler`].
pub struct HandlerFn<F> {
    f: F,
}

impl<F> fmt::Debug for HandlerFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerFn").finish_non_exhaustive()
    }
}

impl<F> ExchangeHandler for HandlerFn<F>
where
    F: Fn(Exchange) + Send + Sync + 'static,
{
    fn handle_request(&self, exchange: Exchange) {
        (self.f)(exchange);
    }
}

pub fn make_handler<F>(f: F) -> HandlerFn<F>
where
    F: Fn(Exchange) + Send + Sync + 'static,
{
    HandlerFn { f }
}
