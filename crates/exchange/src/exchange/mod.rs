//! One in-flight HTTP transaction, as handed to an [`ExchangeHandler`](crate::handler::ExchangeHandler).
//!
//! An [`Exchange`] exposes the request head, connection details, the request body and the
//! response controls. The response travels back to the connection driver as a sequence of
//! frames over a bounded channel:
//!
//! ```text
//! Head(head, size) -> Chunk* -> End -> Complete
//!                                  \-> Abort
//! Head(101, empty) -> Upgrade
//! ```
//!
//! Completing consumes the exchange, so it can only happen once. An exchange that is dropped
//! without completing is noticed by the driver, which closes the connection.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use http::header::CONTENT_LENGTH;
use http::{HeaderMap, HeaderName, HeaderValue, Method, Response, StatusCode, Uri, Version};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::protocol::{ExchangeError, PayloadSize, RequestHeader, ResponseHead};
use crate::runtime::is_io_thread;

mod body;
mod output;
mod raw;

pub use body::{ExchangeInputStream, RequestBody};
pub use output::ExchangeOutputStream;
pub use raw::{RawConnection, RawReader, RawWriter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport details of the connection an exchange arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub scheme: Scheme,
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
}

/// What the exchange asks the connection driver to do.
#[derive(Debug)]
pub(crate) enum ResponseFrame {
    Head(ResponseHead, PayloadSize),
    Chunk(Bytes),
    End,
    Complete,
    Abort,
    Upgrade(oneshot::Sender<RawConnection>),
}

/// Runtimes an exchange may hop between.
#[derive(Debug, Clone)]
pub(crate) struct ExchangeContext {
    pub(crate) io: Handle,
    pub(crate) worker: Handle,
}

#[derive(Debug)]
pub(crate) struct ResponseState {
    status: StatusCode,
    headers: HeaderMap,
    started: bool,
}

impl ResponseState {
    fn new() -> Self {
        Self { status: StatusCode::OK, headers: HeaderMap::new(), started: false }
    }

    /// Freezes status and headers into a head, once.
    pub(crate) fn commit<F>(&mut self, framing: F) -> Option<(ResponseHead, PayloadSize)>
    where
        F: FnOnce(&HeaderMap) -> PayloadSize,
    {
        if self.started {
            return None;
        }
        self.started = true;

        let payload_size = framing(&self.headers);
        let mut head = Response::new(());
        *head.status_mut() = self.status;
        *head.headers_mut() = self.headers.clone();
        Some((head, payload_size))
    }
}

pub(crate) fn lock(state: &Mutex<ResponseState>) -> MutexGuard<'_, ResponseState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
pub struct Exchange {
    header: RequestHeader,
    connection: ConnectionInfo,
    body: Option<RequestBody>,
    response: Arc<Mutex<ResponseState>>,
    frames: mpsc::Sender<ResponseFrame>,
    context: ExchangeContext,
    closed: CancellationToken,
    blocking: bool,
    output_taken: bool,
}

impl Exchange {
    pub(crate) fn new(
        header: RequestHeader,
        connection: ConnectionInfo,
        body: RequestBody,
        frames: mpsc::Sender<ResponseFrame>,
        context: ExchangeContext,
        closed: CancellationToken,
    ) -> Self {
        Self {
            header,
            connection,
            body: Some(body),
            response: Arc::new(Mutex::new(ResponseState::new())),
            frames,
            context,
            closed,
            blocking: false,
            output_taken: false,
        }
    }

    pub fn request_header(&self) -> &RequestHeader {
        &self.header
    }

    pub fn method(&self) -> &Method {
        self.header.method()
    }

    pub fn uri(&self) -> &Uri {
        self.header.uri()
    }

    pub fn version(&self) -> Version {
        self.header.version()
    }

    pub fn request_headers(&self) -> &HeaderMap {
        self.header.headers()
    }

    pub fn connection(&self) -> &ConnectionInfo {
        &self.connection
    }

    pub fn is_in_io_thread(&self) -> bool {
        is_io_thread()
    }

    /// Moves the exchange to a worker thread and runs `f` there.
    ///
    /// `f` runs on the worker pool's blocking threads, so it may block.
    pub fn dispatch<F>(self, f: F)
    where
        F: FnOnce(Exchange) + Send + 'static,
    {
        let worker = self.context.worker.clone();
        drop(worker.spawn_blocking(move || f(self)));
    }

    /// Switches the exchange to blocking mode, required before the blocking output stream is used.
    pub fn start_blocking(&mut self) -> Result<(), ExchangeError> {
        if is_io_thread() {
            error!(uri = %self.uri(), "start_blocking called on an I/O thread");
            return Err(ExchangeError::blocking_on_io_thread("start_blocking"));
        }
        self.blocking = true;
        Ok(())
    }

    pub fn is_blocking(&self) -> bool {
        self.blocking
    }

    /// Takes the request body, `None` if it was taken before.
    pub fn take_request_body(&mut self) -> Option<RequestBody> {
        self.body.take()
    }

    /// The blocking response body stream, available once per exchange after [`Self::start_blocking`].
    pub fn output_stream(&mut self) -> Result<ExchangeOutputStream, ExchangeError> {
        if is_io_thread() {
            return Err(ExchangeError::blocking_on_io_thread("output_stream"));
        }
        if !self.blocking {
            return Err(ExchangeError::NotBlocking);
        }
        if self.output_taken {
            return Err(ExchangeError::stream_taken("output"));
        }
        self.output_taken = true;
        Ok(ExchangeOutputStream::new(Arc::clone(&self.response), self.frames.clone()))
    }

    pub fn status(&self) -> StatusCode {
        lock(&self.response).status
    }

    /// Sets the response status, ignored once the response started.
    pub fn set_status(&self, status: StatusCode) -> bool {
        let mut state = lock(&self.response);
        if state.started {
            trace!(%status, "response already started, status ignored");
            return false;
        }
        state.status = status;
        true
    }

    /// A snapshot of the response headers.
    pub fn response_headers(&self) -> HeaderMap {
        lock(&self.response).headers.clone()
    }

    /// Mutates the response headers, `None` once the response started.
    pub fn with_response_headers<R, F>(&self, f: F) -> Option<R>
    where
        F: FnOnce(&mut HeaderMap) -> R,
    {
        let mut state = lock(&self.response);
        if state.started {
            trace!("response already started, header mutation ignored");
            return None;
        }
        Some(f(&mut state.headers))
    }

    pub fn append_response_header(&self, name: HeaderName, value: HeaderValue) -> bool {
        self.with_response_headers(|headers| headers.append(name, value)).is_some()
    }

    pub fn insert_response_header(&self, name: HeaderName, value: HeaderValue) -> bool {
        self.with_response_headers(|headers| headers.insert(name, value)).is_some()
    }

    pub fn is_response_started(&self) -> bool {
        lock(&self.response).started
    }

    /// Cancelled when the underlying connection fails before the exchange completes.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Sends the current status and headers and takes over the raw connection.
    ///
    /// Must be called before any body byte is written. On failure the exchange is gone and the
    /// driver closes the connection.
    pub async fn upgrade(self) -> Result<RawConnection, ExchangeError> {
        let committed = lock(&self.response).commit(|_| PayloadSize::Empty);
        let Some((head, payload_size)) = committed else {
            return Err(ExchangeError::ResponseStarted);
        };

        let (tx, rx) = oneshot::channel();
        self.send(ResponseFrame::Head(head, payload_size)).await?;
        self.send(ResponseFrame::Upgrade(tx)).await?;
        rx.await.map_err(|_e| ExchangeError::ConnectionClosed)
    }

    /// Completes the exchange, sending an empty response if nothing was sent yet.
    pub async fn end_exchange(self) {
        let committed = lock(&self.response).commit(|_| PayloadSize::Empty);
        if let Some((head, payload_size)) = committed {
            if let Err(e) = self.send(ResponseFrame::Head(head, payload_size)).await {
                debug!(cause = %e, "can't send response head");
                return;
            }
        }
        if let Err(e) = self.send(ResponseFrame::Complete).await {
            debug!(cause = %e, "can't complete exchange");
        }
    }

    /// Completes the exchange with `body` as the whole response body.
    ///
    /// `Content-Length` is set from `body`. If the response already started the body is dropped
    /// and the exchange completes as is.
    pub async fn end_exchange_with(self, body: Bytes) {
        let committed = {
            let mut state = lock(&self.response);
            if !state.started {
                state.headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
            }
            state.commit(PayloadSize::for_response)
        };

        match committed {
            Some((head, payload_size)) => {
                let mut frames = vec![ResponseFrame::Head(head, payload_size)];
                if !payload_size.is_empty() {
                    frames.push(ResponseFrame::Chunk(body));
                    frames.push(ResponseFrame::End);
                }
                for frame in frames {
                    if let Err(e) = self.send(frame).await {
                        debug!(cause = %e, "can't send response");
                        return;
                    }
                }
            }
            None => debug!(len = body.len(), "response already started, body dropped"),
        }

        if let Err(e) = self.send(ResponseFrame::Complete).await {
            debug!(cause = %e, "can't complete exchange");
        }
    }

    /// Completes the exchange by closing the connection without finishing the response.
    pub async fn abort(self) {
        if let Err(e) = self.send(ResponseFrame::Abort).await {
            debug!(cause = %e, "can't abort exchange");
        }
    }

    async fn send(&self, frame: ResponseFrame) -> Result<(), ExchangeError> {
        self.frames.send(frame).await.map_err(|_e| ExchangeError::ConnectionClosed)
    }
}
