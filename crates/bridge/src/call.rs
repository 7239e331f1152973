//! One exchange seen as a pipeline call.
//!
//! The request view copies the request head at construction and derives query parameters and
//! cookies on first access. The response view writes status and headers straight through to
//! the exchange, so the exchange decides when they stop being mutable.
//!
//! Neither view touches blocking mode on construction. The body channels are created on first
//! use, which only happens inside the pipeline, on a worker thread.

use std::mem;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderValue};
use http::{HeaderMap, HeaderName, Method, StatusCode, Uri, Version};
use micro_exchange::exchange::{Exchange, RequestBody};
use micro_pipeline::io::{ByteReadChannel, ByteWriteChannel};
use micro_pipeline::{
    ApplicationCall, ApplicationRequest, ApplicationResponse, CallError, ChannelError, ConnectionPoint, Parameters,
    ProtocolUpgrade, RequestCookies,
};
use once_cell::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::WorkerScope;
use crate::stream_adapter::{WriterHandle, read_from_blocking, write_to_blocking};
use crate::upgrade::{UpgradeSettings, run_upgrade};

const ERROR_BODY: &[u8] = b"Internal Server Error";

/// Channel sizing shared by every call of an engine.
#[derive(Debug, Clone, Copy)]
pub struct CallSettings {
    pub buffer_size: usize,
    pub channel_capacity: usize,
}

impl CallSettings {
    fn upgrade(self) -> UpgradeSettings {
        UpgradeSettings { buffer_size: self.buffer_size, channel_capacity: self.channel_capacity }
    }
}

/// How the pipeline run over a call ended.
#[derive(Debug)]
pub enum CallOutcome {
    Completed,
    Failed(String),
    Cancelled,
}

/// Whether the exchange still belongs to the call.
#[derive(Debug)]
pub enum UpgradeState {
    NotUpgraded(Exchange),
    Upgraded,
}

#[derive(Debug)]
pub struct ExchangeCall {
    request: ExchangeRequest,
    response: ExchangeResponse,
    token: CancellationToken,
}

impl ExchangeCall {
    pub fn new(mut exchange: Exchange, scope: &WorkerScope, token: CancellationToken, settings: CallSettings) -> Self {
        let request = ExchangeRequest::new(&mut exchange, scope.clone(), token.clone(), settings);
        let response = ExchangeResponse {
            state: UpgradeState::NotUpgraded(exchange),
            channel: None,
            writer: None,
            scope: scope.clone(),
            token: token.clone(),
            settings,
        };
        Self { request, response, token }
    }

    pub fn is_upgraded(&self) -> bool {
        matches!(self.response.state, UpgradeState::Upgraded)
    }

    /// Finalizes the response and completes the exchange, once.
    ///
    /// The body channel is closed and its sink finished before the exchange completes. A
    /// failure answers `500` if nothing was sent yet and aborts the connection otherwise.
    pub async fn finish(self, outcome: CallOutcome) {
        let ExchangeResponse { state, channel, writer, .. } = self.response;
        let exchange = match state {
            UpgradeState::NotUpgraded(exchange) => exchange,
            UpgradeState::Upgraded => {
                trace!(?outcome, "upgraded call, exchange already handed over");
                self.token.cancel();
                return;
            }
        };

        let sink_result = finish_body(channel, writer, &outcome).await;

        match outcome {
            CallOutcome::Completed if sink_result.is_ok() => exchange.end_exchange().await,
            CallOutcome::Completed => {
                debug!("response body failed, aborting exchange");
                exchange.abort().await;
            }
            CallOutcome::Failed(reason) => {
                if exchange.is_response_started() {
                    error!(uri = %exchange.uri(), %reason, "pipeline failed after response started, aborting");
                    exchange.abort().await;
                } else {
                    error!(uri = %exchange.uri(), %reason, "pipeline failed, responding 500");
                    exchange.set_status(StatusCode::INTERNAL_SERVER_ERROR);
                    exchange.with_response_headers(|headers| {
                        headers.clear();
                        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
                    });
                    exchange.end_exchange_with(Bytes::from_static(ERROR_BODY)).await;
                }
            }
            CallOutcome::Cancelled => {
                debug!(uri = %exchange.uri(), "call cancelled, aborting exchange");
                exchange.abort().await;
            }
        }

        self.token.cancel();
    }
}

async fn finish_body(
    channel: Option<ByteWriteChannel>,
    writer: Option<WriterHandle>,
    outcome: &CallOutcome,
) -> Result<(), ChannelError> {
    let (Some(mut channel), Some(writer)) = (channel, writer) else {
        return Ok(());
    };

    match outcome {
        CallOutcome::Completed => channel.close(),
        CallOutcome::Failed(reason) => channel.cancel(ChannelError::cancelled(reason)),
        CallOutcome::Cancelled => channel.cancel(ChannelError::cancelled("call cancelled")),
    }

    let result = writer.finish().await;
    if let Err(e) = &result {
        debug!(cause = %e, "response body sink finished with error");
    }
    result
}

impl ApplicationCall for ExchangeCall {
    fn request(&self) -> &dyn ApplicationRequest {
        &self.request
    }

    fn request_mut(&mut self) -> &mut dyn ApplicationRequest {
        &mut self.request
    }

    fn response(&self) -> &dyn ApplicationResponse {
        &self.response
    }

    fn response_mut(&mut self) -> &mut dyn ApplicationResponse {
        &mut self.response
    }

    fn cancellation(&self) -> &CancellationToken {
        &self.token
    }
}

#[derive(Debug)]
pub struct ExchangeRequest {
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    local: ConnectionPoint,
    remote: ConnectionPoint,
    body: Option<RequestBody>,
    query_parameters: OnceCell<Parameters>,
    raw_query_parameters: OnceCell<Parameters>,
    cookies: OnceCell<RequestCookies>,
    scope: WorkerScope,
    token: CancellationToken,
    settings: CallSettings,
}

impl ExchangeRequest {
    fn new(exchange: &mut Exchange, scope: WorkerScope, token: CancellationToken, settings: CallSettings) -> Self {
        let connection = *exchange.connection();
        let scheme = connection.scheme.as_str();
        let version = exchange.version();

        Self {
            method: exchange.method().clone(),
            uri: exchange.uri().clone(),
            version,
            headers: exchange.request_headers().clone(),
            local: ConnectionPoint::from_socket(scheme, version, connection.local_addr),
            remote: ConnectionPoint::from_socket(scheme, version, connection.remote_addr),
            body: exchange.take_request_body(),
            query_parameters: OnceCell::new(),
            raw_query_parameters: OnceCell::new(),
            cookies: OnceCell::new(),
            scope,
            token,
            settings,
        }
    }

    fn query(&self) -> &str {
        self.uri.query().unwrap_or_default()
    }
}

impl ApplicationRequest for ExchangeRequest {
    fn method(&self) -> &Method {
        &self.method
    }

    fn uri(&self) -> &Uri {
        &self.uri
    }

    fn version(&self) -> Version {
        self.version
    }

    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn query_parameters(&self) -> &Parameters {
        self.query_parameters.get_or_init(|| Parameters::parse_decoded(self.query()))
    }

    fn raw_query_parameters(&self) -> &Parameters {
        self.raw_query_parameters.get_or_init(|| Parameters::parse_raw(self.query()))
    }

    fn cookies(&self) -> &RequestCookies {
        self.cookies.get_or_init(|| RequestCookies::from_headers(&self.headers))
    }

    fn local(&self) -> &ConnectionPoint {
        &self.local
    }

    fn remote(&self) -> &ConnectionPoint {
        &self.remote
    }

    fn receive_channel(&mut self) -> Result<ByteReadChannel, CallError> {
        let body = self.body.take().ok_or(CallError::BodyConsumed)?;
        if body.payload_size().is_empty() {
            return Ok(ByteReadChannel::empty());
        }

        let input = body.into_blocking().map_err(crate::BridgeError::from)?;
        let channel = read_from_blocking(
            input,
            &self.scope,
            self.settings.buffer_size,
            self.settings.channel_capacity,
            self.token.clone(),
        )?;
        Ok(channel)
    }
}

#[derive(Debug)]
pub struct ExchangeResponse {
    state: UpgradeState,
    channel: Option<ByteWriteChannel>,
    writer: Option<WriterHandle>,
    scope: WorkerScope,
    token: CancellationToken,
    settings: CallSettings,
}

impl ExchangeResponse {
    fn exchange(&self) -> Option<&Exchange> {
        match &self.state {
            UpgradeState::NotUpgraded(exchange) => Some(exchange),
            UpgradeState::Upgraded => None,
        }
    }
}

#[async_trait]
impl ApplicationResponse for ExchangeResponse {
    fn status(&self) -> StatusCode {
        self.exchange().map_or(StatusCode::SWITCHING_PROTOCOLS, Exchange::status)
    }

    fn set_status(&mut self, status: StatusCode) {
        if let Some(exchange) = self.exchange() {
            exchange.set_status(status);
        }
    }

    fn headers(&self) -> HeaderMap {
        self.exchange().map(Exchange::response_headers).unwrap_or_default()
    }

    fn append_header(&mut self, name: HeaderName, value: HeaderValue) {
        if let Some(exchange) = self.exchange() {
            exchange.append_response_header(name, value);
        }
    }

    fn insert_header(&mut self, name: HeaderName, value: HeaderValue) {
        if let Some(exchange) = self.exchange() {
            exchange.insert_response_header(name, value);
        }
    }

    fn is_committed(&self) -> bool {
        self.exchange().is_none_or(Exchange::is_response_started)
    }

    fn response_channel(&mut self) -> Result<&mut ByteWriteChannel, CallError> {
        let UpgradeState::NotUpgraded(exchange) = &mut self.state else {
            return Err(CallError::AlreadyUpgraded);
        };

        match &mut self.channel {
            Some(channel) => Ok(channel),
            slot @ None => {
                exchange.start_blocking().map_err(crate::BridgeError::from)?;
                let output = exchange.output_stream().map_err(crate::BridgeError::from)?;
                let (channel, writer) =
                    write_to_blocking(output, &self.scope, self.settings.channel_capacity, self.token.clone())?;
                trace!("response channel opened");
                self.writer = Some(writer);
                Ok(slot.insert(channel))
            }
        }
    }

    async fn respond_upgrade(&mut self, upgrade: ProtocolUpgrade) -> Result<(), CallError> {
        if self.channel.is_some() || self.is_committed() {
            return Err(CallError::AlreadyCommitted);
        }
        let UpgradeState::NotUpgraded(exchange) = mem::replace(&mut self.state, UpgradeState::Upgraded) else {
            return Err(CallError::AlreadyUpgraded);
        };

        let phase = run_upgrade(exchange, upgrade, &self.scope, self.settings.upgrade(), self.token.clone()).await;
        debug!(%phase, "upgraded session over");
        Ok(())
    }
}
