use std::io;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use http::{Response, StatusCode};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::select;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::codec::{RequestDecoder, ResponseEncoder};
use crate::exchange::{ConnectionInfo, Exchange, ExchangeContext, RawConnection, RequestBody, ResponseFrame};
use crate::handler::ExchangeHandler;
use crate::protocol::{HttpError, Message, ParseError, PayloadItem, PayloadSize, RequestHeader, ResponseHead, SendError};

/// Body chunks buffered between the socket and a slow body reader.
const BODY_CHANNEL_CAPACITY: usize = 8;

/// Response frames buffered between a writer and the socket.
const FRAME_CHANNEL_CAPACITY: usize = 16;

/// What happens to the connection once an exchange is done.
enum Outcome {
    KeepAlive,
    Close,
    Upgrade(oneshot::Sender<RawConnection>),
}

/// Serves the exchanges of one connection, one after another.
///
/// For every request head the driver creates an [`Exchange`], hands it to the handler and then
/// services two directions at once until the exchange completes: body bytes from the socket to
/// the exchange (only as fast as the exchange consumes them) and response frames from the
/// exchange to the socket.
pub struct HttpConnection<R, W> {
    framed_read: FramedRead<R, RequestDecoder>,
    framed_write: FramedWrite<W, ResponseEncoder>,
    info: ConnectionInfo,
    context: ExchangeContext,
    shutdown: CancellationToken,
}

impl<R, W> HttpConnection<R, W>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    pub(crate) fn new(
        reader: R,
        writer: W,
        info: ConnectionInfo,
        context: ExchangeContext,
        buffer_size: usize,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            framed_read: FramedRead::with_capacity(reader, RequestDecoder::new(), buffer_size),
            framed_write: FramedWrite::new(writer, ResponseEncoder::new()),
            info,
            context,
            shutdown,
        }
    }

    pub async fn process(mut self, handler: &dyn ExchangeHandler) -> Result<(), HttpError> {
        loop {
            let next = select! {
                () = self.shutdown.cancelled() => {
                    debug!(remote = %self.info.remote_addr, "server stopping, closing idle connection");
                    return Ok(());
                }
                next = self.framed_read.next() => next,
            };

            match next {
                Some(Ok(Message::Header((header, payload_size)))) => match self.serve(header, payload_size, handler).await? {
                    Outcome::KeepAlive => {}
                    Outcome::Close => return Ok(()),
                    Outcome::Upgrade(sender) => {
                        self.hand_over(sender);
                        return Ok(());
                    }
                },

                Some(Ok(Message::Payload(_))) => {
                    error!("receive body frame while expecting a request head");
                    self.send_error_response(StatusCode::BAD_REQUEST).await?;
                    return Err(ParseError::invalid_body("need header while receive body").into());
                }

                Some(Err(e)) => {
                    error!(cause = %e, "can't receive next request");
                    self.send_error_response(StatusCode::BAD_REQUEST).await?;
                    return Err(e.into());
                }

                None => {
                    info!(remote = %self.info.remote_addr, "cant read more request, break this connection down");
                    return Ok(());
                }
            }
        }
    }

    async fn serve(&mut self, header: RequestHeader, payload_size: PayloadSize, handler: &dyn ExchangeHandler) -> Result<Outcome, HttpError> {
        let keep_alive = header.is_keep_alive();

        if header.expects_continue() && !payload_size.is_empty() {
            let writer = self.framed_write.get_mut();
            writer.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").await.map_err(SendError::io)?;
            writer.flush().await.map_err(SendError::io)?;
            info!("receive expect request header, sent continue response");
        }

        let (mut body_tx, body) = if payload_size.is_empty() {
            (None, RequestBody::empty())
        } else {
            let (tx, rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
            (Some(tx), RequestBody::streaming(rx, payload_size))
        };
        let (frame_tx, mut frame_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let closed = CancellationToken::new();

        trace!(method = %header.method(), uri = %header.uri(), "dispatching exchange");
        let exchange = Exchange::new(header, self.info, body, frame_tx, self.context.clone(), closed.clone());
        handler.handle_request(exchange);

        let mut body_done = payload_size.is_empty();
        let mut pending: Option<Result<Bytes, ParseError>> = None;
        let mut broken = false;
        let mut response = ResponseProgress::default();

        let outcome = loop {
            select! {
                biased;

                frame = frame_rx.recv() => {
                    let Some(frame) = frame else {
                        error!(remote = %self.info.remote_addr, "exchange dropped without being completed");
                        break Outcome::Close;
                    };
                    match frame {
                        ResponseFrame::Head(head, size) => {
                            if !broken {
                                broken = self.write_head(head, size, &mut response).await.is_err();
                            }
                        }
                        ResponseFrame::Chunk(bytes) => {
                            if !broken {
                                broken = self.write_payload(PayloadItem::Chunk(bytes)).await.is_err();
                            }
                        }
                        ResponseFrame::End => {
                            if !broken {
                                broken = self.write_payload(PayloadItem::Eof).await.is_err();
                            }
                            response.body_ended = true;
                        }
                        ResponseFrame::Complete => {
                            if !broken && response.head_written && !response.body_ended {
                                // the writer never closed its stream, terminate the body now
                                broken = self.write_payload(PayloadItem::Eof).await.is_err();
                            }
                            break if broken || !keep_alive || !response.head_written { Outcome::Close } else { Outcome::KeepAlive };
                        }
                        ResponseFrame::Abort => {
                            debug!(remote = %self.info.remote_addr, "exchange aborted, closing connection");
                            break Outcome::Close;
                        }
                        ResponseFrame::Upgrade(sender) => {
                            if broken || SinkExt::<Message<(ResponseHead, PayloadSize)>>::flush(&mut self.framed_write).await.is_err() {
                                break Outcome::Close;
                            }
                            break Outcome::Upgrade(sender);
                        }
                    }
                    if broken {
                        closed.cancel();
                    }
                }

                forwarded = forward(&body_tx, &mut pending), if pending.is_some() => {
                    if !forwarded {
                        trace!("request body no longer read, draining it");
                        body_tx = None;
                        pending = None;
                    }
                }

                item = self.framed_read.next(), if pending.is_none() && !body_done => {
                    match item {
                        Some(Ok(Message::Payload(PayloadItem::Chunk(bytes)))) => {
                            if body_tx.is_some() {
                                pending = Some(Ok(bytes));
                            }
                        }
                        Some(Ok(Message::Payload(PayloadItem::Eof))) => {
                            body_done = true;
                            body_tx = None;
                        }
                        Some(Ok(Message::Header(_))) => {
                            error!("receive request head while reading a body");
                            body_done = true;
                            broken = true;
                            closed.cancel();
                        }
                        Some(Err(e)) => {
                            warn!(cause = %e, "can't read request body");
                            body_done = true;
                            broken = true;
                            if let Some(tx) = body_tx.take() {
                                // the reader sees the failure if it is still listening
                                let _ = tx.try_send(Err(e));
                            }
                            closed.cancel();
                        }
                        None => {
                            debug!(remote = %self.info.remote_addr, "connection closed while reading request body");
                            body_done = true;
                            broken = true;
                            if let Some(tx) = body_tx.take() {
                                let _ = tx.try_send(Err(ParseError::io(io::Error::from(io::ErrorKind::UnexpectedEof))));
                            }
                            closed.cancel();
                        }
                    }
                }
            }
        };

        if !matches!(outcome, Outcome::KeepAlive) {
            return Ok(outcome);
        }

        // the exchange is done, skip whatever body it did not read
        drop(body_tx);
        while !body_done {
            match self.framed_read.next().await {
                Some(Ok(Message::Payload(PayloadItem::Chunk(_)))) => {}
                Some(Ok(Message::Payload(PayloadItem::Eof))) => body_done = true,
                Some(Ok(Message::Header(_))) | Some(Err(_)) | None => return Ok(Outcome::Close),
            }
        }

        Ok(outcome)
    }

    async fn write_head(&mut self, head: ResponseHead, payload_size: PayloadSize, response: &mut ResponseProgress) -> Result<(), SendError> {
        if response.head_written {
            error!("response head sent twice, ignoring the second one");
            return Ok(());
        }
        response.head_written = true;
        response.body_ended = payload_size.is_empty();

        let result = self.framed_write.send(Message::<_, Bytes>::Header((head, payload_size))).await;
        if let Err(e) = &result {
            debug!(cause = %e, "can't send response head");
        }
        result
    }

    async fn write_payload(&mut self, item: PayloadItem) -> Result<(), SendError> {
        let result = self.framed_write.send(Message::<(ResponseHead, PayloadSize)>::Payload(item)).await;
        if let Err(e) = &result {
            debug!(cause = %e, "can't send response body");
        }
        result
    }

    async fn send_error_response(&mut self, status: StatusCode) -> Result<(), HttpError> {
        let mut head = Response::new(());
        *head.status_mut() = status;
        self.framed_write.send(Message::<_, Bytes>::Header((head, PayloadSize::Empty))).await?;
        Ok(())
    }

    /// Gives the socket, plus anything already buffered from it, to the upgraded protocol.
    fn hand_over(mut self, sender: oneshot::Sender<RawConnection>) {
        let read_ahead = self.framed_read.read_buffer_mut().split().freeze();
        let reader = self.framed_read.into_inner();
        let writer = self.framed_write.into_inner();

        let raw = RawConnection::new(Box::new(reader), Box::new(writer), read_ahead, self.context.io.clone());
        if sender.send(raw).is_err() {
            debug!("upgrade requester went away before taking the connection");
        }
    }
}

#[derive(Debug, Default)]
struct ResponseProgress {
    head_written: bool,
    body_ended: bool,
}

/// Hands the pending body chunk over once the reader has room, `false` if the reader is gone.
async fn forward<T>(tx: &Option<mpsc::Sender<T>>, pending: &mut Option<T>) -> bool {
    let Some(tx) = tx else {
        return false;
    };
    match tx.reserve().await {
        Ok(permit) => {
            if let Some(item) = pending.take() {
                permit.send(item);
            }
            true
        }
        Err(_closed) => false,
    }
}
