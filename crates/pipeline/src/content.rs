//! What a pipeline sends back: [`OutgoingContent`] and the [`respond`] entry point.

use std::fmt;
use std::future::Future;

use bytes::Bytes;
use futures::FutureExt;
use futures::future::BoxFuture;
use http::header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, UPGRADE};
use http::{HeaderMap, HeaderValue};
use http_body::Body as HttpBody;
use http_body_util::BodyExt;
use http_body_util::combinators::UnsyncBoxBody;
use mime::Mime;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::io::{ByteReadChannel, ByteWriteChannel};
use crate::{ApplicationCall, ApplicationResponse, BoxError, CallError};

/// Runs an upgraded session: bytes from the client, bytes to the client, and the call's scope.
pub type UpgradeHandler =
    Box<dyn FnOnce(ByteReadChannel, ByteWriteChannel, CancellationToken) -> BoxFuture<'static, Result<(), BoxError>> + Send>;

/// A response that takes the connection over for another protocol.
pub struct ProtocolUpgrade {
    headers: HeaderMap,
    handler: UpgradeHandler,
}

impl ProtocolUpgrade {
    /// `headers` are sent verbatim with the `101 Switching Protocols` head.
    pub fn new<F, Fut>(headers: HeaderMap, handler: F) -> Self
    where
        F: FnOnce(ByteReadChannel, ByteWriteChannel, CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        Self { headers, handler: Box::new(move |input, output, token| handler(input, output, token).boxed()) }
    }

    /// An upgrade announcing `Upgrade: <protocol>` and `Connection: upgrade`.
    pub fn for_protocol<F, Fut>(protocol: &str, handler: F) -> Result<Self, CallError>
    where
        F: FnOnce(ByteReadChannel, ByteWriteChannel, CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let mut headers = HeaderMap::with_capacity(2);
        headers.insert(UPGRADE, HeaderValue::from_str(protocol).map_err(CallError::body)?);
        headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
        Ok(Self::new(headers, handler))
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn into_parts(self) -> (HeaderMap, UpgradeHandler) {
        (self.headers, self.handler)
    }
}

impl fmt::Debug for ProtocolUpgrade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolUpgrade").field("headers", &self.headers).finish_non_exhaustive()
    }
}

/// The body of a response, or an upgrade replacing it.
pub enum OutgoingContent {
    Empty,
    Bytes { data: Bytes, content_type: Option<Mime> },
    Stream { body: UnsyncBoxBody<Bytes, BoxError>, content_type: Option<Mime> },
    Upgrade(ProtocolUpgrade),
}

impl OutgoingContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Bytes { data: Bytes::from(text.into()), content_type: Some(mime::TEXT_PLAIN_UTF_8) }
    }

    pub fn bytes(data: impl Into<Bytes>) -> Self {
        Self::Bytes { data: data.into(), content_type: None }
    }

    pub fn json<T: Serialize>(value: &T) -> Result<Self, CallError> {
        let data = serde_json::to_vec(value).map_err(CallError::body)?;
        Ok(Self::Bytes { data: Bytes::from(data), content_type: Some(mime::APPLICATION_JSON) })
    }

    pub fn stream<B>(body: B) -> Self
    where
        B: HttpBody<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        Self::Stream { body: UnsyncBoxBody::new(body.map_err(Into::into)), content_type: None }
    }

    pub fn with_content_type(self, mime: Mime) -> Self {
        match self {
            Self::Bytes { data, .. } => Self::Bytes { data, content_type: Some(mime) },
            Self::Stream { body, .. } => Self::Stream { body, content_type: Some(mime) },
            other => other,
        }
    }
}

impl fmt::Debug for OutgoingContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Bytes { data, content_type } => {
                f.debug_struct("Bytes").field("len", &data.len()).field("content_type", content_type).finish()
            }
            Self::Stream { content_type, .. } => {
                f.debug_struct("Stream").field("content_type", content_type).finish_non_exhaustive()
            }
            Self::Upgrade(upgrade) => f.debug_tuple("Upgrade").field(upgrade).finish(),
        }
    }
}

/// Sends `content` as the response of `call`.
///
/// Upgrades go to [`respond_upgrade`](crate::ApplicationResponse::respond_upgrade), everything
/// else is written to the response channel, which is closed afterwards.
pub async fn respond(call: &mut dyn ApplicationCall, content: OutgoingContent) -> Result<(), CallError> {
    let response = call.response_mut();
    match content {
        OutgoingContent::Empty => {
            trace!("responding without body");
            Ok(())
        }

        OutgoingContent::Bytes { data, content_type } => {
            set_content_type(response, content_type);
            response.insert_header(CONTENT_LENGTH, HeaderValue::from(data.len()));

            let channel = response.response_channel()?;
            channel.write_fully(data).await?;
            channel.close();
            Ok(())
        }

        OutgoingContent::Stream { mut body, content_type } => {
            set_content_type(response, content_type);
            if let Some(length) = body.size_hint().exact() {
                response.insert_header(CONTENT_LENGTH, HeaderValue::from(length));
            }

            let channel = response.response_channel()?;
            while let Some(frame) = body.frame().await {
                let frame = frame.map_err(CallError::body)?;
                // trailers are not forwarded
                if let Ok(data) = frame.into_data() {
                    channel.write_fully(data).await?;
                }
            }
            channel.close();
            Ok(())
        }

        OutgoingContent::Upgrade(upgrade) => response.respond_upgrade(upgrade).await,
    }
}

fn set_content_type(response: &mut dyn ApplicationResponse, content_type: Option<Mime>) {
    if let Some(mime) = content_type
        && let Ok(value) = HeaderValue::from_str(mime.as_ref())
    {
        response.insert_header(CONTENT_TYPE, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{WriteChannelConsumer, WriteCommand, write_channel};
    use crate::{ConnectionPoint, Parameters, RequestCookies};
    use async_trait::async_trait;
    use http::{HeaderName, Method, StatusCode, Uri, Version};
    use http_body_util::{Full, StreamBody};
    use http_body::Frame;

    struct TestRequest {
        method: Method,
        headers: HeaderMap,
        uri: Uri,
        params: Parameters,
        cookies: RequestCookies,
        point: ConnectionPoint,
    }

    impl crate::ApplicationRequest for TestRequest {
        fn method(&self) -> &Method {
            &self.method
        }
        fn uri(&self) -> &Uri {
            &self.uri
        }
        fn version(&self) -> Version {
            Version::HTTP_11
        }
        fn headers(&self) -> &HeaderMap {
            &self.headers
        }
        fn query_parameters(&self) -> &Parameters {
            &self.params
        }
        fn raw_query_parameters(&self) -> &Parameters {
            &self.params
        }
        fn cookies(&self) -> &RequestCookies {
            &self.cookies
        }
        fn local(&self) -> &ConnectionPoint {
            &self.point
        }
        fn remote(&self) -> &ConnectionPoint {
            &self.point
        }
        fn receive_channel(&mut self) -> Result<ByteReadChannel, CallError> {
            Ok(ByteReadChannel::empty())
        }
    }

    struct TestResponse {
        status: StatusCode,
        headers: HeaderMap,
        channel: Option<ByteWriteChannel>,
        upgraded: Option<HeaderMap>,
    }

    #[async_trait]
    impl ApplicationResponse for TestResponse {
        fn status(&self) -> StatusCode {
            self.status
        }
        fn set_status(&mut self, status: StatusCode) {
            self.status = status;
        }
        fn headers(&self) -> HeaderMap {
            self.headers.clone()
        }
        fn append_header(&mut self, name: HeaderName, value: HeaderValue) {
            self.headers.append(name, value);
        }
        fn insert_header(&mut self, name: HeaderName, value: HeaderValue) {
            self.headers.insert(name, value);
        }
        fn is_committed(&self) -> bool {
            false
        }
        fn response_channel(&mut self) -> Result<&mut ByteWriteChannel, CallError> {
            self.channel.as_mut().ok_or(CallError::AlreadyUpgraded)
        }
        async fn respond_upgrade(&mut self, upgrade: ProtocolUpgrade) -> Result<(), CallError> {
            let (headers, _handler) = upgrade.into_parts();
            self.upgraded = Some(headers);
            Ok(())
        }
    }

    struct TestCall {
        request: TestRequest,
        response: TestResponse,
        token: CancellationToken,
    }

    impl ApplicationCall for TestCall {
        fn request(&self) -> &dyn crate::ApplicationRequest {
            &self.request
        }
        fn request_mut(&mut self) -> &mut dyn crate::ApplicationRequest {
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

    fn test_call() -> (TestCall, WriteChannelConsumer) {
        let token = CancellationToken::new();
        let (channel, consumer) = write_channel(4, token.clone());
        let call = TestCall {
            request: TestRequest {
                method: Method::GET,
                headers: HeaderMap::new(),
                uri: Uri::from_static("/"),
                params: Parameters::default(),
                cookies: RequestCookies::default(),
                point: ConnectionPoint::new("http", Version::HTTP_11, "localhost", 80),
            },
            response: TestResponse {
                status: StatusCode::OK,
                headers: HeaderMap::new(),
                channel: Some(channel),
                upgraded: None,
            },
            token,
        };
        (call, consumer)
    }

    async fn collect(consumer: &mut WriteChannelConsumer) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(command) = consumer.next().await.unwrap() {
            if let WriteCommand::Data(data) = command {
                out.extend_from_slice(&data);
            }
        }
        out
    }

    #[tokio::test]
    async fn bytes_set_length_and_type() {
        let (mut call, mut consumer) = test_call();
        let reader = tokio::spawn(async move { collect(&mut consumer).await });

        respond(&mut call, OutgoingContent::text("hello")).await.unwrap();

        let headers = call.response().headers();
        assert_eq!(headers[CONTENT_LENGTH], "5");
        assert_eq!(headers[CONTENT_TYPE], "text/plain; charset=utf-8");
        assert_eq!(reader.await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn stream_is_copied_frame_by_frame() {
        let (mut call, mut consumer) = test_call();
        let reader = tokio::spawn(async move { collect(&mut consumer).await });

        let frames = futures::stream::iter(vec![
            Ok::<_, BoxError>(Frame::data(Bytes::from_static(b"one "))),
            Ok(Frame::data(Bytes::from_static(b"two"))),
            Ok(Frame::trailers(HeaderMap::new())),
        ]);
        respond(&mut call, OutgoingContent::stream(StreamBody::new(frames))).await.unwrap();

        assert!(call.response().headers().get(CONTENT_LENGTH).is_none());
        assert_eq!(reader.await.unwrap(), b"one two");
    }

    #[tokio::test]
    async fn sized_stream_announces_length() {
        let (mut call, mut consumer) = test_call();
        let reader = tokio::spawn(async move { collect(&mut consumer).await });

        let body = Full::new(Bytes::from_static(b"sized"));
        respond(&mut call, OutgoingContent::stream(body)).await.unwrap();

        assert_eq!(call.response().headers()[CONTENT_LENGTH], "5");
        assert_eq!(reader.await.unwrap(), b"sized");
    }

    #[tokio::test]
    async fn upgrade_bypasses_body_path() {
        let (mut call, _consumer) = test_call();
        let upgrade = ProtocolUpgrade::for_protocol("test-protocol", |_input, _output, _token| async { Ok(()) }).unwrap();

        respond(&mut call, OutgoingContent::Upgrade(upgrade)).await.unwrap();

        let headers = call.response.upgraded.take().unwrap();
        assert_eq!(headers[UPGRADE], "test-protocol");
        assert_eq!(headers[CONNECTION], "upgrade");
        assert_eq!(call.response.channel.as_ref().map(ByteWriteChannel::bytes_written), Some(0));
    }

    #[test]
    fn json_content_is_typed() {
        let content = OutgoingContent::json(&serde_json::json!({"ok": true})).unwrap();
        match content {
            OutgoingContent::Bytes { data, content_type } => {
                assert_eq!(&data[..], br#"{"ok":true}"#);
                assert_eq!(content_type, Some(mime::APPLICATION_JSON));
            }
            other => panic!("unexpected content {other:?}"),
        }
    }
}
