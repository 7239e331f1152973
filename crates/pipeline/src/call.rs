//! The call abstraction: one request/response pair as the pipeline sees it.
//!
//! A server integration implements [`ApplicationCall`] with its own request and response views;
//! the pipeline only ever talks to these traits.

use std::fmt;
use std::net::SocketAddr;

use async_trait::async_trait;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, Version};
use tokio_util::sync::CancellationToken;

use crate::io::{ByteReadChannel, ByteWriteChannel};
use crate::{CallError, Parameters, ProtocolUpgrade, RequestCookies};

/// One in-flight call, a request view plus a response view under one cancellation scope.
pub trait ApplicationCall: Send + Sync {
    fn request(&self) -> &dyn ApplicationRequest;

    fn request_mut(&mut self) -> &mut dyn ApplicationRequest;

    fn response(&self) -> &dyn ApplicationResponse;

    fn response_mut(&mut self) -> &mut dyn ApplicationResponse;

    /// Cancelled when the call is abandoned, every channel of the call observes it.
    fn cancellation(&self) -> &CancellationToken;
}

/// Read-only view of the request.
pub trait ApplicationRequest: Send + Sync {
    fn method(&self) -> &Method;

    fn uri(&self) -> &Uri;

    fn version(&self) -> Version;

    fn headers(&self) -> &HeaderMap;

    /// Percent-decoded query parameters, parsed on first access.
    fn query_parameters(&self) -> &Parameters;

    /// Query parameters exactly as they appear in the URI.
    fn raw_query_parameters(&self) -> &Parameters;

    fn cookies(&self) -> &RequestCookies;

    fn local(&self) -> &ConnectionPoint;

    fn remote(&self) -> &ConnectionPoint;

    /// The request body. Can be taken once, later calls fail with [`CallError::BodyConsumed`].
    fn receive_channel(&mut self) -> Result<ByteReadChannel, CallError>;
}

/// Response controls. Status and headers are mutable until the response is committed,
/// after that mutations are ignored.
#[async_trait]
pub trait ApplicationResponse: Send + Sync {
    fn status(&self) -> StatusCode;

    fn set_status(&mut self, status: StatusCode);

    /// A snapshot of the headers that will be sent.
    fn headers(&self) -> HeaderMap;

    fn append_header(&mut self, name: HeaderName, value: HeaderValue);

    fn insert_header(&mut self, name: HeaderName, value: HeaderValue);

    /// Whether the head left, or is about to leave, for the client.
    fn is_committed(&self) -> bool;

    /// The response body channel, opened on first use.
    fn response_channel(&mut self) -> Result<&mut ByteWriteChannel, CallError>;

    /// Switches the connection to another protocol and runs the upgrade's session.
    ///
    /// Resolves once the session is over. The response can not be used afterwards.
    async fn respond_upgrade(&mut self, upgrade: ProtocolUpgrade) -> Result<(), CallError>;
}

/// One end of the connection a call arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionPoint {
    scheme: &'static str,
    version: Version,
    host: String,
    port: u16,
}

impl ConnectionPoint {
    pub fn new(scheme: &'static str, version: Version, host: impl Into<String>, port: u16) -> Self {
        Self { scheme, version, host: host.into(), port }
    }

    pub fn from_socket(scheme: &'static str, version: Version, addr: SocketAddr) -> Self {
        Self::new(scheme, version, addr.ip().to_string(), addr.port())
    }

    pub fn scheme(&self) -> &'static str {
        self.scheme
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for ConnectionPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", self.scheme, self.host, self.port)
        } else {
            write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displays_ipv6_hosts_in_brackets() {
        let v4 = ConnectionPoint::from_socket("http", Version::HTTP_11, "127.0.0.1:8080".parse().unwrap());
        let v6 = ConnectionPoint::from_socket("https", Version::HTTP_11, "[::1]:8443".parse().unwrap());

        assert_eq!(v4.to_string(), "http://127.0.0.1:8080");
        assert_eq!(v6.to_string(), "https://[::1]:8443");
        assert_eq!(v6.host(), "::1");
        assert_eq!(v6.port(), 8443);
    }
}
