//! The request head of one exchange.

use http::header::{CONNECTION, EXPECT, UPGRADE};
use http::{HeaderMap, Method, Request, Uri, Version};

/// Parsed request line plus headers, without any body.
#[derive(Debug)]
pub struct RequestHeader {
    inner: Request<()>,
}

impl AsRef<Request<()>> for RequestHeader {
    fn as_ref(&self) -> &Request<()> {
        &self.inner
    }
}

impl RequestHeader {
    pub fn into_inner(self) -> Request<()> {
        self.inner
    }

    pub fn method(&self) -> &Method {
        self.inner.method()
    }

    pub fn uri(&self) -> &Uri {
        self.inner.uri()
    }

    pub fn version(&self) -> Version {
        self.inner.version()
    }

    pub fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    /// Whether the client sent `Expect: 100-continue`.
    pub fn expects_continue(&self) -> bool {
        self.headers()
            .get(EXPECT)
            .is_some_and(|value| value.as_bytes().len() >= 4 && value.as_bytes()[..4].eq_ignore_ascii_case(b"100-"))
    }

    /// Whether the connection may carry another request after this one.
    ///
    /// HTTP/1.1 defaults to keep-alive, HTTP/1.0 needs an explicit `Connection: keep-alive`.
    pub fn is_keep_alive(&self) -> bool {
        let connection_has = |token: &str| {
            self.headers().get_all(CONNECTION).iter().any(|value| {
                value.to_str().is_ok_and(|value| value.split(',').any(|part| part.trim().eq_ignore_ascii_case(token)))
            })
        };

        match self.version() {
            Version::HTTP_11 => !connection_has("close"),
            _ => connection_has("keep-alive"),
        }
    }

    /// Whether the client asked to switch protocols (`Connection: upgrade` plus an `Upgrade` header).
    pub fn is_upgrade_request(&self) -> bool {
        let wants_upgrade = self.headers().get_all(CONNECTION).iter().any(|value| {
            value.to_str().is_ok_and(|value| value.split(',').any(|part| part.trim().eq_ignore_ascii_case("upgrade")))
        });
        wants_upgrade && self.headers().contains_key(UPGRADE)
    }
}

impl From<Request<()>> for RequestHeader {
    #[inline]
    fn from(inner: Request<()>) -> Self {
        Self { inner }
    }
}
