use std::fmt;
use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::Path;

use crate::exchange::Scheme;

/// PEM encoded TLS material of an https listener.
#[derive(Clone, PartialEq, Eq)]
pub struct TlsMaterial {
    pub certificate_chain: Vec<u8>,
    pub private_key: Vec<u8>,
    /// When present, clients must present a certificate signed by one of these roots.
    pub client_trust_roots: Option<Vec<u8>>,
}

impl fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("certificate_chain", &self.certificate_chain.len())
            .field("private_key", &"<redacted>")
            .field("client_auth", &self.client_trust_roots.is_some())
            .finish()
    }
}

impl TlsMaterial {
    pub fn from_pem(certificate_chain: impl Into<Vec<u8>>, private_key: impl Into<Vec<u8>>) -> Self {
        Self { certificate_chain: certificate_chain.into(), private_key: private_key.into(), client_trust_roots: None }
    }

    pub fn from_files(
        certificate_chain: impl AsRef<Path>,
        private_key: impl AsRef<Path>,
        client_trust_roots: Option<&Path>,
    ) -> io::Result<Self> {
        Ok(Self {
            certificate_chain: fs::read(certificate_chain)?,
            private_key: fs::read(private_key)?,
            client_trust_roots: client_trust_roots.map(fs::read).transpose()?,
        })
    }

    pub fn with_client_trust_roots(mut self, roots: impl Into<Vec<u8>>) -> Self {
        self.client_trust_roots = Some(roots.into());
        self
    }
}

/// An address to listen on, `host:port`; port 0 picks a free port.
#[derive(Debug, Clone)]
pub struct Listener {
    pub(crate) address: String,
    pub(crate) scheme: Scheme,
    pub(crate) tls: Option<TlsMaterial>,
}

impl Listener {
    pub fn http(address: impl Into<String>) -> Self {
        Self { address: address.into(), scheme: Scheme::Http, tls: None }
    }

    pub fn https(address: impl Into<String>, material: TlsMaterial) -> Self {
        Self { address: address.into(), scheme: Scheme::Https, tls: Some(material) }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }
}

/// A listener after binding, with the address the OS actually assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundListener {
    pub scheme: Scheme,
    pub local_addr: SocketAddr,
}
