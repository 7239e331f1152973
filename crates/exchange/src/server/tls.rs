use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use super::TlsMaterial;
use crate::protocol::ServerError;

/// Builds the acceptor of an https listener; runs before the listener binds.
pub(crate) fn acceptor(material: &TlsMaterial) -> Result<TlsAcceptor, ServerError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let certs = rustls_pemfile::certs(&mut material.certificate_chain.as_slice())
        .collect::<Result<Vec<CertificateDer<'static>>, _>>()
        .map_err(ServerError::tls)?;
    if certs.is_empty() {
        return Err(ServerError::tls("no certificate found in certificate chain"));
    }

    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut material.private_key.as_slice())
        .map_err(ServerError::tls)?
        .ok_or_else(|| ServerError::tls("no private key found"))?;

    let builder =
        ServerConfig::builder_with_provider(Arc::clone(&provider)).with_safe_default_protocol_versions().map_err(ServerError::tls)?;

    let builder = match &material.client_trust_roots {
        None => builder.with_no_client_auth(),
        Some(pem) => {
            let mut roots = RootCertStore::empty();
            for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
                roots.add(cert.map_err(ServerError::tls)?).map_err(ServerError::tls)?;
            }
            let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
                .build()
                .map_err(ServerError::tls)?;
            builder.with_client_cert_verifier(verifier)
        }
    };

    let mut config = builder.with_single_cert(certs, key).map_err(ServerError::tls)?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    debug!(client_auth = material.client_trust_roots.is_some(), "tls acceptor ready");

    Ok(TlsAcceptor::from(Arc::new(config)))
}
