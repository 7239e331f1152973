//! Declarative engine configuration.
//!
//! Deserializable from any serde format, every field has a default:
//!
//! ```json
//! {
//!   "connectors": [
//!     { "scheme": "http", "host": "0.0.0.0", "port": 8080 },
//!     { "scheme": "https", "host": "0.0.0.0", "port": 8443,
//!       "tls": { "certificate_chain": "cert.pem", "private_key": "key.pem" } }
//!   ],
//!   "worker_threads": 64,
//!   "buffer_size": 8192
//! }
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use micro_exchange::server::{Listener, TlsMaterial};
use serde::Deserialize;

use crate::EngineError;
use crate::stream_adapter::{DEFAULT_BUFFER_SIZE, DEFAULT_CHANNEL_CAPACITY};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectorScheme {
    Http,
    Https,
}

/// PEM files of an https connector.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TlsConfig {
    pub certificate_chain: PathBuf,
    pub private_key: PathBuf,
    /// Client certificates are required and verified against these roots when set.
    #[serde(default)]
    pub client_trust_roots: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConnectorConfig {
    pub scheme: ConnectorScheme,
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

impl ConnectorConfig {
    pub fn http(host: impl Into<String>, port: u16) -> Self {
        Self { scheme: ConnectorScheme::Http, host: host.into(), port, tls: None }
    }

    pub fn https(host: impl Into<String>, port: u16, tls: TlsConfig) -> Self {
        Self { scheme: ConnectorScheme::Https, host: host.into(), port, tls: Some(tls) }
    }

    fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub(crate) fn to_listener(&self) -> Result<Listener, EngineError> {
        match (self.scheme, &self.tls) {
            (ConnectorScheme::Http, _) => Ok(Listener::http(self.address())),
            (ConnectorScheme::Https, Some(tls)) => {
                let mut material = TlsMaterial::from_pem(read_pem(&tls.certificate_chain)?, read_pem(&tls.private_key)?);
                if let Some(roots) = &tls.client_trust_roots {
                    material = material.with_client_trust_roots(read_pem(roots)?);
                }
                Ok(Listener::https(self.address(), material))
            }
            (ConnectorScheme::Https, None) => {
                Err(EngineError::invalid_config(format!("https connector {} has no tls material", self.address())))
            }
        }
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>, EngineError> {
    fs::read(path).map_err(|source| EngineError::TlsMaterial { path: path.to_path_buf(), source })
}

fn default_host() -> String {
    "0.0.0.0".to_owned()
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub connectors: Vec<ConnectorConfig>,
    pub io_threads: usize,
    pub worker_threads: usize,
    /// Size of every blocking read and of each connection's read buffer.
    pub buffer_size: usize,
    pub channel_capacity: usize,
    /// Preallocates connection read buffers at full size.
    pub use_direct_buffers: bool,
    /// How long `stop` waits for in-flight calls, in milliseconds.
    pub shutdown_grace_millis: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let cpus = thread::available_parallelism().map_or(1, usize::from);
        Self {
            connectors: Vec::new(),
            io_threads: cpus.max(2),
            worker_threads: cpus * 8,
            buffer_size: DEFAULT_BUFFER_SIZE,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            use_direct_buffers: true,
            shutdown_grace_millis: 5_000,
        }
    }
}

impl EngineConfig {
    pub fn connector(mut self, connector: ConnectorConfig) -> Self {
        self.connectors.push(connector);
        self
    }

    pub fn io_threads(mut self, io_threads: usize) -> Self {
        self.io_threads = io_threads;
        self
    }

    pub fn worker_threads(mut self, worker_threads: usize) -> Self {
        self.worker_threads = worker_threads;
        self
    }

    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace_millis = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_millis)
    }

    pub(crate) fn validate(&self) -> Result<(), EngineError> {
        if self.connectors.is_empty() {
            return Err(EngineError::invalid_config("no connector configured"));
        }
        if self.channel_capacity == 0 {
            return Err(EngineError::invalid_config("channel_capacity must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_with_defaults() {
        let config: EngineConfig = serde_json::from_str(
            r#"{
                "connectors": [{ "scheme": "http", "port": 8080 }],
                "worker_threads": 4,
                "shutdown_grace_millis": 250
            }"#,
        )
        .unwrap();

        assert_eq!(config.connectors, vec![ConnectorConfig::http("0.0.0.0", 8080)]);
        assert_eq!(config.worker_threads, 4);
        assert_eq!(config.buffer_size, DEFAULT_BUFFER_SIZE);
        assert!(config.use_direct_buffers);
        assert_eq!(config.grace(), Duration::from_millis(250));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_empty_and_https_without_tls() {
        assert!(matches!(EngineConfig::default().validate(), Err(EngineError::InvalidConfig { .. })));

        let connector: ConnectorConfig = serde_json::from_str(r#"{ "scheme": "https", "port": 8443 }"#).unwrap();
        assert!(matches!(connector.to_listener(), Err(EngineError::InvalidConfig { .. })));
    }

    #[test]
    fn missing_tls_files_name_the_path() {
        let tls = TlsConfig {
            certificate_chain: PathBuf::from("/nonexistent/cert.pem"),
            private_key: PathBuf::from("/nonexistent/key.pem"),
            client_trust_roots: None,
        };
        let error = ConnectorConfig::https("127.0.0.1", 0, tls).to_listener().unwrap_err();
        assert!(error.to_string().contains("/nonexistent/"));
    }

    #[test]
    fn brackets_ipv6_hosts() {
        let listener = ConnectorConfig::http("::1", 8080).to_listener().unwrap();
        assert_eq!(listener.address(), "[::1]:8080");
    }
}
