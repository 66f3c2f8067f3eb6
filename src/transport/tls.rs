//! Mutually authenticated TLS connector
//!
//! Peer verification is always on: the broker certificate must chain to the
//! configured CA, and the client presents its own certificate and key.

use super::{BoxedStream, Connector, TransportError};
use crate::config::{ConfigError, ConnectionSection};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::debug;

/// Opens TCP connections to the broker and runs the TLS handshake
#[derive(Clone)]
pub struct TlsConnector {
    host: String,
    port: u16,
    config: Arc<ClientConfig>,
}

impl TlsConnector {
    /// Load the CA, client certificate and key named in the connection section
    pub fn from_config(connection: &ConnectionSection) -> Result<Self, ConfigError> {
        let (host, port) = connection.endpoint()?;

        let roots = load_root_store(&connection.ca_path)?;
        let certs = load_certs(&connection.cert_path)?;
        let key = load_private_key(&connection.key_path)?;

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| ConfigError::Tls(e.to_string()))?
            .with_root_certificates(roots)
            .with_client_auth_cert(certs, key)
            .map_err(|e| ConfigError::Tls(format!("client certificate rejected: {e}")))?;

        Ok(Self {
            host,
            port,
            config: Arc::new(config),
        })
    }
}

impl std::fmt::Debug for TlsConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConnector")
            .field("host", &self.host)
            .field("port", &self.port)
            .finish()
    }
}

#[async_trait::async_trait]
impl Connector for TlsConnector {
    async fn connect(&self) -> Result<BoxedStream, TransportError> {
        let tcp = TcpStream::connect((self.host.as_str(), self.port)).await?;
        tcp.set_nodelay(true)?;
        debug!(target: "mqtt_transport", host = %self.host, port = self.port, "TCP connected");

        let server_name = ServerName::try_from(self.host.clone()).map_err(|e| {
            TransportError::Handshake(format!("invalid server name '{}': {e}", self.host))
        })?;
        let stream = tokio_rustls::TlsConnector::from(Arc::clone(&self.config))
            .connect(server_name, tcp)
            .await
            .map_err(classify_handshake_error)?;
        debug!(target: "mqtt_transport", host = %self.host, "TLS handshake complete");

        Ok(Box::new(stream))
    }

    fn describe(&self) -> String {
        format!("mqtts://{}:{}", self.host, self.port)
    }
}

/// Errors raised by rustls are trust or certificate failures; anything else is
/// an ordinary network failure during the handshake
fn classify_handshake_error(err: io::Error) -> TransportError {
    let tls_failure = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        .map(|tls| tls.to_string());

    match tls_failure {
        Some(reason) => TransportError::Handshake(reason),
        None => TransportError::Network(err),
    }
}

fn open(path: &Path, what: &str) -> Result<BufReader<File>, ConfigError> {
    File::open(path).map(BufReader::new).map_err(|e| {
        ConfigError::Tls(format!("cannot open {what} {}: {e}", path.display()))
    })
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    let mut reader = open(path, "certificate")?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConfigError::Tls(format!("invalid PEM in {}: {e}", path.display())))?;

    if certs.is_empty() {
        return Err(ConfigError::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ConfigError> {
    let mut reader = open(path, "private key")?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ConfigError::Tls(format!("invalid PEM in {}: {e}", path.display())))?
        .ok_or_else(|| ConfigError::Tls(format!("no private key found in {}", path.display())))
}

fn load_root_store(path: &Path) -> Result<RootCertStore, ConfigError> {
    let mut store = RootCertStore::empty();
    for cert in load_certs(path)? {
        store
            .add(cert)
            .map_err(|e| ConfigError::Tls(format!("unusable CA certificate: {e}")))?;
    }
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_missing_ca_file() {
        let result = load_root_store(Path::new("/nonexistent/ca.pem"));
        match result {
            Err(ConfigError::Tls(message)) => assert!(message.contains("cannot open certificate")),
            other => panic!("expected TLS config error, got {other:?}"),
        }
    }

    #[test]
    fn test_pem_without_certificates() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "not a certificate").unwrap();

        let result = load_certs(file.path());
        match result {
            Err(ConfigError::Tls(message)) => assert!(message.contains("no certificates")),
            other => panic!("expected TLS config error, got {other:?}"),
        }
    }

    #[test]
    fn test_pem_without_private_key() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "# empty key file").unwrap();

        let result = load_private_key(file.path());
        assert!(matches!(result, Err(ConfigError::Tls(_))));
    }

    #[test]
    fn test_handshake_error_classification() {
        let tls = io::Error::new(
            io::ErrorKind::InvalidData,
            rustls::Error::InvalidCertificate(rustls::CertificateError::UnknownIssuer),
        );
        assert!(matches!(
            classify_handshake_error(tls),
            TransportError::Handshake(_)
        ));

        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "reset during handshake");
        assert!(matches!(
            classify_handshake_error(reset),
            TransportError::Network(_)
        ));
    }

    #[test]
    fn test_from_config_reports_unreadable_material() {
        let connection = ConnectionSection {
            broker_url: "mqtts://broker.example.com".to_string(),
            client_id: "tls-test".to_string(),
            ca_path: "/nonexistent/ca.pem".into(),
            cert_path: "/nonexistent/cert.pem".into(),
            key_path: "/nonexistent/key.pem".into(),
            keepalive_secs: 60,
            clean_session: true,
            connect_timeout_ms: 1000,
            max_packet_size: 1024,
        };

        assert!(matches!(
            TlsConnector::from_config(&connection),
            Err(ConfigError::Tls(_))
        ));
    }
}
