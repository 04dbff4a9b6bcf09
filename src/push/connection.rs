//! Gateway connections.
//!
//! A [`Connector`] produces byte streams to the gateway; [`open`] splits one
//! stream into the write side used by the dispatcher ([`GatewayConnection`])
//! and the read side owned by that connection's error listener
//! ([`GatewayReader`]). The stream closes once both halves are gone.
//!
//! The production connector speaks TLS over TCP with a client certificate.

use std::future::Future;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, SupportedProtocolVersion};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::{debug, trace, warn};

use crate::config::GatewayConfig;
use crate::error::{Error, Result};

/// Read buffer size; error responses are six bytes.
const READ_BUFFER_SIZE: usize = 64;

/// Upper bound on a graceful write-side shutdown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Opens byte streams to the gateway.
pub trait Connector: Send + Sync {
    /// Stream type produced by this connector.
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Open a new stream to the gateway.
    fn connect(&self) -> impl Future<Output = Result<Self::Stream>> + Send;

    /// Human-readable endpoint, for logs.
    fn endpoint(&self) -> String;
}

/// Client certificate chain and private key presented to the gateway.
pub struct ClientIdentity {
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl ClientIdentity {
    /// Parse a PEM certificate chain and PEM private key.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
        let certs = parse_certificates(cert_pem)?;
        if certs.is_empty() {
            return Err(Error::Tls("no client certificates found".to_string()));
        }
        let key = PrivateKeyDer::from_pem_slice(key_pem)
            .map_err(|e| Error::Tls(format!("failed to parse private key: {e}")))?;
        Ok(Self { certs, key })
    }

    /// Read the certificate chain and key from PEM files.
    pub async fn load(cert_path: &str, key_path: &str) -> Result<Self> {
        let cert_pem = tokio::fs::read(cert_path).await.map_err(|e| {
            Error::Tls(format!("Failed to read certificate file '{cert_path}': {e}"))
        })?;
        let key_pem = tokio::fs::read(key_path)
            .await
            .map_err(|e| Error::Tls(format!("Failed to read key file '{key_path}': {e}")))?;
        Self::from_pem(&cert_pem, &key_pem)
    }

    /// Number of certificates in the chain.
    #[must_use]
    pub fn chain_len(&self) -> usize {
        self.certs.len()
    }
}

impl std::fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("certificates", &self.certs.len())
            .finish_non_exhaustive()
    }
}

/// Parse PEM-encoded certificates.
fn parse_certificates(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    CertificateDer::pem_slice_iter(pem)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("failed to parse certificates: {e}")))
}

/// Map a configured TLS version onto the protocol versions rustls may use.
pub fn protocol_versions(tls_version: &str) -> Result<&'static [&'static SupportedProtocolVersion]> {
    static TLS12_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS12];
    static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];

    match tls_version {
        "1.2" => Ok(TLS12_ONLY),
        "1.3" => Ok(TLS13_ONLY),
        "any" | "" => Ok(rustls::ALL_VERSIONS),
        other => Err(Error::Tls(format!("unsupported TLS version '{other}'"))),
    }
}

/// Build the rustls client configuration for the gateway.
///
/// Trust roots are the Mozilla set from `webpki-roots` plus any PEM
/// certificates in `extra_roots`.
pub fn build_client_config(
    identity: ClientIdentity,
    tls_version: &str,
    extra_roots: Option<&[u8]>,
) -> Result<ClientConfig> {
    let mut root_store = RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(pem) = extra_roots {
        for cert in parse_certificates(pem)? {
            root_store
                .add(cert)
                .map_err(|e| Error::Tls(format!("failed to add CA certificate: {e}")))?;
        }
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(protocol_versions(tls_version)?)
        .map_err(|e| Error::Tls(format!("protocol version error: {e}")))?
        .with_root_certificates(root_store)
        .with_client_auth_cert(identity.certs, identity.key)
        .map_err(|e| Error::Tls(format!("client config error: {e}")))
}

/// TLS-over-TCP connector for the push gateway.
pub struct TlsGatewayConnector {
    host: String,
    port: u16,
    server_name: ServerName<'static>,
    connector: TlsConnector,
    connect_timeout: Duration,
}

impl TlsGatewayConnector {
    /// Create a connector from an already-built client configuration.
    pub fn new(
        host: &str,
        port: u16,
        client_config: Arc<ClientConfig>,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| Error::Tls(format!("invalid server name '{host}': {e}")))?;

        Ok(Self {
            host: host.to_string(),
            port,
            server_name,
            connector: TlsConnector::from(client_config),
            connect_timeout,
        })
    }

    /// Load the client identity named by `config` and build a connector.
    pub async fn from_config(config: &GatewayConfig) -> Result<Self> {
        if config.certificate_path.is_empty() || config.private_key_path.is_empty() {
            return Err(Error::Tls(
                "gateway certificate_path and private_key_path are required".to_string(),
            ));
        }

        let identity = ClientIdentity::load(&config.certificate_path, &config.private_key_path).await?;
        debug!(
            certificates = identity.chain_len(),
            "Loaded gateway client identity"
        );

        let extra_roots = if config.ca_path.is_empty() {
            None
        } else {
            Some(tokio::fs::read(&config.ca_path).await.map_err(|e| {
                Error::Tls(format!("Failed to read CA file '{}': {e}", config.ca_path))
            })?)
        };

        let client_config =
            build_client_config(identity, &config.tls_version, extra_roots.as_deref())?;

        Self::new(
            config.host(),
            config.port,
            Arc::new(client_config),
            config.connect_timeout(),
        )
    }
}

impl Connector for TlsGatewayConnector {
    type Stream = TlsStream<TcpStream>;

    async fn connect(&self) -> Result<Self::Stream> {
        let endpoint = self.endpoint();

        let tcp_stream = timeout(
            self.connect_timeout,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        .map_err(|_| Error::Connection(format!("TCP connect to {endpoint} timed out")))?
        .map_err(|e| Error::Connection(format!("TCP connect to {endpoint} failed: {e}")))?;

        if let Err(e) = tcp_stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }

        let tls_stream = timeout(
            self.connect_timeout,
            self.connector.connect(self.server_name.clone(), tcp_stream),
        )
        .await
        .map_err(|_| Error::Connection(format!("TLS handshake with {endpoint} timed out")))?
        .map_err(|e| Error::Connection(format!("TLS handshake with {endpoint} failed: {e}")))?;

        Ok(tls_stream)
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Write side of a gateway connection.
pub struct GatewayConnection<S> {
    id: u64,
    writer: Option<WriteHalf<S>>,
}

/// Read side of a gateway connection, owned by its error listener.
pub struct GatewayReader<S> {
    id: u64,
    reader: ReadHalf<S>,
    buf: [u8; READ_BUFFER_SIZE],
}

/// Open a connection through `connector` and split it into its two sides.
pub async fn open<C: Connector>(
    connector: &C,
    id: u64,
) -> Result<(GatewayConnection<C::Stream>, GatewayReader<C::Stream>)> {
    let stream = connector.connect().await?;
    debug!(connection_id = id, endpoint = %connector.endpoint(), "Gateway connection opened");
    Ok(split(stream, id))
}

/// Split an established stream into its write and read sides.
pub fn split<S>(stream: S, id: u64) -> (GatewayConnection<S>, GatewayReader<S>)
where
    S: AsyncRead + AsyncWrite,
{
    let (reader, writer) = tokio::io::split(stream);
    (
        GatewayConnection {
            id,
            writer: Some(writer),
        },
        GatewayReader {
            id,
            reader,
            buf: [0u8; READ_BUFFER_SIZE],
        },
    )
}

impl<S: AsyncRead + AsyncWrite> GatewayConnection<S> {
    /// Connection identifier, unique within a batch.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Write one complete frame and flush it to the gateway.
    pub async fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        let id = self.id;
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| Error::Connection(format!("connection {id} is closed")))?;

        writer
            .write_all(frame)
            .await
            .map_err(|e| Error::Connection(format!("write on connection {id} failed: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| Error::Connection(format!("flush on connection {id} failed: {e}")))?;

        trace!(connection_id = id, bytes = frame.len(), "Frame written");
        Ok(())
    }

    /// Shut down the write side. Idempotent; teardown errors are only logged.
    pub async fn close(&mut self) {
        let Some(mut writer) = self.writer.take() else {
            return;
        };

        match timeout(CLOSE_TIMEOUT, writer.shutdown()).await {
            Ok(Ok(())) => debug!(connection_id = self.id, "Gateway connection closed"),
            Ok(Err(e)) => {
                warn!(connection_id = self.id, error = %e, "Error closing gateway connection")
            }
            Err(_) => warn!(connection_id = self.id, "Timed out closing gateway connection"),
        }
    }
}

impl<S: AsyncRead + AsyncWrite> GatewayReader<S> {
    /// Connection identifier.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait until bytes arrive and return them.
    ///
    /// Returns an empty vector when the gateway closed the stream without
    /// sending anything.
    pub async fn read_blocking(&mut self) -> Result<Vec<u8>> {
        match self.reader.read(&mut self.buf).await {
            Ok(n) => Ok(self.buf[..n].to_vec()),
            // TLS peers that drop the socket without close_notify.
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(Vec::new()),
            Err(e) => Err(Error::Connection(format!(
                "read on connection {} failed: {e}",
                self.id
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};

    /// Connector handing out one side of an in-memory pipe.
    struct PipeConnector {
        peer: tokio::sync::Mutex<Option<DuplexStream>>,
    }

    impl PipeConnector {
        fn new() -> (Self, DuplexStream) {
            let (client, server) = duplex(1024);
            (
                Self {
                    peer: tokio::sync::Mutex::new(Some(client)),
                },
                server,
            )
        }
    }

    impl Connector for PipeConnector {
        type Stream = DuplexStream;

        async fn connect(&self) -> Result<DuplexStream> {
            self.peer
                .lock()
                .await
                .take()
                .ok_or_else(|| Error::Connection("pipe already used".to_string()))
        }

        fn endpoint(&self) -> String {
            "pipe".to_string()
        }
    }

    #[tokio::test]
    async fn test_write_frame_reaches_peer() {
        let (connector, mut server) = PipeConnector::new();
        let (mut connection, _reader) = open(&connector, 1).await.unwrap();

        connection.write_frame(&[1, 2, 3, 4]).await.unwrap();

        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
        assert_eq!(connection.id(), 1);
    }

    #[tokio::test]
    async fn test_read_blocking_returns_available_bytes() {
        let (connector, mut server) = PipeConnector::new();
        let (_connection, mut reader) = open(&connector, 2).await.unwrap();

        server.write_all(&[8, 8, 0, 0, 0, 5]).await.unwrap();

        let bytes = reader.read_blocking().await.unwrap();
        assert_eq!(bytes, vec![8, 8, 0, 0, 0, 5]);
        assert_eq!(reader.id(), 2);
    }

    #[tokio::test]
    async fn test_read_blocking_empty_when_peer_closes() {
        let (connector, server) = PipeConnector::new();
        let (_connection, mut reader) = open(&connector, 3).await.unwrap();

        drop(server);

        let bytes = reader.read_blocking().await.unwrap();
        assert!(bytes.is_empty());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (connector, _server) = PipeConnector::new();
        let (mut connection, _reader) = open(&connector, 4).await.unwrap();

        connection.write_frame(&[1]).await.unwrap();
        connection.close().await;
        connection.close().await;
        assert!(connection.write_frame(&[2]).await.is_err());
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let (connector, _server) = PipeConnector::new();
        let (mut connection, _reader) = open(&connector, 5).await.unwrap();

        connection.close().await;
        let err = connection.write_frame(&[1]).await.unwrap_err();
        assert!(err.is_transport());
        assert!(err.to_string().contains("connection 5 is closed"));
    }

    #[tokio::test]
    async fn test_write_to_dropped_peer_fails() {
        let (connector, server) = PipeConnector::new();
        let (mut connection, _reader) = open(&connector, 6).await.unwrap();

        drop(server);

        let err = connection.write_frame(&[1, 2, 3]).await.unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
    }

    #[tokio::test]
    async fn test_open_propagates_connect_error() {
        let (connector, _server) = PipeConnector::new();
        let _first = open(&connector, 7).await.unwrap();
        assert!(matches!(
            open(&connector, 8).await,
            Err(Error::Connection(_))
        ));
    }

    #[test]
    fn test_protocol_versions() {
        assert_eq!(protocol_versions("1.2").unwrap().len(), 1);
        assert_eq!(
            protocol_versions("1.2").unwrap()[0].version,
            rustls::ProtocolVersion::TLSv1_2
        );
        assert_eq!(
            protocol_versions("1.3").unwrap()[0].version,
            rustls::ProtocolVersion::TLSv1_3
        );
        assert_eq!(protocol_versions("any").unwrap().len(), 2);
        assert!(matches!(protocol_versions("1.0"), Err(Error::Tls(_))));
        assert!(matches!(protocol_versions("sslv3"), Err(Error::Tls(_))));
    }

    #[test]
    fn test_identity_requires_certificates() {
        let err = ClientIdentity::from_pem(b"", b"").unwrap_err();
        assert!(err.to_string().contains("no client certificates found"));
    }

    #[test]
    fn test_identity_rejects_garbage_certificate() {
        let pem = b"-----BEGIN CERTIFICATE-----\n!!!!\n-----END CERTIFICATE-----\n";
        assert!(matches!(
            ClientIdentity::from_pem(pem, b""),
            Err(Error::Tls(_))
        ));
    }

    #[tokio::test]
    async fn test_identity_load_missing_file() {
        let err = ClientIdentity::load("/nonexistent/cert.pem", "/nonexistent/key.pem")
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("Failed to read certificate file"));
    }

    #[tokio::test]
    async fn test_from_config_requires_identity_paths() {
        let config = GatewayConfig {
            environment: "sandbox".to_string(),
            host: String::new(),
            port: 2195,
            certificate_path: String::new(),
            private_key_path: String::new(),
            ca_path: String::new(),
            tls_version: "any".to_string(),
            connect_timeout_secs: 1,
        };
        let err = TlsGatewayConnector::from_config(&config).await.err().unwrap();
        assert!(matches!(err, Error::Tls(_)));
    }
}
