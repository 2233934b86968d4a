//! Read/write abstraction over plain TCP or TLS.
//!
//! A tunneled TLS session is established *after* a proxy CONNECT/SOCKS
//! success, so upgrades consume a plain transport and hand back a TLS one
//! over the same socket.

use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pki_types::{CertificateDer, ServerName};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::errors::{NetError, Result};

/// TLS knobs carried by a client scheme.
#[derive(Debug, Clone)]
pub struct TlsSettings {
    /// Verify the peer certificate chain. Turning this off is for test rigs
    /// against self-signed certificates only.
    pub verify: bool,
    /// Extra CA bundle (PEM) trusted in addition to the native roots.
    pub ca_file: Option<PathBuf>,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self { verify: true, ca_file: None }
    }
}

/// One live connection's byte pipe.
pub enum Transport {
    Plain(TcpStream),
    TlsClient(Box<tokio_rustls::client::TlsStream<TcpStream>>),
    TlsServer(Box<tokio_rustls::server::TlsStream<TcpStream>>),
}

impl Transport {
    pub fn is_tls(&self) -> bool {
        !matches!(self, Transport::Plain(_))
    }

    pub fn peer_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        match self {
            Transport::Plain(s) => s.peer_addr(),
            Transport::TlsClient(s) => s.get_ref().0.peer_addr(),
            Transport::TlsServer(s) => s.get_ref().0.peer_addr(),
        }
    }

    /// Drive the client-side TLS handshake over this transport. Only a plain
    /// transport can be upgraded; a second upgrade is a protocol error.
    pub async fn start_tls_client(self, connector: &TlsConnector, domain: &str) -> Result<Self> {
        match self {
            Transport::Plain(stream) => {
                let name = ServerName::try_from(domain.to_owned()).map_err(|_| {
                    NetError::HandshakeInvalid(format!("invalid TLS server name {domain:?}"))
                })?;
                let tls = connector.connect(name, stream).await?;
                Ok(Transport::TlsClient(Box::new(tls)))
            }
            other => {
                drop(other);
                Err(NetError::Protocol("TLS requested on an already-upgraded transport".into()))
            }
        }
    }

    /// Drive the server-side TLS handshake on an accepted socket.
    pub async fn start_tls_server(self, acceptor: &TlsAcceptor) -> Result<Self> {
        match self {
            Transport::Plain(stream) => {
                let tls = acceptor.accept(stream).await?;
                Ok(Transport::TlsServer(Box::new(tls)))
            }
            other => {
                drop(other);
                Err(NetError::Protocol("TLS accept on an already-upgraded transport".into()))
            }
        }
    }

    /// Orderly shutdown of the write side.
    pub async fn close(&mut self) -> std::io::Result<()> {
        self.shutdown().await
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Transport::TlsClient(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            Transport::TlsServer(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Transport::TlsClient(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            Transport::TlsServer(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_flush(cx),
            Transport::TlsClient(s) => Pin::new(s.as_mut()).poll_flush(cx),
            Transport::TlsServer(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Transport::TlsClient(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            Transport::TlsServer(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Plain(_) => f.write_str("Transport::Plain"),
            Transport::TlsClient(_) => f.write_str("Transport::TlsClient"),
            Transport::TlsServer(_) => f.write_str("Transport::TlsServer"),
        }
    }
}

/// Install the process-wide rustls crypto provider. Safe to call repeatedly.
pub fn init_crypto_provider() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Build a client connector honoring [`TlsSettings`].
pub fn client_connector(settings: &TlsSettings) -> Result<TlsConnector> {
    init_crypto_provider();
    let config = if settings.verify {
        let mut roots = RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs();
        for err in &native.errors {
            log::warn!("native root store: {err}");
        }
        for cert in native.certs {
            let _ = roots.add(cert);
        }
        if roots.is_empty() {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }
        if let Some(path) = &settings.ca_file {
            for cert in load_certs(path)? {
                roots
                    .add(cert)
                    .map_err(|e| NetError::HandshakeInvalid(format!("bad CA certificate: {e}")))?;
            }
        }
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    } else {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerify(provider)))
            .with_no_client_auth()
    };
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Build a server acceptor from PEM cert/key (plus an optional chain file
/// appended to the presented chain).
pub fn server_acceptor(cert: &Path, key: &Path, chain: Option<&Path>) -> Result<TlsAcceptor> {
    init_crypto_provider();
    let mut certs = load_certs(cert)?;
    if let Some(chain) = chain {
        certs.extend(load_certs(chain)?);
    }
    let key = {
        let file = std::fs::File::open(key)?;
        rustls_pemfile::private_key(&mut BufReader::new(file))?
            .ok_or_else(|| NetError::HandshakeInvalid(format!("no private key in {}", key.display())))?
    };
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| NetError::HandshakeInvalid(format!("TLS server config: {e}")))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = std::fs::File::open(path)?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::io::Result<Vec<_>>>()?;
    if certs.is_empty() {
        return Err(NetError::HandshakeInvalid(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

/// Certificate verifier that accepts everything. Gated behind
/// `verify_tls(false)`; never the default.
#[derive(Debug)]
struct NoVerify(Arc<rustls::crypto::CryptoProvider>);

impl rustls::client::danger::ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls_pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
