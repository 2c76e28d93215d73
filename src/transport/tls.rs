//! TLS transport

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::{self, ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::common::{Address, Conn};
use crate::error::{Error, Result};

use super::{Dialer, Listener, TcpDialer, TcpListener};

/// TLS configuration
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// Server name for SNI
    pub server_name: Option<String>,
    /// Allow insecure certificates
    pub allow_insecure: bool,
    /// ALPN protocols
    pub alpn: Vec<String>,
    /// Certificate file path (for server)
    pub certificate_file: Option<String>,
    /// Private key file path (for server)
    pub key_file: Option<String>,
}

/// Client/server TLS wrapper shared by the TLS, WSS, HTTP/2 and QUIC
/// transports.
pub struct TlsWrapper {
    config: TlsConfig,
    connector: TlsConnector,
    acceptor: Option<TlsAcceptor>,
}

impl TlsWrapper {
    pub fn new(config: TlsConfig) -> Self {
        let connector = TlsConnector::from(Arc::new(Self::client_config(&config)));
        let acceptor = Self::server_config(&config)
            .map(|sc| TlsAcceptor::from(Arc::new(sc)));
        Self {
            config,
            connector,
            acceptor,
        }
    }

    pub fn client_config(config: &TlsConfig) -> ClientConfig {
        let mut root_store = RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let mut tls_config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        if !config.alpn.is_empty() {
            tls_config.alpn_protocols =
                config.alpn.iter().map(|s| s.as_bytes().to_vec()).collect();
        }

        if config.allow_insecure {
            tls_config
                .dangerous()
                .set_certificate_verifier(Arc::new(InsecureVerifier));
        }

        tls_config
    }

    pub fn server_config(config: &TlsConfig) -> Option<ServerConfig> {
        let cert_file = config.certificate_file.as_ref()?;
        let key_file = config.key_file.as_ref()?;

        let certs = load_certs(cert_file).ok()?;
        let key = load_private_key(key_file).ok()?;

        let mut sc = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .ok()?;
        if !config.alpn.is_empty() {
            sc.alpn_protocols = config.alpn.iter().map(|s| s.as_bytes().to_vec()).collect();
        }
        Some(sc)
    }

    fn server_name(&self, addr: &Address) -> Result<ServerName<'static>> {
        let name = self
            .config
            .server_name
            .clone()
            .unwrap_or_else(|| addr.host());
        ServerName::try_from(name.clone())
            .map_err(|_| Error::Config(format!("invalid server name: {}", name)))
    }

    pub async fn wrap_client(&self, conn: Conn, addr: &Address) -> Result<Conn> {
        let name = self.server_name(addr)?;
        let connector = self.connector.clone();
        Ok(match connector.connect(name, conn.stream).await {
            Ok(tls) => Conn {
                stream: Box::new(tls),
                local: conn.local,
                peer: conn.peer,
                envelope: conn.envelope,
            },
            Err(e) => return Err(Error::Handshake(format!("tls: {}", e))),
        })
    }

    pub async fn wrap_server(&self, conn: Conn) -> Result<Conn> {
        let acceptor = self.acceptor.as_ref().ok_or_else(|| {
            Error::Config("TLS server requires certificate_file and key_file".into())
        })?;
        let tls = acceptor
            .accept(conn.stream)
            .await
            .map_err(|e| Error::Handshake(format!("tls: {}", e)))?;
        Ok(Conn {
            stream: Box::new(tls),
            local: conn.local,
            peer: conn.peer,
            envelope: conn.envelope,
        })
    }
}

pub fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| Error::Config(format!("failed to open certificate file {}: {}", path, e)))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Config(format!("failed to parse certificates: {}", e)))?;
    Ok(certs)
}

pub fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| Error::Config(format!("failed to open key file {}: {}", path, e)))?;
    let mut reader = BufReader::new(file);

    let keys = rustls_pemfile::read_all(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Config(format!("failed to parse private key: {}", e)))?;

    for item in keys {
        match item {
            rustls_pemfile::Item::Pkcs8Key(key) => return Ok(PrivateKeyDer::Pkcs8(key)),
            rustls_pemfile::Item::Pkcs1Key(key) => return Ok(PrivateKeyDer::Pkcs1(key)),
            rustls_pemfile::Item::Sec1Key(key) => return Ok(PrivateKeyDer::Sec1(key)),
            _ => continue,
        }
    }

    Err(Error::Config("no valid private key found in file".into()))
}

/// TLS over TCP dialer
pub struct TlsDialer {
    inner: TcpDialer,
    wrapper: TlsWrapper,
}

impl TlsDialer {
    pub fn new(config: TlsConfig) -> Self {
        Self {
            inner: TcpDialer::new(),
            wrapper: TlsWrapper::new(config),
        }
    }
}

#[async_trait]
impl Dialer for TlsDialer {
    async fn dial(&self, addr: &Address) -> Result<Conn> {
        self.inner.dial(addr).await
    }

    async fn handshake(&self, conn: Conn, addr: &Address) -> Result<Conn> {
        self.wrapper.wrap_client(conn, addr).await
    }
}

/// TLS over TCP listener
pub struct TlsListener {
    inner: TcpListener,
    wrapper: TlsWrapper,
}

impl TlsListener {
    pub async fn bind(addr: &Address, config: TlsConfig) -> Result<Self> {
        let wrapper = TlsWrapper::new(config);
        if wrapper.acceptor.is_none() {
            return Err(Error::Config(
                "TLS listener requires certificate_file and key_file".into(),
            ));
        }
        Ok(Self {
            inner: TcpListener::bind(addr).await?,
            wrapper,
        })
    }
}

#[async_trait]
impl Listener for TlsListener {
    async fn accept(&self) -> Result<Conn> {
        let conn = self.inner.accept().await?;
        self.wrapper.wrap_server(conn).await
    }

    fn local_addr(&self) -> Result<Address> {
        self.inner.local_addr()
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

/// Insecure certificate verifier for testing
#[derive(Debug)]
struct InsecureVerifier;

impl rustls::client::danger::ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}
