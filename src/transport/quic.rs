//! QUIC transport (also the engine behind HTTP/3-style and ICMP tunnels)
//!
//! The listener accepts QUIC connections and surfaces every
//! bidirectional stream as a Conn. The dialer keeps one QUIC connection
//! per address in the session cache and opens a fresh stream per dial.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use quinn::{Endpoint, TransportConfig, VarInt};
use tracing::{debug, warn};

use crate::common::{Address, CombinedStream, Conn, Stream};
use crate::error::{Error, Result};
use crate::session::{Session, SessionCache};

use super::{resolve, AcceptQueue, Dialer, Listener, TlsConfig, TlsWrapper, DEFAULT_BACKLOG};

const ALPN: [&str; 2] = ["http/3", "quic/v1"];

#[derive(Debug, Clone)]
pub struct QuicConfig {
    pub handshake_timeout: Duration,
    pub keep_alive_period: Option<Duration>,
    pub max_idle_timeout: Duration,
    pub max_streams: u32,
    pub backlog: usize,
}

impl Default for QuicConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(5),
            keep_alive_period: Some(Duration::from_secs(10)),
            max_idle_timeout: Duration::from_secs(30),
            max_streams: 100,
            backlog: DEFAULT_BACKLOG,
        }
    }
}

pub(crate) fn transport_config(config: &QuicConfig) -> TransportConfig {
    let mut tc = TransportConfig::default();
    tc.max_idle_timeout(Some(
        config
            .max_idle_timeout
            .try_into()
            .unwrap_or_else(|_| VarInt::from_u32(30_000).into()),
    ));
    tc.keep_alive_interval(config.keep_alive_period);
    tc.max_concurrent_bidi_streams(VarInt::from_u32(config.max_streams));
    tc
}

pub(crate) fn client_config(config: &QuicConfig, tls: &TlsConfig) -> Result<quinn::ClientConfig> {
    let mut tls = tls.clone();
    if tls.alpn.is_empty() {
        tls.alpn = ALPN.iter().map(|s| s.to_string()).collect();
    }
    let crypto = TlsWrapper::client_config(&tls);
    let crypto = QuicClientConfig::try_from(crypto)
        .map_err(|e| Error::Config(format!("quic tls: {}", e)))?;
    let mut cc = quinn::ClientConfig::new(Arc::new(crypto));
    cc.transport_config(Arc::new(transport_config(config)));
    Ok(cc)
}

pub(crate) fn server_config(config: &QuicConfig, tls: &TlsConfig) -> Result<quinn::ServerConfig> {
    let mut tls = tls.clone();
    if tls.alpn.is_empty() {
        tls.alpn = ALPN.iter().map(|s| s.to_string()).collect();
    }
    let crypto = TlsWrapper::server_config(&tls)
        .ok_or_else(|| Error::Config("quic listener requires certificate and key".into()))?;
    let crypto = QuicServerConfig::try_from(crypto)
        .map_err(|e| Error::Config(format!("quic tls: {}", e)))?;
    let mut sc = quinn::ServerConfig::with_crypto(Arc::new(crypto));
    sc.transport_config(Arc::new(transport_config(config)));
    Ok(sc)
}

// ============================================================================
// Session
// ============================================================================

pub(crate) struct QuicSession {
    conn: quinn::Connection,
}

impl QuicSession {
    pub(crate) fn new(conn: quinn::Connection) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl Session for QuicSession {
    async fn open_stream(&self) -> Result<Stream> {
        let (send, recv) = self
            .conn
            .open_bi()
            .await
            .map_err(|e| Error::Transport(format!("quic: {}", e)))?;
        Ok(Box::new(CombinedStream::new(recv, send)))
    }

    fn is_closed(&self) -> bool {
        self.conn.close_reason().is_some()
    }

    async fn close(&self) {
        self.conn.close(VarInt::from_u32(0), b"");
    }
}

// ============================================================================
// Dialer
// ============================================================================

pub struct QuicDialer {
    config: QuicConfig,
    tls: TlsConfig,
    endpoint: Endpoint,
    sessions: SessionCache<QuicSession>,
}

impl QuicDialer {
    pub fn new(config: QuicConfig, tls: TlsConfig) -> Result<Self> {
        let mut endpoint = Endpoint::client("0.0.0.0:0".parse::<SocketAddr>().unwrap())
            .map_err(|e| Error::Resource(format!("quic endpoint: {}", e)))?;
        endpoint.set_default_client_config(client_config(&config, &tls)?);
        Ok(Self {
            config,
            tls,
            endpoint,
            sessions: SessionCache::new(),
        })
    }

    async fn init_session(&self, addr: &Address) -> Result<QuicSession> {
        let sa = resolve(addr).await?;
        let server_name = self.tls.server_name.clone().unwrap_or_else(|| addr.host());
        let connecting = self
            .endpoint
            .connect(sa, &server_name)
            .map_err(|e| Error::Handshake(format!("quic: {}", e)))?;
        let conn = tokio::time::timeout(self.config.handshake_timeout, connecting)
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(|e| Error::Handshake(format!("quic: {}", e)))?;
        Ok(QuicSession::new(conn))
    }
}

#[async_trait]
impl Dialer for QuicDialer {
    async fn dial(&self, addr: &Address) -> Result<Conn> {
        let key = addr.to_string();
        let stream = self
            .sessions
            .open_stream(&key, || self.init_session(addr))
            .await?;
        Ok(Conn::new(stream, Address::unspecified(), addr.clone()))
    }

    fn multiplex(&self) -> bool {
        true
    }
}

// ============================================================================
// Listener
// ============================================================================

pub struct QuicListener {
    local: Address,
    endpoint: Endpoint,
    queue: Arc<AcceptQueue>,
}

impl QuicListener {
    pub async fn bind(addr: &Address, config: QuicConfig, tls: TlsConfig) -> Result<Self> {
        let sa = addr
            .as_socket()
            .ok_or_else(|| Error::Config("cannot bind to a domain address".into()))?;
        let endpoint = Endpoint::server(server_config(&config, &tls)?, sa)
            .map_err(|e| Error::Resource(format!("quic endpoint: {}", e)))?;
        let local = Address::Socket(endpoint.local_addr()?);
        let queue = Arc::new(AcceptQueue::new(config.backlog));

        let accept_endpoint = endpoint.clone();
        let accept_queue = queue.clone();
        tokio::spawn(async move {
            while let Some(incoming) = accept_endpoint.accept().await {
                if accept_queue.is_closed() {
                    break;
                }
                let producer = accept_queue.producer();
                tokio::spawn(async move {
                    let conn = match incoming.await {
                        Ok(c) => c,
                        Err(e) => {
                            warn!("quic: handshake failed: {}", e);
                            return;
                        }
                    };
                    serve_connection(conn, producer).await;
                });
            }
            accept_queue.close();
        });

        Ok(Self {
            local,
            endpoint,
            queue,
        })
    }
}

pub(crate) async fn serve_connection(conn: quinn::Connection, producer: super::QueueProducer) {
    let peer = Address::Socket(conn.remote_address());
    loop {
        match conn.accept_bi().await {
            Ok((send, recv)) => {
                let stream: Stream = Box::new(CombinedStream::new(recv, send));
                producer.offer(
                    Conn::new(stream, Address::unspecified(), peer.clone()),
                    "quic",
                );
            }
            Err(e) => {
                debug!("quic: connection from {} done: {}", peer, e);
                return;
            }
        }
    }
}

#[async_trait]
impl Listener for QuicListener {
    async fn accept(&self) -> Result<Conn> {
        self.queue.pop().await
    }

    fn local_addr(&self) -> Result<Address> {
        Ok(self.local.clone())
    }

    async fn close(&self) -> Result<()> {
        self.queue.close();
        self.endpoint.close(VarInt::from_u32(0), b"");
        Ok(())
    }
}
