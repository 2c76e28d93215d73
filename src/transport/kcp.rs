//! KCP transport
//!
//! KCP over UDP with a yamux multiplexer per conversation and an
//! optional sealed (AEAD) layer keyed by passphrase between the two.
//! Each accepted logical stream is indistinguishable from a TCP
//! connection for the layers above.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_kcp::{KcpConfig as RawKcpConfig, KcpListener as RawKcpListener, KcpStream};
use tracing::{debug, warn};

use crate::common::{Address, Conn, Stream};
use crate::crypto::SealedStream;
use crate::error::{Error, Result};
use crate::session::{Session, SessionCache};

use super::mux::{self, MuxClient};
use super::{resolve, AcceptQueue, Dialer, Listener, DEFAULT_BACKLOG};

#[derive(Debug, Clone)]
pub struct KcpConfig {
    /// Seal the stream with this passphrase; plaintext when empty.
    pub passphrase: Option<String>,
    /// Logical streams per conversation (0 = yamux default).
    pub max_streams: usize,
    pub backlog: usize,
}

impl Default for KcpConfig {
    fn default() -> Self {
        Self {
            passphrase: None,
            max_streams: 0,
            backlog: DEFAULT_BACKLOG,
        }
    }
}

fn raw_config(_config: &KcpConfig) -> RawKcpConfig {
    RawKcpConfig::default()
}

fn seal(stream: Stream, config: &KcpConfig, client: bool) -> Result<Stream> {
    match config.passphrase.as_deref().filter(|p| !p.is_empty()) {
        Some(pass) if client => Ok(Box::new(SealedStream::client(stream, pass)?)),
        Some(pass) => Ok(Box::new(SealedStream::server(stream, pass)?)),
        None => Ok(stream),
    }
}

// ============================================================================
// Dialer
// ============================================================================

pub struct KcpDialer {
    config: KcpConfig,
    sessions: SessionCache<KcpSession>,
}

struct KcpSession {
    mux: MuxClient,
}

#[async_trait]
impl Session for KcpSession {
    async fn open_stream(&self) -> Result<Stream> {
        self.mux.open_stream().await
    }

    fn is_closed(&self) -> bool {
        self.mux.is_closed()
    }

    async fn close(&self) {}
}

impl KcpDialer {
    pub fn new(config: KcpConfig) -> Self {
        Self {
            config,
            sessions: SessionCache::new(),
        }
    }

    async fn init_session(&self, addr: &Address) -> Result<KcpSession> {
        let sa = resolve(addr).await?;
        let stream = KcpStream::connect(&raw_config(&self.config), sa)
            .await
            .map_err(|e| Error::Transport(format!("kcp: {}", e)))?;
        let stream = seal(Box::new(stream), &self.config, true)?;
        Ok(KcpSession {
            mux: MuxClient::new(stream, self.config.max_streams),
        })
    }
}

#[async_trait]
impl Dialer for KcpDialer {
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

pub struct KcpListener {
    local: Address,
    queue: Arc<AcceptQueue>,
}

impl KcpListener {
    pub async fn bind(addr: &Address, config: KcpConfig) -> Result<Self> {
        let sa = addr
            .as_socket()
            .ok_or_else(|| Error::Config("cannot bind to a domain address".into()))?;
        let mut listener = RawKcpListener::bind(raw_config(&config), sa)
            .await
            .map_err(|e| Error::Resource(format!("kcp: {}", e)))?;
        let queue = Arc::new(AcceptQueue::new(config.backlog));

        let accept_queue = queue.clone();
        tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(s) => s,
                    Err(e) => {
                        warn!("kcp: accept: {}", e);
                        break;
                    }
                };
                if accept_queue.is_closed() {
                    break;
                }
                debug!("kcp: conversation from {}", peer);

                let producer = accept_queue.producer();
                let config = config.clone();
                tokio::spawn(async move {
                    let stream: Stream = match seal(Box::new(stream), &config, false) {
                        Ok(s) => s,
                        Err(e) => {
                            warn!("kcp: seal: {}", e);
                            return;
                        }
                    };
                    let peer_addr = Address::Socket(peer);
                    mux::serve(stream, config.max_streams, move |logical| {
                        producer.offer(
                            Conn::new(logical, Address::unspecified(), peer_addr.clone()),
                            "kcp",
                        );
                    })
                    .await;
                });
            }
            accept_queue.close();
        });

        Ok(Self {
            local: addr.clone(),
            queue,
        })
    }
}

#[async_trait]
impl Listener for KcpListener {
    async fn accept(&self) -> Result<Conn> {
        self.queue.pop().await
    }

    fn local_addr(&self) -> Result<Address> {
        Ok(self.local.clone())
    }

    async fn close(&self) -> Result<()> {
        self.queue.close();
        Ok(())
    }
}
