//! Transport layer
//!
//! Dialers open streams toward a remote address, listeners accept them.
//! Multiplexed transports (HTTP/2, QUIC, KCP, SSH) hand out logical
//! sub-streams that upstream code cannot tell apart from a raw TCP
//! connection.

mod tcp;
pub use tcp::{TcpDialer, TcpListener};

mod udp;
pub use udp::{UdpDialer, UdpStream};

mod tls;
pub use tls::{TlsConfig, TlsDialer, TlsListener, TlsWrapper};

mod ws;
pub use ws::{WsConfig, WsDialer, WsListener};

mod h2;
pub use self::h2::{H2ClientHandle, H2Config, H2Dialer, H2Listener, RewriteRule};

mod quic;
pub use quic::{QuicConfig, QuicDialer, QuicListener};

mod icmp;
pub use icmp::{IcmpDialer, IcmpListener, IcmpSocket};

mod kcp;
pub use kcp::{KcpConfig, KcpDialer, KcpListener};

mod ssh;
pub use ssh::{SshClientHandle, SshConfig, SshDialer, SshListener, SshdListener, SshdRequest};

mod tuntap;
pub use tuntap::{TapListener, TunListener, TuntapConfig, TuntapDevice, TuntapLayer};

pub mod mux;
pub mod wrapper;

use async_trait::async_trait;

use crate::common::{Address, Conn};
use crate::error::{Error, Result};

/// Default capacity of accept queues on multiplexed listeners.
pub const DEFAULT_BACKLOG: usize = 128;

/// Opens connections toward remote addresses.
///
/// `dial` establishes the transport; `handshake` runs the optional
/// upgrade step (TLS, WebSocket) over an already-open stream. Dialers
/// with `multiplex() == true` keep the physical connection in an
/// internal session cache and return a fresh logical stream per dial;
/// per-connection setup runs exactly once at session creation.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, addr: &Address) -> Result<Conn>;

    async fn handshake(&self, conn: Conn, _addr: &Address) -> Result<Conn> {
        Ok(conn)
    }

    fn multiplex(&self) -> bool {
        false
    }
}

/// Accepts connections from clients.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Accept the next connection; fails with [`Error::Closed`] once the
    /// listener is shut down.
    async fn accept(&self) -> Result<Conn>;

    fn local_addr(&self) -> Result<Address>;

    async fn close(&self) -> Result<()>;
}

/// Shared accept queue for listeners whose connections materialize on
/// background tasks (HTTP/2 streams, QUIC streams, mux channels).
///
/// Capacity is the listener backlog; producers drop new streams with a
/// warning when the queue is full instead of blocking the transport.
pub struct AcceptQueue {
    tx: tokio::sync::mpsc::Sender<Conn>,
    rx: tokio::sync::Mutex<tokio::sync::mpsc::Receiver<Conn>>,
    closed: tokio::sync::watch::Sender<bool>,
}

impl AcceptQueue {
    pub fn new(backlog: usize) -> Self {
        let (tx, rx) = tokio::sync::mpsc::channel(backlog.max(1));
        let (closed, _) = tokio::sync::watch::channel(false);
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            closed,
        }
    }

    /// Producer handle for background accept tasks.
    pub fn producer(&self) -> QueueProducer {
        QueueProducer {
            tx: self.tx.clone(),
        }
    }

    pub async fn pop(&self) -> Result<Conn> {
        let mut closed = self.closed.subscribe();
        let mut rx = self.rx.lock().await;
        tokio::select! {
            conn = rx.recv() => conn.ok_or(Error::Closed),
            _ = closed.wait_for(|c| *c) => Err(Error::Closed),
        }
    }

    pub fn close(&self) {
        let _ = self.closed.send(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

#[derive(Clone)]
pub struct QueueProducer {
    tx: tokio::sync::mpsc::Sender<Conn>,
}

impl QueueProducer {
    /// Offer a connection; drops it with a warning when the queue is full.
    pub fn offer(&self, conn: Conn, what: &str) {
        if let Err(e) = self.tx.try_send(conn) {
            tracing::warn!("{}: connection queue is full, client discarded ({})", what, e);
        }
    }
}

/// Resolve an [`Address`] to a socket address, resolving domains through
/// the system resolver.
pub async fn resolve(addr: &Address) -> Result<std::net::SocketAddr> {
    match addr {
        Address::Socket(sa) => Ok(*sa),
        Address::Domain(host, port) => tokio::net::lookup_host((host.as_str(), *port))
            .await?
            .next()
            .ok_or_else(|| Error::InvalidAddress(addr.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::empty_stream;

    fn dummy_conn() -> Conn {
        Conn::new(
            empty_stream(),
            Address::unspecified(),
            Address::unspecified(),
        )
    }

    #[tokio::test]
    async fn queue_drops_when_full_and_keeps_existing() {
        let queue = AcceptQueue::new(2);
        let producer = queue.producer();
        producer.offer(dummy_conn(), "test");
        producer.offer(dummy_conn(), "test");
        // queue full: silently dropped, queued streams unaffected
        producer.offer(dummy_conn(), "test");

        assert!(queue.pop().await.is_ok());
        assert!(queue.pop().await.is_ok());
    }

    #[tokio::test]
    async fn close_unblocks_pop() {
        let queue = AcceptQueue::new(1);
        let popper = async { queue.pop().await };
        let closer = async {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            queue.close();
        };
        let (res, _) = tokio::join!(popper, closer);
        assert!(matches!(res, Err(Error::Closed)));
    }
}
