//! Router (L4)
//!
//! Composes zero or more (dialer, connector) hops into a single dial
//! that yields a stream to the requested address. With no hops the
//! router dials directly; with hops, each leg is tunneled through the
//! previous one.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::common::{Address, Conn, Datagram, Network, UdpDatagram};
use crate::connector::Connector;
use crate::error::{Error, Result};
use crate::transport::{Dialer, Listener, TcpDialer, TcpListener, UdpDialer};

/// One proxy hop: how to reach it and how to speak to it.
pub struct Node {
    pub name: String,
    pub addr: Address,
    pub dialer: Arc<dyn Dialer>,
    pub connector: Arc<dyn Connector>,
}

pub struct Router {
    nodes: Vec<Node>,
    dial_timeout: Option<Duration>,
}

impl Default for Router {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            dial_timeout: Some(Duration::from_secs(15)),
        }
    }
}

impl Router {
    pub fn new(nodes: Vec<Node>) -> Self {
        Self {
            nodes,
            ..Default::default()
        }
    }

    /// Direct router without any hops.
    pub fn direct() -> Self {
        Self::default()
    }

    pub fn with_dial_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn is_direct(&self) -> bool {
        self.nodes.is_empty()
    }

    async fn with_timeout<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        match self.dial_timeout {
            Some(timeout) => tokio::time::timeout(timeout, fut).await?,
            None => fut.await,
        }
    }

    /// Open the chain up to the last hop; the caller applies the final
    /// connector operation.
    async fn open_chain(&self) -> Result<Conn> {
        let first = &self.nodes[0];
        debug!("chain: dialing {} ({})", first.name, first.addr);
        let mut conn = first.dialer.dial(&first.addr).await?;
        conn = first.dialer.handshake(conn, &first.addr).await?;

        for i in 1..self.nodes.len() {
            let prev = &self.nodes[i - 1];
            let next = &self.nodes[i];
            debug!("chain: {} -> {} ({})", prev.name, next.name, next.addr);
            conn = prev
                .connector
                .connect(conn, Network::Tcp, &next.addr)
                .await?;
            conn = next.dialer.handshake(conn, &next.addr).await?;
        }
        Ok(conn)
    }

    /// Dial a stream to `addr` through the chain.
    pub async fn dial(&self, network: Network, addr: &Address) -> Result<Conn> {
        self.with_timeout(async {
            if self.nodes.is_empty() {
                return match network {
                    Network::Tcp => TcpDialer::new().dial(addr).await,
                    Network::Udp => UdpDialer::new().dial(addr).await,
                };
            }

            let conn = self.open_chain().await?;
            let last = self.nodes.last().unwrap();
            last.connector.connect(conn, network, addr).await
        })
        .await
    }

    /// Open a UDP association: a datagram endpoint with no fixed peer.
    pub async fn dial_packet(&self) -> Result<Box<dyn Datagram>> {
        self.with_timeout(async {
            if self.nodes.is_empty() {
                let dgram = UdpDatagram::unbound().await?;
                return Ok(Box::new(dgram) as Box<dyn Datagram>);
            }

            let conn = self.open_chain().await?;
            let last = self.nodes.last().unwrap();
            last.connector.connect_packet(conn).await
        })
        .await
    }

    /// Bind a listener at `addr`, remotely when the chain ends in a
    /// binder-capable connector.
    pub async fn bind(&self, network: Network, addr: &Address) -> Result<Box<dyn Listener>> {
        if self.nodes.is_empty() {
            if network != Network::Tcp {
                return Err(Error::Unsupported("bind: tcp only".into()));
            }
            let listener = TcpListener::bind(addr).await?;
            return Ok(Box::new(listener));
        }

        let conn = self.with_timeout(self.open_chain()).await?;
        let last = self.nodes.last().unwrap();
        last.connector.bind(conn, network, addr).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::ForwardConnector;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn direct_dial_reaches_target() {
        let upstream = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: Address = Address::Socket(upstream.local_addr().unwrap());

        let router = Router::direct();
        let dial = tokio::spawn(async move { router.dial(Network::Tcp, &addr).await });

        let (mut server, _) = upstream.accept().await.unwrap();
        let mut conn = dial.await.unwrap().unwrap();

        conn.stream.write_all(b"direct").await.unwrap();
        let mut buf = [0u8; 6];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"direct");
    }

    #[tokio::test]
    async fn single_forward_hop_tunnels_to_hop_address() {
        let hop = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let hop_addr = Address::Socket(hop.local_addr().unwrap());

        let router = Router::new(vec![Node {
            name: "hop".into(),
            addr: hop_addr,
            dialer: Arc::new(TcpDialer::new()),
            connector: Arc::new(ForwardConnector::new()),
        }]);

        let target: Address = "ignored.example:1".parse().unwrap();
        let dial = tokio::spawn(async move { router.dial(Network::Tcp, &target).await });

        let (mut server, _) = hop.accept().await.unwrap();
        let mut conn = dial.await.unwrap().unwrap();

        conn.stream.write_all(b"via-hop").await.unwrap();
        let mut buf = [0u8; 7];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"via-hop");
    }

    #[tokio::test]
    async fn direct_packet_endpoint() {
        let router = Router::direct();
        let dgram = router.dial_packet().await.unwrap();
        assert!(dgram.local_addr().is_some());
    }
}
