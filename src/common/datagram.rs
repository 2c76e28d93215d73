//! Datagram abstraction
//!
//! Packet-oriented counterpart to `Stream`: message boundaries are
//! preserved, delivery and ordering are not guaranteed.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;

use crate::error::{Error, Result};

use super::Address;

/// A packet endpoint. `&self` methods so one endpoint can serve
/// concurrent read and write loops.
#[async_trait]
pub trait Datagram: Send + Sync {
    /// Receive one packet. Oversized packets are truncated to `buf`.
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, Address)>;

    /// Send one packet to `addr`.
    async fn send_to(&self, buf: &[u8], addr: &Address) -> Result<usize>;

    fn local_addr(&self) -> Option<SocketAddr>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Plain UDP socket as a Datagram.
pub struct UdpDatagram {
    socket: Arc<UdpSocket>,
}

impl UdpDatagram {
    pub fn new(socket: UdpSocket) -> Self {
        Self {
            socket: Arc::new(socket),
        }
    }

    /// Bind an unconnected socket on an ephemeral local port.
    pub async fn unbound() -> Result<Self> {
        Ok(Self::new(UdpSocket::bind("0.0.0.0:0").await?))
    }

    pub async fn bind(addr: &Address) -> Result<Self> {
        let addr = addr
            .as_socket()
            .ok_or_else(|| Error::InvalidAddress(addr.to_string()))?;
        Ok(Self::new(UdpSocket::bind(addr).await?))
    }

    pub fn socket(&self) -> Arc<UdpSocket> {
        self.socket.clone()
    }
}

#[async_trait]
impl Datagram for UdpDatagram {
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, Address)> {
        let (n, addr) = self.socket.recv_from(buf).await?;
        Ok((n, Address::Socket(addr)))
    }

    async fn send_to(&self, buf: &[u8], addr: &Address) -> Result<usize> {
        let n = match addr {
            Address::Socket(sa) => self.socket.send_to(buf, sa).await?,
            Address::Domain(host, port) => {
                self.socket
                    .send_to(buf, format!("{}:{}", host, port))
                    .await?
            }
        };
        Ok(n)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn udp_roundtrip_preserves_boundaries() {
        let a = UdpDatagram::unbound().await.unwrap();
        let b = UdpDatagram::bind(&"127.0.0.1:0".parse().unwrap()).await.unwrap();
        let b_addr = Address::Socket(SocketAddr::new(
            "127.0.0.1".parse().unwrap(),
            b.local_addr().unwrap().port(),
        ));

        a.send_to(b"one", &b_addr).await.unwrap();
        a.send_to(b"twotwo", &b_addr).await.unwrap();

        let mut buf = [0u8; 64];
        let (n, _) = b.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"one");
        let (n, _) = b.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"twotwo");
    }
}
