//! TCP transport

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::common::{Address, Conn};
use crate::error::{Error, Result};

use super::{Dialer, Listener};

/// Raw TCP dialer
#[derive(Default)]
pub struct TcpDialer;

impl TcpDialer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: &Address) -> Result<Conn> {
        let stream = match addr {
            Address::Socket(sa) => TcpStream::connect(sa).await?,
            Address::Domain(domain, port) => {
                TcpStream::connect(format!("{}:{}", domain, port)).await?
            }
        };

        // Disable Nagle's algorithm for lower latency
        stream.set_nodelay(true)?;

        let local = Address::Socket(stream.local_addr()?);
        let peer = Address::Socket(stream.peer_addr()?);
        Ok(Conn::new(Box::new(stream), local, peer))
    }
}

/// Raw TCP listener
pub struct TcpListener {
    listener: tokio::net::TcpListener,
}

impl TcpListener {
    pub async fn bind(addr: &Address) -> Result<Self> {
        let sa = addr
            .as_socket()
            .ok_or_else(|| Error::Config("cannot bind to a domain address".into()))?;
        Ok(Self {
            listener: tokio::net::TcpListener::bind(sa).await?,
        })
    }
}

#[async_trait]
impl Listener for TcpListener {
    async fn accept(&self) -> Result<Conn> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        let local = Address::Socket(stream.local_addr()?);
        Ok(Conn::new(Box::new(stream), local, Address::Socket(peer)))
    }

    fn local_addr(&self) -> Result<Address> {
        Ok(Address::Socket(self.listener.local_addr()?))
    }

    async fn close(&self) -> Result<()> {
        // the socket closes when the listener is dropped
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn dial_and_accept() {
        let listener = TcpListener::bind(&"127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let dial = tokio::spawn(async move { TcpDialer::new().dial(&addr).await });
        let mut accepted = listener.accept().await.unwrap();
        let mut dialed = dial.await.unwrap().unwrap();

        dialed.stream.write_all(b"abc").await.unwrap();
        let mut buf = [0u8; 3];
        accepted.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abc");
    }
}
