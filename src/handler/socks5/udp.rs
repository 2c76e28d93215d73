//! SOCKS5 UDP ASSOCIATE
//!
//! The handler binds a local UDP socket for the client, opens an
//! upstream association through the router, and relays encapsulated
//! datagrams until the TCP control connection sees EOF.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::net::UdpSocket;
use tracing::{debug, info, trace};

use crate::common::{Address, Conn, Datagram};
use crate::error::{Error, Result};
use crate::protocol::socks5 as socks;
use crate::protocol::socks5::{Reply, SocksAddr, UdpHeader};
use crate::relay::udp::UdpRelay;

use super::Socks5Handler;

impl Socks5Handler {
    pub(super) async fn handle_udp(&self, mut conn: Conn) -> Result<()> {
        debug!("[{}] {} (udp associate)", self.service, conn.peer);

        if !self.config.enable_udp {
            self.reply_error(&mut conn, socks::REP_NOT_ALLOWED).await;
            return Err(Error::NotAllowed("udp relay is disabled".into()));
        }

        let socket = match UdpSocket::bind("0.0.0.0:0").await {
            Ok(s) => s,
            Err(e) => {
                self.reply_error(&mut conn, socks::REP_FAILURE).await;
                return Err(Error::Resource(format!("udp bind: {}", e)));
            }
        };
        let bound = socket.local_addr()?;

        // report the control connection's local IP with the socket's
        // port; known to be wrong on multi-interface hosts, kept for
        // compatibility
        let reply_host = conn
            .local
            .as_socket()
            .map(|sa| sa.ip())
            .unwrap_or_else(|| "0.0.0.0".parse().unwrap());
        Reply::new(
            socks::REP_SUCCEEDED,
            Some(SocksAddr::from_socket(SocketAddr::new(
                reply_host,
                bound.port(),
            ))),
        )
        .write_to(&mut conn.stream)
        .await?;
        debug!("[{}] udp bind on {} OK", self.service, bound);

        let upstream = match self.router.dial_packet().await {
            Ok(d) => d,
            Err(e) => return Err(e),
        };

        let client_side = Arc::new(AssociationSocket::new(socket, self.config.udp_buffer_size));
        let relay = UdpRelay::new(client_side, Arc::from(upstream))
            .with_bypass(self.bypass.clone())
            .with_buffer_size(self.config.udp_buffer_size);

        info!("[{}] {} <-> udp:{}", self.service, conn.peer, bound.port());

        // the association lives for as long as the control stream
        let mut drain = [0u8; 1024];
        let control = async {
            loop {
                match conn.stream.read(&mut drain).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };

        tokio::select! {
            _ = relay.run() => {}
            _ = control => {}
        }

        info!("[{}] {} >-< udp:{}", self.service, conn.peer, bound.port());
        Ok(())
    }
}

/// Client side of an association: strips/adds the RFC 1928 §7 header
/// and locks onto the first client source address.
pub(super) struct AssociationSocket {
    socket: UdpSocket,
    client: Mutex<Option<SocketAddr>>,
    buffer_size: usize,
}

impl AssociationSocket {
    pub(super) fn new(socket: UdpSocket, buffer_size: usize) -> Self {
        Self {
            socket,
            client: Mutex::new(None),
            buffer_size: buffer_size.max(512),
        }
    }
}

#[async_trait]
impl Datagram for AssociationSocket {
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, Address)> {
        let mut packet = vec![0u8; self.buffer_size];
        loop {
            let (n, src) = self.socket.recv_from(&mut packet).await?;

            {
                let mut client = self.client.lock();
                match *client {
                    None => *client = Some(src),
                    Some(expected) if expected != src => {
                        trace!("udp: datagram from foreign source {} dropped", src);
                        continue;
                    }
                    Some(_) => {}
                }
            }

            let (header, offset) = match UdpHeader::decode(&packet[..n]) {
                Ok(h) => h,
                Err(e) => {
                    trace!("udp: malformed datagram: {}", e);
                    continue;
                }
            };
            if header.frag != 0 {
                trace!("udp: fragmented datagram dropped");
                continue;
            }

            let payload = &packet[offset..n];
            let len = payload.len().min(buf.len());
            buf[..len].copy_from_slice(&payload[..len]);
            return Ok((len, header.addr.to_address()));
        }
    }

    async fn send_to(&self, buf: &[u8], from: &Address) -> Result<usize> {
        let client = match *self.client.lock() {
            Some(c) => c,
            None => {
                trace!("udp: no client yet, reply dropped");
                return Ok(0);
            }
        };
        let packet = UdpHeader::new(SocksAddr::from_address(from)).encode(buf);
        self.socket.send_to(&packet, client).await?;
        Ok(buf.len())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::super::{Socks5Config, Socks5Handler};
    use super::*;
    use crate::handler::Handler;
    use crate::protocol::socks5::Request;
    use crate::router::Router;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn association_relays_datagrams_both_ways() {
        let (mut client, server) = tokio::io::duplex(4096);
        let conn = Conn::new(
            Box::new(server),
            "127.0.0.1:1080".parse().unwrap(),
            "127.0.0.1:51000".parse().unwrap(),
        );

        let h = Socks5Handler::new(
            "udp-test",
            Socks5Config {
                enable_udp: true,
                ..Default::default()
            },
            Arc::new(Router::direct()),
        );
        let serve = tokio::spawn(async move { h.handle(conn).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();

        let req = Request::new(socks::CMD_UDP_ASSOCIATE, "0.0.0.0:0".parse().unwrap());
        client.write_all(&req.encode()).await.unwrap();
        let reply = Reply::read_from(&mut client).await.unwrap();
        assert_eq!(reply.rep, socks::REP_SUCCEEDED);
        let relay_port = reply.addr.port;

        // an "upstream" echo server reached through the association
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 128];
            let (n, from) = echo.recv_from(&mut buf).await.unwrap();
            echo.send_to(&buf[..n], from).await.unwrap();
        });

        let client_udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let header = UdpHeader::new(SocksAddr::from_socket(echo_addr));
        client_udp
            .send_to(&header.encode(b"marco"), ("127.0.0.1", relay_port))
            .await
            .unwrap();

        let mut buf = [0u8; 128];
        let (n, _) = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            client_udp.recv_from(&mut buf),
        )
        .await
        .unwrap()
        .unwrap();
        let (got_header, offset) = UdpHeader::decode(&buf[..n]).unwrap();
        assert_eq!(&buf[offset..n], b"marco");
        assert_eq!(got_header.addr.port, echo_addr.port());

        // closing the control stream ends the association
        drop(client);
        let _ = tokio::time::timeout(std::time::Duration::from_secs(5), serve)
            .await
            .unwrap()
            .unwrap();
    }
}
