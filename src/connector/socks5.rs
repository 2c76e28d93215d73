//! SOCKS5 client connector
//!
//! Negotiates methods in the order [NoAuth, UserPass, TLS, TLSAuth]
//! filtered by configuration, runs the RFC 1929 subnegotiation where
//! required (with TLS layered first for the TLS methods), then issues
//! CONNECT / BIND / UDP-ASSOCIATE per RFC 1928.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::debug;

use crate::common::{Address, Conn, Datagram, Network, Stream};
use crate::error::{Error, Result};
use crate::protocol::socks5 as socks;
use crate::protocol::socks5::{SocksAddr, UdpHeader};
use crate::transport::{resolve, Listener, TlsConfig, TlsWrapper};

use super::Connector;

#[derive(Debug, Clone, Default)]
pub struct Socks5ConnectorConfig {
    pub username: Option<String>,
    pub password: Option<String>,
    /// Offer the plain-TLS extension methods.
    pub enable_tls: bool,
    /// Disable the cleartext methods entirely.
    pub tls_only: bool,
}

pub struct Socks5Connector {
    config: Socks5ConnectorConfig,
    tls: Option<TlsWrapper>,
}

impl Socks5Connector {
    pub fn new(config: Socks5ConnectorConfig, tls: Option<TlsConfig>) -> Self {
        let tls = if config.enable_tls {
            Some(TlsWrapper::new(tls.unwrap_or_default()))
        } else {
            None
        };
        Self { config, tls }
    }

    fn offered_methods(&self) -> Vec<u8> {
        let has_user = self.config.username.is_some();
        let mut methods = Vec::new();
        if !self.config.tls_only {
            methods.push(socks::METHOD_NO_AUTH);
            if has_user {
                methods.push(socks::METHOD_USER_PASS);
            }
        }
        if self.config.enable_tls {
            methods.push(socks::METHOD_TLS);
            if has_user {
                methods.push(socks::METHOD_TLS_AUTH);
            }
        }
        methods
    }

    async fn negotiate(&self, mut conn: Conn) -> Result<Conn> {
        let methods = self.offered_methods();
        socks::write_methods(&mut conn.stream, &methods).await?;
        let method = socks::read_selected_method(&mut conn.stream).await?;
        debug!("socks5: method selected: {:#04x}", method);

        match method {
            socks::METHOD_NO_AUTH => Ok(conn),
            socks::METHOD_USER_PASS => {
                self.sub_negotiate(&mut conn.stream).await?;
                Ok(conn)
            }
            socks::METHOD_TLS | socks::METHOD_TLS_AUTH => {
                let tls = self
                    .tls
                    .as_ref()
                    .ok_or_else(|| Error::Protocol("socks5: TLS method not configured".into()))?;
                let peer = conn.peer.clone();
                let mut conn = tls.wrap_client(conn, &peer).await?;
                if method == socks::METHOD_TLS_AUTH || self.config.username.is_some() {
                    self.sub_negotiate(&mut conn.stream).await?;
                }
                Ok(conn)
            }
            socks::METHOD_NO_ACCEPTABLE => {
                Err(Error::Handshake("socks5: no acceptable method".into()))
            }
            other => Err(Error::Protocol(format!(
                "socks5: unexpected method {:#04x}",
                other
            ))),
        }
    }

    async fn sub_negotiate(&self, stream: &mut Stream) -> Result<()> {
        let username = self.config.username.as_deref().unwrap_or("");
        let password = self.config.password.as_deref().unwrap_or("");
        socks::write_user_pass(stream, username, password).await?;
        let status = socks::read_user_pass_status(stream).await?;
        if status != 0 {
            return Err(Error::AuthFailed);
        }
        Ok(())
    }

    async fn command(&self, conn: &mut Conn, cmd: u8, addr: &SocksAddr) -> Result<Reply> {
        socks::Request::new(cmd, addr.clone())
            .write_to(&mut conn.stream)
            .await?;
        let reply = socks::Reply::read_from(&mut conn.stream).await?;
        debug!("socks5: reply {:#04x} bound {}", reply.rep, reply.addr);
        if reply.rep != socks::REP_SUCCEEDED {
            return Err(Error::Handshake(format!(
                "socks5: request failed: {:#04x}",
                reply.rep
            )));
        }
        Ok(reply)
    }
}

type Reply = socks::Reply;

#[async_trait]
impl Connector for Socks5Connector {
    async fn connect(&self, conn: Conn, network: Network, addr: &Address) -> Result<Conn> {
        debug!("connect {}/{} via socks5", addr, network);
        let mut conn = self.negotiate(conn).await?;

        match network {
            Network::Tcp => {
                self.command(&mut conn, socks::CMD_CONNECT, &SocksAddr::from_address(addr))
                    .await?;
                Ok(conn)
            }
            Network::Udp => Err(Error::Unsupported(
                "socks5: use a udp association for datagram traffic".into(),
            )),
        }
    }

    async fn connect_packet(&self, conn: Conn) -> Result<Box<dyn Datagram>> {
        debug!("udp association via socks5");
        let mut conn = self.negotiate(conn).await?;
        let reply = self
            .command(
                &mut conn,
                socks::CMD_UDP_ASSOCIATE,
                &SocksAddr::unspecified(),
            )
            .await?;

        // the relay endpoint may answer with an unspecified host; fall
        // back to the proxy's own address in that case
        let relay_addr = reply.addr.to_address();
        let relay_sa = if relay_addr.host() == "0.0.0.0" {
            SocketAddr::new(resolve(&conn.peer).await?.ip(), reply.addr.port)
        } else {
            resolve(&relay_addr).await?
        };

        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(relay_sa).await?;

        Ok(Box::new(Socks5ClientDatagram {
            socket,
            // the association lives exactly as long as the control stream
            _control: Mutex::new(conn.stream),
        }))
    }

    async fn bind(
        &self,
        conn: Conn,
        network: Network,
        addr: &Address,
    ) -> Result<Box<dyn Listener>> {
        debug!("bind {}/{} via socks5", addr, network);
        let mut conn = self.negotiate(conn).await?;
        let reply = self
            .command(&mut conn, socks::CMD_BIND, &SocksAddr::from_address(addr))
            .await?;
        let bound = reply.addr.to_address();

        Ok(Box::new(Socks5BindListener {
            bound,
            slot: Mutex::new(Some(conn)),
        }))
    }
}

/// Client side of a UDP association: RFC 1928 §7 encapsulation over a
/// connected UDP socket.
struct Socks5ClientDatagram {
    socket: UdpSocket,
    _control: Mutex<Stream>,
}

#[async_trait]
impl Datagram for Socks5ClientDatagram {
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, Address)> {
        let mut packet = vec![0u8; buf.len() + 262];
        let n = self.socket.recv(&mut packet).await?;
        let (header, offset) = UdpHeader::decode(&packet[..n])?;
        if header.frag != 0 {
            return Err(Error::Protocol("socks5: fragmented datagram".into()));
        }
        let payload = &packet[offset..n];
        let len = payload.len().min(buf.len());
        buf[..len].copy_from_slice(&payload[..len]);
        Ok((len, header.addr.to_address()))
    }

    async fn send_to(&self, buf: &[u8], addr: &Address) -> Result<usize> {
        let packet = UdpHeader::new(SocksAddr::from_address(addr)).encode(buf);
        self.socket.send(&packet).await?;
        Ok(buf.len())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }
}

/// BIND accepts exactly one peer: the second reply announces it and the
/// control stream becomes the data stream.
struct Socks5BindListener {
    bound: Address,
    slot: Mutex<Option<Conn>>,
}

#[async_trait]
impl Listener for Socks5BindListener {
    async fn accept(&self) -> Result<Conn> {
        let mut slot = self.slot.lock().await;
        let mut conn = slot.take().ok_or(Error::Closed)?;
        let reply = socks::Reply::read_from(&mut conn.stream).await?;
        if reply.rep != socks::REP_SUCCEEDED {
            return Err(Error::Handshake(format!(
                "socks5: bind failed: {:#04x}",
                reply.rep
            )));
        }
        conn.peer = reply.addr.to_address();
        Ok(conn)
    }

    fn local_addr(&self) -> Result<Address> {
        Ok(self.bound.clone())
    }

    async fn close(&self) -> Result<()> {
        self.slot.lock().await.take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn conn_pair() -> (Conn, Stream) {
        let (client, server) = tokio::io::duplex(4096);
        (
            Conn::new(
                Box::new(client),
                Address::unspecified(),
                "proxy.example:1080".parse().unwrap(),
            ),
            Box::new(server),
        )
    }

    #[tokio::test]
    async fn no_auth_connect_emits_rfc_frames() {
        let (conn, mut server) = conn_pair();
        let connector = Socks5Connector::new(Socks5ConnectorConfig::default(), None);

        let server_task = tokio::spawn(async move {
            let mut greet = [0u8; 3];
            server.read_exact(&mut greet).await.unwrap();
            assert_eq!(greet, [0x05, 0x01, 0x00]);
            server.write_all(&[0x05, 0x00]).await.unwrap();

            let req = socks::Request::read_from(&mut server).await.unwrap();
            assert_eq!(req.cmd, socks::CMD_CONNECT);
            assert_eq!(req.addr.to_string(), "example.com:80");
            socks::Reply::new(socks::REP_SUCCEEDED, None)
                .write_to(&mut server)
                .await
                .unwrap();
        });

        let target: Address = "example.com:80".parse().unwrap();
        connector
            .connect(conn, Network::Tcp, &target)
            .await
            .unwrap();
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn user_pass_subnegotiation() {
        let (conn, mut server) = conn_pair();
        let connector = Socks5Connector::new(
            Socks5ConnectorConfig {
                username: Some("u".into()),
                password: Some("p".into()),
                ..Default::default()
            },
            None,
        );

        let server_task = tokio::spawn(async move {
            let methods = socks::read_methods(&mut server).await.unwrap();
            assert_eq!(methods, vec![socks::METHOD_NO_AUTH, socks::METHOD_USER_PASS]);
            socks::write_selected_method(&mut server, socks::METHOD_USER_PASS)
                .await
                .unwrap();

            let (user, pass) = socks::read_user_pass(&mut server).await.unwrap();
            assert_eq!((user.as_str(), pass.as_str()), ("u", "p"));
            socks::write_user_pass_status(&mut server, 0).await.unwrap();

            let _ = socks::Request::read_from(&mut server).await.unwrap();
            socks::Reply::new(socks::REP_SUCCEEDED, None)
                .write_to(&mut server)
                .await
                .unwrap();
        });

        let target: Address = "1.1.1.1:443".parse().unwrap();
        connector
            .connect(conn, Network::Tcp, &target)
            .await
            .unwrap();
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn no_acceptable_method_fails() {
        let (conn, mut server) = conn_pair();
        let connector = Socks5Connector::new(Socks5ConnectorConfig::default(), None);

        tokio::spawn(async move {
            let _ = socks::read_methods(&mut server).await;
            let _ = socks::write_selected_method(&mut server, socks::METHOD_NO_ACCEPTABLE).await;
        });

        let target: Address = "example.com:80".parse().unwrap();
        assert!(connector
            .connect(conn, Network::Tcp, &target)
            .await
            .is_err());
    }
}
