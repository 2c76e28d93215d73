//! SOCKS5 MUX-BIND
//!
//! One control connection, many inbound peers: the client connection is
//! upgraded to a multiplexed session and every connection accepted at
//! the bound listener travels as its own logical stream back to the
//! client.

use tracing::{debug, error, info};

use crate::common::{Address, Conn};
use crate::error::{Error, Result};
use crate::protocol::socks5 as socks;
use crate::protocol::socks5::{Reply, SocksAddr};
use crate::relay::Relay;
use crate::transport::mux::MuxClient;

use super::Socks5Handler;

impl Socks5Handler {
    pub(super) async fn handle_mux_bind(&self, mut conn: Conn, target: &Address) -> Result<()> {
        debug!("[{}] {} >> {} (mbind)", self.service, conn.peer, target);

        if !self.config.enable_bind {
            self.reply_error(&mut conn, socks::REP_NOT_ALLOWED).await;
            return Err(Error::NotAllowed("bind is disabled".into()));
        }

        // strict mode: an occupied port is an error
        let listener = match tokio::net::TcpListener::bind(target.to_string()).await {
            Ok(l) => l,
            Err(e) => {
                self.reply_error(&mut conn, socks::REP_FAILURE).await;
                return Err(Error::Resource(format!("bind {}: {}", target, e)));
            }
        };
        let bound = listener.local_addr()?;

        // reported host follows the control connection (multi-interface
        // hosts may publish an unreachable address)
        let mut bound_addr = SocksAddr::from_socket(bound);
        if let Some(local) = conn.local.as_socket() {
            bound_addr =
                SocksAddr::from_socket(std::net::SocketAddr::new(local.ip(), bound.port()));
        }
        Reply::new(socks::REP_SUCCEEDED, Some(bound_addr))
            .write_to(&mut conn.stream)
            .await?;
        debug!("[{}] mbind on {} OK", self.service, bound);

        // upgrade the client connection to a mux session; streams open
        // from this side only
        let mux = MuxClient::new(conn.stream, 0);
        info!("[{}] {} <-> mbind {}", self.service, conn.peer, bound);

        loop {
            if mux.is_closed() {
                return Err(Error::Closed);
            }

            let (peer_stream, peer_addr) = match listener.accept().await {
                Ok(p) => p,
                Err(e) => {
                    error!("[{}] mbind accept: {}", self.service, e);
                    return Err(Error::Resource(format!("accept: {}", e)));
                }
            };
            debug!("[{}] peer {} accepted", self.service, peer_addr);

            let mut logical = match mux.open_stream().await {
                Ok(s) => s,
                Err(e) => {
                    error!("[{}] mbind stream: {}", self.service, e);
                    return Err(e);
                }
            };

            let compatibility = self.config.compatibility_mode;
            let service = self.service.clone();
            tokio::spawn(async move {
                if !compatibility {
                    let reply = Reply::new(
                        socks::REP_SUCCEEDED,
                        Some(SocksAddr::from_socket(peer_addr)),
                    );
                    if let Err(e) = reply.write_to(&mut logical).await {
                        error!("[{}] mbind reply: {}", service, e);
                        return;
                    }
                }

                debug!("[{}] {} <-> mux stream", service, peer_addr);
                let _ = Relay::new(&service).run(logical, peer_stream).await;
                debug!("[{}] {} >-< mux stream", service, peer_addr);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::{Socks5Config, Socks5Handler};
    use super::*;
    use crate::handler::Handler;
    use crate::protocol::socks5::Request;
    use crate::router::Router;
    use crate::transport::mux;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn mbind_streams_carry_reply_and_payload() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let conn = Conn::new(
            Box::new(server),
            "127.0.0.1:1080".parse().unwrap(),
            "127.0.0.1:52000".parse().unwrap(),
        );

        let h = Socks5Handler::new(
            "mbind-test",
            Socks5Config {
                enable_bind: true,
                ..Default::default()
            },
            Arc::new(Router::direct()),
        );
        let serve = tokio::spawn(async move { h.handle(conn).await });

        let mut client: crate::common::Stream = Box::new(client);
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();

        let req = Request::new(socks::CMD_MUX_BIND, "127.0.0.1:0".parse().unwrap());
        client.write_all(&req.encode()).await.unwrap();
        let reply = Reply::read_from(&mut client).await.unwrap();
        assert_eq!(reply.rep, socks::REP_SUCCEEDED);
        let port = reply.addr.port;

        // the client side now serves the mux session
        let (tx, mut rx) = mpsc::channel(4);
        tokio::spawn(async move {
            mux::serve(client, 0, move |s| {
                let _ = tx.try_send(s);
            })
            .await;
        });

        // a peer connects to the bound port and sends a greeting
        let mut peer = tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .unwrap();
        peer.write_all(b"knock").await.unwrap();

        let mut logical = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let stream_reply = Reply::read_from(&mut logical).await.unwrap();
        assert_eq!(stream_reply.rep, socks::REP_SUCCEEDED);

        let mut buf = [0u8; 5];
        logical.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"knock");

        serve.abort();
    }
}
