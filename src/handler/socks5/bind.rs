//! SOCKS5 BIND: listen on the requested port and accept exactly one
//! inbound peer.

use tracing::{debug, info};

use crate::common::Conn;
use crate::error::{Error, Result};
use crate::protocol::socks5 as socks;
use crate::protocol::socks5::{Reply, SocksAddr};
use crate::relay::Relay;
use crate::common::Address;

use super::Socks5Handler;

impl Socks5Handler {
    pub(super) async fn handle_bind(&self, mut conn: Conn, target: &Address) -> Result<()> {
        debug!("[{}] {} >> {} (bind)", self.service, conn.peer, target);

        if !self.config.enable_bind {
            self.reply_error(&mut conn, socks::REP_NOT_ALLOWED).await;
            return Err(Error::NotAllowed("bind is disabled".into()));
        }

        // strict: no reuse, the requested port must be free
        let listener = match tokio::net::TcpListener::bind(target.to_string()).await {
            Ok(l) => l,
            Err(e) => {
                self.reply_error(&mut conn, socks::REP_FAILURE).await;
                return Err(Error::Resource(format!("bind {}: {}", target, e)));
            }
        };
        let bound = listener.local_addr()?;

        let mut bound_addr = SocksAddr::from_socket(bound);
        // the reported host follows the control connection; may be off
        // on multi-interface hosts
        if let Some(local) = conn.local.as_socket() {
            bound_addr = SocksAddr::from_socket(std::net::SocketAddr::new(local.ip(), bound.port()));
        }
        Reply::new(socks::REP_SUCCEEDED, Some(bound_addr))
            .write_to(&mut conn.stream)
            .await?;
        debug!("[{}] bind on {} OK", self.service, bound);

        // exactly one peer is served
        let (peer_stream, peer_addr) = match listener.accept().await {
            Ok(p) => p,
            Err(e) => {
                self.reply_error(&mut conn, socks::REP_FAILURE).await;
                return Err(Error::Resource(format!("accept: {}", e)));
            }
        };
        drop(listener);

        Reply::new(
            socks::REP_SUCCEEDED,
            Some(SocksAddr::from_socket(peer_addr)),
        )
        .write_to(&mut conn.stream)
        .await?;

        info!("[{}] {} <-> {} (bound)", self.service, conn.peer, peer_addr);
        Relay::new(&self.service).run(conn.stream, peer_stream).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::{Socks5Config, Socks5Handler};
    use crate::handler::Handler;
    use crate::protocol::socks5 as socks;
    use crate::protocol::socks5::{Reply, Request};
    use crate::router::Router;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn bind_accepts_one_peer_and_relays() {
        let (mut client, server) = tokio::io::duplex(4096);
        let conn = crate::common::Conn::new(
            Box::new(server),
            "127.0.0.1:1080".parse().unwrap(),
            "127.0.0.1:50000".parse().unwrap(),
        );

        let h = Socks5Handler::new(
            "bind-test",
            Socks5Config {
                enable_bind: true,
                ..Default::default()
            },
            Arc::new(Router::direct()),
        );
        let serve = tokio::spawn(async move { h.handle(conn).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();

        let req = Request::new(socks::CMD_BIND, "127.0.0.1:0".parse().unwrap());
        client.write_all(&req.encode()).await.unwrap();

        let first = Reply::read_from(&mut client).await.unwrap();
        assert_eq!(first.rep, socks::REP_SUCCEEDED);
        let port = first.addr.port;
        assert_ne!(port, 0);

        // an inbound peer connects to the bound port
        let mut peer = tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .unwrap();
        let second = Reply::read_from(&mut client).await.unwrap();
        assert_eq!(second.rep, socks::REP_SUCCEEDED);

        peer.write_all(b"from-peer").await.unwrap();
        let mut buf = [0u8; 9];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"from-peer");

        drop(peer);
        drop(client);
        let _ = serve.await.unwrap();
    }
}
