//! SOCKS5 server handler
//!
//! State machine: GREETING → AUTH? → COMMAND → (CONNECT | BIND | UDP |
//! MBIND) → RELAY. Exactly one reply frame goes out before the relay
//! starts or the connection is closed; reply write failures are logged
//! and never mask the original error.

mod bind;
mod mbind;
mod udp;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info};

use crate::capability::{Auther, Bypass};
use crate::common::{Address, Conn, Network};
use crate::error::{Error, Result};
use crate::protocol::socks5 as socks;
use crate::protocol::socks5::{Reply, Request, SocksAddr};
use crate::relay::Relay;
use crate::router::Router;

use super::Handler;

#[derive(Debug, Clone)]
pub struct Socks5Config {
    pub enable_bind: bool,
    pub enable_udp: bool,
    pub udp_buffer_size: usize,
    /// MUX-BIND without per-stream reply frames, for older peers.
    pub compatibility_mode: bool,
    pub handshake_timeout: Duration,
}

impl Default for Socks5Config {
    fn default() -> Self {
        Self {
            enable_bind: false,
            enable_udp: false,
            udp_buffer_size: crate::relay::udp::DEFAULT_BUFFER_SIZE,
            compatibility_mode: false,
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

pub struct Socks5Handler {
    service: String,
    config: Socks5Config,
    router: Arc<Router>,
    auther: Option<Arc<dyn Auther>>,
    bypass: Option<Arc<dyn Bypass>>,
}

impl Socks5Handler {
    pub fn new(service: impl Into<String>, config: Socks5Config, router: Arc<Router>) -> Self {
        Self {
            service: service.into(),
            config,
            router,
            auther: None,
            bypass: None,
        }
    }

    pub fn with_auther(mut self, auther: Option<Arc<dyn Auther>>) -> Self {
        self.auther = auther;
        self
    }

    pub fn with_bypass(mut self, bypass: Option<Arc<dyn Bypass>>) -> Self {
        self.bypass = bypass;
        self
    }

    fn bypassed(&self, addr: &Address) -> bool {
        self.bypass
            .as_ref()
            .map(|b| b.contains(&addr.to_string()))
            .unwrap_or(false)
    }

    /// Send a failure reply; logged, never fatal.
    async fn reply_error(&self, conn: &mut Conn, code: u8) {
        if let Err(e) = Reply::new(code, None).write_to(&mut conn.stream).await {
            debug!("[{}] reply write failed: {}", self.service, e);
        }
    }

    async fn negotiate(&self, conn: &mut Conn) -> Result<Request> {
        let methods = socks::read_methods(&mut conn.stream).await?;

        let selected = match &self.auther {
            Some(_) if methods.contains(&socks::METHOD_USER_PASS) => socks::METHOD_USER_PASS,
            Some(_) => socks::METHOD_NO_ACCEPTABLE,
            None if methods.contains(&socks::METHOD_NO_AUTH) => socks::METHOD_NO_AUTH,
            None => socks::METHOD_NO_ACCEPTABLE,
        };
        socks::write_selected_method(&mut conn.stream, selected).await?;

        if selected == socks::METHOD_NO_ACCEPTABLE {
            return Err(Error::Protocol("no acceptable method".into()));
        }

        if selected == socks::METHOD_USER_PASS {
            let (username, password) = socks::read_user_pass(&mut conn.stream).await?;
            let ok = self
                .auther
                .as_ref()
                .map(|a| a.authenticate(&username, &password))
                .unwrap_or(false);
            socks::write_user_pass_status(&mut conn.stream, if ok { 0 } else { 1 }).await?;
            if !ok {
                return Err(Error::AuthFailed);
            }
        }

        Request::read_from(&mut conn.stream).await
    }

    async fn handle_connect(&self, mut conn: Conn, target: &Address) -> Result<()> {
        debug!("[{}] {} >> {} (connect)", self.service, conn.peer, target);

        if self.bypassed(target) {
            self.reply_error(&mut conn, socks::REP_NOT_ALLOWED).await;
            return Err(Error::NotAllowed(target.to_string()));
        }

        let upstream = match self.router.dial(Network::Tcp, target).await {
            Ok(c) => c,
            Err(e) => {
                self.reply_error(&mut conn, socks::REP_FAILURE).await;
                return Err(e);
            }
        };

        let bound = upstream
            .local
            .as_socket()
            .map(SocksAddr::from_socket)
            .unwrap_or_else(SocksAddr::unspecified);
        Reply::new(socks::REP_SUCCEEDED, Some(bound))
            .write_to(&mut conn.stream)
            .await?;

        info!("[{}] {} <-> {}", self.service, conn.peer, target);
        let (up, down) = Relay::new(&self.service)
            .run(conn.stream, upstream.stream)
            .await?;
        info!(
            "[{}] {} >-< {} (up {}, down {})",
            self.service,
            conn.peer,
            target,
            crate::metrics::format_bytes(up),
            crate::metrics::format_bytes(down)
        );
        Ok(())
    }
}

#[async_trait]
impl Handler for Socks5Handler {
    async fn handle(&self, mut conn: Conn) -> Result<()> {
        let request =
            tokio::time::timeout(self.config.handshake_timeout, self.negotiate(&mut conn))
                .await
                .map_err(|_| Error::Timeout)??;

        let target = request.addr.to_address();
        match request.cmd {
            socks::CMD_CONNECT => self.handle_connect(conn, &target).await,
            socks::CMD_BIND => self.handle_bind(conn, &target).await,
            socks::CMD_UDP_ASSOCIATE => self.handle_udp(conn).await,
            socks::CMD_MUX_BIND => self.handle_mux_bind(conn, &target).await,
            cmd => {
                error!("[{}] unsupported command: {}", self.service, cmd);
                self.reply_error(&mut conn, socks::REP_CMD_UNSUPPORTED).await;
                Err(Error::Protocol(format!("unsupported command: {}", cmd)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Stream;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn handler(config: Socks5Config) -> Socks5Handler {
        Socks5Handler::new("socks-test", config, Arc::new(Router::direct()))
    }

    fn client_pair() -> (Stream, Conn) {
        let (client, server) = tokio::io::duplex(4096);
        (
            Box::new(client),
            Conn::new(
                Box::new(server),
                "127.0.0.1:1080".parse().unwrap(),
                "127.0.0.1:40000".parse().unwrap(),
            ),
        )
    }

    #[tokio::test]
    async fn connect_scenario_exact_frames() {
        let upstream = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_port = upstream.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut s, _) = upstream.accept().await.unwrap();
            let mut buf = [0u8; 4];
            s.read_exact(&mut buf).await.unwrap();
            s.write_all(&buf).await.unwrap();
        });

        let (mut client, conn) = client_pair();
        let h = handler(Socks5Config::default());
        let serve = tokio::spawn(async move { h.handle(conn).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [0x05, 0x00]);

        // CONNECT 127.0.0.1:<upstream>
        let req = Request::new(
            socks::CMD_CONNECT,
            format!("127.0.0.1:{}", upstream_port).parse().unwrap(),
        );
        client.write_all(&req.encode()).await.unwrap();

        let reply = Reply::read_from(&mut client).await.unwrap();
        assert_eq!(reply.rep, socks::REP_SUCCEEDED);

        client.write_all(b"echo").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"echo");

        drop(client);
        let _ = serve.await.unwrap();
    }

    #[tokio::test]
    async fn bind_disabled_replies_not_allowed_and_closes() {
        let (mut client, conn) = client_pair();
        let h = handler(Socks5Config::default());
        let serve = tokio::spawn(async move { h.handle(conn).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();

        let req = Request::new(socks::CMD_BIND, "0.0.0.0:7777".parse().unwrap());
        client.write_all(&req.encode()).await.unwrap();

        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x02]);

        // connection must be closed after the reply
        let mut rest = Vec::new();
        let reply_tail = client.read_to_end(&mut rest).await.unwrap();
        assert_eq!(reply_tail, 8); // remainder of the 10-byte reply frame
        assert!(serve.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn auth_required_rejects_no_auth_client() {
        let (mut client, conn) = client_pair();
        let h = handler(Socks5Config::default()).with_auther(Some(Arc::new(
            crate::capability::StaticAuther::new("user", "pass"),
        )));
        let serve = tokio::spawn(async move { h.handle(conn).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [0x05, 0xff]);
        assert!(serve.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn bypassed_connect_is_refused() {
        let (mut client, conn) = client_pair();
        let h = handler(Socks5Config::default())
            .with_bypass(Some(Arc::new(|addr: &str| addr.starts_with("10."))));
        let serve = tokio::spawn(async move { h.handle(conn).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();

        let req = Request::new(socks::CMD_CONNECT, "10.0.0.5:22".parse().unwrap());
        client.write_all(&req.encode()).await.unwrap();

        let reply = Reply::read_from(&mut client).await.unwrap();
        assert_eq!(reply.rep, socks::REP_NOT_ALLOWED);
        assert!(matches!(serve.await.unwrap(), Err(Error::NotAllowed(_))));
    }
}
