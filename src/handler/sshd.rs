//! SSH port-forward handler
//!
//! Serves the typed requests surfaced by the sshd listener:
//! direct-tcpip dials out through the router, tcpip-forward pumps
//! connections from the bound listener back over forwarded-tcpip
//! channels until the client SSH connection is done.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info};

use crate::capability::{Bypass, RateLimiter};
use crate::common::{Address, Conn, Network};
use crate::error::{Error, Result};
use crate::relay::Relay;
use crate::router::Router;
use crate::transport::SshdRequest;

use super::Handler;

pub struct SshdHandler {
    service: String,
    router: Arc<Router>,
    bypass: Option<Arc<dyn Bypass>>,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
}

impl SshdHandler {
    pub fn new(service: impl Into<String>, router: Arc<Router>) -> Self {
        Self {
            service: service.into(),
            router,
            bypass: None,
            rate_limiter: None,
        }
    }

    pub fn with_bypass(mut self, bypass: Option<Arc<dyn Bypass>>) -> Self {
        self.bypass = bypass;
        self
    }

    pub fn with_rate_limiter(mut self, limiter: Option<Arc<dyn RateLimiter>>) -> Self {
        self.rate_limiter = limiter;
        self
    }

    /// Per-client gate; rejected connections are dropped silently.
    fn check_rate_limit(&self, peer: &Address) -> bool {
        match &self.rate_limiter {
            Some(rl) => match rl.limiter(&peer.host()) {
                Some(limiter) => limiter.allow(1),
                None => true,
            },
            None => true,
        }
    }

    async fn handle_direct(&self, conn: Conn, host: String, port: u16) -> Result<()> {
        let target = match host.parse::<std::net::IpAddr>() {
            Ok(ip) => Address::ip_port(ip, port),
            Err(_) => Address::domain(host, port),
        };
        debug!("[{}] {} >> {} (direct-tcpip)", self.service, conn.peer, target);

        if let Some(bypass) = &self.bypass {
            if bypass.contains(&target.to_string()) {
                debug!("[{}] bypass {}", self.service, target);
                return Ok(());
            }
        }

        let upstream = self.router.dial(Network::Tcp, &target).await?;

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

    async fn handle_remote_forward(
        &self,
        peer: Address,
        listener: tokio::net::TcpListener,
        host: String,
        port: u16,
        handle: russh::server::Handle,
        mut done: tokio::sync::watch::Receiver<bool>,
    ) -> Result<()> {
        debug!("[{}] {} >> {}:{} (tcpip-forward)", self.service, peer, host, port);

        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                // the listener dies with the client SSH connection
                _ = done.wait_for(|d| *d) => {
                    debug!("[{}] forward {}:{} closed", self.service, host, port);
                    return Ok(());
                }
            };

            let (peer_stream, peer_addr) = match accepted {
                Ok(a) => a,
                Err(e) => {
                    error!("[{}] forward accept: {}", self.service, e);
                    return Err(Error::Resource(format!("accept: {}", e)));
                }
            };

            let channel = match handle
                .channel_open_forwarded_tcpip(
                    host.clone(),
                    port as u32,
                    peer_addr.ip().to_string(),
                    peer_addr.port() as u32,
                )
                .await
            {
                Ok(c) => c,
                Err(e) => {
                    error!("[{}] open forwarded channel: {}", self.service, e);
                    continue;
                }
            };

            let service = self.service.clone();
            tokio::spawn(async move {
                debug!("[{}] {} <-> forwarded channel", service, peer_addr);
                let _ = Relay::new(&service)
                    .run(channel.into_stream(), peer_stream)
                    .await;
                debug!("[{}] {} >-< forwarded channel", service, peer_addr);
            });
        }
    }
}

#[async_trait]
impl Handler for SshdHandler {
    async fn handle(&self, mut conn: Conn) -> Result<()> {
        if !self.check_rate_limit(&conn.peer) {
            return Ok(());
        }

        let request = conn
            .envelope
            .remove::<SshdRequest>()
            .ok_or_else(|| Error::Protocol("sshd: wrong connection type".into()))?;

        match request {
            SshdRequest::DirectTcpip { host, port, .. } => {
                self.handle_direct(conn, host, port).await
            }
            SshdRequest::RemoteForward {
                listener,
                host,
                port,
                handle,
                done,
            } => {
                self.handle_remote_forward(conn.peer.clone(), listener, host, port, handle, done)
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{empty_stream, Envelope};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Bypassed direct-tcpip must return success without dialing.
    #[tokio::test]
    async fn bypassed_direct_forward_short_circuits() {
        let handler = SshdHandler::new("sshd-test", Arc::new(Router::direct()))
            .with_bypass(Some(Arc::new(|addr: &str| addr.starts_with("10.0.0.5"))));

        let mut envelope = Envelope::new();
        envelope.insert(SshdRequest::DirectTcpip {
            host: "10.0.0.5".into(),
            port: 22,
            originator: ("198.51.100.7".into(), 4242),
        });
        let conn = Conn::new(
            empty_stream(),
            Address::unspecified(),
            "198.51.100.7:4242".parse().unwrap(),
        )
        .with_envelope(envelope);

        assert!(handler.handle(conn).await.is_ok());
    }

    #[tokio::test]
    async fn untyped_connection_is_rejected() {
        let handler = SshdHandler::new("sshd-test", Arc::new(Router::direct()));
        let conn = Conn::new(
            empty_stream(),
            Address::unspecified(),
            Address::unspecified(),
        );
        assert!(handler.handle(conn).await.is_err());
    }

    #[tokio::test]
    async fn rate_limited_client_is_dropped_silently() {
        struct Deny;
        struct DenyLimiter(AtomicUsize);
        impl crate::capability::Limiter for DenyLimiter {
            fn allow(&self, _n: usize) -> bool {
                self.0.fetch_add(1, Ordering::SeqCst);
                false
            }
        }
        impl RateLimiter for Deny {
            fn limiter(&self, _key: &str) -> Option<Arc<dyn crate::capability::Limiter>> {
                Some(Arc::new(DenyLimiter(AtomicUsize::new(0))))
            }
        }

        let handler = SshdHandler::new("sshd-test", Arc::new(Router::direct()))
            .with_rate_limiter(Some(Arc::new(Deny)));

        // no envelope at all: would error if it got past the limiter
        let conn = Conn::new(
            empty_stream(),
            Address::unspecified(),
            "203.0.113.9:2222".parse().unwrap(),
        );
        assert!(handler.handle(conn).await.is_ok());
    }
}
