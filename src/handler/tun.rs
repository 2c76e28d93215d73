//! TUN handler: layer-3 relay over UDP with keepalive-based membership
//!
//! Clients announce their interface IPs in a keepalive message on
//! association and on every period; the server installs one route per
//! announced IP toward the sender. Packet classification uses the IP
//! version nibble; unknown versions are dropped with a warning. A
//! device-side failure is fatal and hands the interface back to the
//! service; network failures retry with backoff.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::{debug, error, info, warn};

use crate::common::{Address, Conn, Datagram, Stream, UdpDatagram};
use crate::error::{Error, Result};
use crate::protocol::keepalive::{passphrase_key, Keepalive};
use crate::protocol::packet::{ip_addresses, ip_version};
use crate::router::Router;
use crate::transport::TuntapConfig;

use super::Handler;

const BACKOFF_START: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(6);
const PACKET_BUFFER: usize = 4096;

#[derive(Debug, Clone)]
pub struct TunConfig {
    pub passphrase: String,
    pub keep_alive_period: Option<Duration>,
}

impl Default for TunConfig {
    fn default() -> Self {
        Self {
            passphrase: String::new(),
            keep_alive_period: Some(Duration::from_secs(10)),
        }
    }
}

type Routes = Arc<RwLock<HashMap<IpAddr, Address>>>;

pub struct TunHandler {
    service: String,
    config: TunConfig,
    router: Arc<Router>,
    /// Upstream address; present on clients, absent on the server.
    forward: Option<Address>,
    routes: Routes,
}

impl TunHandler {
    pub fn new(
        service: impl Into<String>,
        config: TunConfig,
        router: Arc<Router>,
        forward: Option<Address>,
    ) -> Self {
        Self {
            service: service.into(),
            config,
            router,
            forward,
            routes: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn classify(&self, packet: &[u8]) -> Option<()> {
        match ip_version(packet) {
            Some(4) | Some(6) => Some(()),
            other => {
                warn!(
                    "[{}] unknown packet version {:?}, discarded",
                    self.service, other
                );
                None
            }
        }
    }

    // ------------------------------------------------------------------
    // client
    // ------------------------------------------------------------------

    async fn run_client(
        &self,
        dev_r: &mut ReadHalf<Stream>,
        dev_w: &mut WriteHalf<Stream>,
        raddr: &Address,
        ips: &[IpAddr],
    ) -> Result<()> {
        let net: Arc<dyn Datagram> = Arc::from(self.router.dial_packet().await?);

        let keepalive = Keepalive::new(passphrase_key(&self.config.passphrase), ips.to_vec());
        let announcer = {
            let net = net.clone();
            let raddr = raddr.clone();
            let period = self.config.keep_alive_period;
            let payload = keepalive.encode();
            async move {
                // announce immediately, then on every period
                net.send_to(&payload, &raddr).await?;
                let period = match period {
                    Some(p) if !p.is_zero() => p,
                    _ => return futures_util::future::pending().await,
                };
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    net.send_to(&payload, &raddr).await?;
                    debug!("keepalive sent");
                }
                #[allow(unreachable_code)]
                Ok::<(), Error>(())
            }
        };

        let outbound = async {
            let mut packet = vec![0u8; PACKET_BUFFER];
            loop {
                let n = dev_r.read(&mut packet).await.map_err(|_| Error::Tun)?;
                if n == 0 {
                    return Err(Error::Tun);
                }
                if self.classify(&packet[..n]).is_none() {
                    continue;
                }
                if let Some((src, dst)) = ip_addresses(&packet[..n]) {
                    debug!("[{}] {} >> {} {}", self.service, src, dst, n);
                }
                net.send_to(&packet[..n], raddr).await?;
            }
            #[allow(unreachable_code)]
            Ok::<(), Error>(())
        };

        let inbound = async {
            let mut packet = vec![0u8; PACKET_BUFFER];
            // a missed liveness window counts as a dead association
            let deadline = self
                .config
                .keep_alive_period
                .filter(|p| !p.is_zero())
                .map(|p| p * 3);
            loop {
                let recv = net.recv_from(&mut packet);
                let (n, _) = match deadline {
                    Some(d) => tokio::time::timeout(d, recv)
                        .await
                        .map_err(|_| Error::Timeout)??,
                    None => recv.await?,
                };

                if Keepalive::matches(&packet[..n]) {
                    debug!("[{}] keepalive received", self.service);
                    continue;
                }
                if self.classify(&packet[..n]).is_none() {
                    continue;
                }
                dev_w
                    .write_all(&packet[..n])
                    .await
                    .map_err(|_| Error::Tun)?;
            }
            #[allow(unreachable_code)]
            Ok::<(), Error>(())
        };

        tokio::select! {
            r = announcer => r,
            r = outbound => r,
            r = inbound => r,
        }
    }

    // ------------------------------------------------------------------
    // server
    // ------------------------------------------------------------------

    async fn run_server(
        &self,
        dev_r: &mut ReadHalf<Stream>,
        dev_w: &mut WriteHalf<Stream>,
        local: &Address,
    ) -> Result<()> {
        let net: Arc<dyn Datagram> = Arc::new(UdpDatagram::bind(local).await?);
        let expected_key = passphrase_key(&self.config.passphrase);

        let outbound = async {
            let mut packet = vec![0u8; PACKET_BUFFER];
            loop {
                let n = dev_r.read(&mut packet).await.map_err(|_| Error::Tun)?;
                if n == 0 {
                    return Err(Error::Tun);
                }
                if self.classify(&packet[..n]).is_none() {
                    continue;
                }
                let dst = match ip_addresses(&packet[..n]) {
                    Some((_, dst)) => dst,
                    None => continue,
                };
                match self.routes.read().get(&dst).cloned() {
                    Some(peer) => {
                        net.send_to(&packet[..n], &peer).await?;
                    }
                    None => debug!("[{}] no route for {}", self.service, dst),
                }
            }
            #[allow(unreachable_code)]
            Ok::<(), Error>(())
        };

        let inbound = async {
            let mut packet = vec![0u8; PACKET_BUFFER];
            loop {
                let (n, from) = net.recv_from(&mut packet).await?;

                if Keepalive::matches(&packet[..n]) {
                    match Keepalive::decode(&packet[..n]) {
                        Ok(ka) if ka.passphrase == expected_key => {
                            for ip in ka.ips {
                                self.install_route(ip, from.clone());
                            }
                        }
                        Ok(_) => warn!("[{}] keepalive with bad passphrase from {}", self.service, from),
                        Err(e) => warn!("[{}] malformed keepalive from {}: {}", self.service, from, e),
                    }
                    continue;
                }

                if self.classify(&packet[..n]).is_none() {
                    continue;
                }
                let dst = match ip_addresses(&packet[..n]) {
                    Some((_, dst)) => dst,
                    None => continue,
                };

                // peer-to-peer traffic never touches the device
                if let Some(peer) = self.routes.read().get(&dst).cloned() {
                    net.send_to(&packet[..n], &peer).await?;
                    continue;
                }

                dev_w
                    .write_all(&packet[..n])
                    .await
                    .map_err(|_| Error::Tun)?;
            }
            #[allow(unreachable_code)]
            Ok::<(), Error>(())
        };

        tokio::select! {
            r = outbound => r,
            r = inbound => r,
        }
    }

    fn install_route(&self, ip: IpAddr, peer: Address) {
        let mut routes = self.routes.write();
        match routes.insert(ip, peer.clone()) {
            Some(old) if old != peer => {
                debug!("[{}] update route: {} -> {} (old {})", self.service, ip, peer, old)
            }
            None => debug!("[{}] new route: {} -> {}", self.service, ip, peer),
            _ => {}
        }
    }
}

#[async_trait]
impl Handler for TunHandler {
    async fn handle(&self, mut conn: Conn) -> Result<()> {
        let tuntap = conn
            .envelope
            .remove::<TuntapConfig>()
            .ok_or_else(|| Error::Protocol("tun: wrong connection type".into()))?;
        let local = conn.local.clone();
        let ips = tuntap.local_ips();

        if self.forward.is_some() && ips.is_empty() {
            return Err(Error::Config("tun: interface has no address".into()));
        }
        info!(
            "[{}] tun up ({})",
            self.service,
            if self.forward.is_some() { "client" } else { "server" }
        );

        let (mut dev_r, mut dev_w) = tokio::io::split(conn.stream);
        let mut backoff = BACKOFF_START;
        loop {
            let result = match &self.forward {
                Some(raddr) => self.run_client(&mut dev_r, &mut dev_w, raddr, &ips).await,
                None => self.run_server(&mut dev_r, &mut dev_w, &local).await,
            };

            match result {
                Err(Error::Tun) => {
                    error!("[{}] device failed, giving the interface back", self.service);
                    return Err(Error::Tun);
                }
                Err(e) => {
                    error!("[{}] {}", self.service, e);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(BACKOFF_CAP);
                }
                Ok(()) => {
                    backoff = BACKOFF_START;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler() -> TunHandler {
        TunHandler::new(
            "tun-test",
            TunConfig::default(),
            Arc::new(Router::direct()),
            None,
        )
    }

    #[test]
    fn keepalive_installs_a_route_per_announced_ip() {
        let h = handler();
        let peer: Address = "198.51.100.4:9000".parse().unwrap();
        let ips: Vec<IpAddr> = vec!["10.1.0.2".parse().unwrap(), "fd00::2".parse().unwrap()];

        for ip in &ips {
            h.install_route(*ip, peer.clone());
        }

        for ip in &ips {
            assert_eq!(h.routes.read().get(ip), Some(&peer));
        }
    }

    #[test]
    fn route_updates_are_last_writer_wins() {
        let h = handler();
        let ip: IpAddr = "10.1.0.7".parse().unwrap();
        h.install_route(ip, "198.51.100.4:9000".parse().unwrap());
        let newer: Address = "198.51.100.5:9000".parse().unwrap();
        h.install_route(ip, newer.clone());
        assert_eq!(h.routes.read().get(&ip), Some(&newer));
    }
}
