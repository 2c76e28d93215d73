//! TAP handler: layer-2 relay with a learning bridge
//!
//! The device connection carries Ethernet frames. A client delivers
//! frames straight to its upstream; a server bridges between peers:
//! broadcast fans out to every learned route, known unicast goes to
//! exactly the last learned peer, unknown unicast is dropped. Routes
//! are learned from source MACs, last writer wins.
//!
//! Transport errors back off (1s doubling, capped at 6s) and retry;
//! device errors are fatal and propagate to the owning service, which
//! recreates the interface.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::{debug, error, info};

use crate::common::{Address, Conn, Datagram, Stream, UdpDatagram};
use crate::error::{Error, Result};
use crate::protocol::packet::{ether_type, ether_type_name, mac_destination, mac_source, MacAddr};
use crate::router::Router;

use super::Handler;

const BACKOFF_START: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(6);
const FRAME_BUFFER: usize = 4096;

/// Learned bridge routes: source MAC to the peer it was last seen from.
type Routes = Arc<RwLock<HashMap<MacAddr, Address>>>;

pub struct TapHandler {
    service: String,
    router: Arc<Router>,
    /// Upstream address; present on clients, absent on the server.
    forward: Option<Address>,
    routes: Routes,
}

impl TapHandler {
    pub fn new(
        service: impl Into<String>,
        router: Arc<Router>,
        forward: Option<Address>,
    ) -> Self {
        Self {
            service: service.into(),
            router,
            forward,
            routes: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn open_packet_conn(&self, local: &Address) -> Result<Arc<dyn Datagram>> {
        match &self.forward {
            Some(_) => Ok(Arc::from(self.router.dial_packet().await?)),
            None => Ok(Arc::new(UdpDatagram::bind(local).await?)),
        }
    }

    async fn transport(
        &self,
        dev_r: &mut ReadHalf<Stream>,
        dev_w: &mut WriteHalf<Stream>,
        net: Arc<dyn Datagram>,
    ) -> Result<()> {
        let outbound = async {
            let mut frame = vec![0u8; FRAME_BUFFER];
            loop {
                let n = dev_r.read(&mut frame).await.map_err(|_| Error::Tun)?;
                if n == 0 {
                    return Err(Error::Tun);
                }
                self.forward_from_device(&frame[..n], &net).await?;
            }
            #[allow(unreachable_code)]
            Ok::<(), Error>(())
        };

        let inbound = async {
            let mut frame = vec![0u8; FRAME_BUFFER];
            loop {
                let (n, from) = net.recv_from(&mut frame).await?;
                if n == 0 {
                    continue;
                }
                if let Some(to_device) = self.forward_from_net(&frame[..n], &from, &net).await? {
                    dev_w.write_all(to_device).await.map_err(|_| Error::Tun)?;
                }
            }
            #[allow(unreachable_code)]
            Ok::<(), Error>(())
        };

        tokio::select! {
            r = outbound => r,
            r = inbound => r,
        }
    }

    /// Device → network. Clients deliver to the upstream; the server
    /// consults the learned routes.
    async fn forward_from_device(&self, frame: &[u8], net: &Arc<dyn Datagram>) -> Result<()> {
        let (src, dst) = match (mac_source(frame), mac_destination(frame)) {
            (Some(s), Some(d)) => (s, d),
            _ => return Ok(()),
        };
        debug!(
            "[{}] {} >> {} {} {}",
            self.service,
            src,
            dst,
            ether_type_name(ether_type(frame).unwrap_or(0)),
            frame.len()
        );

        if let Some(raddr) = &self.forward {
            net.send_to(frame, raddr).await?;
            return Ok(());
        }

        if dst.is_broadcast() {
            for addr in self.broadcast_targets(None) {
                let _ = net.send_to(frame, &addr).await;
            }
            return Ok(());
        }

        match self.route_lookup(&dst) {
            Some(addr) => {
                net.send_to(frame, &addr).await?;
            }
            None => {
                debug!("[{}] no route for {} -> {}", self.service, src, dst);
            }
        }
        Ok(())
    }

    /// Network → device. The server learns routes and forwards
    /// peer-destined frames; anything else lands on the device.
    /// Returns the frame when it must be written to the device.
    async fn forward_from_net<'a>(
        &self,
        frame: &'a [u8],
        from: &Address,
        net: &Arc<dyn Datagram>,
    ) -> Result<Option<&'a [u8]>> {
        let (src, dst) = match (mac_source(frame), mac_destination(frame)) {
            (Some(s), Some(d)) => (s, d),
            _ => return Ok(None),
        };
        debug!(
            "[{}] {} >> {} {} {} (net)",
            self.service,
            src,
            dst,
            ether_type_name(ether_type(frame).unwrap_or(0)),
            frame.len()
        );

        // client side: frames go straight to the device
        if self.forward.is_some() {
            return Ok(Some(frame));
        }

        self.learn(src, from.clone());

        if dst.is_broadcast() {
            for addr in self.broadcast_targets(Some(&src)) {
                let _ = net.send_to(frame, &addr).await;
            }
            return Ok(Some(frame));
        }

        if let Some(addr) = self.route_lookup(&dst) {
            debug!("[{}] find route: {} -> {}", self.service, dst, addr);
            net.send_to(frame, &addr).await?;
            return Ok(None);
        }

        Ok(Some(frame))
    }

    fn learn(&self, src: MacAddr, from: Address) {
        let mut routes = self.routes.write();
        match routes.get(&src) {
            Some(existing) if *existing == from => {}
            Some(existing) => {
                debug!(
                    "[{}] update route: {} -> {} (old {})",
                    self.service, src, from, existing
                );
                routes.insert(src, from);
            }
            None => {
                debug!("[{}] new route: {} -> {}", self.service, src, from);
                routes.insert(src, from);
            }
        }
    }

    fn route_lookup(&self, dst: &MacAddr) -> Option<Address> {
        self.routes.read().get(dst).cloned()
    }

    fn broadcast_targets(&self, exclude: Option<&MacAddr>) -> Vec<Address> {
        self.routes
            .read()
            .iter()
            .filter(|(mac, _)| exclude != Some(*mac))
            .map(|(_, addr)| addr.clone())
            .collect()
    }
}

#[async_trait]
impl Handler for TapHandler {
    async fn handle(&self, conn: Conn) -> Result<()> {
        let local = conn.local.clone();
        info!(
            "[{}] tap up ({})",
            self.service,
            if self.forward.is_some() { "client" } else { "server" }
        );

        let (mut dev_r, mut dev_w) = tokio::io::split(conn.stream);
        let mut backoff = BACKOFF_START;
        loop {
            let result = async {
                let net = self.open_packet_conn(&local).await?;
                self.transport(&mut dev_r, &mut dev_w, net).await
            }
            .await;

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
    use async_trait::async_trait;
    use std::net::SocketAddr;
    use tokio::sync::Mutex;

    struct RecordingNet {
        sent: Mutex<Vec<(Vec<u8>, Address)>>,
    }

    #[async_trait]
    impl Datagram for RecordingNet {
        async fn recv_from(&self, _buf: &mut [u8]) -> Result<(usize, Address)> {
            futures_util::future::pending().await
        }

        async fn send_to(&self, buf: &[u8], addr: &Address) -> Result<usize> {
            self.sent.lock().await.push((buf.to_vec(), addr.clone()));
            Ok(buf.len())
        }

        fn local_addr(&self) -> Option<SocketAddr> {
            None
        }
    }

    fn frame(dst: [u8; 6], src: [u8; 6]) -> Vec<u8> {
        let mut f = Vec::new();
        f.extend_from_slice(&dst);
        f.extend_from_slice(&src);
        f.extend_from_slice(&0x0800u16.to_be_bytes());
        f.extend_from_slice(&[0u8; 16]);
        f
    }

    fn server_handler() -> TapHandler {
        TapHandler::new("tap-test", Arc::new(Router::direct()), None)
    }

    #[tokio::test]
    async fn unicast_goes_to_last_learned_peer() {
        let h = server_handler();
        let net: Arc<dyn Datagram> = Arc::new(RecordingNet {
            sent: Mutex::new(vec![]),
        });

        let mac_a = [2, 0, 0, 0, 0, 0xaa];
        let peer_a1: Address = "192.0.2.1:7000".parse().unwrap();
        let peer_a2: Address = "192.0.2.9:7000".parse().unwrap();

        // peer A appears from one address, then moves
        h.forward_from_net(&frame([0xff; 6], mac_a), &peer_a1, &net)
            .await
            .unwrap();
        h.forward_from_net(&frame([0xff; 6], mac_a), &peer_a2, &net)
            .await
            .unwrap();

        let recording = Arc::new(RecordingNet {
            sent: Mutex::new(vec![]),
        });
        let net2: Arc<dyn Datagram> = recording.clone();
        h.forward_from_device(&frame(mac_a, [2, 0, 0, 0, 0, 1]), &net2)
            .await
            .unwrap();

        let sent = recording.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, peer_a2);
    }

    #[tokio::test]
    async fn broadcast_excludes_origin() {
        let h = server_handler();
        let sink: Arc<dyn Datagram> = Arc::new(RecordingNet {
            sent: Mutex::new(vec![]),
        });

        let peer_a: Address = "192.0.2.1:7000".parse().unwrap();
        let peer_b: Address = "192.0.2.2:7000".parse().unwrap();
        let mac_a = [2, 0, 0, 0, 0, 0x0a];
        let mac_b = [2, 0, 0, 0, 0, 0x0b];

        h.learn(MacAddr(mac_a), peer_a.clone());
        h.learn(MacAddr(mac_b), peer_b.clone());

        // a broadcast frame from A reaches every learned peer except A
        let to_device = h
            .forward_from_net(&frame([0xff; 6], mac_a), &peer_a, &sink)
            .await
            .unwrap();
        assert!(to_device.is_some());

        let targets = h.broadcast_targets(Some(&MacAddr(mac_a)));
        assert_eq!(targets, vec![peer_b.clone()]);
    }

    #[tokio::test]
    async fn unknown_unicast_is_dropped() {
        let h = server_handler();
        let recording = Arc::new(RecordingNet {
            sent: Mutex::new(vec![]),
        });
        let net: Arc<dyn Datagram> = recording.clone();

        h.forward_from_device(&frame([2, 0, 0, 0, 0, 0x99], [2, 0, 0, 0, 0, 1]), &net)
            .await
            .unwrap();
        assert!(recording.sent.lock().await.is_empty());
    }
}
