//! TAP/TUN transport (Linux)
//!
//! The listener creates an OS virtual interface and yields exactly one
//! Conn whose reads and writes are whole frames (TAP) or packets (TUN).
//! When the device fails or its handler gives up, the listener rebuilds
//! the interface with backoff: 1s, doubling, capped at 6s.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::net::IpAddr;
use std::os::fd::AsRawFd;
use std::pin::Pin;
use std::process::Command;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::common::{Address, Conn, Envelope};
use crate::error::{Error, Result};

use super::Listener;

const BACKOFF_START: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(6);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TuntapLayer {
    /// Layer 2, Ethernet frames
    Tap,
    /// Layer 3, IP packets
    Tun,
}

/// Virtual interface configuration, carried to the handler in the
/// connection envelope.
#[derive(Debug, Clone)]
pub struct TuntapConfig {
    pub layer: TuntapLayer,
    /// Interface name; kernel-assigned when empty.
    pub name: String,
    /// Interface addresses in CIDR form.
    pub net: Vec<String>,
    pub mtu: u32,
    pub gateway: Option<IpAddr>,
    /// Extra routes (CIDR) sent through the interface.
    pub routes: Vec<String>,
}

impl TuntapConfig {
    pub fn tap() -> Self {
        Self {
            layer: TuntapLayer::Tap,
            name: String::new(),
            net: vec![],
            mtu: 1350,
            gateway: None,
            routes: vec![],
        }
    }

    pub fn tun() -> Self {
        Self {
            layer: TuntapLayer::Tun,
            ..Self::tap()
        }
    }

    /// Local IPs announced in TUN keepalives.
    pub fn local_ips(&self) -> Vec<IpAddr> {
        self.net
            .iter()
            .filter_map(|cidr| cidr.split('/').next())
            .filter_map(|ip| ip.parse().ok())
            .collect()
    }
}

// Linux TUN/TAP interface constants
const IFF_TUN: u16 = 0x0001;
const IFF_TAP: u16 = 0x0002;
const IFF_NO_PI: u16 = 0x1000;
const TUNSETIFF: libc::c_ulong = 0x400454ca;

#[repr(C)]
struct IfrData {
    ifr_name: [libc::c_char; libc::IF_NAMESIZE],
    ifr_flags: libc::c_short,
}

impl IfrData {
    fn new(name: &str, flags: u16) -> Self {
        let mut ifr_name = [0 as libc::c_char; libc::IF_NAMESIZE];
        for (i, &b) in name
            .as_bytes()
            .iter()
            .take(libc::IF_NAMESIZE - 1)
            .enumerate()
        {
            ifr_name[i] = b as libc::c_char;
        }
        Self {
            ifr_name,
            ifr_flags: flags as libc::c_short,
        }
    }

    fn name(&self) -> String {
        let bytes: Vec<u8> = self
            .ifr_name
            .iter()
            .take_while(|&&c| c != 0)
            .map(|&c| c as u8)
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

fn run_ip(args: &[&str]) -> Result<()> {
    let output = Command::new("ip")
        .args(args)
        .output()
        .map_err(|e| Error::Resource(format!("ip {}: {}", args.join(" "), e)))?;
    if !output.status.success() {
        return Err(Error::Resource(format!(
            "ip {}: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

/// The open virtual interface as a frame/packet stream.
pub struct TuntapDevice {
    io: AsyncFd<File>,
    name: String,
    _closed: Option<mpsc::Sender<()>>,
}

impl TuntapDevice {
    pub fn open(config: &TuntapConfig) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/net/tun")
            .map_err(|e| Error::Resource(format!("/dev/net/tun: {}", e)))?;

        let layer_flag = match config.layer {
            TuntapLayer::Tap => IFF_TAP,
            TuntapLayer::Tun => IFF_TUN,
        };
        let ifr = IfrData::new(&config.name, layer_flag | IFF_NO_PI);

        // SAFETY: file is a valid tun control fd and ifr is a properly
        // initialized ifreq for TUNSETIFF; the return value is checked.
        unsafe {
            if libc::ioctl(file.as_raw_fd(), TUNSETIFF, &ifr) < 0 {
                return Err(Error::Resource(format!(
                    "TUNSETIFF: {}",
                    std::io::Error::last_os_error()
                )));
            }
            let fd = file.as_raw_fd();
            let flags = libc::fcntl(fd, libc::F_GETFL);
            if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
                return Err(Error::Resource(format!(
                    "O_NONBLOCK: {}",
                    std::io::Error::last_os_error()
                )));
            }
        }

        let name = ifr.name();
        let device = Self {
            io: AsyncFd::new(file)?,
            name,
            _closed: None,
        };
        device.configure(config)?;
        Ok(device)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn configure(&self, config: &TuntapConfig) -> Result<()> {
        for cidr in &config.net {
            run_ip(&["addr", "add", cidr, "dev", &self.name])?;
        }
        if config.mtu > 0 {
            run_ip(&["link", "set", &self.name, "mtu", &config.mtu.to_string()])?;
        }
        run_ip(&["link", "set", &self.name, "up"])?;

        let gateway = config.gateway.map(|gw| gw.to_string());
        for route in &config.routes {
            match &gateway {
                Some(gw) => run_ip(&["route", "add", route, "via", gw, "dev", &self.name])?,
                None => run_ip(&["route", "add", route, "dev", &self.name])?,
            }
        }
        Ok(())
    }
}

impl AsyncRead for TuntapDevice {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        loop {
            let mut guard = match this.io.poll_read_ready(cx) {
                Poll::Ready(Ok(g)) => g,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            };
            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|inner| {
                let mut file = inner.get_ref();
                file.read(unfilled)
            }) {
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for TuntapDevice {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        loop {
            let mut guard = match this.io.poll_write_ready(cx) {
                Poll::Ready(Ok(g)) => g,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            };
            match guard.try_io(|inner| {
                let mut file = inner.get_ref();
                file.write(buf)
            }) {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Listener yielding one device Conn at a time, rebuilding on failure.
pub struct DeviceListener {
    local: Address,
    rx: tokio::sync::Mutex<mpsc::Receiver<Conn>>,
    closed: Arc<tokio::sync::watch::Sender<bool>>,
}

impl DeviceListener {
    fn spawn(addr: &Address, config: TuntapConfig) -> Self {
        let (tx, rx) = mpsc::channel::<Conn>(1);
        let (closed_tx, mut closed_rx) = tokio::sync::watch::channel(false);
        let closed = Arc::new(closed_tx);
        let local = addr.clone();

        let loop_local = local.clone();
        tokio::spawn(async move {
            let mut backoff = BACKOFF_START;
            loop {
                if *closed_rx.borrow() {
                    return;
                }

                let (drop_tx, mut drop_rx) = mpsc::channel::<()>(1);
                let conn = match TuntapDevice::open(&config) {
                    Ok(mut device) => {
                        info!(
                            "{}: interface {} up (mtu {})",
                            match config.layer {
                                TuntapLayer::Tap => "tap",
                                TuntapLayer::Tun => "tun",
                            },
                            device.name(),
                            config.mtu
                        );
                        backoff = BACKOFF_START;
                        device._closed = Some(drop_tx);
                        let mut envelope = Envelope::new();
                        envelope.insert(config.clone());
                        Conn::new(Box::new(device), loop_local.clone(), loop_local.clone())
                            .with_envelope(envelope)
                    }
                    Err(e) => {
                        warn!("tuntap: {}", e);
                        tokio::select! {
                            _ = tokio::time::sleep(backoff) => {}
                            _ = closed_rx.wait_for(|c| *c) => return,
                        }
                        backoff = (backoff * 2).min(BACKOFF_CAP);
                        continue;
                    }
                };

                tokio::select! {
                    res = tx.send(conn) => {
                        if res.is_err() {
                            return;
                        }
                    }
                    _ = closed_rx.wait_for(|c| *c) => return,
                }

                // wait for the handler to release the device, then rebuild
                let _ = drop_rx.recv().await;
                debug!("tuntap: device released, recreating");
                tokio::time::sleep(BACKOFF_START).await;
            }
        });

        Self {
            local,
            rx: tokio::sync::Mutex::new(rx),
            closed,
        }
    }
}

#[async_trait]
impl Listener for DeviceListener {
    async fn accept(&self) -> Result<Conn> {
        self.rx.lock().await.recv().await.ok_or(Error::Closed)
    }

    fn local_addr(&self) -> Result<Address> {
        Ok(self.local.clone())
    }

    async fn close(&self) -> Result<()> {
        let _ = self.closed.send(true);
        Ok(())
    }
}

/// Layer-2 listener
pub struct TapListener(DeviceListener);

impl TapListener {
    pub fn new(addr: &Address, mut config: TuntapConfig) -> Self {
        config.layer = TuntapLayer::Tap;
        Self(DeviceListener::spawn(addr, config))
    }
}

#[async_trait]
impl Listener for TapListener {
    async fn accept(&self) -> Result<Conn> {
        self.0.accept().await
    }

    fn local_addr(&self) -> Result<Address> {
        self.0.local_addr()
    }

    async fn close(&self) -> Result<()> {
        self.0.close().await
    }
}

/// Layer-3 listener
pub struct TunListener(DeviceListener);

impl TunListener {
    pub fn new(addr: &Address, mut config: TuntapConfig) -> Self {
        config.layer = TuntapLayer::Tun;
        Self(DeviceListener::spawn(addr, config))
    }
}

#[async_trait]
impl Listener for TunListener {
    async fn accept(&self) -> Result<Conn> {
        self.0.accept().await
    }

    fn local_addr(&self) -> Result<Address> {
        self.0.local_addr()
    }

    async fn close(&self) -> Result<()> {
        self.0.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ifr_name_roundtrip() {
        let ifr = IfrData::new("tap7", IFF_TAP | IFF_NO_PI);
        assert_eq!(ifr.name(), "tap7");
        assert_eq!(ifr.ifr_flags, (IFF_TAP | IFF_NO_PI) as libc::c_short);
    }

    #[test]
    fn config_local_ips() {
        let mut config = TuntapConfig::tun();
        config.net = vec!["10.1.0.2/24".into(), "fd00::2/64".into(), "bogus".into()];
        let ips = config.local_ips();
        assert_eq!(ips.len(), 2);
        assert_eq!(ips[0], "10.1.0.2".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn open_fails_without_privileges_or_device() {
        // on CI this either lacks /dev/net/tun or the capability; both
        // must surface as a resource error, not a panic
        let config = TuntapConfig::tap();
        if let Err(e) = TuntapDevice::open(&config) {
            assert!(matches!(e, Error::Resource(_) | Error::Io(_)));
        }
    }
}
