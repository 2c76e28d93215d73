//! ICMP tunnel transport
//!
//! QUIC over ICMP echo. The carrier is a raw ICMPv4 socket that
//! multiplexes tunnels by echo id: the dialer picks a 16-bit id (address
//! port 0 means a random non-zero id from the process-wide allocator) and
//! sends echo requests; the server answers with echo replies keyed by the
//! same id. Peer addresses are modeled as `ip:echo-id`.

use std::collections::HashSet;
use std::io::IoSliceMut;
use std::mem::MaybeUninit;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use lazy_static::lazy_static;
use parking_lot::Mutex;
use quinn::udp::{RecvMeta, Transmit};
use quinn::{AsyncUdpSocket, Endpoint, EndpointConfig, UdpPoller, VarInt};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tracing::warn;

use crate::common::{Address, Conn};
use crate::error::{Error, Result};
use crate::session::{Session, SessionCache};

use super::quic::{client_config, serve_connection, server_config, QuicSession};
use super::{AcceptQueue, Dialer, Listener, QuicConfig, TlsConfig};

const ECHO_REQUEST: u8 = 8;
const ECHO_REPLY: u8 = 0;
const HEADER_LEN: usize = 8;
const MAX_PACKET: usize = 2048;

lazy_static! {
    /// Echo ids currently in use by dialers in this process. Avoids two
    /// concurrent tunnels silently sharing an id.
    static ref ECHO_IDS: Mutex<HashSet<u16>> = Mutex::new(HashSet::new());
}

fn alloc_echo_id(requested: u16) -> Result<u16> {
    let mut ids = ECHO_IDS.lock();
    if requested != 0 {
        ids.insert(requested);
        return Ok(requested);
    }
    for _ in 0..128 {
        let id = rand::random::<u16>();
        if id != 0 && ids.insert(id) {
            return Ok(id);
        }
    }
    Err(Error::Resource("no free icmp echo id".into()))
}

fn release_echo_id(id: u16) {
    ECHO_IDS.lock().remove(&id);
}

/// RFC 1071 internet checksum.
fn checksum(data: &[u8]) -> u16 {
    let mut sum = 0u32;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Build one echo message around a payload.
fn encode_echo(kind: u8, id: u16, seq: u16, payload: &[u8]) -> Vec<u8> {
    let mut pkt = Vec::with_capacity(HEADER_LEN + payload.len());
    pkt.extend_from_slice(&[kind, 0, 0, 0]);
    pkt.extend_from_slice(&id.to_be_bytes());
    pkt.extend_from_slice(&seq.to_be_bytes());
    pkt.extend_from_slice(payload);
    let sum = checksum(&pkt);
    pkt[2..4].copy_from_slice(&sum.to_be_bytes());
    pkt
}

/// Parse an echo message, returning (kind, id, payload range start).
fn decode_echo(icmp: &[u8]) -> Option<(u8, u16, usize)> {
    if icmp.len() < HEADER_LEN {
        return None;
    }
    let kind = icmp[0];
    let id = u16::from_be_bytes([icmp[4], icmp[5]]);
    Some((kind, id, HEADER_LEN))
}

/// Strip the IPv4 header from a raw-socket read.
fn strip_ip_header(packet: &[u8]) -> Option<&[u8]> {
    let ihl = ((*packet.first()? & 0x0f) as usize) * 4;
    if ihl < 20 || packet.len() < ihl {
        return None;
    }
    Some(&packet[ihl..])
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Client,
    Server,
}

/// Raw ICMPv4 echo socket presented as an unconnected packet endpoint.
pub struct IcmpSocket {
    io: AsyncFd<Socket>,
    mode: Mode,
    /// Demux id on the client; 0 on the server (which answers any id).
    id: u16,
    seq: std::sync::atomic::AtomicU16,
}

impl IcmpSocket {
    fn open(mode: Mode, id: u16) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))
            .map_err(|e| Error::Resource(format!("icmp socket: {}", e)))?;
        socket.set_nonblocking(true)?;
        let io = AsyncFd::with_interest(socket, Interest::READABLE | Interest::WRITABLE)?;
        Ok(Self {
            io,
            mode,
            id,
            seq: std::sync::atomic::AtomicU16::new(0),
        })
    }

    pub fn client(id: u16) -> Result<Self> {
        Self::open(Mode::Client, id)
    }

    pub fn server() -> Result<Self> {
        Self::open(Mode::Server, 0)
    }

    fn send_kind(&self) -> u8 {
        match self.mode {
            Mode::Client => ECHO_REQUEST,
            Mode::Server => ECHO_REPLY,
        }
    }

    fn recv_kind(&self) -> u8 {
        match self.mode {
            Mode::Client => ECHO_REPLY,
            Mode::Server => ECHO_REQUEST,
        }
    }

    fn try_send_packet(&self, dest: SocketAddr, payload: &[u8]) -> std::io::Result<()> {
        let seq = self
            .seq
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let pkt = encode_echo(self.send_kind(), dest.port(), seq, payload);
        let raw = SockAddr::from(SocketAddr::new(dest.ip(), 0));
        match self.io.get_ref().send_to(&pkt, &raw) {
            Ok(_) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Non-blocking receive of one tunnel payload; `None` for foreign
    /// ICMP traffic that must be skipped without surfacing.
    fn try_recv_packet(&self, buf: &mut [u8]) -> std::io::Result<Option<(usize, SocketAddr)>> {
        let mut scratch = [MaybeUninit::<u8>::uninit(); MAX_PACKET];
        let (n, from) = self.io.get_ref().recv_from(&mut scratch)?;
        let data = unsafe { std::slice::from_raw_parts(scratch.as_ptr() as *const u8, n) };

        let peer_ip = from
            .as_socket()
            .map(|sa| sa.ip())
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let icmp = match strip_ip_header(data) {
            Some(p) => p,
            None => return Ok(None),
        };
        let (kind, id, off) = match decode_echo(icmp) {
            Some(h) => h,
            None => return Ok(None),
        };
        if kind != self.recv_kind() {
            return Ok(None);
        }
        if self.mode == Mode::Client && id != self.id {
            return Ok(None);
        }

        let payload = &icmp[off..];
        let len = payload.len().min(buf.len());
        buf[..len].copy_from_slice(&payload[..len]);
        Ok(Some((len, SocketAddr::new(peer_ip, id))))
    }
}

impl Drop for IcmpSocket {
    fn drop(&mut self) {
        if self.mode == Mode::Client {
            release_echo_id(self.id);
        }
    }
}

impl std::fmt::Debug for IcmpSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IcmpSocket(id={})", self.id)
    }
}

// ============================================================================
// quinn glue
// ============================================================================

#[derive(Debug)]
struct IcmpUdpSocket {
    inner: Arc<IcmpSocket>,
}

#[derive(Debug)]
struct IcmpPoller {
    inner: Arc<IcmpSocket>,
}

impl UdpPoller for IcmpPoller {
    fn poll_writable(self: Pin<&mut Self>, cx: &mut Context) -> Poll<std::io::Result<()>> {
        match self.inner.io.poll_write_ready(cx) {
            Poll::Ready(Ok(mut guard)) => {
                guard.clear_ready();
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncUdpSocket for IcmpUdpSocket {
    fn create_io_poller(self: Arc<Self>) -> Pin<Box<dyn UdpPoller>> {
        Box::pin(IcmpPoller {
            inner: self.inner.clone(),
        })
    }

    fn try_send(&self, transmit: &Transmit) -> std::io::Result<()> {
        self.inner
            .try_send_packet(transmit.destination, transmit.contents)
    }

    fn poll_recv(
        &self,
        cx: &mut Context,
        bufs: &mut [IoSliceMut<'_>],
        meta: &mut [RecvMeta],
    ) -> Poll<std::io::Result<usize>> {
        let buf = match bufs.first_mut() {
            Some(b) => b,
            None => return Poll::Ready(Ok(0)),
        };
        loop {
            let mut guard = match self.inner.io.poll_read_ready(cx) {
                Poll::Ready(Ok(g)) => g,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            };
            match guard.try_io(|_| self.inner.try_recv_packet(buf)) {
                Ok(Ok(Some((len, addr)))) => {
                    let mut m = RecvMeta::default();
                    m.addr = addr;
                    m.len = len;
                    m.stride = len;
                    meta[0] = m;
                    return Poll::Ready(Ok(1));
                }
                // foreign traffic: keep reading
                Ok(Ok(None)) => continue,
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => continue,
            }
        }
    }

    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        Ok(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            self.inner.id,
        ))
    }

    fn max_transmit_segments(&self) -> usize {
        1
    }

    fn max_receive_segments(&self) -> usize {
        1
    }

    fn may_fragment(&self) -> bool {
        false
    }
}

// ============================================================================
// Dialer / Listener
// ============================================================================

pub struct IcmpDialer {
    config: QuicConfig,
    tls: TlsConfig,
    sessions: SessionCache<IcmpSession>,
}

struct IcmpSession {
    inner: QuicSession,
    // endpoint kept alive for the lifetime of the tunnel
    _endpoint: Endpoint,
}

#[async_trait]
impl Session for IcmpSession {
    async fn open_stream(&self) -> Result<crate::common::Stream> {
        self.inner.open_stream().await
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}

impl IcmpDialer {
    pub fn new(config: QuicConfig, tls: TlsConfig) -> Self {
        Self {
            config,
            tls,
            sessions: SessionCache::new(),
        }
    }

    async fn init_session(&self, addr: &Address) -> Result<IcmpSession> {
        // the port field selects the echo id, not a transport port
        let target_ip = match addr {
            Address::Socket(sa) => sa.ip(),
            Address::Domain(host, _) => tokio::net::lookup_host((host.as_str(), 0u16))
                .await?
                .next()
                .ok_or_else(|| Error::InvalidAddress(addr.to_string()))?
                .ip(),
        };

        let id = alloc_echo_id(addr.port())?;
        let socket = IcmpSocket::client(id)?;
        let udp = Arc::new(IcmpUdpSocket {
            inner: Arc::new(socket),
        });

        let mut endpoint = Endpoint::new_with_abstract_socket(
            EndpointConfig::default(),
            None,
            udp,
            Arc::new(quinn::TokioRuntime),
        )
        .map_err(|e| Error::Resource(format!("icmp endpoint: {}", e)))?;
        endpoint.set_default_client_config(client_config(&self.config, &self.tls)?);

        let remote = SocketAddr::new(target_ip, id);
        let server_name = self.tls.server_name.clone().unwrap_or_else(|| addr.host());
        let connecting = endpoint
            .connect(remote, &server_name)
            .map_err(|e| Error::Handshake(format!("icmp: {}", e)))?;
        let conn = tokio::time::timeout(self.config.handshake_timeout, connecting)
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(|e| Error::Handshake(format!("icmp: {}", e)))?;

        Ok(IcmpSession {
            inner: QuicSession::new(conn),
            _endpoint: endpoint,
        })
    }
}

#[async_trait]
impl Dialer for IcmpDialer {
    async fn dial(&self, addr: &Address) -> Result<Conn> {
        let key = addr.to_string();
        let stream = self
            .sessions
            .open_stream(&key, || self.init_session(addr))
            .await?;
        Ok(Conn::new(stream, Address::unspecified(), addr.clone()))
    }

    fn multiplex(&self) -> bool {
        true
    }
}

pub struct IcmpListener {
    local: Address,
    endpoint: Endpoint,
    queue: Arc<AcceptQueue>,
}

impl IcmpListener {
    pub async fn bind(addr: &Address, config: QuicConfig, tls: TlsConfig) -> Result<Self> {
        let socket = IcmpSocket::server()?;
        let udp = Arc::new(IcmpUdpSocket {
            inner: Arc::new(socket),
        });

        let endpoint = Endpoint::new_with_abstract_socket(
            EndpointConfig::default(),
            Some(server_config(&config, &tls)?),
            udp,
            Arc::new(quinn::TokioRuntime),
        )
        .map_err(|e| Error::Resource(format!("icmp endpoint: {}", e)))?;

        let queue = Arc::new(AcceptQueue::new(config.backlog));
        let accept_endpoint = endpoint.clone();
        let accept_queue = queue.clone();
        tokio::spawn(async move {
            while let Some(incoming) = accept_endpoint.accept().await {
                if accept_queue.is_closed() {
                    break;
                }
                let producer = accept_queue.producer();
                tokio::spawn(async move {
                    match incoming.await {
                        Ok(conn) => serve_connection(conn, producer).await,
                        Err(e) => warn!("icmp: handshake failed: {}", e),
                    }
                });
            }
            accept_queue.close();
        });

        Ok(Self {
            local: addr.clone(),
            endpoint,
            queue,
        })
    }
}

#[async_trait]
impl Listener for IcmpListener {
    async fn accept(&self) -> Result<Conn> {
        self.queue.pop().await
    }

    fn local_addr(&self) -> Result<Address> {
        Ok(self.local.clone())
    }

    async fn close(&self) -> Result<()> {
        self.queue.close();
        self.endpoint.close(VarInt::from_u32(0), b"");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_verifies_and_zeroes() {
        let pkt = encode_echo(ECHO_REQUEST, 42, 1, b"payload");
        // recomputing over a packet with its checksum in place yields zero
        assert_eq!(checksum(&pkt), 0);
    }

    #[test]
    fn echo_roundtrip() {
        let pkt = encode_echo(ECHO_REPLY, 0xbeef, 7, b"data");
        let (kind, id, off) = decode_echo(&pkt).unwrap();
        assert_eq!(kind, ECHO_REPLY);
        assert_eq!(id, 0xbeef);
        assert_eq!(&pkt[off..], b"data");
    }

    #[test]
    fn ip_header_stripping() {
        let mut raw = vec![0u8; 28];
        raw[0] = 0x45;
        raw[20] = ECHO_REQUEST;
        let icmp = strip_ip_header(&raw).unwrap();
        assert_eq!(icmp.len(), 8);
        assert_eq!(icmp[0], ECHO_REQUEST);
        assert!(strip_ip_header(&raw[..10]).is_none());
    }

    #[test]
    fn id_allocator_avoids_duplicates() {
        let a = alloc_echo_id(0).unwrap();
        let b = alloc_echo_id(0).unwrap();
        assert_ne!(a, 0);
        assert_ne!(a, b);
        release_echo_id(a);
        release_echo_id(b);
    }
}
