//! Relay tunnel connector
//!
//! Speaks the binary relay handshake toward a relay server. Two modes:
//!
//! * **no-delay**: write the request, wait for the response, fail on any
//!   non-OK status.
//! * **delay** (default): buffer the request and piggyback it on the
//!   first client write, saving a round trip; the response header is
//!   consumed transparently before the first read is served.
//!
//! A UDP association (`connect_packet`) sends `Bind|UDP` and returns a
//! datagram endpoint framed over the stream.

use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tracing::debug;

use crate::common::{Address, Conn, Datagram, Network, Stream};
use crate::error::{Error, Result};
use crate::protocol::relay::{
    read_datagram, write_datagram, Feature, Request, Response, CMD_BIND, CMD_CONNECT, FLAG_UDP,
    STATUS_OK,
};
use crate::protocol::socks5::SocksAddr;

use super::Connector;

pub struct RelayConnector {
    username: Option<String>,
    password: Option<String>,
    tunnel_id: Option<[u8; 16]>,
    no_delay: bool,
    connect_timeout: Option<Duration>,
}

impl Default for RelayConnector {
    fn default() -> Self {
        Self {
            username: None,
            password: None,
            tunnel_id: None,
            no_delay: false,
            connect_timeout: Some(Duration::from_secs(10)),
        }
    }
}

impl RelayConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_auth(mut self, username: Option<String>, password: Option<String>) -> Self {
        self.username = username;
        self.password = password;
        self
    }

    pub fn with_tunnel_id(mut self, id: Option<[u8; 16]>) -> Self {
        self.tunnel_id = id;
        self
    }

    pub fn with_no_delay(mut self, no_delay: bool) -> Self {
        self.no_delay = no_delay;
        self
    }

    fn base_request(&self, cmd: u8) -> Request {
        let mut req = Request::new(cmd);
        if let (Some(user), Some(pass)) = (&self.username, &self.password) {
            req.features.push(Feature::UserAuth {
                username: user.clone(),
                password: pass.clone(),
            });
        }
        if let Some(id) = self.tunnel_id {
            req.features.push(Feature::Tunnel(id));
        }
        req
    }

    async fn exchange(&self, stream: &mut Stream, req: &Request) -> Result<()> {
        let io = async {
            req.write_to(stream).await?;
            let resp = Response::read_from(stream).await?;
            if resp.status != STATUS_OK {
                return Err(Error::Handshake(format!(
                    "relay: status {:#04x}",
                    resp.status
                )));
            }
            Ok(())
        };
        match self.connect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, io).await?,
            None => io.await,
        }
    }
}

#[async_trait]
impl Connector for RelayConnector {
    async fn connect(&self, mut conn: Conn, network: Network, addr: &Address) -> Result<Conn> {
        debug!("connect {}/{} via relay", addr, network);

        let mut cmd = CMD_CONNECT;
        if network == Network::Udp {
            cmd |= FLAG_UDP;
        }
        let mut req = self.base_request(cmd);
        if !addr.is_unspecified() {
            req.features
                .push(Feature::Addr(SocksAddr::from_address(addr)));
        }

        if self.no_delay {
            self.exchange(&mut conn.stream, &req).await?;
            return Ok(conn);
        }

        // delay mode: the request rides along with the first write and
        // the response header is stripped ahead of the first read
        conn.stream = Box::new(DelayedStream::new(conn.stream, req.encode()));
        Ok(conn)
    }

    async fn connect_packet(&self, mut conn: Conn) -> Result<Box<dyn Datagram>> {
        debug!("udp association via relay");
        let req = self.base_request(CMD_BIND | FLAG_UDP);
        self.exchange(&mut conn.stream, &req).await?;
        Ok(Box::new(UdpTunDatagram::new(conn.stream)))
    }
}

// ============================================================================
// Delay-mode stream
// ============================================================================

enum SkipState {
    Head { buf: [u8; 3], pos: usize },
    FeatureHead { left: u8, buf: [u8; 3], pos: usize },
    FeatureBody { left: u8, remaining: usize },
    Done,
}

/// Stream that sends a buffered handshake with the first write and
/// discards the handshake response ahead of the first read.
struct DelayedStream {
    inner: Stream,
    wbuf: Vec<u8>,
    wbuf_pos: usize,
    skip: SkipState,
}

impl DelayedStream {
    fn new(inner: Stream, request: Vec<u8>) -> Self {
        Self {
            inner,
            wbuf: request,
            wbuf_pos: 0,
            skip: SkipState::Head {
                buf: [0u8; 3],
                pos: 0,
            },
        }
    }

    fn poll_skip_response(&mut self, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let mut scratch = [0u8; 256];
        loop {
            match &mut self.skip {
                SkipState::Done => return Poll::Ready(Ok(())),
                SkipState::Head { buf, pos } => {
                    let mut temp = ReadBuf::new(&mut buf[*pos..]);
                    match Pin::new(&mut self.inner).poll_read(cx, &mut temp) {
                        Poll::Ready(Ok(())) => {
                            let n = temp.filled().len();
                            if n == 0 {
                                return Poll::Ready(Err(
                                    std::io::ErrorKind::UnexpectedEof.into()
                                ));
                            }
                            *pos += n;
                            if *pos == 3 {
                                if buf[0] != crate::protocol::relay::VERSION {
                                    return Poll::Ready(Err(std::io::Error::new(
                                        std::io::ErrorKind::InvalidData,
                                        "bad relay version",
                                    )));
                                }
                                if buf[1] != STATUS_OK {
                                    return Poll::Ready(Err(std::io::Error::new(
                                        std::io::ErrorKind::ConnectionRefused,
                                        format!("relay status {:#04x}", buf[1]),
                                    )));
                                }
                                if buf[2] == 0 {
                                    self.skip = SkipState::Done;
                                } else {
                                    self.skip = SkipState::FeatureHead {
                                        left: buf[2],
                                        buf: [0u8; 3],
                                        pos: 0,
                                    };
                                }
                            }
                        }
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => return Poll::Pending,
                    }
                }
                SkipState::FeatureHead { left, buf, pos } => {
                    let mut temp = ReadBuf::new(&mut buf[*pos..]);
                    match Pin::new(&mut self.inner).poll_read(cx, &mut temp) {
                        Poll::Ready(Ok(())) => {
                            let n = temp.filled().len();
                            if n == 0 {
                                return Poll::Ready(Err(
                                    std::io::ErrorKind::UnexpectedEof.into()
                                ));
                            }
                            *pos += n;
                            if *pos == 3 {
                                let body = u16::from_be_bytes([buf[1], buf[2]]) as usize;
                                self.skip = SkipState::FeatureBody {
                                    left: *left,
                                    remaining: body,
                                };
                            }
                        }
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => return Poll::Pending,
                    }
                }
                SkipState::FeatureBody { left, remaining } => {
                    if *remaining == 0 {
                        let left = *left - 1;
                        if left == 0 {
                            self.skip = SkipState::Done;
                        } else {
                            self.skip = SkipState::FeatureHead {
                                left,
                                buf: [0u8; 3],
                                pos: 0,
                            };
                        }
                        continue;
                    }
                    let want = (*remaining).min(scratch.len());
                    let mut temp = ReadBuf::new(&mut scratch[..want]);
                    match Pin::new(&mut self.inner).poll_read(cx, &mut temp) {
                        Poll::Ready(Ok(())) => {
                            let n = temp.filled().len();
                            if n == 0 {
                                return Poll::Ready(Err(
                                    std::io::ErrorKind::UnexpectedEof.into()
                                ));
                            }
                            *remaining -= n;
                        }
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => return Poll::Pending,
                    }
                }
            }
        }
    }

    fn poll_flush_request(&mut self, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        while self.wbuf_pos < self.wbuf.len() {
            let chunk = &self.wbuf[self.wbuf_pos..];
            match Pin::new(&mut self.inner).poll_write(cx, chunk) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(std::io::ErrorKind::WriteZero.into()))
                }
                Poll::Ready(Ok(n)) => self.wbuf_pos += n,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        if !self.wbuf.is_empty() {
            self.wbuf.clear();
            self.wbuf_pos = 0;
        }
        Poll::Ready(Ok(()))
    }
}

impl AsyncRead for DelayedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = &mut *self;
        // the request must be on the wire before a response can arrive
        match this.poll_flush_request(cx) {
            Poll::Ready(Ok(())) => {}
            other => return other,
        }
        match this.poll_skip_response(cx) {
            Poll::Ready(Ok(())) => {}
            other => return other,
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for DelayedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = &mut *self;
        match this.poll_flush_request(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = &mut *self;
        match this.poll_flush_request(cx) {
            Poll::Ready(Ok(())) => {}
            other => return other,
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = &mut *self;
        match this.poll_flush_request(cx) {
            Poll::Ready(Ok(())) => {}
            other => return other,
        }
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

// ============================================================================
// UDP over stream
// ============================================================================

/// Datagram endpoint tunneled over a reliable stream with
/// address-prefixed, length-delimited packets.
pub struct UdpTunDatagram {
    reader: Mutex<ReadHalf<Stream>>,
    writer: Mutex<WriteHalf<Stream>>,
}

impl UdpTunDatagram {
    pub fn new(stream: Stream) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        }
    }
}

#[async_trait]
impl Datagram for UdpTunDatagram {
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, Address)> {
        let mut reader = self.reader.lock().await;
        let (n, addr) = read_datagram(&mut *reader, buf).await?;
        Ok((n, addr.to_address()))
    }

    async fn send_to(&self, buf: &[u8], addr: &Address) -> Result<usize> {
        let mut writer = self.writer.lock().await;
        write_datagram(&mut *writer, &SocksAddr::from_address(addr), buf).await?;
        Ok(buf.len())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    async fn close(&self) -> Result<()> {
        use tokio::io::AsyncWriteExt;
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::relay;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn no_delay_handshake() {
        let (client, mut server) = tokio::io::duplex(4096);
        let connector = RelayConnector::new().with_no_delay(true);
        let conn = Conn::new(
            Box::new(client),
            Address::unspecified(),
            Address::unspecified(),
        );

        let server_task = tokio::spawn(async move {
            let req = relay::Request::read_from(&mut server).await.unwrap();
            assert_eq!(req.cmd, CMD_CONNECT);
            assert_eq!(
                req.addr().unwrap(),
                &"example.com:80".parse::<SocksAddr>().unwrap()
            );
            relay::Response::new(STATUS_OK)
                .write_to(&mut server)
                .await
                .unwrap();
            server
        });

        let target: Address = "example.com:80".parse().unwrap();
        let conn = connector
            .connect(conn, Network::Tcp, &target)
            .await
            .unwrap();
        drop(conn);
        let _ = server_task.await.unwrap();
    }

    #[tokio::test]
    async fn no_delay_fails_on_bad_status() {
        let (client, mut server) = tokio::io::duplex(4096);
        let connector = RelayConnector::new().with_no_delay(true);
        let conn = Conn::new(
            Box::new(client),
            Address::unspecified(),
            Address::unspecified(),
        );

        tokio::spawn(async move {
            let _ = relay::Request::read_from(&mut server).await.unwrap();
            relay::Response::new(relay::STATUS_FORBIDDEN)
                .write_to(&mut server)
                .await
                .unwrap();
            // hold the other end open until the client reacts
            let mut sink = [0u8; 1];
            let _ = server.read(&mut sink).await;
        });

        let target: Address = "example.com:80".parse().unwrap();
        assert!(connector
            .connect(conn, Network::Tcp, &target)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn delay_mode_piggybacks_and_strips_response() {
        let (client, mut server) = tokio::io::duplex(4096);
        let connector = RelayConnector::new();
        let conn = Conn::new(
            Box::new(client),
            Address::unspecified(),
            Address::unspecified(),
        );

        let target: Address = "1.2.3.4:9".parse().unwrap();
        let mut conn = connector
            .connect(conn, Network::Tcp, &target)
            .await
            .unwrap();

        let server_task = tokio::spawn(async move {
            // request and first payload arrive together
            let req = relay::Request::read_from(&mut server).await.unwrap();
            assert_eq!(req.cmd, CMD_CONNECT);
            let mut payload = [0u8; 5];
            server.read_exact(&mut payload).await.unwrap();
            assert_eq!(&payload, b"early");

            let mut resp = relay::Response::new(STATUS_OK);
            resp.features
                .push(Feature::Addr("9.9.9.9:1".parse().unwrap()));
            resp.write_to(&mut server).await.unwrap();
            server.write_all(b"payload-after-header").await.unwrap();
        });

        conn.stream.write_all(b"early").await.unwrap();
        conn.stream.flush().await.unwrap();

        let mut buf = [0u8; 20];
        conn.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"payload-after-header");
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn udp_association_roundtrip() {
        let (client, mut server) = tokio::io::duplex(4096);
        let connector = RelayConnector::new();
        let conn = Conn::new(
            Box::new(client),
            Address::unspecified(),
            Address::unspecified(),
        );

        let server_task = tokio::spawn(async move {
            let req = relay::Request::read_from(&mut server).await.unwrap();
            assert_eq!(req.cmd, CMD_BIND | FLAG_UDP);
            relay::Response::new(STATUS_OK)
                .write_to(&mut server)
                .await
                .unwrap();

            let mut buf = [0u8; 64];
            let (n, addr) = relay::read_datagram(&mut server, &mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"ping");
            relay::write_datagram(&mut server, &addr, b"pong")
                .await
                .unwrap();
        });

        let datagram = connector.connect_packet(conn).await.unwrap();
        let target: Address = "8.8.8.8:53".parse().unwrap();
        datagram.send_to(b"ping", &target).await.unwrap();

        let mut buf = [0u8; 64];
        let (n, from) = datagram.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pong");
        assert_eq!(from, target);
        server_task.await.unwrap();
    }
}
