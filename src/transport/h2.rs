//! HTTP/2 transport
//!
//! The listener accepts `CONNECT` (or a fixed path) and upgrades the
//! request into a byte stream: 200 headers out, request body in,
//! response body out. The dialer keeps one HTTP/2 connection per
//! address and opens a `CONNECT` stream per dial. With no TLS config
//! the transport runs as cleartext H2C.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use h2::client::SendRequest;
use h2::{RecvStream, SendStream};
use http::{Method, Request, Response, StatusCode};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

use crate::common::{Address, Conn, Stream};
use crate::error::{Error, Result};
use crate::session::{Session, SessionCache};

use super::{
    AcceptQueue, Dialer, Listener, TcpDialer, TcpListener, TlsConfig, TlsWrapper, DEFAULT_BACKLOG,
};

/// Reverse-proxy rule for non-tunnel requests on an H2C listener.
/// Disabled unless configured.
#[derive(Debug, Clone)]
pub struct RewriteRule {
    /// Upstream HTTP/1.1 server receiving rewritten requests.
    pub target: Address,
    /// Prefix prepended to the original path.
    pub path_prefix: String,
}

#[derive(Debug, Clone)]
pub struct H2Config {
    /// Tunnel path accepted next to CONNECT.
    pub path: String,
    /// Authority override for tunnel dials.
    pub host: Option<String>,
    pub headers: Vec<(String, String)>,
    pub backlog: usize,
    /// Proxy mode: dials yield the client handle for the http2 connector
    /// instead of opening a path tunnel.
    pub proxy: bool,
    pub rewrite: Option<RewriteRule>,
}

impl Default for H2Config {
    fn default() -> Self {
        Self {
            path: "/t".to_string(),
            host: None,
            headers: vec![],
            backlog: DEFAULT_BACKLOG,
            proxy: false,
            rewrite: None,
        }
    }
}

/// Shared HTTP/2 client carried in the envelope of proxy-mode dials; the
/// http2 connector opens CONNECT streams through it.
#[derive(Clone)]
pub struct H2ClientHandle {
    sender: Arc<Mutex<SendRequest<Bytes>>>,
}

impl H2ClientHandle {
    /// Open a CONNECT stream to `authority` with optional extra headers.
    pub async fn connect(
        &self,
        authority: &str,
        headers: &[(String, String)],
    ) -> Result<(StatusCode, Stream)> {
        let sender = self.sender.lock().await.clone();
        let mut sender = sender
            .ready()
            .await
            .map_err(|e| Error::Transport(format!("h2: {}", e)))?;

        let mut builder = Request::builder().method(Method::CONNECT).uri(authority);
        for (k, v) in headers {
            builder = builder.header(k.as_str(), v.as_str());
        }
        let request = builder
            .body(())
            .map_err(|e| Error::Protocol(format!("h2 request: {}", e)))?;

        let (response, send_stream) = sender
            .send_request(request, false)
            .map_err(|e| Error::Transport(format!("h2: {}", e)))?;
        let response = response
            .await
            .map_err(|e| Error::Transport(format!("h2: {}", e)))?;
        let status = response.status();
        Ok((status, Box::new(H2Stream::new(send_stream, response.into_body()))))
    }
}

// ============================================================================
// Dialer
// ============================================================================

pub struct H2Dialer {
    config: H2Config,
    inner: TcpDialer,
    tls: Option<TlsWrapper>,
    sessions: SessionCache<H2Session>,
}

impl H2Dialer {
    pub fn new(config: H2Config) -> Self {
        Self {
            config,
            inner: TcpDialer::new(),
            tls: None,
            sessions: SessionCache::new(),
        }
    }

    pub fn new_tls(config: H2Config, mut tls: TlsConfig) -> Self {
        if tls.alpn.is_empty() {
            tls.alpn = vec!["h2".to_string()];
        }
        Self {
            config,
            inner: TcpDialer::new(),
            tls: Some(TlsWrapper::new(tls)),
            sessions: SessionCache::new(),
        }
    }

    async fn init_session(&self, addr: &Address) -> Result<H2Session> {
        let mut conn = self.inner.dial(addr).await?;
        if let Some(tls) = &self.tls {
            conn = tls.wrap_client(conn, addr).await?;
        }

        let (sender, connection) = h2::client::handshake(conn.stream)
            .await
            .map_err(|e| Error::Handshake(format!("h2: {}", e)))?;

        let (closed_tx, closed_rx) = watch::channel(false);
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("h2: connection terminated: {}", e);
            }
            let _ = closed_tx.send(true);
        });

        Ok(H2Session {
            sender: Arc::new(Mutex::new(sender)),
            config: self.config.clone(),
            secure: self.tls.is_some(),
            peer: addr.clone(),
            closed_rx,
        })
    }
}

#[async_trait]
impl Dialer for H2Dialer {
    async fn dial(&self, addr: &Address) -> Result<Conn> {
        let key = addr.to_string();
        let session = self
            .sessions
            .get_or_init(&key, || self.init_session(addr))
            .await?;

        if self.config.proxy {
            // the http2 connector opens CONNECT streams via the handle
            let mut conn = Conn::new(
                crate::common::empty_stream(),
                Address::unspecified(),
                addr.clone(),
            );
            conn.envelope.insert(session.handle());
            return Ok(conn);
        }

        match session.open_stream().await {
            Ok(stream) => Ok(Conn::new(stream, Address::unspecified(), addr.clone())),
            Err(e) => {
                self.sessions.evict(&key).await;
                Err(e)
            }
        }
    }

    fn multiplex(&self) -> bool {
        true
    }
}

struct H2Session {
    sender: Arc<Mutex<SendRequest<Bytes>>>,
    config: H2Config,
    secure: bool,
    peer: Address,
    closed_rx: watch::Receiver<bool>,
}

impl H2Session {
    fn handle(&self) -> H2ClientHandle {
        H2ClientHandle {
            sender: self.sender.clone(),
        }
    }
}

#[async_trait]
impl Session for H2Session {
    /// Open a path tunnel: `POST {path}`, expect 200, then stream bodies.
    async fn open_stream(&self) -> Result<Stream> {
        let sender = self.sender.lock().await.clone();
        let mut sender = sender
            .ready()
            .await
            .map_err(|e| Error::Transport(format!("h2: {}", e)))?;

        let authority = self
            .config
            .host
            .clone()
            .unwrap_or_else(|| self.peer.to_string());
        let scheme = if self.secure { "https" } else { "http" };
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(format!("{}://{}{}", scheme, authority, self.config.path));
        for (k, v) in &self.config.headers {
            builder = builder.header(k.as_str(), v.as_str());
        }
        let request = builder
            .body(())
            .map_err(|e| Error::Protocol(format!("h2 request: {}", e)))?;

        let (response, send_stream) = sender
            .send_request(request, false)
            .map_err(|e| Error::Transport(format!("h2: {}", e)))?;
        let response = response
            .await
            .map_err(|e| Error::Transport(format!("h2: {}", e)))?;

        if response.status() != StatusCode::OK {
            return Err(Error::Handshake(format!(
                "h2 tunnel failed: {}",
                response.status()
            )));
        }

        Ok(Box::new(H2Stream::new(send_stream, response.into_body())))
    }

    fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    async fn close(&self) {
        // dropping the sender tears the connection down once streams end
    }
}

// ============================================================================
// Listener
// ============================================================================

pub struct H2Listener {
    local: Address,
    queue: Arc<AcceptQueue>,
}

impl H2Listener {
    pub async fn bind(addr: &Address, config: H2Config, tls: Option<TlsConfig>) -> Result<Self> {
        let inner = TcpListener::bind(addr).await?;
        let local = inner.local_addr()?;
        let queue = Arc::new(AcceptQueue::new(config.backlog));

        let tls = tls
            .map(|mut t| {
                if t.alpn.is_empty() {
                    t.alpn = vec!["h2".to_string()];
                }
                Arc::new(TlsWrapper::new(t))
            });

        let accept_queue = queue.clone();
        tokio::spawn(async move {
            loop {
                let conn = match inner.accept().await {
                    Ok(c) => c,
                    Err(e) => {
                        debug!("h2: accept: {}", e);
                        break;
                    }
                };
                if accept_queue.is_closed() {
                    break;
                }
                let producer = accept_queue.producer();
                let config = config.clone();
                let tls = tls.clone();
                tokio::spawn(async move {
                    let conn = match tls {
                        Some(tls) => match tls.wrap_server(conn).await {
                            Ok(c) => c,
                            Err(e) => {
                                warn!("h2: tls handshake failed: {}", e);
                                return;
                            }
                        },
                        None => conn,
                    };
                    serve_connection(conn, config, producer).await;
                });
            }
            accept_queue.close();
        });

        Ok(Self { local, queue })
    }
}

async fn serve_connection(conn: Conn, config: H2Config, producer: super::QueueProducer) {
    let (local, peer) = (conn.local.clone(), conn.peer.clone());
    let mut connection = match h2::server::handshake(conn.stream).await {
        Ok(c) => c,
        Err(e) => {
            warn!("h2: handshake from {} failed: {}", peer, e);
            return;
        }
    };

    while let Some(request) = connection.accept().await {
        let (request, mut respond) = match request {
            Ok(r) => r,
            Err(e) => {
                debug!("h2: stream from {}: {}", peer, e);
                break;
            }
        };

        let is_tunnel =
            request.method() == Method::CONNECT || request.uri().path() == config.path;
        if is_tunnel {
            let response = Response::builder().status(StatusCode::OK).body(()).unwrap();
            match respond.send_response(response, false) {
                Ok(send_stream) => {
                    let stream: Stream =
                        Box::new(H2Stream::new(send_stream, request.into_body()));
                    producer.offer(Conn::new(stream, local.clone(), peer.clone()), "h2");
                }
                Err(e) => debug!("h2: respond to {}: {}", peer, e),
            }
            continue;
        }

        match config.rewrite.clone() {
            Some(rule) => {
                tokio::spawn(async move {
                    if let Err(e) = rewrite_request(request, respond, rule).await {
                        debug!("h2: rewrite failed: {}", e);
                    }
                });
            }
            None => {
                let response = Response::builder()
                    .status(StatusCode::NOT_FOUND)
                    .body(())
                    .unwrap();
                let _ = respond.send_response(response, true);
            }
        }
    }
}

/// Forward a non-tunnel request to the configured HTTP/1.1 upstream.
async fn rewrite_request(
    request: Request<RecvStream>,
    mut respond: h2::server::SendResponse<Bytes>,
    rule: RewriteRule,
) -> Result<()> {
    let upstream = TcpDialer::new().dial(&rule.target).await?;
    let mut upstream = upstream.stream;

    let path = format!(
        "{}{}",
        rule.path_prefix.trim_end_matches('/'),
        request.uri().path()
    );
    let head = format!(
        "{} {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        request.method(),
        path,
        rule.target
    );
    upstream.write_all(head.as_bytes()).await?;

    let mut body = request.into_body();
    while let Some(chunk) = body.data().await {
        let chunk = chunk.map_err(|e| Error::Protocol(format!("h2 body: {}", e)))?;
        let _ = body.flow_control().release_capacity(chunk.len());
        upstream.write_all(&chunk).await?;
    }

    // minimal HTTP/1.1 response parse: status line, skip headers, raw body
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") {
        if upstream.read_exact(&mut byte).await.is_err() {
            break;
        }
        buf.push(byte[0]);
        if buf.len() > 64 * 1024 {
            return Err(Error::Protocol("oversized upstream response header".into()));
        }
    }
    let status = std::str::from_utf8(&buf)
        .ok()
        .and_then(|s| s.split_whitespace().nth(1))
        .and_then(|code| code.parse::<u16>().ok())
        .and_then(|code| StatusCode::from_u16(code).ok())
        .unwrap_or(StatusCode::BAD_GATEWAY);

    let response = Response::builder().status(status).body(()).unwrap();
    let mut send = respond
        .send_response(response, false)
        .map_err(|e| Error::Protocol(format!("h2 respond: {}", e)))?;

    let mut chunk = vec![0u8; 16 * 1024];
    loop {
        let n = match upstream.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        send.reserve_capacity(n);
        if send
            .send_data(Bytes::copy_from_slice(&chunk[..n]), false)
            .is_err()
        {
            break;
        }
    }
    let _ = send.send_data(Bytes::new(), true);
    Ok(())
}

#[async_trait]
impl Listener for H2Listener {
    async fn accept(&self) -> Result<Conn> {
        self.queue.pop().await
    }

    fn local_addr(&self) -> Result<Address> {
        Ok(self.local.clone())
    }

    async fn close(&self) -> Result<()> {
        self.queue.close();
        Ok(())
    }
}

// ============================================================================
// Stream adapter
// ============================================================================

/// h2 (SendStream, RecvStream) pair as a byte stream.
pub struct H2Stream {
    send: SendStream<Bytes>,
    recv: RecvStream,
    read_buf: Bytes,
}

impl H2Stream {
    fn new(send: SendStream<Bytes>, recv: RecvStream) -> Self {
        Self {
            send,
            recv,
            read_buf: Bytes::new(),
        }
    }
}

impl AsyncRead for H2Stream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if !self.read_buf.is_empty() {
            let to_read = self.read_buf.len().min(buf.remaining());
            buf.put_slice(&self.read_buf[..to_read]);
            self.read_buf.advance(to_read);
            return Poll::Ready(Ok(()));
        }

        match self.recv.poll_data(cx) {
            Poll::Ready(Some(Ok(data))) => {
                let _ = self.recv.flow_control().release_capacity(data.len());
                let to_read = data.len().min(buf.remaining());
                buf.put_slice(&data[..to_read]);
                if to_read < data.len() {
                    self.read_buf = data.slice(to_read..);
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Some(Err(e))) => {
                Poll::Ready(Err(std::io::Error::other(format!("h2 read: {}", e))))
            }
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for H2Stream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.send.reserve_capacity(buf.len());

        loop {
            match self.send.poll_capacity(cx) {
                Poll::Ready(Some(Ok(0))) => continue,
                Poll::Ready(Some(Ok(capacity))) => {
                    let to_write = capacity.min(buf.len());
                    let data = Bytes::copy_from_slice(&buf[..to_write]);
                    return match self.send.send_data(data, false) {
                        Ok(()) => Poll::Ready(Ok(to_write)),
                        Err(e) => {
                            Poll::Ready(Err(std::io::Error::other(format!("h2 write: {}", e))))
                        }
                    };
                }
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Err(std::io::Error::other(format!("h2 write: {}", e))))
                }
                Poll::Ready(None) => {
                    return Poll::Ready(Err(std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        "h2 stream closed",
                    )))
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        // data frames are flushed by the connection task
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let _ = self.send.send_data(Bytes::new(), true);
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn connect_tunnel_roundtrip() {
        let listener = H2Listener::bind(&"127.0.0.1:0".parse().unwrap(), H2Config::default(), None)
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let dialer = H2Dialer::new(H2Config::default());
        assert!(dialer.multiplex());

        let client = tokio::spawn(async move { dialer.dial(&addr).await });
        let mut accepted = listener.accept().await.unwrap();
        let mut dialed = client.await.unwrap().unwrap();

        dialed.stream.write_all(b"through h2").await.unwrap();
        let mut buf = [0u8; 10];
        accepted.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"through h2");

        accepted.stream.write_all(b"and back").await.unwrap();
        let mut buf = [0u8; 8];
        dialed.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"and back");
    }

    #[tokio::test]
    async fn second_dial_reuses_the_session() {
        let listener = H2Listener::bind(&"127.0.0.1:0".parse().unwrap(), H2Config::default(), None)
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let dialer = Arc::new(H2Dialer::new(H2Config::default()));

        let d = dialer.clone();
        let a = addr.clone();
        let dials = tokio::spawn(async move {
            let c1 = d.dial(&a).await.unwrap();
            let c2 = d.dial(&a).await.unwrap();
            (c1, c2)
        });

        let s1 = listener.accept().await.unwrap();
        let s2 = listener.accept().await.unwrap();
        // both logical streams surface from the same TCP peer
        assert_eq!(s1.peer, s2.peer);
        let _ = dials.await.unwrap();
    }
}
