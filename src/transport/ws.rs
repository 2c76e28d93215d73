//! WebSocket transport
//!
//! Dial returns raw TCP; the handshake step performs the HTTP upgrade.
//! A ping keepalive guards half-dead connections: a ping goes out every
//! period, and the stream fails when neither a pong nor data arrives
//! within twice the period.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Sink, Stream as FuturesStream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Instant, Interval, Sleep};
use tokio_tungstenite::{
    accept_hdr_async_with_config, client_async_with_config,
    tungstenite::handshake::client::{generate_key, Request},
    tungstenite::handshake::server,
    tungstenite::protocol::{Message, WebSocketConfig as TungsteniteConfig},
    WebSocketStream,
};
use tracing::{debug, warn};

use crate::common::{Address, Conn, Stream};
use crate::error::{Error, Result};

use super::{
    AcceptQueue, Dialer, Listener, TcpDialer, TcpListener, TlsConfig, TlsWrapper, DEFAULT_BACKLOG,
};

/// WebSocket configuration
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Upgrade path
    pub path: String,
    /// Host header (defaults to the dialed address)
    pub host: Option<String>,
    /// Custom headers
    pub headers: Vec<(String, String)>,
    /// Ping period; disables keepalive when `None`
    pub keepalive: Option<Duration>,
    /// Accept queue capacity
    pub backlog: usize,
    /// Permessage-deflate handling is left to the library; this toggles
    /// the larger frame limits used for tunneled traffic.
    pub max_frame_size: Option<usize>,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            path: "/ws".to_string(),
            host: None,
            headers: vec![],
            keepalive: None,
            backlog: DEFAULT_BACKLOG,
            max_frame_size: Some(16 << 20),
        }
    }
}

fn tungstenite_config(config: &WsConfig) -> TungsteniteConfig {
    TungsteniteConfig {
        max_message_size: Some(64 << 20),
        max_frame_size: config.max_frame_size,
        ..Default::default()
    }
}

/// WebSocket dialer (plain or over TLS)
pub struct WsDialer {
    config: WsConfig,
    inner: TcpDialer,
    tls: Option<TlsWrapper>,
}

impl WsDialer {
    pub fn new(config: WsConfig) -> Self {
        Self {
            config,
            inner: TcpDialer::new(),
            tls: None,
        }
    }

    pub fn new_tls(config: WsConfig, tls: TlsConfig) -> Self {
        Self {
            config,
            inner: TcpDialer::new(),
            tls: Some(TlsWrapper::new(tls)),
        }
    }
}

#[async_trait]
impl Dialer for WsDialer {
    async fn dial(&self, addr: &Address) -> Result<Conn> {
        self.inner.dial(addr).await
    }

    async fn handshake(&self, mut conn: Conn, addr: &Address) -> Result<Conn> {
        if let Some(tls) = &self.tls {
            conn = tls.wrap_client(conn, addr).await?;
        }

        let host = self
            .config
            .host
            .clone()
            .unwrap_or_else(|| addr.to_string());
        let scheme = if self.tls.is_some() { "wss" } else { "ws" };
        let uri = format!("{}://{}{}", scheme, host, self.config.path);

        let mut request = Request::builder()
            .uri(&uri)
            .header("Host", &host)
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header("Sec-WebSocket-Key", generate_key());
        for (key, value) in &self.config.headers {
            request = request.header(key.as_str(), value.as_str());
        }
        let request = request
            .body(())
            .map_err(|e| Error::Handshake(format!("ws request: {}", e)))?;

        let (ws, _response) =
            client_async_with_config(request, conn.stream, Some(tungstenite_config(&self.config)))
                .await
                .map_err(|e| Error::Handshake(format!("ws: {}", e)))?;

        conn.stream = Box::new(WsStream::new(ws, self.config.keepalive, true));
        Ok(conn)
    }
}

/// WebSocket listener (plain or over TLS)
pub struct WsListener {
    local: Address,
    queue: Arc<AcceptQueue>,
}

impl WsListener {
    pub async fn bind(addr: &Address, config: WsConfig, tls: Option<TlsConfig>) -> Result<Self> {
        let inner = TcpListener::bind(addr).await?;
        let local = inner.local_addr()?;
        let queue = Arc::new(AcceptQueue::new(config.backlog));

        let tls = tls.map(|t| Arc::new(TlsWrapper::new(t)));
        let accept_queue = queue.clone();
        tokio::spawn(async move {
            loop {
                let conn = match inner.accept().await {
                    Ok(c) => c,
                    Err(e) => {
                        debug!("ws: accept: {}", e);
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
                                warn!("wss: tls handshake failed: {}", e);
                                return;
                            }
                        },
                        None => conn,
                    };
                    upgrade_task(conn, config, producer).await;
                });
            }
            accept_queue.close();
        });

        Ok(Self { local, queue })
    }
}

async fn upgrade_task(conn: Conn, config: WsConfig, producer: super::QueueProducer) {
    let (local, peer, envelope) = (conn.local, conn.peer, conn.envelope);
    let path = config.path.clone();
    let check = move |req: &server::Request, resp: server::Response| {
        if req.uri().path() == path {
            Ok(resp)
        } else {
            let not_found = server::ErrorResponse::new(None);
            let mut resp = not_found;
            *resp.status_mut() = tokio_tungstenite::tungstenite::http::StatusCode::NOT_FOUND;
            Err(resp)
        }
    };

    match accept_hdr_async_with_config(conn.stream, check, Some(tungstenite_config(&config))).await
    {
        Ok(ws) => {
            let stream: Stream = Box::new(WsStream::new(ws, config.keepalive, false));
            producer.offer(
                Conn {
                    stream,
                    local,
                    peer,
                    envelope,
                },
                "ws",
            );
        }
        Err(e) => warn!("ws: handshake from {} failed: {}", peer, e),
    }
}

#[async_trait]
impl Listener for WsListener {
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

/// Adapter exposing a WebSocket as a byte stream, with the optional ping
/// keepalive folded into the read path.
struct WsStream<S> {
    inner: WebSocketStream<S>,
    read_buf: Vec<u8>,
    read_pos: usize,
    closed: bool,
    // keepalive state; only the dialing side sends pings
    ping_interval: Option<Interval>,
    ping_pending: bool,
    deadline: Option<Pin<Box<Sleep>>>,
    period: Option<Duration>,
}

impl<S> WsStream<S> {
    fn new(inner: WebSocketStream<S>, keepalive: Option<Duration>, client: bool) -> Self {
        let period = keepalive.filter(|p| !p.is_zero());
        let (ping_interval, deadline) = match (period, client) {
            (Some(p), true) => (
                Some(tokio::time::interval(p)),
                Some(Box::pin(tokio::time::sleep(p * 2))),
            ),
            _ => (None, None),
        };
        Self {
            inner,
            read_buf: Vec::new(),
            read_pos: 0,
            closed: false,
            ping_interval,
            ping_pending: false,
            deadline,
            period: if client { period } else { None },
        }
    }

    fn extend_deadline(&mut self) {
        if let (Some(deadline), Some(p)) = (self.deadline.as_mut(), self.period) {
            deadline.as_mut().reset(Instant::now() + p * 2);
        }
    }
}

impl<S> AsyncRead for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = &mut *self;

        // buffered remainder first
        if this.read_pos < this.read_buf.len() {
            let remaining = &this.read_buf[this.read_pos..];
            let to_copy = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..to_copy]);
            this.read_pos += to_copy;
            if this.read_pos >= this.read_buf.len() {
                this.read_buf.clear();
                this.read_pos = 0;
            }
            return Poll::Ready(Ok(()));
        }

        if this.closed {
            return Poll::Ready(Ok(()));
        }

        // keepalive: fire pings and enforce the 2P idle limit
        if let Some(interval) = this.ping_interval.as_mut() {
            if interval.poll_tick(cx).is_ready() {
                this.ping_pending = true;
            }
            if this.ping_pending {
                match Pin::new(&mut this.inner).poll_ready(cx) {
                    Poll::Ready(Ok(())) => {
                        if Pin::new(&mut this.inner)
                            .start_send(Message::Ping(Vec::new()))
                            .is_ok()
                        {
                            debug!("ws: ping sent");
                        }
                        let _ = Pin::new(&mut this.inner).poll_flush(cx);
                        this.ping_pending = false;
                    }
                    Poll::Ready(Err(_)) => this.ping_pending = false,
                    Poll::Pending => {}
                }
            }
        }
        if let Some(deadline) = this.deadline.as_mut() {
            if deadline.as_mut().poll(cx).is_ready() {
                return Poll::Ready(Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "websocket keepalive expired",
                )));
            }
        }

        loop {
            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(msg))) => {
                    this.extend_deadline();
                    let data = match msg {
                        Message::Binary(data) => data,
                        Message::Text(text) => text.into_bytes(),
                        Message::Ping(_) | Message::Pong(_) => continue,
                        Message::Close(_) => {
                            this.closed = true;
                            return Poll::Ready(Ok(()));
                        }
                        Message::Frame(_) => {
                            return Poll::Ready(Err(std::io::Error::new(
                                std::io::ErrorKind::InvalidData,
                                "unexpected raw frame",
                            )));
                        }
                    };

                    let to_copy = data.len().min(buf.remaining());
                    buf.put_slice(&data[..to_copy]);
                    if to_copy < data.len() {
                        this.read_buf = data;
                        this.read_pos = to_copy;
                    }
                    return Poll::Ready(Ok(()));
                }
                Poll::Ready(Some(Err(e))) => {
                    this.closed = true;
                    return Poll::Ready(Err(std::io::Error::other(e.to_string())));
                }
                Poll::Ready(None) => {
                    this.closed = true;
                    return Poll::Ready(Ok(()));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<S> AsyncWrite for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        if self.closed {
            return Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "websocket closed",
            )));
        }

        match Pin::new(&mut self.inner).poll_ready(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => {
                self.closed = true;
                return Poll::Ready(Err(std::io::Error::other(e.to_string())));
            }
            Poll::Pending => return Poll::Pending,
        }

        match Pin::new(&mut self.inner).start_send(Message::Binary(buf.to_vec())) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(e) => {
                self.closed = true;
                Poll::Ready(Err(std::io::Error::other(e.to_string())))
            }
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        if self.closed {
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner)
            .poll_flush(cx)
            .map_err(|e| std::io::Error::other(e.to_string()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        // no half-close in websocket; flush and let drop close the socket
        if self.closed {
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner)
            .poll_flush(cx)
            .map_err(|e| std::io::Error::other(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn upgrade_and_relay_bytes() {
        let config = WsConfig::default();
        let listener = WsListener::bind(&"127.0.0.1:0".parse().unwrap(), config.clone(), None)
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let dialer = WsDialer::new(config);
        let client = tokio::spawn(async move {
            let conn = dialer.dial(&addr).await.unwrap();
            dialer.handshake(conn, &addr).await.unwrap()
        });

        let mut accepted = listener.accept().await.unwrap();
        let mut dialed = client.await.unwrap();

        dialed.stream.write_all(b"over-ws").await.unwrap();
        dialed.stream.flush().await.unwrap();
        let mut buf = [0u8; 7];
        accepted.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"over-ws");
    }

    #[tokio::test]
    async fn wrong_path_is_rejected() {
        let listener = WsListener::bind(
            &"127.0.0.1:0".parse().unwrap(),
            WsConfig {
                path: "/tunnel".into(),
                ..Default::default()
            },
            None,
        )
        .await
        .unwrap();
        let addr = listener.local_addr().unwrap();

        let dialer = WsDialer::new(WsConfig {
            path: "/other".into(),
            ..Default::default()
        });
        let conn = dialer.dial(&addr).await.unwrap();
        assert!(dialer.handshake(conn, &addr).await.is_err());
    }
}
