//! Stream multiplexing over a single connection
//!
//! yamux sessions shared by the KCP transport (smux-equivalent) and the
//! SOCKS5 MUX-BIND handler. A background task owns the connection state
//! machine; stream opens go through a command channel so callers never
//! touch the yamux connection concurrently.

use std::task::Poll;

use futures_util::future::poll_fn;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::compat::{FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use tracing::debug;
use yamux::{Config, Connection, Mode};

use crate::common::Stream;
use crate::error::{Error, Result};

/// Streams a mux client may queue while the driver is busy.
const OPEN_QUEUE: usize = 64;

fn config(max_streams: usize) -> Config {
    let mut cfg = Config::default();
    if max_streams > 0 {
        cfg.set_max_num_streams(max_streams);
    }
    cfg
}

enum Cmd {
    Open(oneshot::Sender<Result<yamux::Stream>>),
}

/// Client side of a multiplexed session: opens logical streams, drops
/// inbound ones.
pub struct MuxClient {
    cmd_tx: mpsc::Sender<Cmd>,
    closed_rx: watch::Receiver<bool>,
}

impl MuxClient {
    pub fn new(stream: Stream, max_streams: usize) -> Self {
        let conn = Connection::new(stream.compat(), config(max_streams), Mode::Client);
        let (cmd_tx, cmd_rx) = mpsc::channel(OPEN_QUEUE);
        let (closed_tx, closed_rx) = watch::channel(false);
        tokio::spawn(drive_client(conn, cmd_rx, closed_tx));
        Self { cmd_tx, closed_rx }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    pub async fn open_stream(&self) -> Result<Stream> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Cmd::Open(tx))
            .await
            .map_err(|_| Error::SessionDead)?;
        let stream = rx.await.map_err(|_| Error::SessionDead)??;
        Ok(Box::new(stream.compat()))
    }
}

async fn drive_client(
    mut conn: Connection<tokio_util::compat::Compat<Stream>>,
    mut cmd_rx: mpsc::Receiver<Cmd>,
    closed_tx: watch::Sender<bool>,
) {
    let mut pending: Option<oneshot::Sender<Result<yamux::Stream>>> = None;

    poll_fn(|cx| -> Poll<()> {
        loop {
            if pending.is_none() {
                match cmd_rx.poll_recv(cx) {
                    Poll::Ready(Some(Cmd::Open(tx))) => pending = Some(tx),
                    // all handles dropped: session owner is gone
                    Poll::Ready(None) => return Poll::Ready(()),
                    Poll::Pending => {}
                }
            }

            if pending.is_some() {
                match conn.poll_new_outbound(cx) {
                    Poll::Ready(Ok(stream)) => {
                        let _ = pending.take().unwrap().send(Ok(stream));
                        continue;
                    }
                    Poll::Ready(Err(e)) => {
                        let _ = pending
                            .take()
                            .unwrap()
                            .send(Err(Error::Transport(format!("mux: {}", e))));
                        return Poll::Ready(());
                    }
                    Poll::Pending => {}
                }
            }

            // drive the connection; inbound streams are not served here
            match conn.poll_next_inbound(cx) {
                Poll::Ready(Some(Ok(stream))) => {
                    debug!("mux: dropping unsolicited inbound stream");
                    drop(stream);
                    continue;
                }
                Poll::Ready(Some(Err(e))) => {
                    debug!("mux: session error: {}", e);
                    return Poll::Ready(());
                }
                Poll::Ready(None) => return Poll::Ready(()),
                Poll::Pending => return Poll::Pending,
            }
        }
    })
    .await;

    let _ = closed_tx.send(true);
}

/// Serve the accept side of a multiplexed session, forwarding each
/// inbound logical stream to `on_stream` until the session ends.
pub async fn serve(stream: Stream, max_streams: usize, mut on_stream: impl FnMut(Stream)) {
    let mut conn = Connection::new(stream.compat(), config(max_streams), Mode::Server);
    loop {
        let next = poll_fn(|cx| conn.poll_next_inbound(cx)).await;
        match next {
            Some(Ok(stream)) => on_stream(Box::new(stream.compat())),
            Some(Err(e)) => {
                debug!("mux: accept stream: {}", e);
                break;
            }
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn open_stream_reaches_server_side() {
        let (a, b) = tokio::io::duplex(4096);

        let (tx, mut rx) = mpsc::channel::<Stream>(4);
        tokio::spawn(async move {
            serve(Box::new(b), 0, move |s| {
                let _ = tx.try_send(s);
            })
            .await;
        });

        let client = MuxClient::new(Box::new(a), 0);
        let mut s1 = client.open_stream().await.unwrap();
        s1.write_all(b"first").await.unwrap();
        s1.flush().await.unwrap();

        let mut accepted = rx.recv().await.unwrap();
        let mut buf = [0u8; 5];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"first");

        // a second logical stream over the same connection
        let mut s2 = client.open_stream().await.unwrap();
        s2.write_all(b"second").await.unwrap();
        s2.flush().await.unwrap();
        let mut accepted2 = rx.recv().await.unwrap();
        let mut buf = [0u8; 6];
        accepted2.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"second");

        assert!(!client.is_closed());
    }
}
