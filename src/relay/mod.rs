//! Bidirectional relays
//!
//! The stream relay joins two duplex streams; the UDP relay (in
//! [`udp`]) joins two packet endpoints.

pub mod udp;

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::Result;
use crate::metrics::{TRAFFIC_BYTES_DOWNLOADED, TRAFFIC_BYTES_UPLOADED};

/// Relay buffer size (32KB)
const RELAY_BUFFER_SIZE: usize = 32 * 1024;

/// Stream relay between a client connection and an upstream connection.
pub struct Relay {
    service: String,
    idle_timeout: Option<Duration>,
}

impl Relay {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            idle_timeout: None,
        }
    }

    /// Tear the relay down when neither direction moves bytes for `idle`.
    pub fn with_idle_timeout(mut self, idle: Option<Duration>) -> Self {
        self.idle_timeout = idle;
        self
    }

    /// Copy in both directions until either side closes or fails.
    ///
    /// EOF is normal termination: the opposite write half is shut down and
    /// the other direction is allowed to drain. Returns bytes copied
    /// (client→upstream, upstream→client).
    pub async fn run<A, B>(&self, client: A, upstream: B) -> Result<(u64, u64)>
    where
        A: AsyncRead + AsyncWrite + Unpin + Send,
        B: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (mut client_r, mut client_w) = tokio::io::split(client);
        let (mut upstream_r, mut upstream_w) = tokio::io::split(upstream);

        let idle = self.idle_timeout;
        let service = self.service.clone();

        let upload = async {
            let n = copy_one_way(&mut client_r, &mut upstream_w, idle, |n| {
                TRAFFIC_BYTES_UPLOADED
                    .with_label_values(&[&service])
                    .inc_by(n);
            })
            .await;
            let _ = upstream_w.shutdown().await;
            n
        };

        let service = self.service.clone();
        let download = async {
            let n = copy_one_way(&mut upstream_r, &mut client_w, idle, |n| {
                TRAFFIC_BYTES_DOWNLOADED
                    .with_label_values(&[&service])
                    .inc_by(n);
            })
            .await;
            let _ = client_w.shutdown().await;
            n
        };

        let (up, down) = tokio::join!(upload, download);
        Ok((up, down))
    }
}

async fn copy_one_way<R, W>(
    reader: &mut R,
    writer: &mut W,
    idle: Option<Duration>,
    mut on_bytes: impl FnMut(u64),
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut total: u64 = 0;

    loop {
        let read = async { reader.read(&mut buf).await };
        let n = match idle {
            Some(d) => match tokio::time::timeout(d, read).await {
                Ok(r) => r,
                Err(_) => break,
            },
            None => read.await,
        };
        let n = match n {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };

        if writer.write_all(&buf[..n]).await.is_err() {
            break;
        }
        if writer.flush().await.is_err() {
            break;
        }

        total += n as u64;
        on_bytes(n as u64);
    }

    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn relays_both_directions_and_counts_bytes() {
        let (client, client_remote) = tokio::io::duplex(256);
        let (upstream, upstream_remote) = tokio::io::duplex(256);

        let relay = tokio::spawn(async move {
            Relay::new("test").run(client_remote, upstream_remote).await
        });

        let (mut client, mut upstream) = (client, upstream);
        client.write_all(b"hello upstream").await.unwrap();
        client.shutdown().await.unwrap();

        let mut got = Vec::new();
        upstream.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"hello upstream");

        upstream.write_all(b"hi").await.unwrap();
        upstream.shutdown().await.unwrap();

        let mut back = Vec::new();
        client.read_to_end(&mut back).await.unwrap();
        assert_eq!(back, b"hi");

        let (up, down) = relay.await.unwrap().unwrap();
        assert_eq!(up, 14);
        assert_eq!(down, 2);
    }

    #[tokio::test]
    async fn idle_timeout_tears_down() {
        let (client, client_remote) = tokio::io::duplex(64);
        let (_upstream, upstream_remote) = tokio::io::duplex(64);

        let relay = Relay::new("test").with_idle_timeout(Some(Duration::from_millis(50)));
        let handle = tokio::spawn(async move { relay.run(client_remote, upstream_remote).await });

        // neither side sends anything; the relay must end on its own
        let (up, down) = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!((up, down), (0, 0));
        drop(client);
    }
}
