//! UDP transport
//!
//! A connected UDP socket presented as a stream. Reads and writes map
//! one-to-one onto datagrams up to the MTU; no ordering guarantees are
//! surfaced.

use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::UdpSocket;

use crate::common::{Address, Conn};
use crate::error::Result;

use super::{resolve, Dialer};

/// Dialer yielding a connected UDP socket as a stream
#[derive(Default)]
pub struct UdpDialer;

impl UdpDialer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Dialer for UdpDialer {
    async fn dial(&self, addr: &Address) -> Result<Conn> {
        let peer = resolve(addr).await?;
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(peer).await?;
        let local = Address::Socket(socket.local_addr()?);
        Ok(Conn::new(
            Box::new(UdpStream::new(socket)),
            local,
            Address::Socket(peer),
        ))
    }
}

/// Connected UDP socket as AsyncRead + AsyncWrite
pub struct UdpStream {
    socket: UdpSocket,
    read_buf: Vec<u8>,
    read_pos: usize,
    read_len: usize,
}

impl UdpStream {
    pub fn new(socket: UdpSocket) -> Self {
        Self {
            socket,
            read_buf: vec![0u8; 65535],
            read_pos: 0,
            read_len: 0,
        }
    }
}

impl AsyncRead for UdpStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        // leftover from a datagram larger than the caller's buffer
        if self.read_pos < self.read_len {
            let remaining = self.read_len - self.read_pos;
            let to_copy = remaining.min(buf.remaining());
            let start = self.read_pos;
            buf.put_slice(&self.read_buf[start..start + to_copy]);
            self.read_pos += to_copy;
            return Poll::Ready(Ok(()));
        }

        let this = self.get_mut();
        let mut recv_buf = ReadBuf::new(&mut this.read_buf);
        match this.socket.poll_recv(cx, &mut recv_buf) {
            Poll::Ready(Ok(())) => {
                this.read_len = recv_buf.filled().len();
                this.read_pos = 0;

                let to_copy = this.read_len.min(buf.remaining());
                buf.put_slice(&this.read_buf[..to_copy]);
                this.read_pos = to_copy;

                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for UdpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.socket.poll_send(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn stream_io_preserves_datagram_boundaries() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        let conn = UdpDialer::new()
            .dial(&Address::Socket(server_addr))
            .await
            .unwrap();
        let mut stream = conn.stream;

        stream.write_all(b"datagram-one").await.unwrap();
        let mut buf = [0u8; 64];
        let (n, peer) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"datagram-one");

        server.send_to(b"reply", peer).await.unwrap();
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"reply");
    }
}
