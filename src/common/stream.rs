//! Stream abstraction
//!
//! Unified duplex byte stream for all layers to operate on. Transports,
//! connectors and handlers only ever see `Stream`, never a concrete socket.

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::envelope::Envelope;
use super::Address;

/// The core stream type used throughout the engine.
pub type Stream = Box<dyn AsyncReadWrite + Unpin + Send>;

/// Combined trait for async read + write
pub trait AsyncReadWrite: AsyncRead + AsyncWrite {}

impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}

/// Trait for types that can be converted into a Stream
pub trait IntoStream {
    fn into_stream(self) -> Stream;
}

impl<T> IntoStream for T
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn into_stream(self) -> Stream {
        Box::new(self)
    }
}

/// A connection: a stream plus its addresses and metadata envelope.
///
/// Listeners produce these and dialers return them; the envelope carries
/// transport-specific context (interface config, SSH handles) that selected
/// connectors and handlers query by type.
pub struct Conn {
    pub stream: Stream,
    pub local: Address,
    pub peer: Address,
    pub envelope: Envelope,
}

impl Conn {
    pub fn new(stream: Stream, local: Address, peer: Address) -> Self {
        Self {
            stream,
            local,
            peer,
            envelope: Envelope::default(),
        }
    }

    pub fn with_envelope(mut self, envelope: Envelope) -> Self {
        self.envelope = envelope;
        self
    }
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("local", &self.local)
            .field("peer", &self.peer)
            .finish()
    }
}

/// A wrapper that combines separate read and write halves into a single stream
pub struct CombinedStream<R, W> {
    reader: R,
    writer: W,
}

impl<R, W> CombinedStream<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }
}

impl<R, W> AsyncRead for CombinedStream<R, W>
where
    R: AsyncRead + Unpin,
    W: Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

impl<R, W> AsyncWrite for CombinedStream<R, W>
where
    R: Unpin,
    W: AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.writer).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.writer).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.writer).poll_shutdown(cx)
    }
}

/// Stream that is instantly at EOF and swallows writes.
///
/// Placeholder for connections whose payload travels out of band (e.g. an
/// SSH client handle in the envelope).
pub fn empty_stream() -> Stream {
    Box::new(CombinedStream::new(tokio::io::empty(), tokio::io::sink()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn combined_stream_halves_are_independent() {
        let (client, mut server) = tokio::io::duplex(64);
        let (r, w) = tokio::io::split(client);
        let mut combined = CombinedStream::new(r, w);

        combined.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server.write_all(b"pong").await.unwrap();
        combined.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn empty_stream_is_eof() {
        let mut s = empty_stream();
        let mut buf = [0u8; 8];
        assert_eq!(s.read(&mut buf).await.unwrap(), 0);
        assert_eq!(s.write(b"dropped").await.unwrap(), 7);
    }
}
