//! Sealed stream
//!
//! Chunked AEAD layer over an inner stream: every chunk travels as
//! `u16be ciphertext-length || ciphertext`, with a per-direction key
//! derived from the passphrase and a counter nonce. Used by transports
//! that key themselves with a shared passphrase.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::common::Stream;
use crate::error::Result;

use super::{derive_key, AeadCipher, CipherKind, NONCE_SIZE, TAG_SIZE};
use super::aead::Aead;

const MAX_CHUNK: usize = 16 * 1024 - TAG_SIZE;

enum ReadState {
    Length { buf: [u8; 2], pos: usize },
    Ciphertext { buf: Vec<u8>, pos: usize },
}

pub struct SealedStream {
    inner: Stream,

    seal: AeadCipher,
    seal_nonce: u64,
    pending_write: Vec<u8>,
    write_pos: usize,

    open: AeadCipher,
    open_nonce: u64,
    read_state: ReadState,
    plaintext: Vec<u8>,
    plaintext_pos: usize,
}

impl SealedStream {
    fn new(inner: Stream, write_key: &[u8; 32], read_key: &[u8; 32]) -> Result<Self> {
        Ok(Self {
            inner,
            seal: AeadCipher::new(CipherKind::ChaCha20Poly1305, write_key)?,
            seal_nonce: 0,
            pending_write: Vec::new(),
            write_pos: 0,
            open: AeadCipher::new(CipherKind::ChaCha20Poly1305, read_key)?,
            open_nonce: 0,
            read_state: ReadState::Length {
                buf: [0u8; 2],
                pos: 0,
            },
            plaintext: Vec::new(),
            plaintext_pos: 0,
        })
    }

    /// Dialing side: seals with the client-to-server key.
    pub fn client(inner: Stream, passphrase: &str) -> Result<Self> {
        Self::new(
            inner,
            &derive_key(passphrase, "c2s"),
            &derive_key(passphrase, "s2c"),
        )
    }

    /// Accepting side: seals with the server-to-client key.
    pub fn server(inner: Stream, passphrase: &str) -> Result<Self> {
        Self::new(
            inner,
            &derive_key(passphrase, "s2c"),
            &derive_key(passphrase, "c2s"),
        )
    }

    fn next_nonce(counter: &mut u64) -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[..8].copy_from_slice(&counter.to_le_bytes());
        *counter = counter.wrapping_add(1);
        nonce
    }

    /// Push buffered ciphertext into the inner stream.
    fn drain_pending(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.write_pos < self.pending_write.len() {
            let chunk = &self.pending_write[self.write_pos..];
            match Pin::new(&mut self.inner).poll_write(cx, chunk) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                }
                Poll::Ready(Ok(n)) => self.write_pos += n,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        self.pending_write.clear();
        self.write_pos = 0;
        Poll::Ready(Ok(()))
    }
}

impl AsyncRead for SealedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;

        loop {
            if this.plaintext_pos < this.plaintext.len() {
                let remaining = &this.plaintext[this.plaintext_pos..];
                let to_copy = remaining.len().min(buf.remaining());
                buf.put_slice(&remaining[..to_copy]);
                this.plaintext_pos += to_copy;
                if this.plaintext_pos >= this.plaintext.len() {
                    this.plaintext.clear();
                    this.plaintext_pos = 0;
                }
                return Poll::Ready(Ok(()));
            }

            match &mut this.read_state {
                ReadState::Length { buf: lbuf, pos } => {
                    let mut temp = ReadBuf::new(&mut lbuf[*pos..]);
                    match Pin::new(&mut this.inner).poll_read(cx, &mut temp) {
                        Poll::Ready(Ok(())) => {
                            let n = temp.filled().len();
                            if n == 0 {
                                if *pos == 0 {
                                    // clean EOF at a frame boundary
                                    return Poll::Ready(Ok(()));
                                }
                                return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
                            }
                            *pos += n;
                            if *pos == 2 {
                                let len = u16::from_be_bytes(*lbuf) as usize;
                                if len < TAG_SIZE {
                                    return Poll::Ready(Err(io::Error::new(
                                        io::ErrorKind::InvalidData,
                                        "sealed chunk too short",
                                    )));
                                }
                                this.read_state = ReadState::Ciphertext {
                                    buf: vec![0u8; len],
                                    pos: 0,
                                };
                            }
                        }
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => return Poll::Pending,
                    }
                }
                ReadState::Ciphertext { buf: cbuf, pos } => {
                    let mut temp = ReadBuf::new(&mut cbuf[*pos..]);
                    match Pin::new(&mut this.inner).poll_read(cx, &mut temp) {
                        Poll::Ready(Ok(())) => {
                            let n = temp.filled().len();
                            if n == 0 {
                                return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
                            }
                            *pos += n;
                            if *pos == cbuf.len() {
                                let nonce = Self::next_nonce(&mut this.open_nonce);
                                match this.open.decrypt(&nonce, cbuf, &[]) {
                                    Ok(plain) => {
                                        this.plaintext = plain;
                                        this.plaintext_pos = 0;
                                        this.read_state = ReadState::Length {
                                            buf: [0u8; 2],
                                            pos: 0,
                                        };
                                    }
                                    Err(e) => {
                                        return Poll::Ready(Err(io::Error::new(
                                            io::ErrorKind::InvalidData,
                                            e.to_string(),
                                        )))
                                    }
                                }
                            }
                        }
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => return Poll::Pending,
                    }
                }
            }
        }
    }
}

impl AsyncWrite for SealedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;

        if !this.pending_write.is_empty() {
            match this.drain_pending(cx) {
                Poll::Ready(Ok(())) => {}
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }

        let n = buf.len().min(MAX_CHUNK);
        let nonce = Self::next_nonce(&mut this.seal_nonce);
        let ciphertext = this
            .seal
            .encrypt(&nonce, &buf[..n], &[])
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

        this.pending_write
            .extend_from_slice(&(ciphertext.len() as u16).to_be_bytes());
        this.pending_write.extend_from_slice(&ciphertext);

        // opportunistic drain; leftover goes out on the next write or flush
        let _ = this.drain_pending(cx);
        Poll::Ready(Ok(n))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        match this.drain_pending(cx) {
            Poll::Ready(Ok(())) => Pin::new(&mut this.inner).poll_flush(cx),
            other => other,
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        match this.drain_pending(cx) {
            Poll::Ready(Ok(())) => Pin::new(&mut this.inner).poll_shutdown(cx),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn sealed_roundtrip() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut client = SealedStream::client(Box::new(a), "opensesame").unwrap();
        let mut server = SealedStream::server(Box::new(b), "opensesame").unwrap();

        client.write_all(b"sealed payload").await.unwrap();
        client.flush().await.unwrap();

        let mut buf = [0u8; 14];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"sealed payload");

        server.write_all(b"reply").await.unwrap();
        server.flush().await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"reply");
    }

    #[tokio::test]
    async fn wrong_passphrase_fails_decrypt() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut client = SealedStream::client(Box::new(a), "right").unwrap();
        let mut server = SealedStream::server(Box::new(b), "wrong").unwrap();

        client.write_all(b"sealed").await.unwrap();
        client.flush().await.unwrap();

        let mut buf = [0u8; 6];
        assert!(server.read_exact(&mut buf).await.is_err());
    }

    #[tokio::test]
    async fn large_payload_spans_chunks() {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let mut client = SealedStream::client(Box::new(a), "pw").unwrap();
        let mut server = SealedStream::server(Box::new(b), "pw").unwrap();

        let payload: Vec<u8> = (0..(MAX_CHUNK * 2 + 5)).map(|i| i as u8).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            client.write_all(&payload).await.unwrap();
            client.flush().await.unwrap();
            client
        });

        let mut got = vec![0u8; expected.len()];
        server.read_exact(&mut got).await.unwrap();
        assert_eq!(got, expected);
        drop(writer.await.unwrap());
    }
}
