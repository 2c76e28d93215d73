//! UDP relay
//!
//! Two packet loops between a client-side datagram endpoint and an
//! upstream datagram endpoint. Destinations matching the bypass
//! predicate are dropped silently.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::capability::Bypass;
use crate::common::{Address, Datagram};
use crate::error::Result;

pub const DEFAULT_BUFFER_SIZE: usize = 4096;

pub struct UdpRelay {
    client: Arc<dyn Datagram>,
    upstream: Arc<dyn Datagram>,
    bypass: Option<Arc<dyn Bypass>>,
    buffer_size: usize,
}

impl UdpRelay {
    pub fn new(client: Arc<dyn Datagram>, upstream: Arc<dyn Datagram>) -> Self {
        Self {
            client,
            upstream,
            bypass: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }

    pub fn with_bypass(mut self, bypass: Option<Arc<dyn Bypass>>) -> Self {
        self.bypass = bypass;
        self
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        if size > 0 {
            self.buffer_size = size;
        }
        self
    }

    fn bypassed(&self, addr: &Address) -> bool {
        match &self.bypass {
            Some(b) => b.contains(&addr.to_string()),
            None => false,
        }
    }

    /// Run both directions until either endpoint fails.
    ///
    /// Packets larger than the buffer are truncated by the endpoints;
    /// the loops never desync.
    pub async fn run(&self) -> Result<()> {
        let c2u = async {
            let mut buf = vec![0u8; self.buffer_size];
            loop {
                let (n, target) = self.client.recv_from(&mut buf).await?;
                if self.bypassed(&target) {
                    trace!("bypass {}", target);
                    continue;
                }
                self.upstream.send_to(&buf[..n], &target).await?;
                trace!("{} bytes -> {}", n, target);
            }
            #[allow(unreachable_code)]
            Ok::<(), crate::error::Error>(())
        };

        let u2c = async {
            let mut buf = vec![0u8; self.buffer_size];
            loop {
                let (n, from) = self.upstream.recv_from(&mut buf).await?;
                if self.bypassed(&from) {
                    trace!("bypass {}", from);
                    continue;
                }
                self.client.send_to(&buf[..n], &from).await?;
                trace!("{} bytes <- {}", n, from);
            }
            #[allow(unreachable_code)]
            Ok::<(), crate::error::Error>(())
        };

        let res = tokio::select! {
            r = c2u => r,
            r = u2c => r,
        };
        if let Err(e) = &res {
            debug!("udp relay done: {}", e);
        }
        let _ = self.client.close().await;
        let _ = self.upstream.close().await;
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::net::SocketAddr;
    use tokio::sync::Mutex;

    /// In-memory datagram endpoint fed by a queue, recording sends.
    ///
    /// When the queue runs dry the endpoint either fails like a dead
    /// socket (driving side) or blocks forever (passive side), so the
    /// relay's select loop ends deterministically.
    struct FakeDatagram {
        incoming: Mutex<VecDeque<(Vec<u8>, Address)>>,
        sent: Mutex<Vec<(Vec<u8>, Address)>>,
        hang_when_empty: bool,
    }

    impl FakeDatagram {
        fn new(incoming: Vec<(Vec<u8>, Address)>, hang_when_empty: bool) -> Arc<Self> {
            Arc::new(Self {
                incoming: Mutex::new(incoming.into()),
                sent: Mutex::new(Vec::new()),
                hang_when_empty,
            })
        }
    }

    #[async_trait]
    impl Datagram for FakeDatagram {
        async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, Address)> {
            let next = self.incoming.lock().await.pop_front();
            match next {
                Some((data, addr)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    Ok((n, addr))
                }
                None if self.hang_when_empty => futures_util::future::pending().await,
                None => Err(crate::error::Error::Closed),
            }
        }

        async fn send_to(&self, buf: &[u8], addr: &Address) -> Result<usize> {
            self.sent.lock().await.push((buf.to_vec(), addr.clone()));
            Ok(buf.len())
        }

        fn local_addr(&self) -> Option<SocketAddr> {
            None
        }
    }

    #[tokio::test]
    async fn forwards_and_applies_bypass() {
        let target: Address = "8.8.8.8:53".parse().unwrap();
        let blocked: Address = "10.0.0.5:53".parse().unwrap();
        let client = FakeDatagram::new(
            vec![(b"ok".to_vec(), target.clone()), (b"drop-me".to_vec(), blocked)],
            false,
        );
        let upstream = FakeDatagram::new(vec![], true);

        let relay = UdpRelay::new(client.clone(), upstream.clone())
            .with_bypass(Some(Arc::new(|a: &str| a.starts_with("10."))));
        let _ = relay.run().await;

        let sent = upstream.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0], (b"ok".to_vec(), target));
    }

    #[tokio::test]
    async fn oversized_packet_truncates_without_desync() {
        let target: Address = "1.1.1.1:53".parse().unwrap();
        let client = FakeDatagram::new(
            vec![(vec![0xaa; 100], target.clone()), (b"next".to_vec(), target.clone())],
            false,
        );
        let upstream = FakeDatagram::new(vec![], true);

        let relay = UdpRelay::new(client.clone(), upstream.clone()).with_buffer_size(16);
        let _ = relay.run().await;

        let sent = upstream.sent.lock().await;
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0.len(), 16);
        assert_eq!(sent[1].0, b"next".to_vec());
    }
}
