//! Listener wrapper chain
//!
//! Every service listener is wrapped in a fixed order, outermost last:
//! metrics → admission → traffic limiter → connection limiter. Wrappers
//! may drop or reshape accepted connections but never change accept/close
//! semantics.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

use crate::capability::{Admission, ConnLimiter, TrafficLimiter};
use crate::common::{Address, Conn, Stream};
use crate::error::Result;
use crate::metrics::{SERVICE_CONNECTIONS_ACTIVE, SERVICE_CONNECTIONS_TOTAL};

use super::Listener;

/// Capabilities applied to a service's listener.
#[derive(Clone, Default)]
pub struct WrapOptions {
    pub admission: Option<Arc<dyn Admission>>,
    pub traffic_limiter: Option<Arc<dyn TrafficLimiter>>,
    pub conn_limiter: Option<Arc<dyn ConnLimiter>>,
}

pub struct WrappedListener {
    service: String,
    inner: Box<dyn Listener>,
    options: WrapOptions,
}

/// Wrap a listener for `service`. With empty options only metrics apply.
pub fn wrap(service: &str, inner: Box<dyn Listener>, options: WrapOptions) -> Box<dyn Listener> {
    Box::new(WrappedListener {
        service: service.to_string(),
        inner,
        options,
    })
}

#[async_trait]
impl Listener for WrappedListener {
    async fn accept(&self) -> Result<Conn> {
        loop {
            let mut conn = self.inner.accept().await?;

            SERVICE_CONNECTIONS_TOTAL
                .with_label_values(&[&self.service])
                .inc();

            if let Some(admission) = &self.options.admission {
                let admitted = match &conn.peer {
                    Address::Socket(sa) => admission.admit(sa.ip()),
                    Address::Domain(_, _) => true,
                };
                if !admitted {
                    debug!("[{}] {} refused by admission", self.service, conn.peer);
                    continue;
                }
            }

            if let Some(limiter) = &self.options.traffic_limiter {
                conn.stream = limiter.wrap(conn.stream);
            }

            if let Some(limiter) = &self.options.conn_limiter {
                match limiter.acquire() {
                    Some(guard) => {
                        conn.stream = Box::new(TrackedStream {
                            inner: conn.stream,
                            service: self.service.clone(),
                            _guard: Some(guard),
                        });
                        SERVICE_CONNECTIONS_ACTIVE
                            .with_label_values(&[&self.service])
                            .inc();
                        return Ok(conn);
                    }
                    None => {
                        debug!("[{}] {} over connection limit", self.service, conn.peer);
                        continue;
                    }
                }
            }

            conn.stream = Box::new(TrackedStream {
                inner: conn.stream,
                service: self.service.clone(),
                _guard: None,
            });
            SERVICE_CONNECTIONS_ACTIVE
                .with_label_values(&[&self.service])
                .inc();
            return Ok(conn);
        }
    }

    fn local_addr(&self) -> Result<Address> {
        self.inner.local_addr()
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

/// Stream that owns the connection-limiter guard and maintains the
/// active-connection gauge.
struct TrackedStream {
    inner: Stream,
    service: String,
    _guard: Option<Box<dyn Send>>,
}

impl Drop for TrackedStream {
    fn drop(&mut self) {
        SERVICE_CONNECTIONS_ACTIVE
            .with_label_values(&[&self.service])
            .dec();
    }
}

impl AsyncRead for TrackedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TrackedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{TcpDialer, TcpListener};
    use std::net::IpAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use crate::transport::Dialer;

    struct DenyAll;

    impl Admission for DenyAll {
        fn admit(&self, _addr: IpAddr) -> bool {
            false
        }
    }

    struct CountedLimit {
        used: AtomicUsize,
        max: usize,
    }

    impl ConnLimiter for CountedLimit {
        fn acquire(&self) -> Option<Box<dyn Send>> {
            if self.used.fetch_add(1, Ordering::SeqCst) < self.max {
                Some(Box::new(()))
            } else {
                None
            }
        }
    }

    #[tokio::test]
    async fn admission_drops_refused_peers() {
        let inner = TcpListener::bind(&"127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = inner.local_addr().unwrap();
        let listener = wrap(
            "deny",
            Box::new(inner),
            WrapOptions {
                admission: Some(Arc::new(DenyAll)),
                ..Default::default()
            },
        );

        let _c1 = TcpDialer::new().dial(&addr).await.unwrap();
        // the refused connection never surfaces; accept stays pending
        let res =
            tokio::time::timeout(std::time::Duration::from_millis(100), listener.accept()).await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn conn_limit_drops_excess() {
        let inner = TcpListener::bind(&"127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = inner.local_addr().unwrap();
        let listener = wrap(
            "limited",
            Box::new(inner),
            WrapOptions {
                conn_limiter: Some(Arc::new(CountedLimit {
                    used: AtomicUsize::new(0),
                    max: 1,
                })),
                ..Default::default()
            },
        );

        let _c1 = TcpDialer::new().dial(&addr).await.unwrap();
        let _c2 = TcpDialer::new().dial(&addr).await.unwrap();

        // first one passes, second is dropped by the limiter
        let first = listener.accept().await.unwrap();
        drop(first);
        let res =
            tokio::time::timeout(std::time::Duration::from_millis(100), listener.accept()).await;
        assert!(res.is_err());
    }
}
