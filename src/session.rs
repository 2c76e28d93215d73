//! Session cache (L2)
//!
//! Per-address reuse of a multiplexed transport. One async mutex guards
//! the whole map and is held through session creation, so exactly one
//! init runs per (address, lifetime) and eviction always happens under
//! the same lock that created the entry. The trade-off — a slow
//! handshake briefly blocks dials to other addresses — is acceptable at
//! proxy-hop fan-out, where each process talks to few upstreams.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::common::Stream;
use crate::error::Result;

/// A reusable multiplexed transport bound to one remote address.
#[async_trait]
pub trait Session: Send + Sync {
    /// Open a new logical stream on the session.
    async fn open_stream(&self) -> Result<Stream>;

    fn is_closed(&self) -> bool;

    async fn close(&self);
}

pub struct SessionCache<S> {
    sessions: Mutex<HashMap<String, Arc<S>>>,
}

impl<S> Default for SessionCache<S> {
    fn default() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }
}

impl<S: Session> SessionCache<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the live session for `addr`, creating it with `init` on miss.
    /// A cached session observed closed is evicted and replaced.
    pub async fn get_or_init<F, Fut>(&self, addr: &str, init: F) -> Result<Arc<S>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<S>>,
    {
        let mut sessions = self.sessions.lock().await;

        if let Some(session) = sessions.get(addr) {
            if !session.is_closed() {
                return Ok(session.clone());
            }
            debug!("session for {} is dead, evicting", addr);
            sessions.remove(addr);
        }

        let session = Arc::new(init().await?);
        sessions.insert(addr.to_string(), session.clone());
        Ok(session)
    }

    /// Open a logical stream, evicting and closing the session on failure.
    pub async fn open_stream<F, Fut>(&self, addr: &str, init: F) -> Result<Stream>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<S>>,
    {
        let session = self.get_or_init(addr, init).await?;
        match session.open_stream().await {
            Ok(stream) => Ok(stream),
            Err(e) => {
                self.evict(addr).await;
                session.close().await;
                Err(e)
            }
        }
    }

    pub async fn evict(&self, addr: &str) {
        self.sessions.lock().await.remove(addr);
    }

    pub async fn close_all(&self) {
        let sessions: Vec<Arc<S>> = self.sessions.lock().await.drain().map(|(_, s)| s).collect();
        for s in sessions {
            s.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FakeSession {
        id: usize,
        closed: AtomicBool,
        fail_open: bool,
    }

    #[async_trait]
    impl Session for FakeSession {
        async fn open_stream(&self) -> Result<Stream> {
            if self.fail_open {
                return Err(crate::error::Error::SessionDead);
            }
            Ok(crate::common::empty_stream())
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn one_session_per_address_under_concurrency() {
        let cache = Arc::new(SessionCache::<FakeSession>::new());
        let inits = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let inits = inits.clone();
            tasks.push(tokio::spawn(async move {
                cache
                    .get_or_init("upstream:443", || async {
                        let id = inits.fetch_add(1, Ordering::SeqCst);
                        Ok(FakeSession {
                            id,
                            closed: AtomicBool::new(false),
                            fail_open: false,
                        })
                    })
                    .await
                    .unwrap()
            }));
        }

        let sessions: Vec<_> = futures_util::future::join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(inits.load(Ordering::SeqCst), 1);
        assert!(sessions.windows(2).all(|w| w[0].id == w[1].id));
    }

    #[tokio::test]
    async fn closed_session_is_evicted_and_rebuilt() {
        let cache = SessionCache::<FakeSession>::new();

        let first = cache
            .get_or_init("a:1", || async {
                Ok(FakeSession {
                    id: 1,
                    closed: AtomicBool::new(false),
                    fail_open: false,
                })
            })
            .await
            .unwrap();
        first.close().await;

        let second = cache
            .get_or_init("a:1", || async {
                Ok(FakeSession {
                    id: 2,
                    closed: AtomicBool::new(false),
                    fail_open: false,
                })
            })
            .await
            .unwrap();
        assert_eq!(second.id, 2);
    }

    #[tokio::test]
    async fn open_error_forces_eviction() {
        let cache = SessionCache::<FakeSession>::new();
        let mk = |id, fail_open| async move {
            Ok(FakeSession {
                id,
                closed: AtomicBool::new(false),
                fail_open,
            })
        };

        assert!(cache.open_stream("b:2", || mk(1, true)).await.is_err());
        // the failing session must be gone; a fresh one is built
        let s = cache.get_or_init("b:2", || mk(2, false)).await.unwrap();
        assert_eq!(s.id, 2);
    }
}
