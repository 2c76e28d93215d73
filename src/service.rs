//! Service: one listener bound to one handler
//!
//! The accept loop owns the listener; every accepted connection runs in
//! its own task and a handler failure never takes the service down.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::common::Conn;
use crate::error::{Error, Result};
use crate::handler::Handler;
use crate::metrics::SERVICE_HANDLER_ERRORS;
use crate::transport::Listener;

pub struct Service {
    name: String,
    listener: Box<dyn Listener>,
    handler: Arc<dyn Handler>,
}

impl Service {
    pub fn new(
        name: impl Into<String>,
        listener: Box<dyn Listener>,
        handler: Arc<dyn Handler>,
    ) -> Self {
        Self {
            name: name.into(),
            listener,
            handler,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the accept loop until shutdown or listener failure.
    pub async fn serve(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        if let Ok(addr) = self.listener.local_addr() {
            info!("[{}] listening on {}", self.name, addr);
        }

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let conn = match accepted {
                        Ok(conn) => conn,
                        Err(e) if e.is_closed() => {
                            info!("[{}] listener closed", self.name);
                            return Ok(());
                        }
                        Err(e) => {
                            error!("[{}] accept: {}", self.name, e);
                            continue;
                        }
                    };
                    debug!("[{}] connection from {}", self.name, conn.peer);
                    self.spawn_handler(conn);
                }
                _ = shutdown.recv() => {
                    info!("[{}] shutting down", self.name);
                    let _ = self.listener.close().await;
                    return Ok(());
                }
            }
        }
    }

    fn spawn_handler(&self, conn: Conn) {
        let handler = self.handler.clone();
        let name = self.name.clone();
        let peer = conn.peer.clone();
        tokio::spawn(async move {
            if let Err(e) = handler.handle(conn).await {
                SERVICE_HANDLER_ERRORS.with_label_values(&[&name]).inc();
                match e {
                    Error::Closed => debug!("[{}] {}: {}", name, peer, e),
                    e => warn!("[{}] {}: {}", name, peer, e),
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TcpListener;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncWriteExt;

    struct CountingHandler(Arc<AtomicUsize>);

    #[async_trait]
    impl Handler for CountingHandler {
        async fn handle(&self, _conn: Conn) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn serves_connections_and_stops_on_shutdown() {
        let listener = TcpListener::bind(&"127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap().as_socket().unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        let service = Service::new(
            "svc-test",
            Box::new(listener),
            Arc::new(CountingHandler(counter.clone())),
        );

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let running = tokio::spawn(async move { service.serve(shutdown_rx).await });

        for _ in 0..3 {
            let mut c = tokio::net::TcpStream::connect(addr).await.unwrap();
            let _ = c.shutdown().await;
        }

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);

        shutdown_tx.send(()).unwrap();
        assert!(running.await.unwrap().is_ok());
    }
}
