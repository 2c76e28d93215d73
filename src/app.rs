//! Runtime assembly
//!
//! Builds chains and services from configuration through the
//! registries, runs them, and tears everything down on Ctrl-C.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::capability::{Auther, StaticAuther};
use crate::common::Address;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::registry::{
    build_connector, build_dialer, build_handler, build_listener, register_defaults,
    ConnectorContext, DialerContext, HandlerContext, ListenerContext,
};
use crate::router::{Node, Router};
use crate::service::Service;
use crate::transport::wrapper::{self, WrapOptions};

pub struct Runtime {
    services: Vec<Arc<Service>>,
    shutdown_tx: broadcast::Sender<()>,
    api_listen: Option<SocketAddr>,
}

impl Runtime {
    /// Build every chain and service described by the configuration.
    pub async fn from_config(config: Config) -> Result<Self> {
        // one crypto provider for every rustls consumer (tls, quic)
        let _ = tokio_rustls::rustls::crypto::ring::default_provider().install_default();
        crate::metrics::init_metrics();
        register_defaults();

        let (shutdown_tx, _) = broadcast::channel(1);

        // chains first: services reference them by name
        let mut routers: HashMap<String, Arc<Router>> = HashMap::new();
        for chain in &config.chains {
            let mut nodes = Vec::with_capacity(chain.hops.len());
            for hop in &chain.hops {
                let addr: Address = hop.addr.parse()?;
                let dialer = build_dialer(&DialerContext {
                    config: hop.dialer.clone(),
                })?;
                let connector = build_connector(&ConnectorContext {
                    config: hop.connector.clone(),
                })?;
                nodes.push(Node {
                    name: hop.name.clone(),
                    addr,
                    dialer,
                    connector,
                });
            }
            routers.insert(chain.name.clone(), Arc::new(Router::new(nodes)));
        }

        let mut services = Vec::with_capacity(config.services.len());
        for svc in &config.services {
            let addr: Address = svc.addr.parse()?;

            let router = match &svc.chain {
                Some(name) => routers
                    .get(name)
                    .cloned()
                    .ok_or_else(|| Error::Config(format!("unknown chain: {}", name)))?,
                None => Arc::new(Router::direct()),
            };

            let auther: Option<Arc<dyn Auther>> = svc.handler.auth.as_ref().map(|a| {
                Arc::new(StaticAuther::new(&a.username, &a.password)) as Arc<dyn Auther>
            });

            let listener = build_listener(ListenerContext {
                service: svc.name.clone(),
                addr: addr.clone(),
                config: svc.listener.clone(),
                auther,
            })
            .await?;
            let listener = wrapper::wrap(&svc.name, listener, WrapOptions::default());

            let forward = match &svc.forward {
                Some(f) => Some(f.parse()?),
                None => None,
            };
            let handler = build_handler(HandlerContext {
                service: svc.name.clone(),
                config: svc.handler.clone(),
                router,
                forward,
            })?;

            services.push(Arc::new(Service::new(&svc.name, listener, handler)));
        }

        let api_listen = match &config.api {
            Some(api) => Some(api.listen.parse().map_err(|_| {
                Error::Config(format!("invalid api listen address: {}", api.listen))
            })?),
            None => None,
        };

        Ok(Self {
            services,
            shutdown_tx,
            api_listen,
        })
    }

    /// Run all services until Ctrl-C.
    pub async fn run(&self) -> Result<()> {
        let mut handles = Vec::new();
        for service in &self.services {
            let service = service.clone();
            let shutdown_rx = self.shutdown_tx.subscribe();
            handles.push(tokio::spawn(async move {
                if let Err(e) = service.serve(shutdown_rx).await {
                    error!("[{}] {}", service.name(), e);
                }
            }));
        }
        info!("runtime started with {} services", self.services.len());

        let api_handle = self.api_listen.map(|addr| {
            let shutdown_rx = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                if let Err(e) = serve_api(addr, shutdown_rx).await {
                    warn!("stats api: {}", e);
                }
            })
        });

        tokio::signal::ctrl_c().await?;
        info!("shutting down...");
        let _ = self.shutdown_tx.send(());

        for handle in handles {
            let _ = handle.await;
        }
        if let Some(handle) = api_handle {
            let _ = handle.await;
        }
        Ok(())
    }
}

/// Prometheus endpoint for scrapers.
async fn serve_api(addr: SocketAddr, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
    let app = axum::Router::new().route(
        "/metrics",
        axum::routing::get(|| async { crate::metrics::gather() }),
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("stats api on http://{}/metrics", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await
        .map_err(|e| Error::Resource(format!("stats api: {}", e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[tokio::test]
    async fn builds_runtime_from_default_configs() {
        let mut config = Config::default_client();
        // bind on an ephemeral port so tests never collide
        config.services[0].addr = "127.0.0.1:0".to_string();
        let runtime = Runtime::from_config(config).await.unwrap();
        assert_eq!(runtime.services.len(), 1);
    }

    #[tokio::test]
    async fn unknown_chain_is_rejected() {
        let mut config = Config::default_client();
        config.services[0].addr = "127.0.0.1:0".to_string();
        config.services[0].chain = Some("missing".to_string());
        assert!(matches!(
            Runtime::from_config(config).await,
            Err(Error::Config(_))
        ));
    }
}
