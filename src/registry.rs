//! Component registries
//!
//! Process-wide maps from kind names to factories, populated once by
//! [`register_defaults`] during startup and read-only afterwards. The
//! service builder resolves every listener, dialer, connector and
//! handler through these.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Once};

use futures_util::future::BoxFuture;
use parking_lot::RwLock;

use crate::capability::{Auther, Bypass, StaticAuther};
use crate::common::Address;
use crate::config::{
    seconds, parse_tunnel_id, ConnectorConfig, DialerConfig, HandlerConfig, ListenerConfig,
    TlsSettings,
};
use crate::connector::{
    Connector, ForwardConnector, Http2Connector, RelayConnector, Socks5Connector,
    Socks5ConnectorConfig, SshdConnector,
};
use crate::error::{Error, Result};
use crate::handler::{
    Handler, Socks5Config, Socks5Handler, SshdHandler, TapHandler, TunConfig, TunHandler,
};
use crate::router::Router;
use crate::transport::{
    Dialer, H2Config, H2Dialer, H2Listener, IcmpDialer, IcmpListener, KcpConfig, KcpDialer,
    KcpListener, Listener, QuicConfig, QuicDialer, QuicListener, RewriteRule, SshConfig,
    SshDialer, SshListener, SshdListener, TapListener, TcpDialer, TcpListener, TlsConfig,
    TlsDialer, TlsListener, TunListener, TuntapConfig, UdpDialer, WsConfig, WsDialer, WsListener,
    DEFAULT_BACKLOG,
};

pub struct ListenerContext {
    pub service: String,
    pub addr: Address,
    pub config: ListenerConfig,
    pub auther: Option<Arc<dyn Auther>>,
}

pub struct DialerContext {
    pub config: DialerConfig,
}

pub struct ConnectorContext {
    pub config: ConnectorConfig,
}

pub struct HandlerContext {
    pub service: String,
    pub config: HandlerConfig,
    pub router: Arc<Router>,
    pub forward: Option<Address>,
}

pub type ListenerFactory = fn(ListenerContext) -> BoxFuture<'static, Result<Box<dyn Listener>>>;
pub type DialerFactory = fn(&DialerContext) -> Result<Arc<dyn Dialer>>;
pub type ConnectorFactory = fn(&ConnectorContext) -> Result<Arc<dyn Connector>>;
pub type HandlerFactory = fn(HandlerContext) -> Result<Arc<dyn Handler>>;

pub struct Registry<F> {
    entries: RwLock<HashMap<&'static str, F>>,
}

impl<F: Clone> Registry<F> {
    fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, kind: &'static str, factory: F) {
        self.entries.write().insert(kind, factory);
    }

    pub fn get(&self, kind: &str) -> Option<F> {
        self.entries.read().get(kind).cloned()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        let mut kinds: Vec<_> = self.entries.read().keys().copied().collect();
        kinds.sort_unstable();
        kinds
    }
}

pub fn listener_registry() -> &'static Registry<ListenerFactory> {
    static REGISTRY: OnceLock<Registry<ListenerFactory>> = OnceLock::new();
    REGISTRY.get_or_init(Registry::new)
}

pub fn dialer_registry() -> &'static Registry<DialerFactory> {
    static REGISTRY: OnceLock<Registry<DialerFactory>> = OnceLock::new();
    REGISTRY.get_or_init(Registry::new)
}

pub fn connector_registry() -> &'static Registry<ConnectorFactory> {
    static REGISTRY: OnceLock<Registry<ConnectorFactory>> = OnceLock::new();
    REGISTRY.get_or_init(Registry::new)
}

pub fn handler_registry() -> &'static Registry<HandlerFactory> {
    static REGISTRY: OnceLock<Registry<HandlerFactory>> = OnceLock::new();
    REGISTRY.get_or_init(Registry::new)
}

// ============================================================================
// Config mapping helpers
// ============================================================================

fn tls_config(settings: &Option<TlsSettings>) -> TlsConfig {
    match settings {
        Some(t) => TlsConfig {
            server_name: t.server_name.clone(),
            allow_insecure: t.insecure,
            alpn: t.alpn.clone(),
            certificate_file: t.cert_file.clone(),
            key_file: t.key_file.clone(),
        },
        None => TlsConfig::default(),
    }
}

fn ws_config_from_listener(config: &ListenerConfig) -> WsConfig {
    WsConfig {
        path: config.path.clone().unwrap_or_else(|| "/ws".to_string()),
        host: config.host.clone(),
        headers: config.header.clone().into_iter().collect(),
        keepalive: seconds(config.keep_alive),
        backlog: config.backlog.unwrap_or(DEFAULT_BACKLOG),
        ..Default::default()
    }
}

fn ws_config_from_dialer(config: &DialerConfig) -> WsConfig {
    WsConfig {
        path: config.path.clone().unwrap_or_else(|| "/ws".to_string()),
        host: config.host.clone(),
        headers: config.header.clone().into_iter().collect(),
        keepalive: seconds(config.keep_alive),
        ..Default::default()
    }
}

fn h2_config_from_listener(config: &ListenerConfig) -> Result<H2Config> {
    let rewrite = match &config.rewrite {
        Some(r) => Some(RewriteRule {
            target: r.target.parse()?,
            path_prefix: r.path_prefix.clone(),
        }),
        None => None,
    };
    Ok(H2Config {
        path: config.path.clone().unwrap_or_else(|| "/t".to_string()),
        host: config.host.clone(),
        headers: config.header.clone().into_iter().collect(),
        backlog: config.backlog.unwrap_or(DEFAULT_BACKLOG),
        proxy: false,
        rewrite,
    })
}

fn h2_config_from_dialer(config: &DialerConfig, proxy: bool) -> H2Config {
    H2Config {
        path: config.path.clone().unwrap_or_else(|| "/t".to_string()),
        host: config.host.clone(),
        headers: config.header.clone().into_iter().collect(),
        proxy,
        ..Default::default()
    }
}

fn quic_config_from_listener(config: &ListenerConfig) -> QuicConfig {
    let defaults = QuicConfig::default();
    QuicConfig {
        handshake_timeout: seconds(config.handshake_timeout)
            .unwrap_or(defaults.handshake_timeout),
        keep_alive_period: seconds(config.keep_alive).or(defaults.keep_alive_period),
        max_idle_timeout: seconds(config.max_idle_timeout).unwrap_or(defaults.max_idle_timeout),
        max_streams: config.max_streams.unwrap_or(defaults.max_streams),
        backlog: config.backlog.unwrap_or(DEFAULT_BACKLOG),
    }
}

fn quic_config_from_dialer(config: &DialerConfig) -> QuicConfig {
    let defaults = QuicConfig::default();
    QuicConfig {
        handshake_timeout: seconds(config.handshake_timeout)
            .unwrap_or(defaults.handshake_timeout),
        keep_alive_period: seconds(config.keep_alive).or(defaults.keep_alive_period),
        max_idle_timeout: seconds(config.max_idle_timeout).unwrap_or(defaults.max_idle_timeout),
        max_streams: config.max_streams.unwrap_or(defaults.max_streams),
        backlog: DEFAULT_BACKLOG,
    }
}

fn ssh_config_from_listener(config: &ListenerConfig) -> SshConfig {
    SshConfig {
        host_key_file: config.private_key_file.clone(),
        passphrase: config.passphrase.clone(),
        authorized_keys_file: config.authorized_keys.clone(),
        handshake_timeout: seconds(config.handshake_timeout),
        backlog: config.backlog.unwrap_or(DEFAULT_BACKLOG),
        ..Default::default()
    }
}

fn ssh_config_from_dialer(config: &DialerConfig) -> SshConfig {
    SshConfig {
        username: config.username.clone().unwrap_or_default(),
        password: config.password.clone(),
        private_key_file: config.private_key_file.clone(),
        passphrase: config.passphrase.clone(),
        handshake_timeout: seconds(config.handshake_timeout),
        ..Default::default()
    }
}

fn tuntap_config(config: &ListenerConfig) -> TuntapConfig {
    let mut tt = TuntapConfig::tap();
    if let Some(name) = &config.name {
        tt.name = name.clone();
    }
    tt.net = config.net.clone();
    if let Some(mtu) = config.mtu {
        tt.mtu = mtu;
    }
    tt.gateway = config.gw.as_deref().and_then(|gw| gw.parse().ok());
    tt.routes = config.routes.clone();
    tt
}

fn prefix_bypass(prefixes: &[String]) -> Option<Arc<dyn Bypass>> {
    if prefixes.is_empty() {
        return None;
    }
    let prefixes = prefixes.to_vec();
    Some(Arc::new(move |addr: &str| {
        prefixes.iter().any(|p| addr.starts_with(p.as_str()))
    }))
}

// ============================================================================
// Factories
// ============================================================================

fn boxed<L: Listener + 'static>(listener: L) -> Box<dyn Listener> {
    Box::new(listener)
}

fn register_listeners() {
    let registry = listener_registry();

    registry.register("tcp", |ctx| {
        Box::pin(async move { Ok(boxed(TcpListener::bind(&ctx.addr).await?)) })
    });
    registry.register("tls", |ctx| {
        Box::pin(async move {
            Ok(boxed(
                TlsListener::bind(&ctx.addr, tls_config(&ctx.config.tls)).await?,
            ))
        })
    });
    registry.register("ws", |ctx| {
        Box::pin(async move {
            let config = ws_config_from_listener(&ctx.config);
            Ok(boxed(WsListener::bind(&ctx.addr, config, None).await?))
        })
    });
    registry.register("wss", |ctx| {
        Box::pin(async move {
            let config = ws_config_from_listener(&ctx.config);
            let tls = tls_config(&ctx.config.tls);
            Ok(boxed(WsListener::bind(&ctx.addr, config, Some(tls)).await?))
        })
    });
    registry.register("h2", |ctx| {
        Box::pin(async move {
            let config = h2_config_from_listener(&ctx.config)?;
            let tls = tls_config(&ctx.config.tls);
            Ok(boxed(H2Listener::bind(&ctx.addr, config, Some(tls)).await?))
        })
    });
    registry.register("h2c", |ctx| {
        Box::pin(async move {
            let config = h2_config_from_listener(&ctx.config)?;
            Ok(boxed(H2Listener::bind(&ctx.addr, config, None).await?))
        })
    });
    registry.register("quic", |ctx| {
        Box::pin(async move {
            let config = quic_config_from_listener(&ctx.config);
            let tls = tls_config(&ctx.config.tls);
            Ok(boxed(QuicListener::bind(&ctx.addr, config, tls).await?))
        })
    });
    registry.register("http3", |ctx| {
        Box::pin(async move {
            let config = quic_config_from_listener(&ctx.config);
            let tls = tls_config(&ctx.config.tls);
            Ok(boxed(QuicListener::bind(&ctx.addr, config, tls).await?))
        })
    });
    registry.register("icmp", |ctx| {
        Box::pin(async move {
            let config = quic_config_from_listener(&ctx.config);
            let tls = tls_config(&ctx.config.tls);
            Ok(boxed(IcmpListener::bind(&ctx.addr, config, tls).await?))
        })
    });
    registry.register("kcp", |ctx| {
        Box::pin(async move {
            let config = KcpConfig {
                passphrase: ctx.config.passphrase.clone(),
                max_streams: ctx.config.max_streams.unwrap_or(0) as usize,
                backlog: ctx.config.backlog.unwrap_or(DEFAULT_BACKLOG),
            };
            Ok(boxed(KcpListener::bind(&ctx.addr, config).await?))
        })
    });
    registry.register("ssh", |ctx| {
        Box::pin(async move {
            let config = ssh_config_from_listener(&ctx.config);
            Ok(boxed(SshListener::bind(&ctx.addr, config, ctx.auther).await?))
        })
    });
    registry.register("sshd", |ctx| {
        Box::pin(async move {
            let config = ssh_config_from_listener(&ctx.config);
            Ok(boxed(
                SshdListener::bind(&ctx.addr, config, ctx.auther).await?,
            ))
        })
    });
    registry.register("tap", |ctx| {
        Box::pin(async move {
            Ok(boxed(TapListener::new(&ctx.addr, tuntap_config(&ctx.config))))
        })
    });
    registry.register("tun", |ctx| {
        Box::pin(async move {
            Ok(boxed(TunListener::new(&ctx.addr, tuntap_config(&ctx.config))))
        })
    });
}

fn register_dialers() {
    let registry = dialer_registry();

    registry.register("tcp", |_| Ok(Arc::new(TcpDialer::new())));
    registry.register("udp", |_| Ok(Arc::new(UdpDialer::new())));
    registry.register("tls", |ctx| {
        Ok(Arc::new(TlsDialer::new(tls_config(&ctx.config.tls))))
    });
    registry.register("ws", |ctx| {
        Ok(Arc::new(WsDialer::new(ws_config_from_dialer(&ctx.config))))
    });
    registry.register("wss", |ctx| {
        Ok(Arc::new(WsDialer::new_tls(
            ws_config_from_dialer(&ctx.config),
            tls_config(&ctx.config.tls),
        )))
    });
    registry.register("h2", |ctx| {
        Ok(Arc::new(H2Dialer::new_tls(
            h2_config_from_dialer(&ctx.config, false),
            tls_config(&ctx.config.tls),
        )))
    });
    registry.register("h2c", |ctx| {
        Ok(Arc::new(H2Dialer::new(h2_config_from_dialer(
            &ctx.config,
            false,
        ))))
    });
    registry.register("http2", |ctx| {
        Ok(Arc::new(H2Dialer::new_tls(
            h2_config_from_dialer(&ctx.config, true),
            tls_config(&ctx.config.tls),
        )))
    });
    registry.register("quic", |ctx| {
        Ok(Arc::new(QuicDialer::new(
            quic_config_from_dialer(&ctx.config),
            tls_config(&ctx.config.tls),
        )?))
    });
    registry.register("http3", |ctx| {
        Ok(Arc::new(QuicDialer::new(
            quic_config_from_dialer(&ctx.config),
            tls_config(&ctx.config.tls),
        )?))
    });
    registry.register("icmp", |ctx| {
        let mut tls = tls_config(&ctx.config.tls);
        // echo tunnels run on self-provisioned certificates
        if ctx.config.tls.is_none() {
            tls.allow_insecure = true;
        }
        Ok(Arc::new(IcmpDialer::new(
            quic_config_from_dialer(&ctx.config),
            tls,
        )))
    });
    registry.register("kcp", |ctx| {
        Ok(Arc::new(KcpDialer::new(KcpConfig {
            passphrase: ctx.config.passphrase.clone(),
            max_streams: ctx.config.max_streams.unwrap_or(0) as usize,
            backlog: DEFAULT_BACKLOG,
        })))
    });
    registry.register("ssh", |ctx| {
        Ok(Arc::new(SshDialer::tunnel(ssh_config_from_dialer(
            &ctx.config,
        ))))
    });
    registry.register("sshd", |ctx| {
        Ok(Arc::new(SshDialer::forward(ssh_config_from_dialer(
            &ctx.config,
        ))))
    });
}

fn register_connectors() {
    let registry = connector_registry();

    registry.register("forward", |_| Ok(Arc::new(ForwardConnector::new())));
    registry.register("http2", |ctx| {
        let (username, password) = match &ctx.config.auth {
            Some(auth) => (Some(auth.username.clone()), Some(auth.password.clone())),
            None => (None, None),
        };
        Ok(Arc::new(Http2Connector::new().with_auth(username, password)))
    });
    registry.register("relay", |ctx| {
        let (username, password) = match &ctx.config.auth {
            Some(auth) => (Some(auth.username.clone()), Some(auth.password.clone())),
            None => (None, None),
        };
        let tunnel_id = match &ctx.config.tunnel_id {
            Some(id) => Some(parse_tunnel_id(id)?),
            None => None,
        };
        Ok(Arc::new(
            RelayConnector::new()
                .with_auth(username, password)
                .with_tunnel_id(tunnel_id)
                .with_no_delay(ctx.config.no_delay),
        ))
    });
    registry.register("socks5", |ctx| {
        let config = Socks5ConnectorConfig {
            username: ctx.config.auth.as_ref().map(|a| a.username.clone()),
            password: ctx.config.auth.as_ref().map(|a| a.password.clone()),
            enable_tls: ctx.config.enable_tls,
            tls_only: ctx.config.tls_only,
        };
        Ok(Arc::new(Socks5Connector::new(config, None)))
    });
    registry.register("sshd", |_| Ok(Arc::new(SshdConnector::new())));
}

fn register_handlers() {
    let registry = handler_registry();

    registry.register("socks5", |ctx| {
        let auther: Option<Arc<dyn Auther>> = ctx
            .config
            .auth
            .as_ref()
            .map(|a| Arc::new(StaticAuther::new(&a.username, &a.password)) as Arc<dyn Auther>);
        let defaults = Socks5Config::default();
        let config = Socks5Config {
            enable_bind: ctx.config.enable_bind,
            enable_udp: ctx.config.enable_udp,
            udp_buffer_size: ctx
                .config
                .udp_buffer_size
                .unwrap_or(defaults.udp_buffer_size),
            compatibility_mode: ctx.config.compatibility_mode,
            handshake_timeout: seconds(ctx.config.handshake_timeout)
                .unwrap_or(defaults.handshake_timeout),
        };
        Ok(Arc::new(
            Socks5Handler::new(ctx.service, config, ctx.router)
                .with_auther(auther)
                .with_bypass(prefix_bypass(&ctx.config.bypass)),
        ))
    });
    registry.register("sshd", |ctx| {
        Ok(Arc::new(
            SshdHandler::new(ctx.service, ctx.router)
                .with_bypass(prefix_bypass(&ctx.config.bypass)),
        ))
    });
    registry.register("tap", |ctx| {
        Ok(Arc::new(TapHandler::new(
            ctx.service,
            ctx.router,
            ctx.forward,
        )))
    });
    registry.register("tun", |ctx| {
        let config = TunConfig {
            passphrase: ctx.config.passphrase.clone().unwrap_or_default(),
            keep_alive_period: seconds(ctx.config.keep_alive_period)
                .or(TunConfig::default().keep_alive_period),
        };
        Ok(Arc::new(TunHandler::new(
            ctx.service,
            config,
            ctx.router,
            ctx.forward,
        )))
    });
}

/// Populate every registry. Idempotent; called once during startup
/// before any service is built.
pub fn register_defaults() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        register_listeners();
        register_dialers();
        register_connectors();
        register_handlers();
    });
}

fn unknown(kind: &str, what: &str) -> Error {
    Error::Config(format!("unknown {} kind: {}", what, kind))
}

pub async fn build_listener(ctx: ListenerContext) -> Result<Box<dyn Listener>> {
    let kind = ctx.config.kind.clone();
    let factory = listener_registry()
        .get(&kind)
        .ok_or_else(|| unknown(&kind, "listener"))?;
    factory(ctx).await
}

pub fn build_dialer(ctx: &DialerContext) -> Result<Arc<dyn Dialer>> {
    let factory = dialer_registry()
        .get(&ctx.config.kind)
        .ok_or_else(|| unknown(&ctx.config.kind, "dialer"))?;
    factory(ctx)
}

pub fn build_connector(ctx: &ConnectorContext) -> Result<Arc<dyn Connector>> {
    let factory = connector_registry()
        .get(&ctx.config.kind)
        .ok_or_else(|| unknown(&ctx.config.kind, "connector"))?;
    factory(ctx)
}

pub fn build_handler(ctx: HandlerContext) -> Result<Arc<dyn Handler>> {
    let kind = ctx.config.kind.clone();
    let factory = handler_registry()
        .get(&kind)
        .ok_or_else(|| unknown(&kind, "handler"))?;
    factory(ctx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_every_core_kind() {
        register_defaults();

        for kind in ["tcp", "tls", "ws", "wss", "h2", "h2c", "quic", "http3", "icmp", "kcp", "ssh", "sshd", "tap", "tun"] {
            assert!(listener_registry().get(kind).is_some(), "listener {}", kind);
        }
        for kind in ["tcp", "udp", "tls", "ws", "wss", "h2", "h2c", "http2", "quic", "http3", "icmp", "kcp", "ssh", "sshd"] {
            assert!(dialer_registry().get(kind).is_some(), "dialer {}", kind);
        }
        for kind in ["forward", "http2", "relay", "socks5", "sshd"] {
            assert!(connector_registry().get(kind).is_some(), "connector {}", kind);
        }
        for kind in ["socks5", "sshd", "tap", "tun"] {
            assert!(handler_registry().get(kind).is_some(), "handler {}", kind);
        }
    }

    #[test]
    fn unknown_kind_is_a_config_error() {
        register_defaults();
        let ctx = DialerContext {
            config: DialerConfig {
                kind: "carrier-pigeon".into(),
                ..Default::default()
            },
        };
        assert!(matches!(build_dialer(&ctx), Err(Error::Config(_))));
    }
}
