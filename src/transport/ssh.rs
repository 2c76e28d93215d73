//! SSH transport
//!
//! Two personalities share this module:
//!
//! * the tunnel transport (`ssh`): one SSH client per remote address in
//!   the session cache, one channel per dial. The server side accepts
//!   only the tunnel channel type (a session channel); anything else is
//!   rejected by the SSH layer.
//! * the port-forward flavor (`sshd`): full RFC 4254 §7 semantics.
//!   Dials carry an [`SshClientHandle`] in the envelope for the sshd
//!   connector; the listener surfaces `direct-tcpip` channels and
//!   `tcpip-forward` requests as typed [`SshdRequest`] envelopes for the
//!   forward handler.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::server::{self, Auth, Msg, Session as ServerSession};
use russh::Channel;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use crate::capability::Auther;
use crate::common::{empty_stream, Address, Conn, Envelope, Stream};
use crate::error::{Error, Result};
use crate::session::{Session, SessionCache};

use super::{resolve, AcceptQueue, Dialer, Listener, TcpListener, DEFAULT_BACKLOG};

#[derive(Clone, Default)]
pub struct SshConfig {
    pub username: String,
    pub password: Option<String>,
    /// Client authentication key.
    pub private_key_file: Option<String>,
    /// Passphrase for the private key.
    pub passphrase: Option<String>,
    pub handshake_timeout: Option<Duration>,
    /// Server host key; generated when absent.
    pub host_key_file: Option<String>,
    pub authorized_keys_file: Option<String>,
    pub backlog: usize,
}

impl SshConfig {
    fn backlog(&self) -> usize {
        if self.backlog == 0 {
            DEFAULT_BACKLOG
        } else {
            self.backlog
        }
    }

    fn timeout(&self) -> Duration {
        self.handshake_timeout.unwrap_or(Duration::from_secs(30))
    }
}

// ============================================================================
// Client side
// ============================================================================

type ForwardMap = Arc<Mutex<HashMap<(String, u32), mpsc::Sender<Conn>>>>;

/// russh client handler: trusts any host key (the tunnel authenticates
/// at the proxy protocol layer) and routes forwarded-tcpip channels to
/// their bound listeners.
struct ClientHandler {
    forwards: ForwardMap,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &ssh_key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<client::Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> std::result::Result<(), Self::Error> {
        let key = (connected_address.to_string(), connected_port);
        let peer: Address = format!("{}:{}", originator_address, originator_port)
            .parse()
            .unwrap_or_else(|_| Address::unspecified());
        let sender = self.forwards.lock().await.get(&key).cloned();
        match sender {
            Some(tx) => {
                let conn = Conn::new(
                    Box::new(channel.into_stream()),
                    Address::unspecified(),
                    peer,
                );
                if tx.send(conn).await.is_err() {
                    debug!("ssh: forward listener for {:?} is gone", key);
                }
            }
            None => {
                debug!("ssh: unsolicited forwarded-tcpip for {:?}", key);
            }
        }
        Ok(())
    }
}

struct SshSession {
    handle: Arc<Mutex<client::Handle<ClientHandler>>>,
    forwards: ForwardMap,
    dead: AtomicBool,
}

impl SshSession {
    fn client_handle(&self) -> SshClientHandle {
        SshClientHandle {
            handle: self.handle.clone(),
            forwards: self.forwards.clone(),
        }
    }
}

#[async_trait]
impl Session for SshSession {
    async fn open_stream(&self) -> Result<Stream> {
        let mut handle = self.handle.lock().await;
        match handle.channel_open_session().await {
            Ok(channel) => Ok(Box::new(channel.into_stream())),
            Err(e) => {
                self.dead.store(true, Ordering::SeqCst);
                Err(Error::Transport(format!("ssh: {}", e)))
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        let mut handle = self.handle.lock().await;
        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await;
    }
}

/// Handle to a live SSH client, carried in the envelope of
/// forward-mode dials for the sshd connector.
#[derive(Clone)]
pub struct SshClientHandle {
    handle: Arc<Mutex<client::Handle<ClientHandler>>>,
    forwards: ForwardMap,
}

impl SshClientHandle {
    /// Open a direct-tcpip channel to `host:port`.
    pub async fn connect(&self, host: &str, port: u16) -> Result<Stream> {
        let mut handle = self.handle.lock().await;
        let channel = handle
            .channel_open_direct_tcpip(host, port as u32, "127.0.0.1", 0)
            .await
            .map_err(|e| Error::Transport(format!("ssh: {}", e)))?;
        Ok(Box::new(channel.into_stream()))
    }

    /// Request a remote tcpip-forward and surface accepted peers as a
    /// listener. An empty host binds all interfaces on the remote.
    pub async fn bind(&self, host: &str, port: u16) -> Result<Box<dyn Listener>> {
        let host = if host.is_empty() { "0.0.0.0" } else { host };
        let (tx, rx) = mpsc::channel(DEFAULT_BACKLOG);
        let key = (host.to_string(), port as u32);
        self.forwards.lock().await.insert(key.clone(), tx);

        let mut handle = self.handle.lock().await;
        let result = handle.tcpip_forward(host, port as u32).await;
        drop(handle);
        match result {
            Ok(_) => {}
            Err(russh::Error::RequestDenied) => {
                self.forwards.lock().await.remove(&key);
                return Err(Error::Resource(format!(
                    "ssh: remote refused forward for {}:{}",
                    host, port
                )));
            }
            Err(e) => return Err(Error::Transport(format!("ssh: {}", e))),
        }

        Ok(Box::new(SshBoundListener {
            local: format!("{}:{}", host, port)
                .parse()
                .unwrap_or_else(|_| Address::unspecified()),
            rx: Mutex::new(rx),
            forwards: self.forwards.clone(),
            key,
        }))
    }
}

struct SshBoundListener {
    local: Address,
    rx: Mutex<mpsc::Receiver<Conn>>,
    forwards: ForwardMap,
    key: (String, u32),
}

#[async_trait]
impl Listener for SshBoundListener {
    async fn accept(&self) -> Result<Conn> {
        self.rx.lock().await.recv().await.ok_or(Error::Closed)
    }

    fn local_addr(&self) -> Result<Address> {
        Ok(self.local.clone())
    }

    async fn close(&self) -> Result<()> {
        self.forwards.lock().await.remove(&self.key);
        Ok(())
    }
}

/// SSH dialer. Tunnel mode opens one channel per dial; forward mode
/// yields the client handle for the sshd connector.
pub struct SshDialer {
    config: SshConfig,
    forward: bool,
    sessions: SessionCache<SshSession>,
}

impl SshDialer {
    pub fn tunnel(config: SshConfig) -> Self {
        Self {
            config,
            forward: false,
            sessions: SessionCache::new(),
        }
    }

    pub fn forward(config: SshConfig) -> Self {
        Self {
            config,
            forward: true,
            sessions: SessionCache::new(),
        }
    }

    async fn init_session(&self, addr: &Address) -> Result<SshSession> {
        let sa = resolve(addr).await?;
        let forwards: ForwardMap = Arc::new(Mutex::new(HashMap::new()));
        let handler = ClientHandler {
            forwards: forwards.clone(),
        };

        let client_config = Arc::new(client::Config::default());
        let mut handle = tokio::time::timeout(
            self.config.timeout(),
            client::connect(client_config, sa, handler),
        )
        .await
        .map_err(|_| Error::Timeout)?
        .map_err(|e| Error::Handshake(format!("ssh: {}", e)))?;

        let mut authenticated = false;
        if let Some(key_file) = &self.config.private_key_file {
            let key = russh_keys::load_secret_key(key_file, self.config.passphrase.as_deref())
                .map_err(|e| Error::Config(format!("ssh key: {}", e)))?;
            let key = russh_keys::key::PrivateKeyWithHashAlg::new(Arc::new(key), None)
                .map_err(|e| Error::Config(format!("ssh key: {}", e)))?;
            authenticated = handle
                .authenticate_publickey(&self.config.username, key)
                .await
                .map_err(|e| Error::Handshake(format!("ssh auth: {}", e)))?;
        }
        if !authenticated {
            if let Some(password) = &self.config.password {
                authenticated = handle
                    .authenticate_password(&self.config.username, password)
                    .await
                    .map_err(|e| Error::Handshake(format!("ssh auth: {}", e)))?;
            }
        }
        if !authenticated {
            return Err(Error::AuthFailed);
        }

        Ok(SshSession {
            handle: Arc::new(Mutex::new(handle)),
            forwards,
            dead: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Dialer for SshDialer {
    async fn dial(&self, addr: &Address) -> Result<Conn> {
        let key = addr.to_string();
        let session = self
            .sessions
            .get_or_init(&key, || self.init_session(addr))
            .await?;

        if self.forward {
            let mut envelope = Envelope::new();
            envelope.insert(session.client_handle());
            return Ok(
                Conn::new(empty_stream(), Address::unspecified(), addr.clone())
                    .with_envelope(envelope),
            );
        }

        match session.open_stream().await {
            Ok(stream) => Ok(Conn::new(stream, Address::unspecified(), addr.clone())),
            Err(e) => {
                self.sessions.evict(&key).await;
                session.close().await;
                Err(e)
            }
        }
    }

    fn multiplex(&self) -> bool {
        true
    }
}

// ============================================================================
// Server side
// ============================================================================

/// Typed request surfaced by the sshd listener for the forward handler.
pub enum SshdRequest {
    /// RFC 4254 §7.2 direct-tcpip: the peer wants us to dial out.
    DirectTcpip {
        host: String,
        port: u16,
        originator: (String, u16),
    },
    /// RFC 4254 §7.1 tcpip-forward: listener already bound, connections
    /// flow back over forwarded-tcpip channels on `handle`.
    RemoteForward {
        listener: tokio::net::TcpListener,
        host: String,
        port: u16,
        handle: server::Handle,
        done: watch::Receiver<bool>,
    },
}

fn load_host_key(config: &SshConfig) -> Result<ssh_key::PrivateKey> {
    if let Some(path) = &config.host_key_file {
        if Path::new(path).exists() {
            let data = std::fs::read_to_string(path)
                .map_err(|e| Error::Config(format!("ssh host key: {}", e)))?;
            return russh_keys::decode_secret_key(&data, config.passphrase.as_deref())
                .map_err(|e| Error::Config(format!("ssh host key: {}", e)));
        }
        warn!("ssh: host key {} missing, generating an ephemeral key", path);
    }
    ssh_key::PrivateKey::random(&mut rand::thread_rng(), ssh_key::Algorithm::Ed25519)
        .map_err(|e| Error::Config(format!("ssh host key: {}", e)))
}

fn load_authorized_keys(path: &str) -> Result<Vec<ssh_key::PublicKey>> {
    let data = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("authorized keys: {}", e)))?;
    let mut keys = Vec::new();
    for line in data.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match ssh_key::PublicKey::from_openssh(line) {
            Ok(key) => keys.push(key),
            Err(e) => warn!("authorized keys: skipping malformed entry: {}", e),
        }
    }
    Ok(keys)
}

struct ServerAuth {
    auther: Option<Arc<dyn Auther>>,
    authorized_keys: Vec<ssh_key::PublicKey>,
}

impl ServerAuth {
    fn open(&self) -> bool {
        self.auther.is_none() && self.authorized_keys.is_empty()
    }

    fn check_password(&self, user: &str, password: &str) -> bool {
        match &self.auther {
            Some(auther) => auther.authenticate(user, password),
            None => false,
        }
    }

    fn check_key(&self, offered: &ssh_key::PublicKey) -> bool {
        let offered = offered.fingerprint(ssh_key::HashAlg::Sha256).to_string();
        self.authorized_keys
            .iter()
            .any(|k| k.fingerprint(ssh_key::HashAlg::Sha256).to_string() == offered)
    }
}

enum ServerMode {
    /// Accept only tunnel (session) channels.
    Tunnel,
    /// Accept direct-tcpip and tcpip-forward.
    Forward,
}

struct ServerHandler {
    mode: Arc<ServerMode>,
    auth: Arc<ServerAuth>,
    producer: super::QueueProducer,
    peer: Address,
    // signaled on drop, i.e. when the client connection is done
    done_tx: Arc<watch::Sender<bool>>,
    done_rx: watch::Receiver<bool>,
}

impl Drop for ServerHandler {
    fn drop(&mut self) {
        let _ = self.done_tx.send(true);
    }
}

#[async_trait]
impl server::Handler for ServerHandler {
    type Error = russh::Error;

    async fn auth_none(&mut self, user: &str) -> std::result::Result<Auth, Self::Error> {
        if self.auth.open() {
            debug!("ssh: {} accepted without authentication", user);
            return Ok(Auth::Accept);
        }
        Ok(Auth::Reject {
            proceed_with_methods: None,
        })
    }

    async fn auth_password(
        &mut self,
        user: &str,
        password: &str,
    ) -> std::result::Result<Auth, Self::Error> {
        if self.auth.open() || self.auth.check_password(user, password) {
            info!("ssh: password auth for {} succeeded", user);
            return Ok(Auth::Accept);
        }
        warn!("ssh: password auth for {} failed", user);
        Ok(Auth::Reject {
            proceed_with_methods: None,
        })
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &ssh_key::PublicKey,
    ) -> std::result::Result<Auth, Self::Error> {
        if self.auth.open() || self.auth.check_key(public_key) {
            info!("ssh: public key auth for {} succeeded", user);
            return Ok(Auth::Accept);
        }
        warn!("ssh: public key auth for {} failed", user);
        Ok(Auth::Reject {
            proceed_with_methods: None,
        })
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut ServerSession,
    ) -> std::result::Result<bool, Self::Error> {
        match &*self.mode {
            ServerMode::Tunnel => {
                let conn = Conn::new(
                    Box::new(channel.into_stream()),
                    Address::unspecified(),
                    self.peer.clone(),
                );
                self.producer.offer(conn, "ssh");
                Ok(true)
            }
            // forward mode serves port-forwarding only
            ServerMode::Forward => Ok(false),
        }
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut ServerSession,
    ) -> std::result::Result<bool, Self::Error> {
        match &*self.mode {
            ServerMode::Forward => {
                let mut envelope = Envelope::new();
                envelope.insert(SshdRequest::DirectTcpip {
                    host: host_to_connect.to_string(),
                    port: port_to_connect as u16,
                    originator: (originator_address.to_string(), originator_port as u16),
                });
                let conn = Conn::new(
                    Box::new(channel.into_stream()),
                    Address::unspecified(),
                    self.peer.clone(),
                )
                .with_envelope(envelope);
                self.producer.offer(conn, "sshd");
                Ok(true)
            }
            ServerMode::Tunnel => Ok(false),
        }
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        session: &mut ServerSession,
    ) -> std::result::Result<bool, Self::Error> {
        if matches!(&*self.mode, ServerMode::Tunnel) {
            return Ok(false);
        }

        let bind_addr = format!(
            "{}:{}",
            if address.is_empty() { "0.0.0.0" } else { address },
            port
        );
        let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
            Ok(l) => l,
            Err(e) => {
                warn!("sshd: bind {} failed: {}", bind_addr, e);
                return Ok(false);
            }
        };
        // report the allocated port back when the client asked for 0
        if let Ok(local) = listener.local_addr() {
            *port = local.port() as u32;
        }
        debug!("sshd: bound {} for {}", bind_addr, self.peer);

        let mut envelope = Envelope::new();
        envelope.insert(SshdRequest::RemoteForward {
            listener,
            host: address.to_string(),
            port: *port as u16,
            handle: session.handle(),
            done: self.done_rx.clone(),
        });
        let conn = Conn::new(empty_stream(), Address::unspecified(), self.peer.clone())
            .with_envelope(envelope);
        self.producer.offer(conn, "sshd");
        Ok(true)
    }
}

struct ServerState {
    mode: Arc<ServerMode>,
    auth: Arc<ServerAuth>,
    config: Arc<server::Config>,
}

async fn run_server(
    inner: TcpListener,
    state: ServerState,
    queue: Arc<AcceptQueue>,
) {
    loop {
        let conn = match inner.accept().await {
            Ok(c) => c,
            Err(e) => {
                debug!("ssh: accept: {}", e);
                break;
            }
        };
        if queue.is_closed() {
            break;
        }

        let (done_tx, done_rx) = watch::channel(false);
        let handler = ServerHandler {
            mode: state.mode.clone(),
            auth: state.auth.clone(),
            producer: queue.producer(),
            peer: conn.peer.clone(),
            done_tx: Arc::new(done_tx),
            done_rx,
        };
        let config = state.config.clone();
        let peer = conn.peer.clone();
        tokio::spawn(async move {
            match server::run_stream(config, conn.stream, handler).await {
                Ok(session) => {
                    if let Err(e) = session.await {
                        debug!("ssh: session from {} ended: {}", peer, e);
                    }
                }
                Err(e) => warn!("ssh: handshake from {} failed: {}", peer, e),
            }
        });
    }
    queue.close();
}

fn server_state(
    config: &SshConfig,
    auther: Option<Arc<dyn Auther>>,
    mode: ServerMode,
) -> Result<ServerState> {
    let host_key = load_host_key(config)?;
    let authorized_keys = match &config.authorized_keys_file {
        Some(path) => load_authorized_keys(path)?,
        None => Vec::new(),
    };

    let server_config = server::Config {
        keys: vec![host_key],
        inactivity_timeout: Some(Duration::from_secs(3600)),
        auth_rejection_time: Duration::from_secs(3),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        ..Default::default()
    };

    Ok(ServerState {
        mode: Arc::new(mode),
        auth: Arc::new(ServerAuth {
            auther,
            authorized_keys,
        }),
        config: Arc::new(server_config),
    })
}

/// Tunnel-mode SSH listener: every accepted conn is one logical channel.
pub struct SshListener {
    local: Address,
    queue: Arc<AcceptQueue>,
}

impl SshListener {
    pub async fn bind(
        addr: &Address,
        config: SshConfig,
        auther: Option<Arc<dyn Auther>>,
    ) -> Result<Self> {
        let inner = TcpListener::bind(addr).await?;
        let local = inner.local_addr()?;
        let queue = Arc::new(AcceptQueue::new(config.backlog()));
        let state = server_state(&config, auther, ServerMode::Tunnel)?;
        tokio::spawn(run_server(inner, state, queue.clone()));
        Ok(Self { local, queue })
    }
}

#[async_trait]
impl Listener for SshListener {
    async fn accept(&self) -> Result<Conn> {
        self.queue.pop().await
    }

    fn local_addr(&self) -> Result<Address> {
        Ok(self.local.clone())
    }

    async fn close(&self) -> Result<()> {
        self.queue.close();
        Ok(())
    }
}

/// Port-forward SSH listener: accepted conns carry [`SshdRequest`].
pub struct SshdListener {
    local: Address,
    queue: Arc<AcceptQueue>,
}

impl SshdListener {
    pub async fn bind(
        addr: &Address,
        config: SshConfig,
        auther: Option<Arc<dyn Auther>>,
    ) -> Result<Self> {
        let inner = TcpListener::bind(addr).await?;
        let local = inner.local_addr()?;
        let queue = Arc::new(AcceptQueue::new(config.backlog()));
        let state = server_state(&config, auther, ServerMode::Forward)?;
        tokio::spawn(run_server(inner, state, queue.clone()));
        Ok(Self { local, queue })
    }
}

#[async_trait]
impl Listener for SshdListener {
    async fn accept(&self) -> Result<Conn> {
        self.queue.pop().await
    }

    fn local_addr(&self) -> Result<Address> {
        Ok(self.local.clone())
    }

    async fn close(&self) -> Result<()> {
        self.queue.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authorized_keys_parsing_skips_garbage() {
        let dir = std::env::temp_dir().join("passage-ssh-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("authorized_keys");

        let key = ssh_key::PrivateKey::random(&mut rand::thread_rng(), ssh_key::Algorithm::Ed25519)
            .unwrap();
        let public = key.public_key().to_openssh().unwrap();
        std::fs::write(&path, format!("# comment\n\nnot-a-key\n{}\n", public)).unwrap();

        let keys = load_authorized_keys(path.to_str().unwrap()).unwrap();
        assert_eq!(keys.len(), 1);

        let auth = ServerAuth {
            auther: None,
            authorized_keys: keys,
        };
        assert!(auth.check_key(key.public_key()));
        let other =
            ssh_key::PrivateKey::random(&mut rand::thread_rng(), ssh_key::Algorithm::Ed25519)
                .unwrap();
        assert!(!auth.check_key(other.public_key()));
    }

    #[test]
    fn ephemeral_host_key_when_unconfigured() {
        let key = load_host_key(&SshConfig::default()).unwrap();
        assert_eq!(key.algorithm(), ssh_key::Algorithm::Ed25519);
    }
}
