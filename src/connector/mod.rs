//! Connectors (L3)
//!
//! A connector takes an already-open connection to the next hop and
//! performs the proxy handshake that makes it a tunnel to
//! `(network, address)`.

mod forward;
pub use forward::ForwardConnector;

mod http2;
pub use http2::Http2Connector;

mod relay;
pub use relay::{RelayConnector, UdpTunDatagram};

mod socks5;
pub use socks5::{Socks5Connector, Socks5ConnectorConfig};

mod sshd;
pub use sshd::SshdConnector;

use async_trait::async_trait;

use crate::common::{Address, Conn, Datagram, Network};
use crate::error::{Error, Result};
use crate::transport::Listener;

#[async_trait]
pub trait Connector: Send + Sync {
    /// Turn `conn` into a stream tunneled to `addr`.
    async fn connect(&self, conn: Conn, network: Network, addr: &Address) -> Result<Conn>;

    /// Open a UDP association over `conn` (no fixed peer).
    async fn connect_packet(&self, _conn: Conn) -> Result<Box<dyn Datagram>> {
        Err(Error::Unsupported("udp association".into()))
    }

    /// Bind a remote listener through `conn`.
    async fn bind(
        &self,
        _conn: Conn,
        _network: Network,
        _addr: &Address,
    ) -> Result<Box<dyn Listener>> {
        Err(Error::Unsupported("bind".into()))
    }
}
