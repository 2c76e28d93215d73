//! SSH port-forward connector
//!
//! Requires an SSH client handle in the connection envelope, as produced
//! by a forward-mode SSH dial. `connect` opens direct-tcpip; `bind`
//! requests a remote tcpip-forward (empty host binds all interfaces on
//! the remote).

use async_trait::async_trait;
use tracing::debug;

use crate::common::{Address, Conn, Network};
use crate::error::{Error, Result};
use crate::transport::{Listener, SshClientHandle};

use super::Connector;

#[derive(Default)]
pub struct SshdConnector;

impl SshdConnector {
    pub fn new() -> Self {
        Self
    }

    fn handle(conn: &Conn) -> Result<&SshClientHandle> {
        conn.envelope
            .get::<SshClientHandle>()
            .ok_or_else(|| Error::Protocol("sshd: connection carries no ssh client".into()))
    }
}

#[async_trait]
impl Connector for SshdConnector {
    async fn connect(&self, conn: Conn, network: Network, addr: &Address) -> Result<Conn> {
        debug!("connect {}/{} via sshd", addr, network);
        if network != Network::Tcp {
            return Err(Error::Unsupported("sshd: tcp only".into()));
        }

        let stream = Self::handle(&conn)?
            .connect(&addr.host(), addr.port())
            .await?;
        Ok(Conn {
            stream,
            local: conn.local,
            peer: addr.clone(),
            envelope: conn.envelope,
        })
    }

    async fn bind(
        &self,
        conn: Conn,
        network: Network,
        addr: &Address,
    ) -> Result<Box<dyn Listener>> {
        debug!("bind {}/{} via sshd", addr, network);
        if network != Network::Tcp {
            return Err(Error::Unsupported("sshd: tcp only".into()));
        }

        let host = addr.host();
        let host = if host == "0.0.0.0" { String::new() } else { host };
        Self::handle(&conn)?.bind(&host, addr.port()).await
    }
}
