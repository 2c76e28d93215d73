//! Forward connector: the remote already expects raw bytes.

use async_trait::async_trait;
use tracing::debug;

use crate::common::{Address, Conn, Network};
use crate::error::Result;

use super::Connector;

#[derive(Default)]
pub struct ForwardConnector;

impl ForwardConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for ForwardConnector {
    async fn connect(&self, conn: Conn, network: Network, addr: &Address) -> Result<Conn> {
        debug!("forward {}/{}", addr, network);
        Ok(conn)
    }
}
