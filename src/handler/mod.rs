//! Handlers (L5)
//!
//! A handler terminates the client-side protocol on an accepted
//! connection, resolves destinations, dials through the router and runs
//! the relay. Handler errors are per-connection and never take the
//! service down.

pub mod socks5;
pub use socks5::{Socks5Config, Socks5Handler};

mod sshd;
pub use sshd::SshdHandler;

mod tap;
pub use tap::TapHandler;

mod tun;
pub use tun::{TunConfig, TunHandler};

use async_trait::async_trait;

use crate::common::Conn;
use crate::error::Result;

#[async_trait]
pub trait Handler: Send + Sync {
    /// Serve one client connection to completion. The connection and
    /// every upstream opened for it are released when this returns.
    async fn handle(&self, conn: Conn) -> Result<()>;
}
