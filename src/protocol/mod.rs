//! Wire protocol codecs
//!
//! Pure framing shared by handlers and connectors; no IO policy lives
//! here, only bytes.

pub mod keepalive;
pub mod packet;
pub mod relay;
pub mod socks5;
