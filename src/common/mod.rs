//! Core types shared by every layer: addresses, streams, datagrams and the
//! per-connection metadata envelope.

mod address;
mod datagram;
mod envelope;
mod stream;

pub use address::{Address, Network};
pub use datagram::{Datagram, UdpDatagram};
pub use envelope::Envelope;
pub use stream::{empty_stream, AsyncReadWrite, CombinedStream, Conn, IntoStream, Stream};

pub use crate::error::Result;
