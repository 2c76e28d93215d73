//! TUN membership keepalive
//!
//! `"GOST"(4) || passphrase(16) || (IPv6-mapped IP x N)`. Sent by the
//! client on association and every keepalive period; the server installs
//! one route per announced IP toward the sender.

use std::net::{IpAddr, Ipv6Addr};

use crate::error::{Error, Result};

pub const MAGIC: &[u8; 4] = b"GOST";
pub const HEADER_LEN: usize = 20;
const IP_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keepalive {
    pub passphrase: [u8; 16],
    pub ips: Vec<IpAddr>,
}

/// Pad or truncate a configured passphrase into the fixed 16-byte field.
pub fn passphrase_key(passphrase: &str) -> [u8; 16] {
    let mut key = [0u8; 16];
    let bytes = passphrase.as_bytes();
    let n = bytes.len().min(16);
    key[..n].copy_from_slice(&bytes[..n]);
    key
}

impl Keepalive {
    pub fn new(passphrase: [u8; 16], ips: Vec<IpAddr>) -> Self {
        Self { passphrase, ips }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.ips.len() * IP_LEN);
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&self.passphrase);
        for ip in &self.ips {
            let v6 = match ip {
                IpAddr::V4(v4) => v4.to_ipv6_mapped(),
                IpAddr::V6(v6) => *v6,
            };
            buf.extend_from_slice(&v6.octets());
        }
        buf
    }

    /// Quick check whether a packet is a keepalive at all.
    pub fn matches(buf: &[u8]) -> bool {
        buf.len() >= HEADER_LEN
            && (buf.len() - HEADER_LEN) % IP_LEN == 0
            && &buf[..4] == MAGIC
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if !Self::matches(buf) {
            return Err(Error::Protocol("not a keepalive message".into()));
        }
        let mut passphrase = [0u8; 16];
        passphrase.copy_from_slice(&buf[4..HEADER_LEN]);
        let mut ips = Vec::with_capacity((buf.len() - HEADER_LEN) / IP_LEN);
        for chunk in buf[HEADER_LEN..].chunks_exact(IP_LEN) {
            let octets: [u8; 16] = chunk.try_into().unwrap();
            let v6 = Ipv6Addr::from(octets);
            match v6.to_ipv4_mapped() {
                Some(v4) => ips.push(IpAddr::V4(v4)),
                None => ips.push(IpAddr::V6(v6)),
            }
        }
        Ok(Self { passphrase, ips })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_v4_and_v6() {
        let ka = Keepalive::new(
            passphrase_key("hunter2"),
            vec!["10.0.0.2".parse().unwrap(), "fd00::2".parse().unwrap()],
        );
        let buf = ka.encode();
        assert_eq!(buf.len(), HEADER_LEN + 32);
        assert_eq!(Keepalive::decode(&buf).unwrap(), ka);
    }

    #[test]
    fn bare_header_is_valid() {
        let ka = Keepalive::new(passphrase_key(""), vec![]);
        let buf = ka.encode();
        assert_eq!(buf.len(), HEADER_LEN);
        assert!(Keepalive::matches(&buf));
    }

    #[test]
    fn rejects_non_keepalive() {
        assert!(!Keepalive::matches(b"GOSTshort"));
        let mut buf = Keepalive::new(passphrase_key("x"), vec![]).encode();
        buf[0] = b'g';
        assert!(Keepalive::decode(&buf).is_err());
        // a data packet whose tail is not a multiple of 16
        let mut odd = Keepalive::new(passphrase_key("x"), vec![]).encode();
        odd.push(0xff);
        assert!(!Keepalive::matches(&odd));
    }
}
