//! SOCKS5 wire protocol (RFC 1928, RFC 1929)
//!
//! Framing shared by the server-side handler and the client-side
//! connector: greeting/method negotiation, username/password
//! subnegotiation, command/reply frames and the UDP datagram
//! encapsulation.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::common::Address;
use crate::error::{Error, Result};

pub const VERSION: u8 = 0x05;

// Method identifiers. TLS and TLSAuth are the extension methods.
pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_USER_PASS: u8 = 0x02;
pub const METHOD_TLS: u8 = 0x80;
pub const METHOD_TLS_AUTH: u8 = 0x82;
pub const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

// Commands.
pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_BIND: u8 = 0x02;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;
pub const CMD_MUX_BIND: u8 = 0x08;

// Reply codes.
pub const REP_SUCCEEDED: u8 = 0x00;
pub const REP_FAILURE: u8 = 0x01;
pub const REP_NOT_ALLOWED: u8 = 0x02;
pub const REP_NETWORK_UNREACHABLE: u8 = 0x03;
pub const REP_HOST_UNREACHABLE: u8 = 0x04;
pub const REP_CONNECTION_REFUSED: u8 = 0x05;
pub const REP_CMD_UNSUPPORTED: u8 = 0x07;
pub const REP_ATYP_UNSUPPORTED: u8 = 0x08;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

pub const USER_PASS_VERSION: u8 = 0x01;

/// Type-tagged SOCKS5 address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksAddr {
    pub host: Host,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Host {
    Ipv4(Ipv4Addr),
    Domain(String),
    Ipv6(Ipv6Addr),
}

impl SocksAddr {
    pub fn unspecified() -> Self {
        Self {
            host: Host::Ipv4(Ipv4Addr::UNSPECIFIED),
            port: 0,
        }
    }

    pub fn from_socket(addr: SocketAddr) -> Self {
        let host = match addr.ip() {
            IpAddr::V4(ip) => Host::Ipv4(ip),
            IpAddr::V6(ip) => Host::Ipv6(ip),
        };
        Self {
            host,
            port: addr.port(),
        }
    }

    pub fn to_address(&self) -> Address {
        match &self.host {
            Host::Ipv4(ip) => Address::ip_port(IpAddr::V4(*ip), self.port),
            Host::Ipv6(ip) => Address::ip_port(IpAddr::V6(*ip), self.port),
            Host::Domain(d) => Address::domain(d.clone(), self.port),
        }
    }

    pub fn from_address(addr: &Address) -> Self {
        match addr {
            Address::Socket(sa) => Self::from_socket(*sa),
            Address::Domain(d, port) => Self {
                host: Host::Domain(d.clone()),
                port: *port,
            },
        }
    }

    /// Encoded length including the address type byte.
    pub fn encoded_len(&self) -> usize {
        match &self.host {
            Host::Ipv4(_) => 1 + 4 + 2,
            Host::Domain(d) => 1 + 1 + d.len() + 2,
            Host::Ipv6(_) => 1 + 16 + 2,
        }
    }

    pub fn encode_to(&self, buf: &mut Vec<u8>) {
        match &self.host {
            Host::Ipv4(ip) => {
                buf.push(ATYP_IPV4);
                buf.extend_from_slice(&ip.octets());
            }
            Host::Domain(d) => {
                buf.push(ATYP_DOMAIN);
                buf.push(d.len() as u8);
                buf.extend_from_slice(d.as_bytes());
            }
            Host::Ipv6(ip) => {
                buf.push(ATYP_IPV6);
                buf.extend_from_slice(&ip.octets());
            }
        }
        buf.extend_from_slice(&self.port.to_be_bytes());
    }

    pub async fn read_from<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self> {
        let atyp = r.read_u8().await?;
        Self::read_body(r, atyp).await
    }

    async fn read_body<R: AsyncRead + Unpin>(r: &mut R, atyp: u8) -> Result<Self> {
        let host = match atyp {
            ATYP_IPV4 => {
                let mut b = [0u8; 4];
                r.read_exact(&mut b).await?;
                Host::Ipv4(Ipv4Addr::from(b))
            }
            ATYP_DOMAIN => {
                let len = r.read_u8().await? as usize;
                let mut b = vec![0u8; len];
                r.read_exact(&mut b).await?;
                Host::Domain(String::from_utf8_lossy(&b).into_owned())
            }
            ATYP_IPV6 => {
                let mut b = [0u8; 16];
                r.read_exact(&mut b).await?;
                Host::Ipv6(Ipv6Addr::from(b))
            }
            _ => {
                return Err(Error::Protocol(format!(
                    "unsupported address type: {}",
                    atyp
                )))
            }
        };
        let port = r.read_u16().await?;
        Ok(Self { host, port })
    }

    /// Decode from a byte slice, returning the address and consumed length.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let short = || Error::Protocol("short socks5 address".into());
        let atyp = *buf.first().ok_or_else(short)?;
        let (host, n) = match atyp {
            ATYP_IPV4 => {
                let b: [u8; 4] = buf.get(1..5).ok_or_else(short)?.try_into().unwrap();
                (Host::Ipv4(Ipv4Addr::from(b)), 5)
            }
            ATYP_DOMAIN => {
                let len = *buf.get(1).ok_or_else(short)? as usize;
                let d = buf.get(2..2 + len).ok_or_else(short)?;
                (Host::Domain(String::from_utf8_lossy(d).into_owned()), 2 + len)
            }
            ATYP_IPV6 => {
                let b: [u8; 16] = buf.get(1..17).ok_or_else(short)?.try_into().unwrap();
                (Host::Ipv6(Ipv6Addr::from(b)), 17)
            }
            _ => {
                return Err(Error::Protocol(format!(
                    "unsupported address type: {}",
                    atyp
                )))
            }
        };
        let port = u16::from_be_bytes(buf.get(n..n + 2).ok_or_else(short)?.try_into().unwrap());
        Ok((Self { host, port }, n + 2))
    }
}

impl std::fmt::Display for SocksAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.host {
            Host::Ipv4(ip) => write!(f, "{}:{}", ip, self.port),
            Host::Domain(d) => write!(f, "{}:{}", d, self.port),
            Host::Ipv6(ip) => write!(f, "[{}]:{}", ip, self.port),
        }
    }
}

impl FromStr for SocksAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Ok(sa) = s.parse::<SocketAddr>() {
            return Ok(Self::from_socket(sa));
        }
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidAddress(s.to_string()))?;
        let port: u16 = port
            .parse()
            .map_err(|_| Error::InvalidAddress(s.to_string()))?;
        let host = if host.is_empty() {
            Host::Ipv4(Ipv4Addr::UNSPECIFIED)
        } else {
            Host::Domain(host.to_string())
        };
        Ok(Self { host, port })
    }
}

/// Client greeting: offered methods.
pub async fn read_methods<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<u8>> {
    let ver = r.read_u8().await?;
    if ver != VERSION {
        return Err(Error::Protocol(format!("unsupported socks version: {}", ver)));
    }
    let n = r.read_u8().await? as usize;
    let mut methods = vec![0u8; n];
    r.read_exact(&mut methods).await?;
    Ok(methods)
}

pub async fn write_methods<W: AsyncWrite + Unpin>(w: &mut W, methods: &[u8]) -> Result<()> {
    let mut buf = Vec::with_capacity(2 + methods.len());
    buf.push(VERSION);
    buf.push(methods.len() as u8);
    buf.extend_from_slice(methods);
    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}

pub async fn write_selected_method<W: AsyncWrite + Unpin>(w: &mut W, method: u8) -> Result<()> {
    w.write_all(&[VERSION, method]).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_selected_method<R: AsyncRead + Unpin>(r: &mut R) -> Result<u8> {
    let mut b = [0u8; 2];
    r.read_exact(&mut b).await?;
    if b[0] != VERSION {
        return Err(Error::Protocol(format!("unsupported socks version: {}", b[0])));
    }
    Ok(b[1])
}

/// RFC 1929 username/password subnegotiation.
pub async fn write_user_pass<W: AsyncWrite + Unpin>(
    w: &mut W,
    username: &str,
    password: &str,
) -> Result<()> {
    let mut buf = Vec::with_capacity(3 + username.len() + password.len());
    buf.push(USER_PASS_VERSION);
    buf.push(username.len() as u8);
    buf.extend_from_slice(username.as_bytes());
    buf.push(password.len() as u8);
    buf.extend_from_slice(password.as_bytes());
    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_user_pass<R: AsyncRead + Unpin>(r: &mut R) -> Result<(String, String)> {
    let ver = r.read_u8().await?;
    if ver != USER_PASS_VERSION {
        return Err(Error::Protocol(format!("invalid auth version: {}", ver)));
    }
    let ulen = r.read_u8().await? as usize;
    let mut user = vec![0u8; ulen];
    r.read_exact(&mut user).await?;
    let plen = r.read_u8().await? as usize;
    let mut pass = vec![0u8; plen];
    r.read_exact(&mut pass).await?;
    Ok((
        String::from_utf8_lossy(&user).into_owned(),
        String::from_utf8_lossy(&pass).into_owned(),
    ))
}

pub async fn write_user_pass_status<W: AsyncWrite + Unpin>(w: &mut W, status: u8) -> Result<()> {
    w.write_all(&[USER_PASS_VERSION, status]).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_user_pass_status<R: AsyncRead + Unpin>(r: &mut R) -> Result<u8> {
    let mut b = [0u8; 2];
    r.read_exact(&mut b).await?;
    Ok(b[1])
}

/// Command request frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub cmd: u8,
    pub addr: SocksAddr,
}

impl Request {
    pub fn new(cmd: u8, addr: SocksAddr) -> Self {
        Self { cmd, addr }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(3 + self.addr.encoded_len());
        buf.push(VERSION);
        buf.push(self.cmd);
        buf.push(0x00);
        self.addr.encode_to(&mut buf);
        buf
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<()> {
        w.write_all(&self.encode()).await?;
        w.flush().await?;
        Ok(())
    }

    pub async fn read_from<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self> {
        let mut head = [0u8; 3];
        r.read_exact(&mut head).await?;
        if head[0] != VERSION {
            return Err(Error::Protocol(format!(
                "unsupported socks version: {}",
                head[0]
            )));
        }
        let addr = SocksAddr::read_from(r).await?;
        Ok(Self { cmd: head[1], addr })
    }
}

/// Reply frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub rep: u8,
    pub addr: SocksAddr,
}

impl Reply {
    pub fn new(rep: u8, addr: Option<SocksAddr>) -> Self {
        Self {
            rep,
            addr: addr.unwrap_or_else(SocksAddr::unspecified),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(3 + self.addr.encoded_len());
        buf.push(VERSION);
        buf.push(self.rep);
        buf.push(0x00);
        self.addr.encode_to(&mut buf);
        buf
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<()> {
        w.write_all(&self.encode()).await?;
        w.flush().await?;
        Ok(())
    }

    pub async fn read_from<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self> {
        let mut head = [0u8; 3];
        r.read_exact(&mut head).await?;
        if head[0] != VERSION {
            return Err(Error::Protocol(format!(
                "unsupported socks version: {}",
                head[0]
            )));
        }
        let addr = SocksAddr::read_from(r).await?;
        Ok(Self { rep: head[1], addr })
    }
}

/// RFC 1928 §7 UDP request header around each relayed datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpHeader {
    pub frag: u8,
    pub addr: SocksAddr,
}

impl UdpHeader {
    pub fn new(addr: SocksAddr) -> Self {
        Self { frag: 0, addr }
    }

    pub fn encode(&self, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(3 + self.addr.encoded_len() + payload.len());
        buf.extend_from_slice(&[0x00, 0x00, self.frag]);
        self.addr.encode_to(&mut buf);
        buf.extend_from_slice(payload);
        buf
    }

    /// Split a datagram into header and payload offset.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < 3 {
            return Err(Error::Protocol("short socks5 udp datagram".into()));
        }
        let frag = buf[2];
        let (addr, n) = SocksAddr::decode(&buf[3..])?;
        Ok((Self { frag, addr }, 3 + n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addr_parse_format_roundtrip() {
        for s in ["1.2.3.4:80", "[2001:db8::1]:443", "example.com:1080"] {
            let a: SocksAddr = s.parse().unwrap();
            let b: SocksAddr = a.to_string().parse().unwrap();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn addr_encode_decode_roundtrip() {
        for s in ["1.2.3.4:80", "[2001:db8::1]:443", "example.com:1080"] {
            let a: SocksAddr = s.parse().unwrap();
            let mut buf = Vec::new();
            a.encode_to(&mut buf);
            let (b, n) = SocksAddr::decode(&buf).unwrap();
            assert_eq!(a, b);
            assert_eq!(n, buf.len());
        }
    }

    #[test]
    fn connect_request_bytes() {
        let req = Request::new(CMD_CONNECT, "example.com:80".parse().unwrap());
        assert_eq!(
            req.encode(),
            [
                0x05, 0x01, 0x00, 0x03, 0x0b, b'e', b'x', b'a', b'm', b'p', b'l', b'e', b'.',
                b'c', b'o', b'm', 0, 80
            ]
        );
    }

    #[tokio::test]
    async fn request_stream_roundtrip() {
        let req = Request::new(CMD_UDP_ASSOCIATE, "0.0.0.0:0".parse().unwrap());
        let mut buf = Vec::new();
        req.write_to(&mut buf).await.unwrap();
        let got = Request::read_from(&mut buf.as_slice()).await.unwrap();
        assert_eq!(req, got);
    }

    #[test]
    fn udp_header_roundtrip() {
        let hdr = UdpHeader::new("8.8.8.8:53".parse().unwrap());
        let pkt = hdr.encode(b"query");
        let (got, off) = UdpHeader::decode(&pkt).unwrap();
        assert_eq!(got, hdr);
        assert_eq!(&pkt[off..], b"query");
    }
}
