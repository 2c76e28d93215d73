//! Relay tunnel wire protocol
//!
//! Compact binary handshake spoken between relay connectors and relay
//! servers:
//!
//! ```text
//! { Version:u8 = 1, Cmd:u8 | Flags, FeatureCount:u8,
//!   Features: [ FeatureID:u8, Len:u16be, Body[Len] ] }
//! ```
//!
//! The response reuses the frame with a status byte in place of the
//! command. UDP payloads tunneled over a stream are framed as
//! `Addr || u16be length || payload`.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

use super::socks5::SocksAddr;

pub const VERSION: u8 = 0x01;

pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_BIND: u8 = 0x02;
/// Flag bit marking a UDP request; OR-ed into the command byte.
pub const FLAG_UDP: u8 = 0x80;

pub const STATUS_OK: u8 = 0x00;
pub const STATUS_BAD_REQUEST: u8 = 0x01;
pub const STATUS_UNAUTHORIZED: u8 = 0x02;
pub const STATUS_FORBIDDEN: u8 = 0x03;
pub const STATUS_TIMEOUT: u8 = 0x04;
pub const STATUS_FAILED: u8 = 0x05;
pub const STATUS_NETWORK_UNREACHABLE: u8 = 0x06;
pub const STATUS_HOST_UNREACHABLE: u8 = 0x07;

const FEATURE_USER_AUTH: u8 = 0x01;
const FEATURE_ADDR: u8 = 0x02;
const FEATURE_TUNNEL: u8 = 0x03;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Feature {
    UserAuth { username: String, password: String },
    Addr(SocksAddr),
    Tunnel([u8; 16]),
}

impl Feature {
    fn id(&self) -> u8 {
        match self {
            Feature::UserAuth { .. } => FEATURE_USER_AUTH,
            Feature::Addr(_) => FEATURE_ADDR,
            Feature::Tunnel(_) => FEATURE_TUNNEL,
        }
    }

    fn encode_body(&self) -> Vec<u8> {
        match self {
            Feature::UserAuth { username, password } => {
                let mut b = Vec::with_capacity(2 + username.len() + password.len());
                b.push(username.len() as u8);
                b.extend_from_slice(username.as_bytes());
                b.push(password.len() as u8);
                b.extend_from_slice(password.as_bytes());
                b
            }
            Feature::Addr(addr) => {
                let mut b = Vec::with_capacity(addr.encoded_len());
                addr.encode_to(&mut b);
                b
            }
            Feature::Tunnel(id) => id.to_vec(),
        }
    }

    fn decode(id: u8, body: &[u8]) -> Result<Self> {
        let short = || Error::Protocol("short relay feature".into());
        match id {
            FEATURE_USER_AUTH => {
                let ulen = *body.first().ok_or_else(short)? as usize;
                let user = body.get(1..1 + ulen).ok_or_else(short)?;
                let plen = *body.get(1 + ulen).ok_or_else(short)? as usize;
                let pass = body.get(2 + ulen..2 + ulen + plen).ok_or_else(short)?;
                Ok(Feature::UserAuth {
                    username: String::from_utf8_lossy(user).into_owned(),
                    password: String::from_utf8_lossy(pass).into_owned(),
                })
            }
            FEATURE_ADDR => {
                let (addr, _) = SocksAddr::decode(body)?;
                Ok(Feature::Addr(addr))
            }
            FEATURE_TUNNEL => {
                let id: [u8; 16] = body
                    .try_into()
                    .map_err(|_| Error::Protocol("bad tunnel id length".into()))?;
                Ok(Feature::Tunnel(id))
            }
            _ => Err(Error::Protocol(format!("unknown relay feature: {}", id))),
        }
    }
}

fn encode_frame(version: u8, code: u8, features: &[Feature]) -> Vec<u8> {
    let mut buf = vec![version, code, features.len() as u8];
    for f in features {
        let body = f.encode_body();
        buf.push(f.id());
        buf.extend_from_slice(&(body.len() as u16).to_be_bytes());
        buf.extend_from_slice(&body);
    }
    buf
}

async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<(u8, Vec<Feature>)> {
    let mut head = [0u8; 3];
    r.read_exact(&mut head).await?;
    if head[0] != VERSION {
        return Err(Error::Protocol(format!(
            "unsupported relay version: {}",
            head[0]
        )));
    }
    let mut features = Vec::with_capacity(head[2] as usize);
    for _ in 0..head[2] {
        let id = r.read_u8().await?;
        let len = r.read_u16().await? as usize;
        let mut body = vec![0u8; len];
        r.read_exact(&mut body).await?;
        features.push(Feature::decode(id, &body)?);
    }
    Ok((head[1], features))
}

/// Relay request: command byte (possibly OR-ed with [`FLAG_UDP`]) plus
/// features.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub cmd: u8,
    pub features: Vec<Feature>,
}

impl Request {
    pub fn new(cmd: u8) -> Self {
        Self {
            cmd,
            features: Vec::new(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        encode_frame(VERSION, self.cmd, &self.features)
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<()> {
        w.write_all(&self.encode()).await?;
        w.flush().await?;
        Ok(())
    }

    pub async fn read_from<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self> {
        let (cmd, features) = read_frame(r).await?;
        Ok(Self { cmd, features })
    }

    pub fn addr(&self) -> Option<&SocksAddr> {
        self.features.iter().find_map(|f| match f {
            Feature::Addr(a) => Some(a),
            _ => None,
        })
    }

    pub fn user_auth(&self) -> Option<(&str, &str)> {
        self.features.iter().find_map(|f| match f {
            Feature::UserAuth { username, password } => {
                Some((username.as_str(), password.as_str()))
            }
            _ => None,
        })
    }
}

/// Relay response: status byte plus features.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u8,
    pub features: Vec<Feature>,
}

impl Response {
    pub fn new(status: u8) -> Self {
        Self {
            status,
            features: Vec::new(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        encode_frame(VERSION, self.status, &self.features)
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<()> {
        w.write_all(&self.encode()).await?;
        w.flush().await?;
        Ok(())
    }

    pub async fn read_from<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self> {
        let (status, features) = read_frame(r).await?;
        Ok(Self { status, features })
    }
}

/// Write one tunneled datagram: address, 16-bit length, payload.
pub async fn write_datagram<W: AsyncWrite + Unpin>(
    w: &mut W,
    addr: &SocksAddr,
    payload: &[u8],
) -> Result<()> {
    if payload.len() > u16::MAX as usize {
        return Err(Error::Protocol("datagram too large".into()));
    }
    let mut buf = Vec::with_capacity(addr.encoded_len() + 2 + payload.len());
    addr.encode_to(&mut buf);
    buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    buf.extend_from_slice(payload);
    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}

/// Read one tunneled datagram into `buf`; oversized payloads are truncated.
pub async fn read_datagram<R: AsyncRead + Unpin>(
    r: &mut R,
    buf: &mut [u8],
) -> Result<(usize, SocksAddr)> {
    let addr = SocksAddr::read_from(r).await?;
    let len = r.read_u16().await? as usize;
    let n = len.min(buf.len());
    r.read_exact(&mut buf[..n]).await?;
    // drain the remainder so the stream does not desync
    let mut rest = len - n;
    let mut sink = [0u8; 512];
    while rest > 0 {
        let k = rest.min(sink.len());
        r.read_exact(&mut sink[..k]).await?;
        rest -= k;
    }
    Ok((n, addr))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_features() -> Vec<Vec<Feature>> {
        let auth = Feature::UserAuth {
            username: "ray".into(),
            password: "secret".into(),
        };
        let addr = Feature::Addr("example.com:443".parse().unwrap());
        let tunnel = Feature::Tunnel([7u8; 16]);
        vec![
            vec![],
            vec![addr.clone()],
            vec![auth.clone(), addr.clone()],
            vec![auth, addr, tunnel],
        ]
    }

    #[tokio::test]
    async fn request_roundtrip_all_feature_combinations() {
        for features in sample_features() {
            for cmd in [CMD_CONNECT, CMD_BIND, CMD_CONNECT | FLAG_UDP, CMD_BIND | FLAG_UDP] {
                let req = Request { cmd, features: features.clone() };
                let bytes = req.encode();
                let got = Request::read_from(&mut bytes.as_slice()).await.unwrap();
                assert_eq!(req, got);
            }
        }
    }

    #[tokio::test]
    async fn response_roundtrip() {
        let mut resp = Response::new(STATUS_OK);
        resp.features.push(Feature::Addr("1.2.3.4:9000".parse().unwrap()));
        let bytes = resp.encode();
        let got = Response::read_from(&mut bytes.as_slice()).await.unwrap();
        assert_eq!(resp, got);
    }

    #[tokio::test]
    async fn rejects_wrong_version() {
        let mut bytes = Request::new(CMD_CONNECT).encode();
        bytes[0] = 0x02;
        assert!(Request::read_from(&mut bytes.as_slice()).await.is_err());
    }

    #[tokio::test]
    async fn datagram_roundtrip_and_truncation() {
        let addr: SocksAddr = "8.8.4.4:53".parse().unwrap();
        let mut wire = Vec::new();
        write_datagram(&mut wire, &addr, b"0123456789").await.unwrap();
        write_datagram(&mut wire, &addr, b"after").await.unwrap();

        let mut r = wire.as_slice();
        let mut small = [0u8; 4];
        let (n, got) = read_datagram(&mut r, &mut small).await.unwrap();
        assert_eq!((n, &small[..n]), (4, &b"0123"[..]));
        assert_eq!(got, addr);

        // the loop stays in sync after a truncated packet
        let mut buf = [0u8; 64];
        let (n, _) = read_datagram(&mut r, &mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"after");
    }
}
