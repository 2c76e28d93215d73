//! Address type for network connections

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

use crate::error::Error;

/// Network type carried by dial requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Network {
    #[default]
    Tcp,
    Udp,
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Network::Tcp => write!(f, "tcp"),
            Network::Udp => write!(f, "udp"),
        }
    }
}

/// Network address representation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// IP socket address (IP + port)
    Socket(SocketAddr),
    /// Domain name with port
    Domain(String, u16),
}

impl Address {
    /// Create an unspecified address (0.0.0.0:0)
    pub fn unspecified() -> Self {
        Address::Socket(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))
    }

    /// Create from domain and port
    pub fn domain(domain: impl Into<String>, port: u16) -> Self {
        Address::Domain(domain.into(), port)
    }

    /// Create from IP and port
    pub fn ip_port(ip: IpAddr, port: u16) -> Self {
        Address::Socket(SocketAddr::new(ip, port))
    }

    /// Get the port
    pub fn port(&self) -> u16 {
        match self {
            Address::Socket(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }

    /// Get the host part as string
    pub fn host(&self) -> String {
        match self {
            Address::Socket(addr) => addr.ip().to_string(),
            Address::Domain(domain, _) => domain.clone(),
        }
    }

    /// Check if this is a domain address
    pub fn is_domain(&self) -> bool {
        matches!(self, Address::Domain(_, _))
    }

    /// True for the empty/unspecified placeholder used by UDP associations
    pub fn is_unspecified(&self) -> bool {
        match self {
            Address::Socket(addr) => addr.ip().is_unspecified() && addr.port() == 0,
            Address::Domain(domain, port) => domain.is_empty() && *port == 0,
        }
    }

    /// Try to get as socket address (fails for domain)
    pub fn as_socket(&self) -> Option<SocketAddr> {
        match self {
            Address::Socket(addr) => Some(*addr),
            Address::Domain(_, _) => None,
        }
    }

    /// Replace the host, keeping the port
    pub fn with_host(&self, host: &str) -> Address {
        match host.parse::<IpAddr>() {
            Ok(ip) => Address::ip_port(ip, self.port()),
            Err(_) => Address::domain(host, self.port()),
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Socket(addr) => write!(f, "{}", addr),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Address::Socket(addr));
        }
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidAddress(s.to_string()))?;
        let port: u16 = port
            .parse()
            .map_err(|_| Error::InvalidAddress(s.to_string()))?;
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(Address::Socket(SocketAddr::new(ip, port)));
        }
        if host.is_empty() {
            return Ok(Address::ip_port(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));
        }
        Ok(Address::Domain(host.to_string(), port))
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::Socket(addr)
    }
}

impl From<(String, u16)> for Address {
    fn from((domain, port): (String, u16)) -> Self {
        Address::Domain(domain, port)
    }
}

impl From<(&str, u16)> for Address {
    fn from((domain, port): (&str, u16)) -> Self {
        Address::Domain(domain.to_string(), port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_socket_and_domain() {
        let a: Address = "127.0.0.1:8080".parse().unwrap();
        assert_eq!(a, Address::Socket("127.0.0.1:8080".parse().unwrap()));

        let a: Address = "example.com:443".parse().unwrap();
        assert_eq!(a, Address::domain("example.com", 443));

        let a: Address = "[::1]:53".parse().unwrap();
        assert_eq!(a.port(), 53);
        assert!(!a.is_domain());
    }

    #[test]
    fn parse_empty_host_binds_any() {
        let a: Address = ":9000".parse().unwrap();
        assert_eq!(a, Address::ip_port(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 9000));
    }

    #[test]
    fn rejects_garbage() {
        assert!("no-port".parse::<Address>().is_err());
        assert!("host:notaport".parse::<Address>().is_err());
    }

    #[test]
    fn with_host_keeps_port() {
        let a: Address = "0.0.0.0:7000".parse().unwrap();
        assert_eq!(a.with_host("192.168.1.2").to_string(), "192.168.1.2:7000");
    }
}
