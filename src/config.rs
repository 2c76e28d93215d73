//! Configuration
//!
//! JSON configuration describing services (listener + handler) and
//! chains (hops of dialer + connector). Durations are seconds.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub log: LogConfig,
    pub api: Option<ApiConfig>,
    pub services: Vec<ServiceConfig>,
    pub chains: Vec<ChainConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Stats API endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiConfig {
    pub listen: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceConfig {
    pub name: String,
    pub addr: String,
    pub listener: ListenerConfig,
    pub handler: HandlerConfig,
    /// Chain carrying this service's outbound dials.
    pub chain: Option<String>,
    /// Fixed upstream for forwarding services (tap/tun).
    pub forward: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ListenerConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub tls: Option<TlsSettings>,

    // http-family routing
    pub path: Option<String>,
    pub host: Option<String>,
    pub header: HashMap<String, String>,
    pub rewrite: Option<RewriteSettings>,

    // queueing and timings
    pub backlog: Option<usize>,
    pub keep_alive: Option<u64>,
    pub handshake_timeout: Option<u64>,
    pub max_idle_timeout: Option<u64>,
    pub max_streams: Option<u32>,

    // ssh / kcp identity
    pub passphrase: Option<String>,
    pub private_key_file: Option<String>,
    pub authorized_keys: Option<String>,

    // virtual interface
    pub name: Option<String>,
    pub net: Vec<String>,
    pub mtu: Option<u32>,
    pub gw: Option<String>,
    pub routes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct TlsSettings {
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
    pub server_name: Option<String>,
    pub insecure: bool,
    pub alpn: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct RewriteSettings {
    pub target: String,
    pub path_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct HandlerConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub auth: Option<AuthSettings>,

    // socks5
    pub enable_bind: bool,
    #[serde(rename = "enableUDP")]
    pub enable_udp: bool,
    pub udp_buffer_size: Option<usize>,
    pub compatibility_mode: bool,
    pub handshake_timeout: Option<u64>,

    // tun membership
    pub passphrase: Option<String>,
    pub keep_alive_period: Option<u64>,

    /// Host prefixes exempted from proxying.
    pub bypass: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthSettings {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ChainConfig {
    pub name: String,
    pub hops: Vec<HopConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct HopConfig {
    pub name: String,
    pub addr: String,
    pub dialer: DialerConfig,
    pub connector: ConnectorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct DialerConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub tls: Option<TlsSettings>,

    pub path: Option<String>,
    pub host: Option<String>,
    pub header: HashMap<String, String>,

    pub keep_alive: Option<u64>,
    pub handshake_timeout: Option<u64>,
    pub max_idle_timeout: Option<u64>,
    pub max_streams: Option<u32>,

    pub passphrase: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub private_key_file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectorConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub auth: Option<AuthSettings>,

    // relay
    pub no_delay: bool,
    /// 32 hex characters
    pub tunnel_id: Option<String>,

    // socks5 extension methods
    pub enable_tls: bool,
    pub tls_only: bool,
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file: {}", e)))?;
        Self::from_json(&content)
    }

    /// Parse configuration from JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))
    }

    /// A client-side starting point: local SOCKS5 front, relay upstream.
    pub fn default_client() -> Self {
        Config {
            services: vec![ServiceConfig {
                name: "socks".to_string(),
                addr: "127.0.0.1:1080".to_string(),
                listener: ListenerConfig {
                    kind: "tcp".to_string(),
                    ..Default::default()
                },
                handler: HandlerConfig {
                    kind: "socks5".to_string(),
                    enable_udp: true,
                    ..Default::default()
                },
                chain: Some("upstream".to_string()),
                forward: None,
            }],
            chains: vec![ChainConfig {
                name: "upstream".to_string(),
                hops: vec![HopConfig {
                    name: "hop0".to_string(),
                    addr: "server.example.com:8443".to_string(),
                    dialer: DialerConfig {
                        kind: "tls".to_string(),
                        ..Default::default()
                    },
                    connector: ConnectorConfig {
                        kind: "relay".to_string(),
                        ..Default::default()
                    },
                }],
            }],
            ..Default::default()
        }
    }

    /// A server-side starting point: relay over TLS.
    pub fn default_server() -> Self {
        Config {
            services: vec![ServiceConfig {
                name: "relay".to_string(),
                addr: "0.0.0.0:8443".to_string(),
                listener: ListenerConfig {
                    kind: "tcp".to_string(),
                    ..Default::default()
                },
                handler: HandlerConfig {
                    kind: "socks5".to_string(),
                    enable_bind: true,
                    enable_udp: true,
                    ..Default::default()
                },
                ..Default::default()
            }],
            ..Default::default()
        }
    }
}

pub(crate) fn seconds(value: Option<u64>) -> Option<Duration> {
    value.map(Duration::from_secs)
}

/// Decode a 32-hex-character tunnel id.
pub(crate) fn parse_tunnel_id(value: &str) -> Result<[u8; 16]> {
    let cleaned: String = value.chars().filter(|c| *c != '-').collect();
    if cleaned.len() != 32 {
        return Err(Error::Config(format!("invalid tunnel id: {}", value)));
    }
    let mut id = [0u8; 16];
    for (i, chunk) in cleaned.as_bytes().chunks_exact(2).enumerate() {
        let hex = std::str::from_utf8(chunk).map_err(|_| {
            Error::Config(format!("invalid tunnel id: {}", value))
        })?;
        id[i] = u8::from_str_radix(hex, 16)
            .map_err(|_| Error::Config(format!("invalid tunnel id: {}", value)))?;
    }
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_service_with_handler_options() {
        let json = r#"{
            "services": [{
                "name": "socks",
                "addr": ":1080",
                "listener": {"type": "ws", "path": "/tunnel", "backlog": 64},
                "handler": {"type": "socks5", "enableBind": true, "enableUDP": true,
                            "udpBufferSize": 8192, "compatibilityMode": false}
            }],
            "chains": [{
                "name": "up",
                "hops": [{"name": "h0", "addr": "relay.example:443",
                          "dialer": {"type": "tls"},
                          "connector": {"type": "relay", "noDelay": true}}]
            }]
        }"#;
        let config = Config::from_json(json).unwrap();
        assert_eq!(config.services.len(), 1);
        let svc = &config.services[0];
        assert_eq!(svc.listener.kind, "ws");
        assert_eq!(svc.listener.path.as_deref(), Some("/tunnel"));
        assert!(svc.handler.enable_bind);
        assert!(svc.handler.enable_udp);
        assert_eq!(svc.handler.udp_buffer_size, Some(8192));
        assert!(config.chains[0].hops[0].connector.no_delay);
    }

    #[test]
    fn default_configs_roundtrip() {
        for config in [Config::default_client(), Config::default_server()] {
            let json = serde_json::to_string(&config).unwrap();
            let back = Config::from_json(&json).unwrap();
            assert_eq!(back.services.len(), config.services.len());
        }
    }

    #[test]
    fn tunnel_id_parsing() {
        let id = parse_tunnel_id("00112233445566778899aabbccddeeff").unwrap();
        assert_eq!(id[0], 0x00);
        assert_eq!(id[15], 0xff);
        // uuid form is tolerated
        assert!(parse_tunnel_id("00112233-4455-6677-8899-aabbccddeeff").is_ok());
        assert!(parse_tunnel_id("short").is_err());
    }
}
