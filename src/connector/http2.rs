//! HTTP/2 CONNECT connector
//!
//! Runs on top of a proxy-mode HTTP/2 dial: the shared client handle is
//! taken from the connection envelope and a CONNECT stream is opened per
//! tunnel, with optional basic proxy authorization.

use async_trait::async_trait;
use http::StatusCode;
use tracing::debug;

use crate::common::{Address, Conn, Network};
use crate::error::{Error, Result};
use crate::transport::H2ClientHandle;
use crate::util::basic_auth;

use super::Connector;

#[derive(Default)]
pub struct Http2Connector {
    username: Option<String>,
    password: Option<String>,
}

impl Http2Connector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_auth(mut self, username: Option<String>, password: Option<String>) -> Self {
        self.username = username;
        self.password = password;
        self
    }
}

#[async_trait]
impl Connector for Http2Connector {
    async fn connect(&self, conn: Conn, network: Network, addr: &Address) -> Result<Conn> {
        debug!("connect {}/{} via http2", addr, network);

        let handle = conn
            .envelope
            .get::<H2ClientHandle>()
            .ok_or_else(|| Error::Protocol("http2: connection carries no client".into()))?;

        let mut headers = Vec::new();
        if let (Some(user), Some(pass)) = (&self.username, &self.password) {
            headers.push((
                "proxy-authorization".to_string(),
                format!("Basic {}", basic_auth(user, pass)),
            ));
        }

        let (status, stream) = handle.connect(&addr.to_string(), &headers).await?;
        if status != StatusCode::OK {
            return Err(Error::Handshake(format!("http2 connect: {}", status)));
        }

        Ok(Conn {
            stream,
            local: conn.local,
            peer: addr.clone(),
            envelope: conn.envelope,
        })
    }
}
