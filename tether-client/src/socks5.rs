//! Dialing a provider through a SOCKS5 proxy.
//!
//! A [`Socks5Config`] on [`crate::TransportConfig::socks5`] makes every dial
//! of that transport go through the proxy. In a config file:
//!
//! ```json
//! "transport": {
//!   "socks5": { "proxy_addr": "127.0.0.1:1080", "auth": { "username": "u", "password": "p" } }
//! }
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;

use crate::{ConfigError, ConnError};

/// Longest username or password the SOCKS5 sub-negotiation can carry.
const MAX_CREDENTIAL_LEN: usize = 255;

/// Username/password for proxies that require them.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Socks5Auth {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Socks5Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socks5Auth")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Where the proxy is and how to log in to it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Socks5Config {
    /// `host:port` of the proxy.
    pub proxy_addr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth:       Option<Socks5Auth>,
}

impl Socks5Config {
    pub fn new(proxy_addr: impl Into<String>) -> Self {
        Self { proxy_addr: proxy_addr.into(), auth: None }
    }

    pub fn with_auth(
        proxy_addr: impl Into<String>,
        username:   impl Into<String>,
        password:   impl Into<String>,
    ) -> Self {
        Self {
            proxy_addr: proxy_addr.into(),
            auth: Some(Socks5Auth { username: username.into(), password: password.into() }),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.proxy_addr.trim().is_empty() {
            return Err(ConfigError::Invalid("`socks5.proxy_addr` is empty".into()));
        }
        if let Some(auth) = &self.auth {
            if auth.username.is_empty() || auth.username.len() > MAX_CREDENTIAL_LEN {
                return Err(ConfigError::Invalid(format!(
                    "`socks5.auth.username` must be 1 to {MAX_CREDENTIAL_LEN} bytes"
                )));
            }
            if auth.password.len() > MAX_CREDENTIAL_LEN {
                return Err(ConfigError::Invalid(format!(
                    "`socks5.auth.password` must be at most {MAX_CREDENTIAL_LEN} bytes"
                )));
            }
        }
        Ok(())
    }

    /// Open a tunnel to `target` through the proxy.
    ///
    /// Every failure, including the proxy being unreachable, is reported
    /// as [`ConnError::Proxy`].
    pub async fn connect(&self, target: &str) -> Result<TcpStream, ConnError> {
        tracing::debug!("[socks5] Dialing {target} via {}", self.proxy_addr);
        let proxy = self.proxy_addr.as_str();
        let tunnel = match &self.auth {
            None       => Socks5Stream::connect(proxy, target).await,
            Some(auth) => Socks5Stream::connect_with_password(proxy, target, &auth.username, &auth.password).await,
        };
        match tunnel {
            Ok(stream) => {
                tracing::info!("[socks5] Tunnel to {target} via {proxy} ✓");
                Ok(stream.into_inner())
            }
            Err(e) => {
                tracing::warn!("[socks5] {proxy} could not reach {target}: {e}");
                Err(ConnError::Proxy { proxy: self.proxy_addr.clone(), message: e.to_string() })
            }
        }
    }
}
