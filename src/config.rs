//! Client-wide configuration.
//!
//! A [`ClientConfig`] carries everything the connection needs besides the endpoint:
//! optional credentials for the handshake, optional TLS settings and socket options.
//!
//! # Example
//! ```rust
//! use std::time::Duration;
//! use thinwire::config::{ClientConfig, TlsConfig, TransportOptions};
//!
//! let config = ClientConfig::default()
//!     .with_credentials("ignite", "secret")
//!     .with_tls(TlsConfig::default())
//!     .with_transport(TransportOptions {
//!         connect_timeout: Duration::from_secs(3),
//!         ..TransportOptions::default()
//!     });
//!
//! assert!(config.validate().is_ok());
//! ```
use std::{fmt, path::PathBuf, time::Duration};

use crate::error::{ClientError, Result};

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsConfig {
    /// Extra PEM bundle trusted in addition to the platform roots.
    pub ca_file: Option<PathBuf>,
    /// Name presented for SNI and certificate checks; defaults to the endpoint host.
    pub server_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOptions {
    pub connect_timeout: Duration,
    pub tcp_nodelay: bool,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            tcp_nodelay: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientConfig {
    pub credentials: Option<Credentials>,
    pub tls: Option<TlsConfig>,
    pub transport: TransportOptions,
}

impl ClientConfig {
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.credentials = Some(Credentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_transport(mut self, transport: TransportOptions) -> Self {
        self.transport = transport;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.transport.connect_timeout.is_zero() {
            return Err(ClientError::IllegalArgument(
                "connect timeout must be greater than zero".to_string(),
            ));
        }
        if let Some(credentials) = &self.credentials {
            if credentials.username.is_empty() {
                return Err(ClientError::IllegalArgument(
                    "username must not be empty".to_string(),
                ));
            }
        }
        Ok(())
    }
}
