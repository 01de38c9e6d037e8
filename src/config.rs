//! Client and server configuration.
//!
//! The client loads a JSON file; the server loads TOML. Both validate before
//! the process commits to listening.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

fn default_socks_addr() -> String {
    "127.0.0.1:1080".to_string()
}

fn default_listen_addr() -> String {
    "0.0.0.0:8443".to_string()
}

fn default_true() -> bool {
    true
}

/// Client-side configuration: local SOCKS entry and the remote server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Local address the SOCKS listener binds.
    #[serde(default = "default_socks_addr")]
    pub socks_addr: String,

    /// Remote proxy server address (`host:port`).
    pub server_addr: String,

    /// Whether the shared channel uses TLS.
    #[serde(default = "default_true")]
    pub tls: bool,

    /// PEM file with additional trusted root certificates.
    #[serde(default)]
    pub ca_file: Option<String>,

    /// Server name for TLS verification; defaults to the host part of
    /// `server_addr`.
    #[serde(default)]
    pub server_name: Option<String>,

    /// Enable debug-level logging.
    #[serde(default)]
    pub verbose: bool,
}

impl ClientConfig {
    /// Load and validate a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("failed to read {}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| Error::config(format!("failed to parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check addresses and TLS settings for obvious mistakes.
    pub fn validate(&self) -> Result<()> {
        if self.server_addr.is_empty() {
            return Err(Error::config("server_addr must not be empty"));
        }
        if !self.server_addr.contains(':') {
            return Err(Error::config(format!(
                "server_addr '{}' must be host:port",
                self.server_addr
            )));
        }
        if self.socks_addr.is_empty() {
            return Err(Error::config("socks_addr must not be empty"));
        }
        if !self.tls && (self.ca_file.is_some() || self.server_name.is_some()) {
            return Err(Error::config(
                "ca_file/server_name are set but tls is disabled",
            ));
        }
        Ok(())
    }

    /// The name the TLS handshake verifies the server certificate against.
    pub fn tls_server_name(&self) -> &str {
        match &self.server_name {
            Some(name) => name,
            None => self
                .server_addr
                .rsplit_once(':')
                .map(|(host, _)| host)
                .unwrap_or(&self.server_addr),
        }
    }
}

/// Server-side configuration: channel listener and TLS identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the channel listener binds.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Whether accepted channels are TLS.
    #[serde(default = "default_true")]
    pub tls: bool,

    /// PEM file with the server certificate chain.
    #[serde(default)]
    pub cert_file: Option<String>,

    /// PEM file with the server private key.
    #[serde(default)]
    pub key_file: Option<String>,

    /// Enable debug-level logging.
    #[serde(default)]
    pub verbose: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            tls: true,
            cert_file: Some("server.crt".to_string()),
            key_file: Some("server.key".to_string()),
            verbose: false,
        }
    }
}

impl ServerConfig {
    /// Load and validate a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("failed to read {}: {}", path.display(), e)))?;
        let config: Self = toml::from_str(&raw)
            .map_err(|e| Error::config(format!("failed to parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the listener address and TLS identity for obvious mistakes.
    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.is_empty() {
            return Err(Error::config("listen_addr must not be empty"));
        }
        if self.tls && (self.cert_file.is_none() || self.key_file.is_none()) {
            return Err(Error::config(
                "tls is enabled but cert_file/key_file are missing",
            ));
        }
        Ok(())
    }
}
