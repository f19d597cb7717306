//! Proxy configuration
//!
//! Loaded once at startup from a YAML file and shared read-only for the
//! process lifetime. The schema mirrors the `-d` sample: a listen
//! endpoint, optional listener TLS, the connection tap mode, and a user
//! directory keyed by downstream username.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// Schema sample printed by `mailgate -d`.
const CONFIG_SAMPLE: &str = r#"imap:
  addr: "ip:port"
  conn_log: "off"
  tls:
    enabled: true
    cert: "path"
    key: "path"
  users:
    <username>:
      password: "?"
      upstream:
        addr: "127.0.0.1:1233"
        tls:
          enabled: true
          skipVerify: false
        auth:
          type: plain|xoauth2
          username: "?"
          password: "?"
"#;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub imap: ImapConfig,
}

impl Config {
    /// Parse a configuration from YAML text.
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    /// Read and parse a configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("read {}: {e}", path.display())))?;
        Self::from_yaml(&text)
    }

    /// The YAML schema sample shown by the `-d` flag.
    #[must_use]
    pub const fn sample() -> &'static str {
        CONFIG_SAMPLE
    }
}

/// Listener settings and the downstream user directory.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ImapConfig {
    /// Listen endpoint, host:port.
    pub addr: String,
    pub tls: TlsServerConfig,
    pub conn_log: ConnLog,
    /// Downstream usernames are unique and case-sensitive.
    pub users: HashMap<String, UserEntry>,
}

/// Connection tap mode.
///
/// `Handshake` mirrors traffic only until the relay starts, so mail
/// bodies and upstream tokens never reach the debug sink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnLog {
    #[default]
    Off,
    On,
    Handshake,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TlsServerConfig {
    pub enabled: bool,
    pub cert: String,
    pub key: String,
}

/// One downstream user: the password the client presents, and the
/// upstream account the proxy swaps it for.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UserEntry {
    pub password: String,
    pub upstream: UpstreamConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub addr: String,
    pub tls: TlsClientConfig,
    pub auth: UpstreamAuth,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TlsClientConfig {
    pub enabled: bool,
    #[serde(rename = "skipVerify")]
    pub skip_verify: bool,
}

/// Upstream credentials. For `type: xoauth2` the `password` field
/// carries the bearer token.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UpstreamAuth {
    #[serde(rename = "type")]
    pub mechanism: String,
    pub username: String,
    pub password: String,
}
