//! YAML configuration file format: listen address lists for each
//! protocol, an optional SOCKS5 credential pair, and a log file path.
//! All keys are optional except the address lists, which may
//! themselves be empty (an empty file still parses).

use crate::error::{ProxyError, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// `host:port` addresses for the HTTP/HTTPS proxy listeners.
    pub http_proxy_addrs: Vec<String>,
    /// `host:port` addresses for the SOCKS5 proxy listeners.
    pub socks_proxy_addrs: Vec<String>,
    /// SOCKS5 username; user/pass auth is enabled only when both this
    /// and `socks_password` are set.
    pub socks_username: Option<String>,
    pub socks_password: Option<String>,
    /// Log file path; `None` logs to stderr only.
    pub log_path: Option<String>,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|err| {
            ProxyError::Config(format!("failed to read {}: {err}", path.display()))
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        serde_yaml::from_str(text)
            .map_err(|err| ProxyError::Config(format!("invalid configuration: {err}")))
    }

    /// `Some(credentials)` only when both username and password are set.
    pub fn socks_credentials(&self) -> Option<(String, String)> {
        match (&self.socks_username, &self.socks_password) {
            (Some(user), Some(pass)) => Some((user.clone(), pass.clone())),
            _ => None,
        }
    }
}
