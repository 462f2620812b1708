//! Configuration
//!
//! Settings for the client and server proxies. The CLI populates this from
//! flags; a JSON file round-trip is supported for embedding deployments.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Which proxy role to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Client,
    Server,
}

/// Proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Proxy role
    pub mode: Mode,

    /// Local bind address. Clients listen here for plain TCP; servers
    /// listen here for covertext sessions. A bare IP takes its port from
    /// the document.
    pub bind: String,

    /// Server IP the client dials (port comes from the document)
    pub server_host: String,

    /// Format name, optionally `name:version`
    pub format: String,

    /// Address the server proxies application streams to
    pub proxy_target: String,

    /// Multiplier applied to `model.sleep` delays
    pub sleep_factor: f64,

    /// Log level name
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Client,
            bind: "127.0.0.1:8079".into(),
            server_host: "127.0.0.1".into(),
            format: String::new(),
            proxy_target: "127.0.0.1:8080".into(),
            sleep_factor: 1.0,
            log_level: "info".into(),
        }
    }
}

impl Config {
    /// Client-role configuration
    pub fn client(format: &str) -> Self {
        Self { format: format.into(), ..Self::default() }
    }

    /// Server-role configuration
    pub fn server(format: &str) -> Self {
        Self {
            mode: Mode::Server,
            bind: "127.0.0.1:8081".into(),
            format: format.into(),
            ..Self::default()
        }
    }

    /// Load configuration from a JSON file
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::InvalidConfiguration(e.to_string()))?;
        serde_json::from_str(&content).map_err(|e| Error::InvalidConfiguration(e.to_string()))
    }

    /// Save configuration to a JSON file
    pub fn save(&self, path: &std::path::Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| Error::InvalidConfiguration(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| Error::InvalidConfiguration(e.to_string()))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.format.is_empty() {
            return Err(Error::InvalidConfiguration("format required".into()));
        }
        if self.bind.is_empty() {
            return Err(Error::InvalidConfiguration("bind address required".into()));
        }
        if self.sleep_factor <= 0.0 {
            return Err(Error::InvalidConfiguration(format!(
                "sleep factor must be positive, got {}",
                self.sleep_factor
            )));
        }
        if self.mode == Mode::Server && self.proxy_target.is_empty() {
            return Err(Error::InvalidConfiguration("proxy target required".into()));
        }
        Ok(())
    }
}
