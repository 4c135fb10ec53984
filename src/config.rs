//! Configuration loading and persistence.
//!
//! Reads `config.json` from the socket-call config directory and applies
//! `SOCKET_CALL_*` environment overrides on top.
//!
//! Rust guideline compliant 2026-02

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::time::Duration;
use std::{fs, path::PathBuf};

use crate::transport::ConnectOptions;

/// Configuration for socket-call clients and the demo server.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Root URL of the socket server.
    pub server_url: String,
    /// Handshake timeout in milliseconds.
    pub timeout_ms: u64,
    /// Allowed transports.
    pub transports: Vec<String>,
    /// Whether namespaces may share a connection.
    pub multiplex: bool,
    /// Whether to reconnect after the link drops.
    pub reconnection: bool,
    /// Lifetime of cached responses, in seconds.
    pub cache_ttl_secs: u64,
    /// File backing the response cache. No file means an in-memory cache.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_path: Option<PathBuf>,
    /// Session token - NOT serialized to disk (env only).
    #[serde(skip)]
    pub token: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:3000".to_string(),
            timeout_ms: 1000,
            transports: vec!["websocket".to_string()],
            multiplex: false,
            reconnection: true,
            cache_ttl_secs: 300,
            cache_path: None,
            token: None,
        }
    }
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// Directory selection priority:
    /// 1. `#[cfg(test)]` (unit tests): `tmp/socket-call-test`
    /// 2. `SOCKET_CALL_CONFIG_DIR` env var: explicit override
    /// 3. Default: platform config dir (Linux: ~/.config/socket-call)
    pub fn config_dir() -> Result<PathBuf> {
        let dir = {
            #[cfg(test)]
            {
                PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tmp/socket-call-test")
            }

            #[cfg(not(test))]
            {
                if let Ok(dir) = std::env::var("SOCKET_CALL_CONFIG_DIR") {
                    PathBuf::from(dir)
                } else {
                    dirs::config_dir()
                        .context("Could not determine config directory")?
                        .join("socket-call")
                }
            }
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        Ok(dir)
    }

    /// Loads configuration from file, with environment variable overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file().unwrap_or_else(|e| {
            log::debug!("Using default config: {}", e);
            Self::default()
        });
        config.apply_env_overrides();
        Ok(config)
    }

    fn load_from_file() -> Result<Self> {
        let config_path = Self::config_dir()?.join("config.json");
        if config_path.exists() {
            let content = fs::read_to_string(&config_path)?;
            serde_json::from_str(&content)
                .with_context(|| format!("Invalid config file {}", config_path.display()))
        } else {
            anyhow::bail!("Config file not found")
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(server_url) = std::env::var("SOCKET_CALL_SERVER_URL") {
            self.server_url = server_url;
        }

        if let Ok(token) = std::env::var("SOCKET_CALL_TOKEN") {
            self.token = Some(token).filter(|t| !t.is_empty());
        }

        if let Ok(timeout) = std::env::var("SOCKET_CALL_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse::<u64>() {
                self.timeout_ms = ms;
            }
        }

        if let Ok(ttl) = std::env::var("SOCKET_CALL_CACHE_TTL_SECS") {
            if let Ok(secs) = ttl.parse::<u64>() {
                self.cache_ttl_secs = secs;
            }
        }

        if let Ok(path) = std::env::var("SOCKET_CALL_CACHE_PATH") {
            self.cache_path = Some(PathBuf::from(path)).filter(|p| !p.as_os_str().is_empty());
        }
    }

    /// Persists the current configuration to disk.
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_dir()?.join("config.json");
        fs::write(&config_path, serde_json::to_string_pretty(self)?)?;

        // Set restrictive permissions (owner read/write only)
        #[cfg(unix)]
        fs::set_permissions(&config_path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// Cache entry lifetime.
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    /// Transport options shared by every namespace.
    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            timeout: Duration::from_millis(self.timeout_ms),
            transports: self.transports.clone(),
            multiplex: self.multiplex,
            reconnection: self.reconnection,
            ..ConnectOptions::default()
        }
    }
}
