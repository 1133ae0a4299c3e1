//! Configuration loading and persistence.
//!
//! Handles reading and writing the session configuration file. The access
//! token itself never lives here; it is persisted by the credential storage
//! backend selected with `token_storage`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::time::Duration;
use std::{fs, path::PathBuf};

use crate::push::BackoffPolicy;

/// Path of the push hub relative to the server root.
const HUB_PATH: &str = "/hubs/document-processing";

/// Where the access token and session cookies are persisted.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TokenStorageKind {
    /// OS keyring (macOS keychain, Secret Service).
    #[default]
    Keyring,
    /// `credentials.json` in the config directory.
    File,
    /// Process memory only; nothing survives a restart.
    Memory,
}

impl std::str::FromStr for TokenStorageKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "keyring" => Ok(Self::Keyring),
            "file" => Ok(Self::File),
            "memory" => Ok(Self::Memory),
            other => anyhow::bail!("unknown token storage '{other}' (expected keyring, file or memory)"),
        }
    }
}

/// Configuration for the session layer.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct Config {
    /// Base URL of the REST API, including the `/api` prefix.
    pub api_url: String,
    /// Timeout in seconds for ordinary API requests.
    pub request_timeout_secs: u64,
    /// Timeout in seconds for the token refresh call.
    pub refresh_timeout_secs: u64,
    /// Delays between consecutive push reconnection attempts. The last
    /// entry is the ceiling and repeats once the schedule is exhausted.
    pub reconnect_delays_ms: Vec<u64>,
    /// Seconds of continuous reconnecting after which the channel is
    /// reported as persistently disconnected. `None` relies on the
    /// schedule alone.
    pub persistent_disconnect_after_secs: Option<u64>,
    /// Interval in seconds between client keep-alive pings on the hub.
    pub keepalive_interval_secs: u64,
    /// Seconds without any server traffic before the hub is considered gone.
    pub server_timeout_secs: u64,
    /// Seconds allowed for negotiate + WebSocket + hub handshake.
    pub handshake_timeout_secs: u64,
    /// Connect straight to the WebSocket endpoint without negotiating.
    pub skip_negotiation: bool,
    /// Credential storage backend.
    pub token_storage: TokenStorageKind,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:5000/api".to_string(),
            request_timeout_secs: 30,
            refresh_timeout_secs: 15,
            reconnect_delays_ms: vec![0, 2_000, 5_000, 10_000, 30_000],
            persistent_disconnect_after_secs: Some(120),
            keepalive_interval_secs: 15,
            server_timeout_secs: 30,
            handshake_timeout_secs: 15,
            skip_negotiation: false,
            token_storage: TokenStorageKind::default(),
        }
    }
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// `ACORD_CONFIG_DIR` overrides the platform config directory.
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = std::env::var("ACORD_CONFIG_DIR") {
            PathBuf::from(dir)
        } else {
            dirs::config_dir()
                .context("Could not determine config directory")?
                .join("acord-session")
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config directory {}", dir.display()))?;
        Ok(dir)
    }

    /// Loads configuration from file, with environment variable overrides.
    pub fn load() -> Result<Self> {
        let mut config = match Self::load_from_file() {
            Ok(Some(config)) => config,
            Ok(None) => Self::default(),
            Err(e) => {
                log::warn!("Ignoring unreadable config file: {e:#}");
                Self::default()
            }
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn load_from_file() -> Result<Option<Self>> {
        let config_path = Self::config_dir()?.join("config.json");
        if !config_path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        let config = serde_json::from_str(&content)
            .with_context(|| format!("Invalid JSON in {}", config_path.display()))?;
        Ok(Some(config))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(api_url) = std::env::var("ACORD_API_URL") {
            self.api_url = api_url;
        }

        if let Ok(timeout) = std::env::var("ACORD_REQUEST_TIMEOUT") {
            if let Ok(secs) = timeout.parse::<u64>() {
                self.request_timeout_secs = secs;
            }
        }

        if let Ok(timeout) = std::env::var("ACORD_REFRESH_TIMEOUT") {
            if let Ok(secs) = timeout.parse::<u64>() {
                self.refresh_timeout_secs = secs;
            }
        }

        if let Ok(storage) = std::env::var("ACORD_TOKEN_STORAGE") {
            match storage.parse() {
                Ok(kind) => self.token_storage = kind,
                Err(e) => log::warn!("Ignoring ACORD_TOKEN_STORAGE: {e}"),
            }
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

    /// API base URL without a trailing slash.
    pub fn api_base(&self) -> &str {
        self.api_url.trim_end_matches('/')
    }

    /// URL of the document-processing hub.
    ///
    /// The hub is mounted at the server root, so a trailing `/api` segment
    /// is stripped from `api_url` first.
    pub fn hub_url(&self) -> String {
        let base = self.api_base();
        let root = base.strip_suffix("/api").unwrap_or(base);
        format!("{root}{HUB_PATH}")
    }

    /// Timeout for ordinary API requests.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Timeout for the token refresh call.
    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout_secs)
    }

    /// Keep-alive ping interval on the hub connection.
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    /// Maximum server silence before the hub connection is dropped.
    pub fn server_timeout(&self) -> Duration {
        Duration::from_secs(self.server_timeout_secs)
    }

    /// Deadline for establishing a hub connection.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Reconnection schedule for the push channel.
    pub fn backoff_policy(&self) -> BackoffPolicy {
        let delays = self
            .reconnect_delays_ms
            .iter()
            .map(|ms| Duration::from_millis(*ms))
            .collect();
        let policy = BackoffPolicy::new(delays);
        match self.persistent_disconnect_after_secs {
            Some(secs) => policy.with_persistent_after(Duration::from_secs(secs)),
            None => policy,
        }
    }
}
