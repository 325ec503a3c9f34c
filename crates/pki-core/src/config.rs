//! Configuration for the coordinator.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $PKI_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/pkid/config.toml
//!   3. ~/.config/pkid/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PkiConfig {
    pub listen: ListenConfig,
    pub tls: TlsConfig,
    pub epoch: EpochConfig,
    pub broadcast: BroadcastConfig,
    pub control: ControlConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    /// TCP address for registration connections.
    pub addr: String,
    /// Bound on the TLS handshake plus reading the registration line.
    pub read_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// PEM certificate chain presented to registering nodes.
    pub cert_path: PathBuf,
    /// PEM private key for `cert_path`.
    pub key_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EpochConfig {
    /// Base time unit. All windows are multiples of it.
    pub tick_ms: u64,
    pub mix_window_ticks: u32,
    pub client_window_ticks: u32,
    pub steady_window_ticks: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// Dial attempts per node before giving up on it.
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    /// Bound on one TCP connect + TLS handshake.
    pub dial_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Start the first epoch immediately instead of waiting for SIGUSR1.
    pub autostart: bool,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:33000".to_string(),
            read_timeout_ms: 10_000,
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert_path: config_dir().join("pki-cert.pem"),
            key_path: config_dir().join("pki-key.pem"),
        }
    }
}

impl Default for EpochConfig {
    fn default() -> Self {
        Self {
            tick_ms: 5_000,
            mix_window_ticks: 2,
            client_window_ticks: 4,
            steady_window_ticks: 500,
        }
    }
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            retry_delay_ms: 200,
            dial_timeout_ms: 5_000,
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self { autostart: false }
    }
}

impl ListenConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl EpochConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn mix_window(&self) -> Duration {
        self.tick().saturating_mul(self.mix_window_ticks)
    }

    pub fn client_window(&self) -> Duration {
        self.tick().saturating_mul(self.client_window_ticks)
    }

    pub fn steady_window(&self) -> Duration {
        self.tick().saturating_mul(self.steady_window_ticks)
    }

    /// Window lengths that do not fit in a `Duration`.
    fn overflowing_window(&self) -> Option<&'static str> {
        [
            ("epoch.mix_window_ticks", self.mix_window_ticks),
            ("epoch.client_window_ticks", self.client_window_ticks),
            ("epoch.steady_window_ticks", self.steady_window_ticks),
        ]
        .into_iter()
        .find(|(_, ticks)| self.tick().checked_mul(*ticks).is_none())
        .map(|(key, _)| key)
    }
}

impl BroadcastConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("pkid")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid setting {0}: {1}")]
    Invalid(&'static str, String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl PkiConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            PkiConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("PKI_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&PkiConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Reject settings the scheduler and broadcaster cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.epoch.tick_ms == 0 {
            return Err(ConfigError::Invalid("epoch.tick_ms", "must be positive".into()));
        }
        if let Some(key) = self.epoch.overflowing_window() {
            return Err(ConfigError::Invalid(
                key,
                format!("window of {} ms ticks overflows", self.epoch.tick_ms),
            ));
        }
        if self.listen.read_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "listen.read_timeout_ms",
                "must be positive".into(),
            ));
        }
        if self.broadcast.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "broadcast.max_attempts",
                "must be at least 1".into(),
            ));
        }
        if crate::endpoint::split_host_port(&self.listen.addr).is_none() {
            return Err(ConfigError::Invalid(
                "listen.addr",
                format!("{:?} is not host:port", self.listen.addr),
            ));
        }
        Ok(())
    }

    /// Apply PKI_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("PKI_LISTEN__ADDR") {
            self.listen.addr = v;
        }
        if let Ok(v) = std::env::var("PKI_LISTEN__READ_TIMEOUT_MS") {
            if let Ok(ms) = v.parse() {
                self.listen.read_timeout_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("PKI_TLS__CERT_PATH") {
            self.tls.cert_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("PKI_TLS__KEY_PATH") {
            self.tls.key_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("PKI_EPOCH__TICK_MS") {
            if let Ok(ms) = v.parse() {
                self.epoch.tick_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("PKI_BROADCAST__MAX_ATTEMPTS") {
            if let Ok(n) = v.parse() {
                self.broadcast.max_attempts = n;
            }
        }
        if let Ok(v) = std::env::var("PKI_CONTROL__AUTOSTART") {
            self.control.autostart = v == "true" || v == "1";
        }
    }
}
