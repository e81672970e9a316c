use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── Environment keys ─────────────────────────────────────────────────────────

pub const ENV_BACKEND_URL: &str = "TAGRELAY_BACKEND_URL";
pub const ENV_SECRET: &str = "TAGRELAY_SECRET";
pub const ENV_POLL_INTERVAL_MS: &str = "TAGRELAY_POLL_INTERVAL_MS";
pub const ENV_DRAIN_INTERVAL_MS: &str = "TAGRELAY_DRAIN_INTERVAL_MS";
pub const ENV_HTTP_TIMEOUT_MS: &str = "TAGRELAY_HTTP_TIMEOUT_MS";
pub const ENV_QUEUE_PATH: &str = "TAGRELAY_QUEUE_PATH";
pub const ENV_LOG_LEVEL: &str = "TAGRELAY_LOG_LEVEL";
pub const ENV_LOG_DIR: &str = "TAGRELAY_LOG_DIR";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required configuration: {}", .0.join(", "))]
    Missing(Vec<&'static str>),
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

// ── Backend ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL of the backend, e.g. `https://clinic.example.com`.
    pub base_url: String,
    /// Shared secret sent as `X-Agent-Secret` on every request.
    pub secret: String,
    /// Per-request timeout. Exceeding it counts as a retryable failure.
    pub timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            secret: String::new(),
            timeout_ms: 10_000,
        }
    }
}

// ── Relay ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// How often the queued backlog is retried.
    pub drain_interval_ms: u64,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Upper bound of the random jitter added to each retry delay.
    pub retry_jitter_ms: u64,
    /// Retries after the first attempt before giving up.
    pub max_retries: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            drain_interval_ms: 30_000,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 30_000,
            retry_jitter_ms: 1_000,
            max_retries: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    pub interval_ms: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self { interval_ms: 3_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Relative paths resolve against the working directory.
    pub path: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            path: ".tagrelay/queue.jsonl".to_string(),
        }
    }
}

// ── Supervisor ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub restart_base_delay_ms: u64,
    pub restart_max_delay_ms: u64,
    /// Consecutive crashes after which the agent gives up.
    pub max_restarts: u32,
    /// Grace period for the worker to exit after `terminate`.
    pub shutdown_timeout_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            restart_base_delay_ms: 1_000,
            restart_max_delay_ms: 30_000,
            max_restarts: 10,
            shutdown_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
    /// Directory for daily log files. Unset means stderr only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub backend: BackendConfig,
    pub relay: RelayConfig,
    pub poller: PollerConfig,
    pub queue: QueueConfig,
    pub supervisor: SupervisorConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    /// Load `path` if it exists, then apply `TAGRELAY_*` environment overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }
        config.apply_env(|key| env::var(key).ok())?;
        Ok(config)
    }

    /// Apply overrides from `lookup`. Empty values are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let millis = |key: &'static str| -> Result<Option<u64>, ConfigError> {
            get(key)
                .map(|raw| {
                    raw.trim()
                        .parse::<u64>()
                        .map_err(|_| ConfigError::Invalid { key, value: raw })
                })
                .transpose()
        };

        if let Some(url) = get(ENV_BACKEND_URL) {
            self.backend.base_url = url;
        }
        if let Some(secret) = get(ENV_SECRET) {
            self.backend.secret = secret;
        }
        if let Some(ms) = millis(ENV_POLL_INTERVAL_MS)? {
            self.poller.interval_ms = ms;
        }
        if let Some(ms) = millis(ENV_DRAIN_INTERVAL_MS)? {
            self.relay.drain_interval_ms = ms;
        }
        if let Some(ms) = millis(ENV_HTTP_TIMEOUT_MS)? {
            self.backend.timeout_ms = ms;
        }
        if let Some(path) = get(ENV_QUEUE_PATH) {
            self.queue.path = path;
        }
        if let Some(level) = get(ENV_LOG_LEVEL) {
            self.telemetry.log_level = level;
        }
        if let Some(dir) = get(ENV_LOG_DIR) {
            self.telemetry.log_dir = Some(dir);
        }
        Ok(())
    }

    /// Every required setting that is still empty, reported together.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut missing = Vec::new();
        if self.backend.base_url.trim().is_empty() {
            missing.push(ENV_BACKEND_URL);
        }
        if self.backend.secret.trim().is_empty() {
            missing.push(ENV_SECRET);
        }
        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }
        for (key, value) in [
            (ENV_POLL_INTERVAL_MS, self.poller.interval_ms),
            (ENV_DRAIN_INTERVAL_MS, self.relay.drain_interval_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    key,
                    value: value.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Copy safe to print: the secret is masked.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if !copy.backend.secret.is_empty() {
            copy.backend.secret = "********".to_string();
        }
        copy
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poller.interval_ms)
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.relay.drain_interval_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.backend.timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.supervisor.shutdown_timeout_ms)
    }
}
