//! Client configuration management.
//!
//! This module handles loading and saving the client configuration, which
//! includes the API base URL, the secure-storage namespace for sessions and
//! the token refresh policy.
//!
//! Configuration is stored at `~/.config/loyalty/config.json`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Application name used for the config directory path
const APP_NAME: &str = "loyalty";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Default secure-storage namespace for persisted sessions
pub const DEFAULT_SERVICE_NAME: &str = "com.loyalty.sessions";

/// HTTP request timeout in seconds.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

const DEFAULT_BASE_URL: &str = "https://api.loyalty.example.com/v1/";

const DEFAULT_REFRESH_PATH: &str = "auth/refresh";

/// Overrides `base_url` when set
pub const BASE_URL_ENV: &str = "LOYALTY_BASE_URL";

/// Overrides `service_name` when set
pub const SERVICE_NAME_ENV: &str = "LOYALTY_SERVICE_NAME";

/// Retry policy for a single refresh attempt.
///
/// `max_retries` counts total invocations of the refresh action, so the
/// default of 1 means no retry at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            max_retries: 1,
            initial_delay_ms: 100,
            max_delay_ms: 100,
        }
    }
}

impl RefreshConfig {
    /// Delay before the attempt following `attempt` (0-indexed), doubling
    /// from `initial_delay_ms` up to `max_delay_ms`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u64.checked_pow(attempt).unwrap_or(u64::MAX);
        let delay_ms = self.initial_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay_ms.min(self.max_delay_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub base_url: String,
    pub service_name: String,
    pub request_timeout_secs: u64,
    pub refresh_path: String,
    pub refresh: RefreshConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            refresh_path: DEFAULT_REFRESH_PATH.to_string(),
            refresh: RefreshConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents).context("Failed to parse config file")
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Apply `LOYALTY_*` environment overrides on top of the file values.
    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var(BASE_URL_ENV) {
            if !url.trim().is_empty() {
                self.base_url = url;
            }
        }
        if let Ok(name) = std::env::var(SERVICE_NAME_ENV) {
            if !name.trim().is_empty() {
                self.service_name = name;
            }
        }
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refresh_config_defaults() {
        let config = RefreshConfig::default();
        assert_eq!(config.max_retries, 1);
        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(100));
    }

    #[test]
    fn test_delay_for_attempt_doubles_and_caps() {
        let config = RefreshConfig {
            max_retries: 5,
            initial_delay_ms: 100,
            max_delay_ms: 350,
        };
        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(config.delay_for_attempt(64), Duration::from_millis(350));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"base_url": "http://localhost:8080/"}"#).unwrap();
        assert_eq!(config.base_url, "http://localhost:8080/");
        assert_eq!(config.service_name, DEFAULT_SERVICE_NAME);
        assert_eq!(config.refresh, RefreshConfig::default());
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_load_missing_file_returns_default() {
        let path = std::env::temp_dir().join("loyalty-config-test-missing.json");
        let _ = std::fs::remove_file(&path);
        let config = ClientConfig::load_from(&path).unwrap();
        assert_eq!(config.refresh_path, DEFAULT_REFRESH_PATH);
    }
}
