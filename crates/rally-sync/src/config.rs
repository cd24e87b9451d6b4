use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

use crate::error::{SyncError, SyncResult};

/// Runtime settings for the sync layer, read from `RALLY_*` variables.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_server_url")]
    pub server_url: String,
    #[serde(default)]
    pub socket_url: Option<String>,
    #[serde(default)]
    pub feed_url: Option<String>,
    #[serde(default)]
    pub feed_rest_url: Option<String>,
    #[serde(default)]
    pub feed_api_key: Option<String>,
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    #[serde(default = "default_force_reconnect_delay_ms")]
    pub force_reconnect_delay_ms: u64,
    #[serde(default = "default_ping_interval_ms")]
    pub feed_heartbeat_ms: u64,
    #[serde(default = "default_feed_debounce_ms")]
    pub feed_debounce_ms: u64,
    #[serde(default = "default_queue_interval_ms")]
    pub queue_interval_ms: u64,
    #[serde(default = "default_queue_batch_size")]
    pub queue_batch_size: usize,
    #[serde(default = "default_connection_check_ms")]
    pub connection_check_ms: u64,
    #[serde(default = "default_step_timeout_ms")]
    pub step_timeout_ms: u64,
    #[serde(default = "default_max_dependency_retries")]
    pub max_dependency_retries: u32,
    #[serde(default = "default_sent_retention_ms")]
    pub sent_retention_ms: u64,
    #[serde(default)]
    pub job_store_path: Option<PathBuf>,
    #[serde(default)]
    pub preferences_path: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            socket_url: None,
            feed_url: None,
            feed_rest_url: None,
            feed_api_key: None,
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            ping_interval_ms: default_ping_interval_ms(),
            force_reconnect_delay_ms: default_force_reconnect_delay_ms(),
            feed_heartbeat_ms: default_ping_interval_ms(),
            feed_debounce_ms: default_feed_debounce_ms(),
            queue_interval_ms: default_queue_interval_ms(),
            queue_batch_size: default_queue_batch_size(),
            connection_check_ms: default_connection_check_ms(),
            step_timeout_ms: default_step_timeout_ms(),
            max_dependency_retries: default_max_dependency_retries(),
            sent_retention_ms: default_sent_retention_ms(),
            job_store_path: None,
            preferences_path: None,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        config::Config::builder()
            .add_source(
                config::Environment::with_prefix("RALLY")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map(SyncConfig::normalize)
            .unwrap_or_else(|_| SyncConfig::default().normalize())
    }

    pub fn normalize(mut self) -> Self {
        self.server_url = Self::normalize_opt(Some(self.server_url))
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or_else(default_server_url);
        self.socket_url = Self::normalize_opt(self.socket_url.take());
        self.feed_url = Self::normalize_opt(self.feed_url.take());
        self.feed_rest_url = Self::normalize_opt(self.feed_rest_url.take());
        self.feed_api_key = Self::normalize_opt(self.feed_api_key.take());
        self.queue_batch_size = self.queue_batch_size.max(1);
        self
    }

    fn normalize_opt(value: Option<String>) -> Option<String> {
        value.and_then(|s| {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    /// Socket endpoint: explicit `socket_url`, otherwise `server_url` with
    /// its scheme swapped (`http` to `ws`, `https` to `wss`).
    pub fn resolved_socket_url(&self) -> SyncResult<Url> {
        if let Some(explicit) = &self.socket_url {
            return Ok(Url::parse(explicit)?);
        }
        let mut url = Url::parse(&self.server_url)?;
        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            _ => "ws",
        };
        url.set_scheme(scheme)
            .map_err(|_| SyncError::NotConfigured("socket_url"))?;
        url.set_path("");
        url.set_query(None);
        Ok(url)
    }

    pub fn feed_configured(&self) -> bool {
        self.feed_url.is_some() && self.feed_rest_url.is_some()
    }

    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms.max(1))
    }

    pub fn force_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.force_reconnect_delay_ms)
    }

    pub fn feed_heartbeat(&self) -> Duration {
        Duration::from_millis(self.feed_heartbeat_ms.max(1))
    }

    pub fn feed_debounce(&self) -> Duration {
        Duration::from_millis(self.feed_debounce_ms)
    }

    pub fn queue_interval(&self) -> Duration {
        Duration::from_millis(self.queue_interval_ms.max(1))
    }

    pub fn connection_check(&self) -> Duration {
        Duration::from_millis(self.connection_check_ms)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms.max(1))
    }

    /// How long sent jobs are kept before the queue prunes them.
    pub fn sent_retention(&self) -> Duration {
        Duration::from_millis(self.sent_retention_ms)
    }

    pub fn job_store_path(&self) -> PathBuf {
        self.job_store_path
            .clone()
            .or_else(|| project_dirs().map(|dirs| dirs.data_dir().join("jobs.sqlite")))
            .unwrap_or_else(|| PathBuf::from("rally-jobs.sqlite"))
    }

    pub fn preferences_path(&self) -> PathBuf {
        self.preferences_path
            .clone()
            .or_else(|| project_dirs().map(|dirs| dirs.config_dir().join("preferences.json")))
            .unwrap_or_else(|| PathBuf::from("rally-preferences.json"))
    }
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("dev", "rally", "rally")
}

fn default_server_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_reconnect_base_ms() -> u64 {
    3_000
}

fn default_reconnect_max_ms() -> u64 {
    10_000
}

fn default_ping_interval_ms() -> u64 {
    25_000
}

fn default_force_reconnect_delay_ms() -> u64 {
    100
}

fn default_feed_debounce_ms() -> u64 {
    150
}

fn default_queue_interval_ms() -> u64 {
    1_000
}

fn default_queue_batch_size() -> usize {
    50
}

fn default_connection_check_ms() -> u64 {
    30_000
}

fn default_step_timeout_ms() -> u64 {
    10_000
}

fn default_max_dependency_retries() -> u32 {
    10
}

fn default_sent_retention_ms() -> u64 {
    7 * 24 * 60 * 60 * 1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_socket_url_from_server_url() {
        let cfg = SyncConfig {
            server_url: "https://scores.example.com:8443/".into(),
            ..SyncConfig::default()
        }
        .normalize();
        assert_eq!(cfg.resolved_socket_url().unwrap().as_str(), "wss://scores.example.com:8443/");

        let local = SyncConfig::default().normalize();
        assert_eq!(local.resolved_socket_url().unwrap().as_str(), "ws://127.0.0.1:8080/");
    }

    #[test]
    fn blank_values_become_none() {
        let cfg = SyncConfig {
            feed_url: Some("   ".into()),
            feed_api_key: Some(" key ".into()),
            queue_batch_size: 0,
            ..SyncConfig::default()
        }
        .normalize();
        assert!(cfg.feed_url.is_none());
        assert_eq!(cfg.feed_api_key.as_deref(), Some("key"));
        assert_eq!(cfg.queue_batch_size, 1);
        assert!(!cfg.feed_configured());
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = SyncConfig::default();
        assert_eq!(cfg.reconnect_base(), Duration::from_secs(3));
        assert_eq!(cfg.reconnect_max(), Duration::from_secs(10));
        assert_eq!(cfg.ping_interval(), Duration::from_secs(25));
        assert_eq!(cfg.max_dependency_retries, 10);
    }
}
