use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use vidrelay_retry::RetryPolicy;

/// Daemon configuration. Every field has a default; a TOML file fills in
/// what it names and `VIDRELAY_*` environment variables win over both.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    pub nodes: NodesSection,
    pub storage: StorageSection,
    pub timeouts: TimeoutsSection,
    pub retry: RetrySection,
    pub backup: BackupSection,
    pub transfer: TransferSection,
    pub receiver: ReceiverSection,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct NodesSection {
    /// Remote node asked to switch into upload mode. Negotiation is skipped
    /// when unset.
    pub laptop_url: Option<String>,
    pub receiver_url: String,
    pub metadata_url: String,
    /// Identity sent as `source` in mode switch requests.
    pub source: String,
}

impl Default for NodesSection {
    fn default() -> Self {
        Self {
            laptop_url: None,
            receiver_url: "http://127.0.0.1:4000".to_string(),
            metadata_url: "http://127.0.0.1:3000".to_string(),
            source: "vidrelay".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageSection {
    pub sqlite_path: String,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            sqlite_path: "data/vidrelay.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimeoutsSection {
    pub mode_switch_ms: u64,
    pub health_ms: u64,
    pub request_ms: u64,
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        Self {
            mode_switch_ms: 10_000,
            health_ms: 5_000,
            request_ms: 300_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            multiplier: 2.0,
        }
    }
}

impl RetrySection {
    pub fn policy(&self) -> Result<RetryPolicy> {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            self.multiplier,
        )
        .context("invalid [retry] settings")
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackupSection {
    pub volume_path: PathBuf,
    /// Free space a job asks for when `enqueue` is not given `--bytes`.
    pub required_free_bytes: u64,
    pub receive_url: String,
    pub complete_url: String,
    pub concurrency: usize,
    pub poll_interval_ms: u64,
}

impl Default for BackupSection {
    fn default() -> Self {
        Self {
            volume_path: PathBuf::from("."),
            required_free_bytes: 1024 * 1024 * 1024,
            receive_url: "http://127.0.0.1:3000/backup/receive".to_string(),
            complete_url: "http://127.0.0.1:3000/backup/complete".to_string(),
            concurrency: 1,
            poll_interval_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransferSection {
    /// Read buffer used when streaming chunk files.
    pub chunk_size: usize,
    /// Relay for user notifications; messages are only logged when unset.
    pub notify_url: Option<String>,
}

impl Default for TransferSection {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024,
            notify_url: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReceiverSection {
    pub bind: String,
    pub storage_dir: PathBuf,
}

impl Default for ReceiverSection {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:4000".to_string(),
            storage_dir: PathBuf::from("data/received"),
        }
    }
}

impl RuntimeConfig {
    /// Reads `path` when it exists, then applies the process environment.
    pub fn load(path: &Path) -> Result<Self> {
        Self::load_with(path, |key| std::env::var(key).ok())
    }

    pub fn load_with(path: &Path, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = if path.exists() {
            let source = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            toml::from_str(&source)
                .with_context(|| format!("invalid config TOML at {}", path.display()))?
        } else {
            RuntimeConfig::default()
        };
        config.apply_env(lookup)?;
        Ok(config)
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(url) = lookup("VIDRELAY_LAPTOP_URL") {
            self.nodes.laptop_url = Some(url);
        }
        override_string(&lookup, "VIDRELAY_RECEIVER_URL", &mut self.nodes.receiver_url);
        override_string(&lookup, "VIDRELAY_METADATA_URL", &mut self.nodes.metadata_url);
        override_string(&lookup, "VIDRELAY_SQLITE_PATH", &mut self.storage.sqlite_path);
        let timeouts = &mut self.timeouts;
        override_parsed(&lookup, "VIDRELAY_MODE_SWITCH_TIMEOUT_MS", &mut timeouts.mode_switch_ms)?;
        override_parsed(&lookup, "VIDRELAY_HEALTH_TIMEOUT_MS", &mut timeouts.health_ms)?;
        override_parsed(&lookup, "VIDRELAY_REQUEST_TIMEOUT_MS", &mut timeouts.request_ms)?;
        let retry = &mut self.retry;
        override_parsed(&lookup, "VIDRELAY_RETRY_MAX_ATTEMPTS", &mut retry.max_attempts)?;
        override_parsed(&lookup, "VIDRELAY_RETRY_BASE_DELAY_MS", &mut retry.base_delay_ms)?;
        override_parsed(&lookup, "VIDRELAY_RETRY_MULTIPLIER", &mut retry.multiplier)?;
        override_parsed(
            &lookup,
            "VIDRELAY_REQUIRED_FREE_BYTES",
            &mut self.backup.required_free_bytes,
        )?;
        override_parsed(&lookup, "VIDRELAY_CHUNK_SIZE", &mut self.transfer.chunk_size)?;
        Ok(())
    }
}

fn override_string(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut String) {
    if let Some(value) = lookup(key) {
        *target = value;
    }
}

fn override_parsed<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) -> Result<()>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if let Some(raw) = lookup(key) {
        *target = raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value {raw:?} for {key}"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let config = RuntimeConfig::load_with(&path, env(&[])).unwrap();

        assert_eq!(config, RuntimeConfig::default());
        assert_eq!(config.nodes.laptop_url, None);
        assert!(config.retry.policy().is_ok());
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        std::fs::write(
            &path,
            "[retry]\nmax_attempts = 5\n\n[nodes]\nlaptop_url = \"http://laptop:4000\"\n",
        )
        .unwrap();

        let config = RuntimeConfig::load_with(&path, env(&[])).unwrap();
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay_ms, 1_000);
        assert_eq!(config.nodes.laptop_url.as_deref(), Some("http://laptop:4000"));
        assert_eq!(config.storage, StorageSection::default());
    }

    #[test]
    fn environment_overrides_file_values() {
        let mut config: RuntimeConfig = toml::from_str("[timeouts]\nhealth_ms = 100\n").unwrap();
        config
            .apply_env(env(&[
                ("VIDRELAY_HEALTH_TIMEOUT_MS", "250"),
                ("VIDRELAY_RETRY_MULTIPLIER", "1.5"),
                ("VIDRELAY_LAPTOP_URL", "http://10.0.0.2:4000"),
                ("VIDRELAY_CHUNK_SIZE", "4096"),
            ]))
            .unwrap();

        assert_eq!(config.timeouts.health_ms, 250);
        assert_eq!(config.retry.multiplier, 1.5);
        assert_eq!(config.nodes.laptop_url.as_deref(), Some("http://10.0.0.2:4000"));
        assert_eq!(config.transfer.chunk_size, 4096);
    }

    #[test]
    fn malformed_environment_value_names_the_variable() {
        let mut config = RuntimeConfig::default();
        let err = config
            .apply_env(env(&[("VIDRELAY_RETRY_MAX_ATTEMPTS", "lots")]))
            .unwrap_err();
        assert!(err.to_string().contains("VIDRELAY_RETRY_MAX_ATTEMPTS"));
    }

    #[test]
    fn zero_attempts_is_rejected_when_building_the_policy() {
        let retry = RetrySection {
            max_attempts: 0,
            ..RetrySection::default()
        };
        assert!(retry.policy().is_err());
    }
}
