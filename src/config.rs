//! Explicit configuration values for the registry client.
//!
//! Nothing in the library reads process environment. Callers build these
//! values directly or load them from a JSON file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ProvenanceError, Result};

/// Retry behaviour for registry lookups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff_ms: 200,
            max_backoff_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// No retries and no waiting.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }

    /// Upper bound of the backoff before retry number `retry` (1-based).
    pub fn backoff_ceiling(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(16);
        let ms = self
            .base_backoff_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// Connection settings for an Ethereum JSON-RPC registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub rpc_url: String,
    /// Path of the deployment record (`{"address": ..., "abi": [...]}`).
    pub deployment_path: PathBuf,
    /// Node-managed account used for `publish_key` transactions.
    #[serde(default)]
    pub from_address: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_timeout_secs() -> u64 {
    10
}

impl RegistryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    fn validate(&self) -> Result<()> {
        if !(self.rpc_url.starts_with("http://") || self.rpc_url.starts_with("https://")) {
            return Err(ProvenanceError::Config(format!(
                "rpc_url must be an http(s) URL, got '{}'",
                self.rpc_url
            )));
        }
        if self.timeout_secs == 0 {
            return Err(ProvenanceError::Config(
                "timeout_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceConfig {
    pub registry: RegistryConfig,
}

impl ProvenanceConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ProvenanceError::Config(format!("Failed to parse config: {}", e)))?;
        config.registry.validate()?;
        Ok(config)
    }

    /// Load from a JSON file. A relative `deployment_path` is resolved
    /// against the config file's directory.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config = Self::from_json(&contents)?;
        if config.registry.deployment_path.is_relative() {
            if let Some(dir) = path.parent() {
                config.registry.deployment_path = dir.join(&config.registry.deployment_path);
            }
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_config() {
        let json = r#"{"registry": {"rpc_url": "https://rpc.example", "deployment_path": "deployed_info.json"}}"#;
        let config = ProvenanceConfig::from_json(json).unwrap();
        assert_eq!(config.registry.timeout_secs, 10);
        assert_eq!(config.registry.retry, RetryPolicy::default());
        assert_eq!(config.registry.from_address, None);
    }

    #[test]
    fn parse_retry_override() {
        let json = r#"{"registry": {
            "rpc_url": "http://localhost:8545",
            "deployment_path": "/etc/camprov/deployed_info.json",
            "timeout_secs": 3,
            "retry": {"max_retries": 1}
        }}"#;
        let config = ProvenanceConfig::from_json(json).unwrap();
        assert_eq!(config.registry.timeout(), Duration::from_secs(3));
        assert_eq!(config.registry.retry.max_retries, 1);
        assert_eq!(config.registry.retry.base_backoff_ms, 200);
    }

    #[test]
    fn reject_non_http_url() {
        let json = r#"{"registry": {"rpc_url": "ws://node", "deployment_path": "d.json"}}"#;
        let result = ProvenanceConfig::from_json(json);
        assert!(matches!(result, Err(ProvenanceError::Config(_))));
    }

    #[test]
    fn reject_zero_timeout() {
        let json = r#"{"registry": {"rpc_url": "https://node", "deployment_path": "d.json", "timeout_secs": 0}}"#;
        assert!(matches!(
            ProvenanceConfig::from_json(json),
            Err(ProvenanceError::Config(_))
        ));
    }

    #[test]
    fn relative_deployment_path_resolved_against_config_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("camprov.json");
        std::fs::write(
            &path,
            r#"{"registry": {"rpc_url": "https://node", "deployment_path": "deployed_info.json"}}"#,
        )
        .unwrap();

        let config = ProvenanceConfig::from_file(&path).unwrap();
        assert_eq!(
            config.registry.deployment_path,
            dir.path().join("deployed_info.json")
        );
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_ceiling(1), Duration::from_millis(200));
        assert_eq!(policy.backoff_ceiling(2), Duration::from_millis(400));
        assert_eq!(policy.backoff_ceiling(10), Duration::from_millis(5_000));
        assert_eq!(RetryPolicy::none().backoff_ceiling(3), Duration::ZERO);
    }
}
