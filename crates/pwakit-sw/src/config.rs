//! Worker and host configuration.

use std::path::Path;

use pwakit_common::{CommonError, RetryConfig};
use serde::{Deserialize, Serialize};

/// What the worker caches and how it hands over between versions.
///
/// Changing the content of any asset requires bumping `cache_name`, since
/// cache-first serving never revalidates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Version tag naming the current cache generation.
    pub cache_name: String,

    /// App shell paths, relative to the worker script URL.
    pub assets: Vec<String>,

    /// Entry served to navigations when the network is down.
    pub offline_fallback: String,

    /// Activate right after install instead of waiting for old pages to close.
    pub skip_waiting: bool,

    /// Take control of already open pages on activation.
    pub claim_clients: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            cache_name: "pwa-playground-v3".to_string(),
            assets: [
                "./",
                "./index.html",
                "./style.css",
                "./app.js?v=5",
                "./manifest.json",
                "./icons/icon.svg",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            offline_fallback: "./index.html".to_string(),
            skip_waiting: true,
            claim_clients: true,
        }
    }
}

impl WorkerConfig {
    /// Parse from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> pwakit_common::Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| CommonError::config_with_source("invalid worker config", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> pwakit_common::Result<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&json)
    }

    /// Check invariants that serde cannot express.
    pub fn validate(&self) -> pwakit_common::Result<()> {
        if self.cache_name.trim().is_empty() {
            return Err(CommonError::config("cache_name must not be empty"));
        }
        if self.offline_fallback.trim().is_empty() {
            return Err(CommonError::config("offline_fallback must not be empty"));
        }
        if let Some(blank) = self.assets.iter().position(|a| a.trim().is_empty()) {
            return Err(CommonError::config(format!("asset #{blank} is empty")));
        }
        Ok(())
    }
}

/// Behaviour of the runtime hosting the worker.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Whether service workers are available at all.
    pub enabled: bool,

    /// Refuse registration from origins that are not https or localhost.
    pub require_secure_origin: bool,

    /// Backoff for failed installs.
    pub install_retry: RetryConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            require_secure_origin: true,
            install_retry: RetryConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_manifest() {
        let config = WorkerConfig::default();
        assert_eq!(config.cache_name, "pwa-playground-v3");
        assert_eq!(config.assets.len(), 6);
        assert_eq!(config.assets[0], "./");
        assert_eq!(config.offline_fallback, "./index.html");
        assert!(config.skip_waiting && config.claim_clients);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let config = WorkerConfig::from_json(r#"{"cache_name": "v4", "assets": ["./"]}"#).unwrap();
        assert_eq!(config.cache_name, "v4");
        assert_eq!(config.assets, vec!["./".to_string()]);
        assert_eq!(config.offline_fallback, "./index.html");
    }

    #[test]
    fn test_from_json_rejects_bad_input() {
        assert!(matches!(
            WorkerConfig::from_json("{not json"),
            Err(CommonError::Config { .. })
        ));
        assert!(matches!(
            WorkerConfig::from_json(r#"{"cache_name": "  "}"#),
            Err(CommonError::Config { .. })
        ));
        assert!(matches!(
            WorkerConfig::from_json(r#"{"assets": ["./", ""]}"#),
            Err(CommonError::Config { .. })
        ));
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            WorkerConfig::load("/nonexistent/pwakit/worker.json"),
            Err(CommonError::Io(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.json");
        let config = WorkerConfig {
            cache_name: "v9".into(),
            ..Default::default()
        };
        std::fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();

        assert_eq!(WorkerConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_host_config_default() {
        let config = HostConfig::default();
        assert!(config.enabled);
        assert!(config.require_secure_origin);
        assert_eq!(config.install_retry.max_attempts, 3);
    }
}
