use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::backend::memory::MemoryBackend;
use crate::backend::rest::RestBackend;
use crate::backend::SharedBackend;
use crate::conversation::DEFAULT_RECONCILE_WINDOW_MS;
use crate::feed::DEFAULT_FRESH_FACES;

pub(crate) const CONFIG_FILE: &str = "nearby_config.json";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 15;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anon_key: Option<String>,
    // Keeps Rust tests deterministic and offline.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disable_network: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconcile_window_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fresh_faces_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_to_file: Option<bool>,
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Read `nearby_config.json` from `data_dir`, then apply `NEARBY_*` overrides.
/// A missing or malformed file yields defaults.
pub fn load_app_config(data_dir: &str) -> AppConfig {
    let path = Path::new(data_dir).join(CONFIG_FILE);
    let mut config = match std::fs::read(&path) {
        Ok(bytes) => serde_json::from_slice::<AppConfig>(&bytes).unwrap_or_else(|e| {
            tracing::warn!(%e, path = %path.display(), "config: ignoring malformed file");
            AppConfig::default()
        }),
        Err(_) => AppConfig::default(),
    };
    if let Some(url) = non_empty_env("NEARBY_BACKEND_URL") {
        config.backend_url = Some(url);
    }
    if let Some(key) = non_empty_env("NEARBY_ANON_KEY") {
        config.anon_key = Some(key);
    }
    if std::env::var("NEARBY_DISABLE_NETWORK").ok().as_deref() == Some("1") {
        config.disable_network = Some(true);
    }
    config
}

impl AppConfig {
    pub fn network_enabled(&self) -> bool {
        self.disable_network != Some(true)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(
            self.request_timeout_secs
                .filter(|s| *s > 0)
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
        )
    }

    pub fn reconcile_window_ms(&self) -> u64 {
        self.reconcile_window_ms
            .unwrap_or(DEFAULT_RECONCILE_WINDOW_MS)
    }

    pub fn fresh_faces_count(&self) -> usize {
        self.fresh_faces_count.unwrap_or(DEFAULT_FRESH_FACES)
    }

    pub fn log_to_file(&self) -> bool {
        self.log_to_file == Some(true)
    }

    fn backend_url(&self) -> Option<&str> {
        self.backend_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
    }

    /// HTTP backend when a URL is configured and the network is enabled,
    /// otherwise an in-process store.
    pub fn build_backend(&self) -> anyhow::Result<SharedBackend> {
        match self.backend_url() {
            Some(url) if self.network_enabled() => {
                let backend = RestBackend::new(
                    url,
                    self.anon_key.clone().unwrap_or_default(),
                    self.request_timeout(),
                )
                .with_context(|| format!("build http backend for {url}"))?;
                tracing::info!(url, "backend: http");
                Ok(Arc::new(backend))
            }
            _ => {
                tracing::info!("backend: in-memory");
                Ok(Arc::new(MemoryBackend::new()))
            }
        }
    }
}

/// The `nearby_config.json` payload written when none exists.
pub fn default_config_json() -> String {
    let config = AppConfig {
        request_timeout_secs: Some(DEFAULT_REQUEST_TIMEOUT_SECS),
        reconcile_window_ms: Some(DEFAULT_RECONCILE_WINDOW_MS),
        fresh_faces_count: Some(DEFAULT_FRESH_FACES),
        ..AppConfig::default()
    };
    serde_json::to_string_pretty(&config).unwrap_or_else(|_| "{}".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_app_config(&dir.path().to_string_lossy());
        assert_eq!(config.request_timeout(), Duration::from_secs(15));
        assert_eq!(config.reconcile_window_ms(), 10_000);
        assert_eq!(config.fresh_faces_count(), 6);
        assert!(!config.log_to_file());
    }

    #[test]
    fn reads_file_keys() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{"disable_network": true, "request_timeout_secs": 3, "fresh_faces_count": 2, "unknown": 1}"#,
        )
        .unwrap();
        let config = load_app_config(&dir.path().to_string_lossy());
        assert!(!config.network_enabled());
        assert_eq!(config.request_timeout(), Duration::from_secs(3));
        assert_eq!(config.fresh_faces_count(), 2);
    }

    #[test]
    fn malformed_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "{not json").unwrap();
        let config = load_app_config(&dir.path().to_string_lossy());
        assert_eq!(config.fresh_faces_count(), 6);
    }

    #[test]
    fn zero_timeout_falls_back_to_default() {
        let config = AppConfig {
            request_timeout_secs: Some(0),
            ..AppConfig::default()
        };
        assert_eq!(config.request_timeout(), Duration::from_secs(15));
    }

    #[test]
    fn default_payload_round_trips() {
        let parsed: AppConfig = serde_json::from_str(&default_config_json()).unwrap();
        assert_eq!(parsed.fresh_faces_count, Some(6));
        assert_eq!(parsed.backend_url, None);
    }
}
