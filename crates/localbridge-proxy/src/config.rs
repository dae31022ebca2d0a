//! Configuration from environment variables and an optional YAML file.
//!
//! **Environment variables:**
//! - `HOST`: bind address (default: 127.0.0.1)
//! - `PORT`: server port (default: 8787)
//! - `BACKEND_URL`: full URL of the backend chat-completions endpoint
//!   (default: http://127.0.0.1:11434/v1/chat/completions)
//! - `PROXY_API_KEY`: secret callers must present as a bearer token or
//!   `x-api-key`; authentication is disabled when unset
//! - `REQUEST_TIMEOUT_MS`: bound on every backend call (default: 120000)
//! - `QUEUE_CONCURRENCY`: simultaneous backend calls (default: 1)
//! - `QUEUE_MAX_PENDING`: requests allowed to wait for a slot (default: unbounded)
//! - `MODEL_REASONING`, `MODEL_CODE`, `MODEL_FAST`, `MODEL_DEFAULT`: backend
//!   model ids used by the router
//!
//! A YAML file can override any of these:
//!
//! ```yaml
//! port: 9000
//! backend_url: "http://127.0.0.1:8080/v1/chat/completions"
//! timeout_ms: 60000
//! concurrency: 1
//! max_pending: 16
//! models:
//!   code: "qwen2.5-coder:14b"
//! ```

use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use localbridge_queue::QueueOptions;
use serde::Deserialize;
use tracing::warn;

use crate::routing::ModelSet;

pub const DEFAULT_PORT: u16 = 8787;
pub const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:11434/v1/chat/completions";
pub const DEFAULT_TIMEOUT_MS: u64 = 120_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    pub backend_url: String,
    pub api_key: Option<String>,
    pub timeout_ms: u64,
    pub concurrency: usize,
    pub max_pending: Option<usize>,
    pub models: ModelSet,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            api_key: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            concurrency: localbridge_queue::DEFAULT_CONCURRENCY,
            max_pending: None,
            models: ModelSet::default(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct YamlConfig {
    host: Option<String>,
    port: Option<u16>,
    backend_url: Option<String>,
    api_key: Option<String>,
    timeout_ms: Option<u64>,
    concurrency: Option<usize>,
    max_pending: Option<usize>,
    #[serde(default)]
    models: YamlModels,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct YamlModels {
    reasoning: Option<String>,
    code: Option<String>,
    fast: Option<String>,
    default: Option<String>,
}

impl ProxyConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary variable source. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        Self {
            host: get("HOST").unwrap_or(defaults.host),
            port: parse_or(get("PORT"), "PORT", defaults.port),
            backend_url: get("BACKEND_URL").unwrap_or(defaults.backend_url),
            api_key: get("PROXY_API_KEY"),
            timeout_ms: parse_or(get("REQUEST_TIMEOUT_MS"), "REQUEST_TIMEOUT_MS", defaults.timeout_ms),
            concurrency: parse_or(
                get("QUEUE_CONCURRENCY"),
                "QUEUE_CONCURRENCY",
                defaults.concurrency,
            ),
            max_pending: get("QUEUE_MAX_PENDING")
                .and_then(|v| parse_value::<usize>(&v, "QUEUE_MAX_PENDING")),
            models: ModelSet {
                reasoning: get("MODEL_REASONING").unwrap_or(defaults.models.reasoning),
                code: get("MODEL_CODE").unwrap_or(defaults.models.code),
                fast: get("MODEL_FAST").unwrap_or(defaults.models.fast),
                default: get("MODEL_DEFAULT").unwrap_or(defaults.models.default),
            },
        }
    }

    /// Overlay values from a YAML file on top of `self`.
    pub fn with_yaml_file(self, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        self.with_yaml_str(&content)
            .with_context(|| format!("Failed to parse config file {:?}", path))
    }

    pub fn with_yaml_str(mut self, content: &str) -> Result<Self> {
        let yaml: YamlConfig = serde_yaml_ng::from_str(content)?;

        if let Some(v) = yaml.host {
            self.host = v;
        }
        if let Some(v) = yaml.port {
            self.port = v;
        }
        if let Some(v) = yaml.backend_url {
            self.backend_url = v;
        }
        if yaml.api_key.is_some() {
            self.api_key = yaml.api_key;
        }
        if let Some(v) = yaml.timeout_ms {
            self.timeout_ms = v;
        }
        if let Some(v) = yaml.concurrency {
            self.concurrency = v;
        }
        if yaml.max_pending.is_some() {
            self.max_pending = yaml.max_pending;
        }
        let models = yaml.models;
        if let Some(v) = models.reasoning {
            self.models.reasoning = v;
        }
        if let Some(v) = models.code {
            self.models.code = v;
        }
        if let Some(v) = models.fast {
            self.models.fast = v;
        }
        if let Some(v) = models.default {
            self.models.default = v;
        }

        Ok(self)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn queue_options(&self) -> QueueOptions {
        QueueOptions {
            concurrency: self.concurrency.max(1),
            max_pending: self.max_pending,
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_value<T: FromStr>(raw: &str, key: &str) -> Option<T> {
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = raw, "ignoring unparseable configuration value");
            None
        }
    }
}

fn parse_or<T: FromStr>(raw: Option<String>, key: &str, default: T) -> T {
    raw.and_then(|v| parse_value(&v, key)).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_env_empty() {
        let config = ProxyConfig::from_lookup(lookup(&[]));
        assert_eq!(config, ProxyConfig::default());
        assert_eq!(config.bind_addr(), "127.0.0.1:8787");
        assert_eq!(config.timeout(), Duration::from_secs(120));
    }

    #[test]
    fn test_env_overrides() {
        let config = ProxyConfig::from_lookup(lookup(&[
            ("PORT", "9001"),
            ("BACKEND_URL", "http://gpu-box:8080/v1/chat/completions"),
            ("PROXY_API_KEY", "s3cret"),
            ("REQUEST_TIMEOUT_MS", "2500"),
            ("QUEUE_CONCURRENCY", "2"),
            ("QUEUE_MAX_PENDING", "10"),
            ("MODEL_CODE", "coder"),
        ]));

        assert_eq!(config.port, 9001);
        assert_eq!(config.backend_url, "http://gpu-box:8080/v1/chat/completions");
        assert_eq!(config.api_key.as_deref(), Some("s3cret"));
        assert_eq!(config.timeout_ms, 2500);
        assert_eq!(config.concurrency, 2);
        assert_eq!(config.max_pending, Some(10));
        assert_eq!(config.models.code, "coder");
        assert_eq!(config.models.fast, ModelSet::default().fast);
    }

    #[test]
    fn test_bad_numbers_fall_back_to_defaults() {
        let config = ProxyConfig::from_lookup(lookup(&[
            ("PORT", "eighty"),
            ("REQUEST_TIMEOUT_MS", "-5"),
            ("QUEUE_MAX_PENDING", "lots"),
            ("PROXY_API_KEY", "  "),
        ]));

        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.timeout_ms, DEFAULT_TIMEOUT_MS);
        assert_eq!(config.max_pending, None);
        assert_eq!(config.api_key, None);
    }

    #[test]
    fn test_zero_concurrency_is_coerced_for_queue() {
        let config = ProxyConfig::from_lookup(lookup(&[("QUEUE_CONCURRENCY", "0")]));
        assert_eq!(config.queue_options().concurrency, 1);
    }

    #[test]
    fn test_yaml_overlay() {
        let config = ProxyConfig::default()
            .with_yaml_str(
                r#"
port: 9000
timeout_ms: 500
max_pending: 3
models:
  reasoning: "thinker"
"#,
            )
            .unwrap();

        assert_eq!(config.port, 9000);
        assert_eq!(config.timeout_ms, 500);
        assert_eq!(config.max_pending, Some(3));
        assert_eq!(config.models.reasoning, "thinker");
        assert_eq!(config.models.code, ModelSet::default().code);
        assert_eq!(config.backend_url, DEFAULT_BACKEND_URL);
    }

    #[test]
    fn test_yaml_rejects_unknown_keys() {
        assert!(ProxyConfig::default().with_yaml_str("prot: 1").is_err());
    }
}
