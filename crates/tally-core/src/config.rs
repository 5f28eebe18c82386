use crate::engine::retry::RetryPolicy;
use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

pub const SUPPORTED_CONFIG_VERSION: u32 = 1;

/// Evaluation-level configuration: what to score with and which components run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvalConfig {
    pub version: u32,
    /// Model spec forwarded to metrics and folded into cache keys.
    pub model: String,
    /// Per-metric options, keyed by metric name.
    pub metric_options: BTreeMap<String, serde_json::Value>,
    pub reporters: Vec<String>,
    pub stores: Vec<String>,
    pub broadcasters: Vec<String>,
    pub processors: Vec<String>,
    /// Middleware names, outermost first. Empty means the tracing middleware.
    pub middleware: Vec<String>,
    pub run: RunConfig,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            version: SUPPORTED_CONFIG_VERSION,
            model: String::new(),
            metric_options: BTreeMap::new(),
            reporters: Vec::new(),
            stores: Vec::new(),
            broadcasters: Vec::new(),
            processors: Vec::new(),
            middleware: Vec::new(),
            run: RunConfig::default(),
        }
    }
}

impl EvalConfig {
    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        let cfg: EvalConfig = serde_yaml::from_str(raw)
            .map_err(|e| ConfigError(format!("failed to parse YAML: {}", e)))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version != SUPPORTED_CONFIG_VERSION {
            return Err(ConfigError(format!(
                "unsupported config version {} (supported: {})",
                self.version, SUPPORTED_CONFIG_VERSION
            )));
        }
        self.run.validate()
    }

    pub fn options_for(&self, metric: &str) -> serde_json::Value {
        self.metric_options
            .get(metric)
            .cloned()
            .unwrap_or_else(|| serde_json::json!({}))
    }
}

/// Execution knobs for a single run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Hard per-sample deadline enforced by the worker.
    pub sample_timeout_ms: u64,
    pub max_workers: usize,
    pub retry: RetryPolicy,
    pub seed: Option<u64>,
    pub cache: CacheConfig,
    /// How long a finished run stays queryable before its controller exits.
    pub retention_ms: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            sample_timeout_ms: 60_000,
            max_workers: 4,
            retry: RetryPolicy::default(),
            seed: None,
            cache: CacheConfig::default(),
            retention_ms: 30_000,
        }
    }
}

impl RunConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError("run.max_workers must be at least 1".into()));
        }
        if self.sample_timeout_ms == 0 {
            return Err(ConfigError("run.sample_timeout_ms must be positive".into()));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(ConfigError(format!(
                "run.retry.max_delay_ms ({}) is below base_delay_ms ({})",
                self.retry.max_delay_ms, self.retry.base_delay_ms
            )));
        }
        Ok(())
    }

    pub fn sample_timeout(&self) -> Duration {
        Duration::from_millis(self.sample_timeout_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl_ms: 3_600_000,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

pub fn load_config(path: &Path) -> Result<EvalConfig, ConfigError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| ConfigError(format!("failed to read config {}: {}", path.display(), e)))?;
    EvalConfig::from_yaml_str(&raw)
}
