//! Configuration values for the rate limiter and the tool orchestrator.
//!
//! Durations are integer milliseconds. Every field has a serde default, so a
//! partial JSON document is accepted and filled in.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::telemetry::TracingConfig;

/// Worker-pool width used when `max_workers` is left at 0.
pub const DEFAULT_MAX_WORKERS: usize = 10;
/// Per-call tool deadline used when `timeout_ms` is left at 0.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// RateLimitConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Master switch. A disabled limiter admits everything.
    pub enabled: bool,
    /// Refill rate in tokens per second.
    pub requests_per_second: f64,
    /// Bucket capacity.
    pub burst_size: u32,
    /// One bucket per key instead of a single shared bucket.
    pub per_key: bool,
    /// Idle time after which a per-key bucket is evicted. 0 disables eviction.
    pub key_timeout_ms: i64,
    /// Longest a single `wait` may block. 0 means no limiter-side ceiling.
    pub wait_timeout_ms: i64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            requests_per_second: 10.0,
            burst_size: 20,
            per_key: false,
            key_timeout_ms: 5 * 60 * 1000,
            wait_timeout_ms: 30 * 1000,
        }
    }
}

impl RateLimitConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let rate = self.requests_per_second;
        if !(rate.is_finite() && rate > 0.0) {
            return Err(ConfigError::InvalidRate(self.requests_per_second));
        }
        if self.burst_size < 1 {
            return Err(ConfigError::InvalidBurst(self.burst_size));
        }
        if self.key_timeout_ms < 0 {
            return Err(ConfigError::NegativeTimeout {
                field: "key_timeout_ms",
                value_ms: self.key_timeout_ms,
            });
        }
        if self.wait_timeout_ms < 0 {
            return Err(ConfigError::NegativeTimeout {
                field: "wait_timeout_ms",
                value_ms: self.wait_timeout_ms,
            });
        }
        Ok(())
    }

    pub fn key_timeout(&self) -> Duration {
        millis(self.key_timeout_ms)
    }

    /// `None` when waits are bounded only by the caller's context.
    pub fn wait_timeout(&self) -> Option<Duration> {
        match self.wait_timeout_ms {
            0 => None,
            ms => Some(millis(ms)),
        }
    }
}

// ---------------------------------------------------------------------------
// ToolsConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ToolsConfig {
    /// Run multi-call batches on the worker pool.
    pub parallel_execution: bool,
    /// Worker-pool ceiling; 0 falls back to [`DEFAULT_MAX_WORKERS`].
    pub max_workers: usize,
    /// Per-call deadline; 0 falls back to [`DEFAULT_TOOL_TIMEOUT`].
    pub timeout_ms: i64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            parallel_execution: true,
            max_workers: DEFAULT_MAX_WORKERS,
            timeout_ms: DEFAULT_TOOL_TIMEOUT.as_millis() as i64,
        }
    }
}

impl ToolsConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_ms < 0 {
            return Err(ConfigError::NegativeTimeout {
                field: "timeout_ms",
                value_ms: self.timeout_ms,
            });
        }
        Ok(())
    }

    pub fn effective_max_workers(&self) -> usize {
        match self.max_workers {
            0 => DEFAULT_MAX_WORKERS,
            n => n,
        }
    }

    pub fn effective_timeout(&self) -> Duration {
        match self.timeout_ms {
            ms if ms <= 0 => DEFAULT_TOOL_TIMEOUT,
            ms => millis(ms),
        }
    }
}

// ---------------------------------------------------------------------------
// CoreConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub rate_limit: RateLimitConfig,
    pub tools: ToolsConfig,
    pub tracing: TracingConfig,
}

impl CoreConfig {
    /// Read and validate a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let cfg: Self = serde_json::from_str(raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from `path` when given, otherwise fall back to defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.rate_limit.validate()?;
        self.tools.validate()
    }

    pub fn json_schema() -> serde_json::Value {
        serde_json::json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "title": "Agent Governor Configuration",
            "type": "object",
            "properties": {
                "rate_limit": {
                    "type": "object",
                    "properties": {
                        "enabled": { "type": "boolean", "default": false },
                        "requests_per_second": {
                            "type": "number",
                            "exclusiveMinimum": 0,
                            "default": 10.0
                        },
                        "burst_size": { "type": "integer", "minimum": 1, "default": 20 },
                        "per_key": { "type": "boolean", "default": false },
                        "key_timeout_ms": { "type": "integer", "minimum": 0, "default": 300000 },
                        "wait_timeout_ms": { "type": "integer", "minimum": 0, "default": 30000 }
                    }
                },
                "tools": {
                    "type": "object",
                    "properties": {
                        "parallel_execution": { "type": "boolean", "default": true },
                        "max_workers": { "type": "integer", "minimum": 0, "default": 10 },
                        "timeout_ms": { "type": "integer", "minimum": 0, "default": 30000 }
                    }
                },
                "tracing": {
                    "type": "object",
                    "properties": {
                        "service_name": { "type": "string", "default": "agent-governor" },
                        "enabled": { "type": "boolean", "default": true },
                        "exporter": {
                            "type": "string",
                            "enum": ["otlp", "none"],
                            "default": "none"
                        },
                        "otlp_endpoint": { "type": ["string", "null"] }
                    }
                }
            }
        })
    }
}

fn millis(ms: i64) -> Duration {
    Duration::from_millis(ms.max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        let cfg = CoreConfig::default();
        cfg.validate().unwrap();
        assert!(!cfg.rate_limit.enabled);
        assert_eq!(cfg.tools.effective_max_workers(), 10);
        assert_eq!(cfg.tools.effective_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn rejects_non_positive_rate() {
        let cfg = RateLimitConfig {
            requests_per_second: 0.0,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidRate(_))));

        let cfg = RateLimitConfig {
            requests_per_second: f64::NAN,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidRate(_))));
    }

    #[test]
    fn rejects_zero_burst() {
        let cfg = RateLimitConfig {
            burst_size: 0,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidBurst(0))));
    }

    #[test]
    fn rejects_negative_timeouts() {
        let cfg = RateLimitConfig {
            wait_timeout_ms: -1,
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("wait_timeout_ms"));

        let tools = ToolsConfig {
            timeout_ms: -5,
            ..Default::default()
        };
        assert!(tools.validate().is_err());
    }

    #[test]
    fn zero_values_fall_back_to_defaults() {
        let tools = ToolsConfig {
            parallel_execution: true,
            max_workers: 0,
            timeout_ms: 0,
        };
        assert_eq!(tools.effective_max_workers(), DEFAULT_MAX_WORKERS);
        assert_eq!(tools.effective_timeout(), DEFAULT_TOOL_TIMEOUT);

        let rl = RateLimitConfig {
            wait_timeout_ms: 0,
            ..Default::default()
        };
        assert_eq!(rl.wait_timeout(), None);
    }

    #[test]
    fn partial_json_is_filled_with_defaults() {
        let cfg = CoreConfig::from_json(
            r#"{"rate_limit": {"enabled": true, "burst_size": 5}, "tools": {"max_workers": 4}}"#,
        )
        .unwrap();
        assert!(cfg.rate_limit.enabled);
        assert_eq!(cfg.rate_limit.burst_size, 5);
        assert_eq!(cfg.rate_limit.requests_per_second, 10.0);
        assert_eq!(cfg.tools.max_workers, 4);
        assert!(cfg.tools.parallel_execution);
    }

    #[test]
    fn load_reads_file_and_validates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"rate_limit": {{"requests_per_second": -1}}}}"#).unwrap();
        let err = CoreConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidRate(_)));
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let err = CoreConfig::load("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn json_schema_is_valid_json() {
        let schema = CoreConfig::json_schema();
        assert_eq!(schema["title"], "Agent Governor Configuration");
        assert!(schema["properties"]["rate_limit"].is_object());
    }
}
