//! Configuration for the gateway.

use std::str::FromStr;
use std::time::Duration;

use config::{Config as ConfigLoader, ConfigError, Environment, File};
use serde::Deserialize;

use crate::admission::{AdmissionConfig, QueueMode};

/// Main configuration structure for the gateway.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Base URL of the OpenAI-compatible inference backend.
    #[serde(default = "default_backend_base_url")]
    pub backend_base_url: String,
    /// Model used when a request omits `model` or leaves it empty.
    #[serde(default = "default_model_name")]
    pub model_name: String,
    /// Number of requests the backend may run concurrently.
    #[serde(default = "default_max_active")]
    pub max_active: usize,
    /// Overload policy: "queue" or "reject".
    #[serde(default = "default_queue_mode")]
    pub queue_mode: String,
    #[serde(default = "default_queue_max")]
    pub queue_max: usize,
    #[serde(default = "default_queue_timeout")]
    pub queue_timeout_secs: f64,
    /// End-to-end timeout for a forwarded call, streaming included.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: f64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: f64,
    #[serde(default = "default_health_timeout")]
    pub health_timeout_secs: f64,
    #[serde(default = "default_models_timeout")]
    pub models_timeout_secs: f64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            backend_base_url: default_backend_base_url(),
            model_name: default_model_name(),
            max_active: default_max_active(),
            queue_mode: default_queue_mode(),
            queue_max: default_queue_max(),
            queue_timeout_secs: default_queue_timeout(),
            request_timeout_secs: default_request_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            health_timeout_secs: default_health_timeout(),
            models_timeout_secs: default_models_timeout(),
            log_level: default_log_level(),
        }
    }
}

// Default values
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_backend_base_url() -> String {
    "http://vllm:8000".to_string()
}
fn default_model_name() -> String {
    "qwen25-14b".to_string()
}
fn default_max_active() -> usize {
    2
}
fn default_queue_mode() -> String {
    "queue".to_string()
}
fn default_queue_max() -> usize {
    100
}
fn default_queue_timeout() -> f64 {
    120.0
}
fn default_request_timeout() -> f64 {
    300.0
}
fn default_connect_timeout() -> f64 {
    5.0
}
fn default_health_timeout() -> f64 {
    3.0
}
fn default_models_timeout() -> f64 {
    10.0
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration sources (in order of precedence):
    /// 1. Environment variables (GATEWAY_KEY format, e.g. GATEWAY_MAX_ACTIVE)
    /// 2. gateway.toml file (if present)
    /// 3. Built-in defaults
    pub fn load() -> Result<Self, ConfigError> {
        let config: Config = ConfigLoader::builder()
            .add_source(File::with_name("gateway").required(false))
            .add_source(Environment::with_prefix("GATEWAY").try_parsing(true))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values the admission controller and backend client cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_active == 0 {
            return Err(ConfigError::Message("max_active must be greater than 0".into()));
        }
        QueueMode::from_str(&self.queue_mode)
            .map_err(|e| ConfigError::Message(format!("queue_mode: {}", e)))?;

        let non_negative = [("queue_timeout_secs", self.queue_timeout_secs)];
        let positive = [
            ("request_timeout_secs", self.request_timeout_secs),
            ("connect_timeout_secs", self.connect_timeout_secs),
            ("health_timeout_secs", self.health_timeout_secs),
            ("models_timeout_secs", self.models_timeout_secs),
        ];
        for (key, value) in non_negative {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::Message(format!("{} must be >= 0", key)));
            }
        }
        for (key, value) in positive {
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfigError::Message(format!("{} must be > 0", key)));
            }
        }
        for (key, value) in non_negative.into_iter().chain(positive) {
            Duration::try_from_secs_f64(value).map_err(|e| {
                ConfigError::Message(format!("{} is out of range: {}", key, e))
            })?;
        }
        Ok(())
    }

    /// Admission settings derived from this configuration.
    ///
    /// An unrecognised queue mode falls back to `queue`; `validate` rejects it at load time.
    pub fn admission(&self) -> AdmissionConfig {
        AdmissionConfig {
            max_active: self.max_active,
            queue_mode: self.queue_mode.parse().unwrap_or_default(),
            queue_max: self.queue_max,
            queue_timeout: secs(self.queue_timeout_secs),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        secs(self.connect_timeout_secs)
    }

    pub fn health_timeout(&self) -> Duration {
        secs(self.health_timeout_secs)
    }

    pub fn models_timeout(&self) -> Duration {
        secs(self.models_timeout_secs)
    }
}

/// Seconds to a `Duration`, saturating instead of panicking on values `validate` refuses.
fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8080);
        assert_eq!(config.max_active, 2);
        assert_eq!(config.queue_max, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_admission_settings() {
        let config = Config {
            queue_mode: "REJECT".to_string(),
            queue_timeout_secs: 0.5,
            ..Config::default()
        };
        let admission = config.admission();
        assert_eq!(admission.queue_mode, QueueMode::Reject);
        assert_eq!(admission.queue_timeout, Duration::from_millis(500));
    }

    #[test]
    fn test_validate_rejects_zero_slots() {
        let config = Config {
            max_active: 0,
            ..Config::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_active"));
    }

    #[test]
    fn test_validate_rejects_unknown_queue_mode() {
        let config = Config {
            queue_mode: "drop".to_string(),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_negative_timeouts() {
        let config = Config {
            queue_timeout_secs: -1.0,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            request_timeout_secs: 0.0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_timeouts_beyond_duration_range() {
        let config = Config {
            queue_timeout_secs: 1e300,
            ..Config::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("queue_timeout_secs"));

        let config = Config {
            request_timeout_secs: f64::MAX,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_out_of_range_timeout_saturates() {
        let config = Config {
            queue_timeout_secs: 1e300,
            ..Config::default()
        };
        assert_eq!(config.admission().queue_timeout, Duration::MAX);
    }
}
