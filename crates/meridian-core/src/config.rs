//! Core configuration with layered loading and per-service circuit
//! breaker blocks.

use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::{Error as FigmentError, Figment};
use serde::Deserialize;
use thiserror::Error;

use crate::service::ServiceType;

/// Errors that can occur when loading or parsing core configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Error from the Figment configuration library.
    #[error("Configuration error: {0}")]
    Figment(Box<FigmentError>),

    /// The specified configuration file was not found.
    #[error("Configuration file not found: {0}")]
    FileNotFound(String),

    /// The configuration is invalid or malformed.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<FigmentError> for ConfigError {
    fn from(err: FigmentError) -> Self {
        Self::Figment(Box::new(err))
    }
}

/// Endpoint I/O configuration.
///
/// All durations accept suffix strings (`"2500ms"`, `"10s"`, `"1m"`)
/// or bare seconds in TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct CoreConfig {
    /// Per-attempt connect deadline.
    #[serde(
        default = "default_connect_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub connect_timeout: Duration,

    /// Idle deadline for HTTP-style connections; pipelines kill the
    /// channel when nothing moves for this long.
    #[serde(
        default = "default_idle_http_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub idle_http_timeout: Duration,

    /// Maximum time to wait for the channel to close during shutdown.
    #[serde(
        default = "default_disconnect_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub disconnect_timeout: Duration,

    /// Circuit breaker for the key-value service.
    #[serde(default)]
    pub kv_circuit_breaker: CircuitBreakerConfig,

    /// Circuit breaker for the query service.
    #[serde(default)]
    pub query_circuit_breaker: CircuitBreakerConfig,

    /// Circuit breaker for the search service.
    #[serde(default)]
    pub search_circuit_breaker: CircuitBreakerConfig,

    /// Circuit breaker for the analytics service.
    #[serde(default)]
    pub analytics_circuit_breaker: CircuitBreakerConfig,

    /// Circuit breaker for the view engine.
    #[serde(default)]
    pub views_circuit_breaker: CircuitBreakerConfig,

    /// Circuit breaker for the eventing service.
    #[serde(default)]
    pub eventing_circuit_breaker: CircuitBreakerConfig,

    /// Circuit breaker for the management service.
    #[serde(default)]
    pub management_circuit_breaker: CircuitBreakerConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            idle_http_timeout: default_idle_http_timeout(),
            disconnect_timeout: default_disconnect_timeout(),
            kv_circuit_breaker: CircuitBreakerConfig::default(),
            query_circuit_breaker: CircuitBreakerConfig::default(),
            search_circuit_breaker: CircuitBreakerConfig::default(),
            analytics_circuit_breaker: CircuitBreakerConfig::default(),
            views_circuit_breaker: CircuitBreakerConfig::default(),
            eventing_circuit_breaker: CircuitBreakerConfig::default(),
            management_circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl CoreConfig {
    /// Loads configuration from the default path (`meridian.toml`).
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("meridian.toml")
    }

    /// Loads configuration from the specified file path.
    ///
    /// Environment variables prefixed with `MERIDIAN_` override file
    /// settings.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("MERIDIAN_").split("__").lowercase(false));

        figment.extract::<Self>().map_err(ConfigError::from)
    }

    /// Parses configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let figment = Figment::new().merge(Toml::string(content));
        figment.extract::<Self>().map_err(ConfigError::from)
    }

    /// Selects the circuit breaker block for a service.
    pub fn circuit_breaker(&self, service: ServiceType) -> &CircuitBreakerConfig {
        match service {
            ServiceType::Kv => &self.kv_circuit_breaker,
            ServiceType::Query => &self.query_circuit_breaker,
            ServiceType::Search => &self.search_circuit_breaker,
            ServiceType::Analytics => &self.analytics_circuit_breaker,
            ServiceType::Views => &self.views_circuit_breaker,
            ServiceType::Eventing => &self.eventing_circuit_breaker,
            ServiceType::Management => &self.management_circuit_breaker,
        }
    }
}

/// Circuit breaker configuration for a single service type.
#[derive(Debug, Clone, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Whether the breaker gates `send` at all.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Failure ratio (integer percent, inclusive) at which the
    /// breaker opens.
    #[serde(default = "default_error_threshold_percent")]
    pub error_threshold_percent: u8,

    /// Minimum samples inside the rolling window before the breaker
    /// may open.
    #[serde(default = "default_volume_threshold")]
    pub volume_threshold: u32,

    /// How long the breaker stays open before permitting a probe.
    #[serde(
        default = "default_sleep_window",
        deserialize_with = "deserialize_duration"
    )]
    pub sleep_window: Duration,

    /// Window over which successes and failures are counted.
    #[serde(
        default = "default_rolling_window",
        deserialize_with = "deserialize_duration"
    )]
    pub rolling_window: Duration,

    /// Maximum in-flight probes while half-open.
    #[serde(default = "default_half_open_probe_limit")]
    pub half_open_probe_limit: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            error_threshold_percent: default_error_threshold_percent(),
            volume_threshold: default_volume_threshold(),
            sleep_window: default_sleep_window(),
            rolling_window: default_rolling_window(),
            half_open_probe_limit: default_half_open_probe_limit(),
        }
    }
}

const fn default_connect_timeout() -> Duration {
    Duration::from_millis(2500)
}

const fn default_idle_http_timeout() -> Duration {
    Duration::from_millis(4500)
}

const fn default_disconnect_timeout() -> Duration {
    Duration::from_secs(10)
}

const fn default_enabled() -> bool {
    true
}

const fn default_error_threshold_percent() -> u8 {
    50
}

const fn default_volume_threshold() -> u32 {
    20
}

const fn default_sleep_window() -> Duration {
    Duration::from_secs(10)
}

const fn default_rolling_window() -> Duration {
    Duration::from_secs(60)
}

const fn default_half_open_probe_limit() -> u32 {
    1
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_duration(&s).map_err(serde::de::Error::custom)
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if let Some(stripped) = s.strip_suffix("ms") {
        let ms: u64 = stripped
            .trim()
            .parse()
            .map_err(|_| format!("Invalid duration: {s}"))?;
        Ok(Duration::from_millis(ms))
    } else if let Some(stripped) = s.strip_suffix('s') {
        let secs: u64 = stripped
            .trim()
            .parse()
            .map_err(|_| format!("Invalid duration: {s}"))?;
        Ok(Duration::from_secs(secs))
    } else if let Some(stripped) = s.strip_suffix('m') {
        let mins: u64 = stripped
            .trim()
            .parse()
            .map_err(|_| format!("Invalid duration: {s}"))?;
        Ok(Duration::from_secs(mins * 60))
    } else {
        let secs: u64 = s.parse().map_err(|_| format!("Invalid duration: {s}"))?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_forms() {
        assert_eq!(parse_duration("2500ms").unwrap(), Duration::from_millis(2500));
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("60").unwrap(), Duration::from_secs(60));
        assert!(parse_duration("fast").is_err());
    }

    #[test]
    fn config_defaults() {
        let config = CoreConfig::parse("").unwrap();

        assert_eq!(config.connect_timeout, Duration::from_millis(2500));
        assert_eq!(config.idle_http_timeout, Duration::from_millis(4500));
        assert_eq!(config.disconnect_timeout, Duration::from_secs(10));

        let kv = &config.kv_circuit_breaker;
        assert!(kv.enabled);
        assert_eq!(kv.error_threshold_percent, 50);
        assert_eq!(kv.volume_threshold, 20);
        assert_eq!(kv.sleep_window, Duration::from_secs(10));
        assert_eq!(kv.rolling_window, Duration::from_secs(60));
        assert_eq!(kv.half_open_probe_limit, 1);
    }

    #[test]
    fn config_from_string() {
        let config_str = r#"
            connect_timeout = "500ms"
            disconnect_timeout = "5s"

            [kv_circuit_breaker]
            enabled = false
            error_threshold_percent = 75

            [query_circuit_breaker]
            volume_threshold = 5
        "#;

        let config = CoreConfig::parse(config_str).unwrap();

        assert_eq!(config.connect_timeout, Duration::from_millis(500));
        assert_eq!(config.disconnect_timeout, Duration::from_secs(5));
        assert!(!config.kv_circuit_breaker.enabled);
        assert_eq!(config.kv_circuit_breaker.error_threshold_percent, 75);
        assert_eq!(config.query_circuit_breaker.volume_threshold, 5);
        // Untouched services keep defaults.
        assert!(config.search_circuit_breaker.enabled);
    }

    #[test]
    fn circuit_breaker_selector() {
        let config_str = r#"
            [analytics_circuit_breaker]
            volume_threshold = 3
        "#;
        let config = CoreConfig::parse(config_str).unwrap();

        assert_eq!(
            config.circuit_breaker(ServiceType::Analytics).volume_threshold,
            3
        );
        assert_eq!(config.circuit_breaker(ServiceType::Kv).volume_threshold, 20);
    }

    #[test]
    fn load_missing_file_fails() {
        let err = CoreConfig::load_from("/nonexistent/meridian.toml").unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }
}
