//! Circuit breaker configuration
//!
//! Configuration can be assembled in code with [`CircuitBreakerConfig::builder`],
//! parsed from TOML, and overridden from environment variables. Every path
//! validates before handing back a config, so an invalid config never reaches a
//! breaker.
//!
//! ## TOML
//! ```toml
//! failure_threshold = 3
//! success_threshold = 2
//! cooldown_ms = 10000
//! max_probe_calls = 1
//! ```
//! Missing keys take their defaults; unknown keys are rejected.
//!
//! ## Environment Variables
//! With a prefix of `PAYMENTS_BREAKER`:
//! - `PAYMENTS_BREAKER_FAILURE_THRESHOLD`
//! - `PAYMENTS_BREAKER_SUCCESS_THRESHOLD`
//! - `PAYMENTS_BREAKER_COOLDOWN_MS`
//! - `PAYMENTS_BREAKER_MAX_PROBE_CALLS`

use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::breaker::CircuitBreakerBuilder;
use crate::clock::Clock;
use crate::error::{ConfigError, ConfigResult};
use crate::utils::serde::duration_millis;

/// Default consecutive failures in `NORMAL` before tripping
pub const DEFAULT_FAILURE_THRESHOLD: u64 = 3;
/// Default consecutive successes in `PROBING` before returning to `NORMAL`
pub const DEFAULT_SUCCESS_THRESHOLD: u64 = 2;
/// Default time spent `TRIPPED` before probing is allowed
pub const DEFAULT_COOLDOWN: Duration = Duration::from_millis(10_000);
/// Default number of concurrent trial calls while `PROBING`
pub const DEFAULT_MAX_PROBE_CALLS: u64 = 1;

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures while `NORMAL` that trip the breaker
    pub failure_threshold: u64,
    /// Consecutive successes while `PROBING` that return it to `NORMAL`
    pub success_threshold: u64,
    /// How long the breaker stays `TRIPPED` before probing
    #[serde(rename = "cooldown_ms", with = "duration_millis")]
    pub cooldown: Duration,
    /// Trial calls allowed in flight at once while `PROBING`
    ///
    /// `1` admits a single canary call; `u64::MAX` admits every call.
    pub max_probe_calls: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            success_threshold: DEFAULT_SUCCESS_THRESHOLD,
            cooldown: DEFAULT_COOLDOWN,
            max_probe_calls: DEFAULT_MAX_PROBE_CALLS,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a configuration builder
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid("failure_threshold must be greater than 0"));
        }

        if self.success_threshold == 0 {
            return Err(ConfigError::invalid("success_threshold must be greater than 0"));
        }

        if self.cooldown.is_zero() {
            return Err(ConfigError::invalid("cooldown must be greater than 0"));
        }

        if self.max_probe_calls == 0 {
            return Err(ConfigError::invalid("max_probe_calls must be greater than 0"));
        }

        Ok(())
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(source: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(source).map_err(|e| ConfigError::parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    ///
    /// # Errors
    /// Returns `ConfigError::Io` if the file cannot be read, `ConfigError::Parse`
    /// if it is not valid TOML for this type, and `ConfigError::Invalid` if a
    /// value is out of range.
    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;

        let config = Self::from_toml_str(&source)?;
        debug!(path = %path.display(), "Circuit breaker configuration loaded from file");
        Ok(config)
    }

    /// Apply `{prefix}_*` environment variable overrides and re-validate
    ///
    /// Unset variables leave the current value alone. A set but unparsable
    /// variable is an error rather than being silently ignored.
    pub fn apply_env_overrides(mut self, prefix: &str) -> ConfigResult<Self> {
        if let Some(value) = env_override(prefix, "FAILURE_THRESHOLD")? {
            self.failure_threshold = value;
        }
        if let Some(value) = env_override(prefix, "SUCCESS_THRESHOLD")? {
            self.success_threshold = value;
        }
        if let Some(millis) = env_override::<u64>(prefix, "COOLDOWN_MS")? {
            self.cooldown = Duration::from_millis(millis);
        }
        if let Some(value) = env_override(prefix, "MAX_PROBE_CALLS")? {
            self.max_probe_calls = value;
        }

        self.validate()?;
        Ok(self)
    }
}

fn env_override<T>(prefix: &str, key: &str) -> ConfigResult<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    let name = format!("{prefix}_{key}");
    match std::env::var(&name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::parse(format!("{name}={raw:?}: {e}"))),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(ConfigError::parse(format!("{name}: {e}"))),
    }
}

/// Builder for CircuitBreakerConfig
#[derive(Debug, Default)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerConfigBuilder {
    pub fn new() -> Self {
        Self { config: CircuitBreakerConfig::default() }
    }

    pub fn failure_threshold(mut self, threshold: u64) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    pub fn success_threshold(mut self, threshold: u64) -> Self {
        self.config.success_threshold = threshold;
        self
    }

    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.config.cooldown = cooldown;
        self
    }

    pub fn max_probe_calls(mut self, max_calls: u64) -> Self {
        self.config.max_probe_calls = max_calls;
        self
    }

    /// Continue as a breaker builder using a custom clock
    pub fn clock<C: Clock>(self, clock: C) -> CircuitBreakerBuilder<C> {
        CircuitBreakerBuilder::from_config(self.config, clock)
    }

    pub fn build(self) -> ConfigResult<CircuitBreakerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_config_default() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_threshold, 3);
        assert_eq!(config.success_threshold, 2);
        assert_eq!(config.cooldown, Duration::from_millis(10_000));
        assert_eq!(config.max_probe_calls, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = CircuitBreakerConfig::default();

        config.failure_threshold = 0;
        assert!(config.validate().is_err());

        config.failure_threshold = 5;
        config.success_threshold = 0;
        assert!(config.validate().is_err());

        config.success_threshold = 2;
        config.cooldown = Duration::ZERO;
        assert!(config.validate().is_err());

        config.cooldown = Duration::from_millis(1);
        config.max_probe_calls = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_message_names_field() {
        let err = CircuitBreakerConfig::builder().cooldown(Duration::ZERO).build().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
        assert!(err.to_string().contains("cooldown"));
    }

    #[test]
    fn test_config_builder() {
        let config = CircuitBreakerConfig::builder()
            .failure_threshold(10)
            .success_threshold(3)
            .cooldown(Duration::from_secs(30))
            .max_probe_calls(4)
            .build()
            .expect("valid config");

        assert_eq!(config.failure_threshold, 10);
        assert_eq!(config.success_threshold, 3);
        assert_eq!(config.cooldown, Duration::from_secs(30));
        assert_eq!(config.max_probe_calls, 4);
    }

    #[test]
    fn test_from_toml_partial_uses_defaults() {
        let config = CircuitBreakerConfig::from_toml_str(
            r#"
            failure_threshold = 5
            cooldown_ms = 2500
            "#,
        )
        .expect("valid toml");

        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.success_threshold, DEFAULT_SUCCESS_THRESHOLD);
        assert_eq!(config.cooldown, Duration::from_millis(2500));
        assert_eq!(config.max_probe_calls, DEFAULT_MAX_PROBE_CALLS);
    }

    #[test]
    fn test_from_toml_rejects_unknown_key() {
        let err = CircuitBreakerConfig::from_toml_str("failure_treshold = 5").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_from_toml_validates() {
        let err = CircuitBreakerConfig::from_toml_str("success_threshold = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "failure_threshold = 7\nmax_probe_calls = 2").expect("write");

        let config = CircuitBreakerConfig::from_file(file.path()).expect("load");
        assert_eq!(config.failure_threshold, 7);
        assert_eq!(config.max_probe_calls, 2);
    }

    #[test]
    fn test_from_missing_file() {
        let dir = tempfile::tempdir().expect("temp dir");
        let err = CircuitBreakerConfig::from_file(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    // Each env test uses its own prefix so parallel tests never share variables.
    #[test]
    fn test_env_overrides() {
        std::env::set_var("TRIPWIRE_T1_FAILURE_THRESHOLD", "9");
        std::env::set_var("TRIPWIRE_T1_COOLDOWN_MS", " 1500 ");

        let config = CircuitBreakerConfig::default()
            .apply_env_overrides("TRIPWIRE_T1")
            .expect("valid overrides");

        assert_eq!(config.failure_threshold, 9);
        assert_eq!(config.cooldown, Duration::from_millis(1500));
        assert_eq!(config.success_threshold, DEFAULT_SUCCESS_THRESHOLD);
    }

    #[test]
    fn test_env_override_unparsable() {
        std::env::set_var("TRIPWIRE_T2_SUCCESS_THRESHOLD", "two");

        let err = CircuitBreakerConfig::default().apply_env_overrides("TRIPWIRE_T2").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("TRIPWIRE_T2_SUCCESS_THRESHOLD"));
    }

    #[test]
    fn test_env_override_validates() {
        std::env::set_var("TRIPWIRE_T3_MAX_PROBE_CALLS", "0");

        let err = CircuitBreakerConfig::default().apply_env_overrides("TRIPWIRE_T3").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }
}
