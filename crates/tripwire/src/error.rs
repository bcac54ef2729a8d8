//! Error types for breaker construction and guarded calls
//!
//! Two kinds of error originate from the breaker itself:
//! - [`ConfigError`] when a configuration is rejected at construction or load
//!   time
//! - [`BreakerError::Open`] when a call is refused without being attempted
//!
//! Everything else is the guarded operation's own error, carried unmodified in
//! [`BreakerError::Operation`].

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Configuration errors raised while building or loading a breaker config
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A configuration value is out of range
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    /// A configuration source could not be parsed
    #[error("Failed to parse configuration: {message}")]
    Parse { message: String },

    /// A configuration file could not be read
    #[error("Failed to read configuration file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ConfigError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid { message: message.into() }
    }

    pub(crate) fn parse(message: impl Into<String>) -> Self {
        Self::Parse { message: message.into() }
    }
}

/// Errors returned from a call made through a circuit breaker
///
/// Generic over the guarded operation's error type `E`. Callers can tell a
/// refusal (`Open`) apart from a downstream failure (`Operation`) and recover
/// the original error with [`BreakerError::into_operation_error`].
#[derive(Debug, Error)]
pub enum BreakerError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// The breaker refused the call; the operation was not invoked
    ///
    /// `retry_after` is the remaining cooldown while `TRIPPED`. While
    /// `PROBING` with every trial slot taken it is a short fixed hint, capped
    /// by the cooldown; it is never zero.
    #[error("Circuit breaker is open, retry after {retry_after:?}")]
    Open { retry_after: Duration },

    /// The operation ran and failed
    #[error(transparent)]
    Operation(E),
}

impl<E> BreakerError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Whether the call was refused without reaching the operation
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }

    /// Whether the operation itself failed
    pub fn is_operation(&self) -> bool {
        matches!(self, Self::Operation(_))
    }

    /// Borrow the operation's error, if that is what this is
    pub fn operation_error(&self) -> Option<&E> {
        match self {
            Self::Operation(error) => Some(error),
            Self::Open { .. } => None,
        }
    }

    /// Take back the operation's original error
    pub fn into_operation_error(self) -> Option<E> {
        match self {
            Self::Operation(error) => Some(error),
            Self::Open { .. } => None,
        }
    }
}

/// Result type for calls made through a breaker
pub type BreakerResult<T, E> = Result<T, BreakerError<E>>;

/// Result type for configuration handling
pub type ConfigResult<T> = Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use super::*;

    #[derive(Debug, Error)]
    #[error("downstream unavailable")]
    struct Downstream {
        #[source]
        cause: std::io::Error,
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::invalid("bad value");
        assert!(err.to_string().contains("bad value"));
    }

    #[test]
    fn test_io_error_names_path() {
        let err = ConfigError::Io {
            path: PathBuf::from("/etc/breaker.toml"),
            source: std::io::Error::other("denied"),
        };
        assert!(err.to_string().contains("/etc/breaker.toml"));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_open_is_distinct_from_operation() {
        let open: BreakerError<std::io::Error> =
            BreakerError::Open { retry_after: Duration::from_millis(250) };
        assert!(open.is_open());
        assert!(!open.is_operation());
        assert!(open.operation_error().is_none());
        assert!(open.into_operation_error().is_none());
    }

    /// The operation's error is passed through transparently: same message,
    /// same source chain.
    #[test]
    fn test_operation_error_is_transparent() {
        let err: BreakerError<Downstream> =
            BreakerError::Operation(Downstream { cause: std::io::Error::other("reset") });

        assert_eq!(err.to_string(), "downstream unavailable");
        assert_eq!(err.source().map(ToString::to_string), Some("reset".to_string()));

        let inner = err.into_operation_error().expect("operation error");
        assert_eq!(inner.cause.to_string(), "reset");
    }
}
