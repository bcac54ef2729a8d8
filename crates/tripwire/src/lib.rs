//! In-process circuit breaker for guarding calls to a failing dependency.
//!
//! A [`CircuitBreaker`] counts consecutive failures of the operation it wraps.
//! Once they reach the configured threshold it trips and refuses calls
//! immediately for a cooldown period. After the cooldown it admits trial
//! calls, and enough consecutive trial successes bring it back to normal.
//!
//! # Modules
//!
//! - [`breaker`]: the state machine and the `execute`/`call` entry points
//! - [`config`]: configuration, validation, TOML and environment loading
//! - [`error`]: configuration errors and call errors
//! - [`clock`]: time sources, including a mock clock for tests
//! - [`observer`]: hooks fired on state transitions
//! - [`timer`]: cancellable one-shot timer backing the cooldown
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//!
//! use tripwire::{BreakerState, CircuitBreaker, MockClock};
//!
//! let clock = MockClock::new();
//! let breaker = CircuitBreaker::builder()
//!     .failure_threshold(2)
//!     .cooldown(Duration::from_secs(1))
//!     .clock(clock.clone())
//!     .build()
//!     .unwrap();
//!
//! for _ in 0..2 {
//!     let _ = breaker.call(|| Err::<(), _>(std::io::Error::other("down")));
//! }
//! assert_eq!(breaker.state(), BreakerState::Tripped);
//!
//! let refused = breaker.call(|| Ok::<_, std::io::Error>(()));
//! assert!(refused.unwrap_err().is_open());
//! ```

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

pub mod breaker;
pub mod clock;
pub mod config;
pub mod error;
pub mod observer;
pub mod timer;
pub mod utils;

pub use breaker::{BreakerState, CircuitBreaker, CircuitBreakerBuilder, CircuitBreakerMetrics};
pub use clock::{Clock, MockClock, SystemClock, TokioClock};
pub use config::{CircuitBreakerConfig, CircuitBreakerConfigBuilder};
pub use error::{BreakerError, BreakerResult, ConfigError, ConfigResult};
pub use observer::{Hook, Observers};
pub use utils::serde::duration_millis;
