//! Circuit breaker state machine
//!
//! ```text
//! NORMAL   --(failure_threshold consecutive failures)--> TRIPPED
//! TRIPPED  --(cooldown elapsed: next call or timer)----> PROBING
//! PROBING  --(success_threshold consecutive successes)-> NORMAL
//! PROBING  --(any failure)------------------------------> TRIPPED
//! any      --(trip())-----------------------------------> TRIPPED
//! any      --(reset())----------------------------------> NORMAL
//! ```
//!
//! All bookkeeping happens under one mutex per breaker. The guarded operation
//! always runs with the mutex released, and observers are notified after it has
//! been released. Each notification carries the epoch of its transition; one
//! older than a notification already delivered is dropped, so observers never
//! see a superseded state last.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{debug, info, instrument, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::CircuitBreakerConfig;
use crate::error::{BreakerError, BreakerResult, ConfigResult};
use crate::observer::Observers;
use crate::timer::{self, TimerHandle};

/// Fallback cooldown span when `now + cooldown` is not representable
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

/// Upper bound on the retry hint given while every probe slot is taken
const PROBE_BUSY_RETRY: Duration = Duration::from_millis(100);

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BreakerState {
    /// Calls pass through; consecutive failures are counted
    Normal,
    /// Calls are refused until the cooldown deadline
    Tripped,
    /// Trial calls probe whether the dependency has recovered
    Probing,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerState::Normal => write!(f, "NORMAL"),
            BreakerState::Tripped => write!(f, "TRIPPED"),
            BreakerState::Probing => write!(f, "PROBING"),
        }
    }
}

/// Point-in-time snapshot of a breaker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerMetrics {
    pub state: BreakerState,
    /// Consecutive failures observed in `NORMAL`
    pub failure_count: u64,
    /// Consecutive successes observed in `PROBING`
    pub success_count: u64,
    /// Set exactly when `state` is `TRIPPED`
    pub cooldown_deadline: Option<Instant>,
    /// Trial calls currently in flight
    pub in_flight_probes: u64,
    /// Calls admitted to the operation since construction
    pub total_calls: u64,
    /// Calls refused since construction
    pub rejected_calls: u64,
    pub last_transition: Instant,
}

struct Core {
    state: BreakerState,
    failure_count: u64,
    success_count: u64,
    cooldown_deadline: Option<Instant>,
    in_flight_probes: u64,
    /// Bumped on every transition; outcomes from an older epoch are dropped.
    epoch: u64,
    total_calls: u64,
    rejected_calls: u64,
    last_transition: Instant,
    cooldown_timer: Option<TimerHandle>,
    disposed: bool,
}

struct Inner<C: Clock> {
    config: CircuitBreakerConfig,
    clock: C,
    observers: Observers,
    core: Mutex<Core>,
    /// Runtime the breaker was built on; cooldown timers are spawned there.
    runtime: Option<Handle>,
    /// Epoch of the newest transition handed to observers
    notified_epoch: AtomicU64,
}

/// Ticket for one admitted call
#[derive(Debug, Clone, Copy)]
struct Permit {
    epoch: u64,
    probe: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
}

/// Releases a probe slot if the call never reports an outcome (the future was
/// dropped, or the operation panicked).
struct InFlight<'a, C: Clock> {
    breaker: &'a CircuitBreaker<C>,
    permit: Option<Permit>,
}

impl<C: Clock> InFlight<'_, C> {
    fn finish(mut self, outcome: Outcome) {
        if let Some(permit) = self.permit.take() {
            self.breaker.record(permit, Some(outcome));
        }
    }
}

impl<C: Clock> Drop for InFlight<'_, C> {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            self.breaker.record(permit, None);
        }
    }
}

/// Circuit breaker guarding calls to a single dependency
///
/// Clones share the same state. The pending cooldown timer holds only a weak
/// reference, and is cancelled when the last clone is dropped or
/// [`dispose`](Self::dispose) is called.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
///
/// use tripwire::{BreakerError, CircuitBreaker};
///
/// # async fn fetch(id: u32) -> Result<String, std::io::Error> { Ok(id.to_string()) }
/// # async fn run() -> Result<(), tripwire::ConfigError> {
/// let breaker = CircuitBreaker::builder()
///     .failure_threshold(3)
///     .cooldown(Duration::from_secs(10))
///     .on_tripped(|| eprintln!("inventory service tripped"))
///     .build()?;
///
/// match breaker.execute(|| fetch(7)).await {
///     Ok(body) => println!("{body}"),
///     Err(BreakerError::Open { retry_after }) => println!("skipped, retry in {retry_after:?}"),
///     Err(BreakerError::Operation(e)) => println!("inventory failed: {e}"),
/// }
/// # Ok(())
/// # }
/// ```
pub struct CircuitBreaker<C: Clock = SystemClock> {
    inner: Arc<Inner<C>>,
}

impl<C: Clock> Clone for CircuitBreaker<C> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<C: Clock> fmt::Debug for CircuitBreaker<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let metrics = self.metrics();
        f.debug_struct("CircuitBreaker")
            .field("config", &self.inner.config)
            .field("state", &metrics.state)
            .field("failure_count", &metrics.failure_count)
            .field("success_count", &metrics.success_count)
            .field("observers", &self.inner.observers)
            .finish()
    }
}

impl CircuitBreaker<SystemClock> {
    /// Create a new circuit breaker using the system clock
    pub fn new(config: CircuitBreakerConfig) -> ConfigResult<Self> {
        Self::with_clock(config, SystemClock)
    }

    /// Create a circuit breaker with the default configuration
    pub fn with_defaults() -> Self {
        Self::from_parts(CircuitBreakerConfig::default(), SystemClock, Observers::new())
    }

    /// Start building a circuit breaker
    pub fn builder() -> CircuitBreakerBuilder<SystemClock> {
        CircuitBreakerBuilder::from_config(CircuitBreakerConfig::default(), SystemClock)
    }
}

impl Default for CircuitBreaker<SystemClock> {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl<C: Clock> CircuitBreaker<C> {
    /// Create a new circuit breaker with a custom clock
    pub fn with_clock(config: CircuitBreakerConfig, clock: C) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self::from_parts(config, clock, Observers::new()))
    }

    fn from_parts(config: CircuitBreakerConfig, clock: C, observers: Observers) -> Self {
        let now = clock.now();
        let core = Core {
            state: BreakerState::Normal,
            failure_count: 0,
            success_count: 0,
            cooldown_deadline: None,
            in_flight_probes: 0,
            epoch: 0,
            total_calls: 0,
            rejected_calls: 0,
            last_transition: now,
            cooldown_timer: None,
            disposed: false,
        };

        Self {
            inner: Arc::new(Inner {
                config,
                clock,
                observers,
                core: Mutex::new(core),
                runtime: Handle::try_current().ok(),
                notified_epoch: AtomicU64::new(0),
            }),
        }
    }

    /// Execute an async operation with circuit breaker protection
    ///
    /// Arguments are captured by the closure. The operation is invoked only if
    /// the breaker admits the call, and its result or error is handed back
    /// unchanged (errors inside [`BreakerError::Operation`]).
    ///
    /// # Errors
    /// [`BreakerError::Open`] if the call was refused, otherwise whatever the
    /// operation returned.
    #[instrument(skip_all)]
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> BreakerResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let permit = self.admit().map_err(|retry_after| BreakerError::Open { retry_after })?;
        let guard = InFlight { breaker: self, permit: Some(permit) };

        match operation().await {
            Ok(value) => {
                guard.finish(Outcome::Success);
                Ok(value)
            }
            Err(error) => {
                warn!(error = %error, "Circuit breaker: operation failed");
                guard.finish(Outcome::Failure);
                Err(BreakerError::Operation(error))
            }
        }
    }

    /// Execute an async operation that takes its arguments explicitly
    pub async fn execute_with<A, F, Fut, T, E>(&self, args: A, operation: F) -> BreakerResult<T, E>
    where
        F: FnOnce(A) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.execute(move || operation(args)).await
    }

    /// Execute a synchronous operation with circuit breaker protection
    ///
    /// Same admission and bookkeeping as [`execute`](Self::execute). The
    /// cooldown timer runs on the runtime the breaker was built on, so tripping
    /// from a plain thread still schedules it. A breaker built outside any
    /// runtime falls back to the calling thread's runtime; with neither, it
    /// leaves `TRIPPED` on the first call after the deadline instead.
    #[instrument(skip_all)]
    pub fn call<F, T, E>(&self, operation: F) -> BreakerResult<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let permit = self.admit().map_err(|retry_after| BreakerError::Open { retry_after })?;
        let guard = InFlight { breaker: self, permit: Some(permit) };

        match operation() {
            Ok(value) => {
                guard.finish(Outcome::Success);
                Ok(value)
            }
            Err(error) => {
                warn!(error = %error, "Circuit breaker: operation failed");
                guard.finish(Outcome::Failure);
                Err(BreakerError::Operation(error))
            }
        }
    }

    /// Force the breaker into `TRIPPED`, re-arming the cooldown
    pub fn trip(&self) {
        let now = self.inner.clock.now();
        let epoch = {
            let mut core = self.inner.core.lock();
            info!(from = %core.state, "Circuit breaker manually tripped");
            self.enter_tripped(&mut core, now);
            core.epoch
        };
        self.notify(BreakerState::Tripped, epoch);
    }

    /// Force the breaker into `NORMAL`, clearing counters and the cooldown
    pub fn reset(&self) {
        let now = self.inner.clock.now();
        let epoch = {
            let mut core = self.inner.core.lock();
            info!(from = %core.state, "Circuit breaker manually reset");
            Self::enter_normal(&mut core, now);
            core.epoch
        };
        self.notify(BreakerState::Normal, epoch);
    }

    /// Cancel the pending cooldown timer and stop scheduling new ones
    ///
    /// The breaker keeps working afterwards; it just leaves `TRIPPED` lazily,
    /// on the first call after the deadline.
    pub fn dispose(&self) {
        let mut core = self.inner.core.lock();
        core.disposed = true;
        if let Some(timer) = core.cooldown_timer.take() {
            timer.cancel();
            debug!("Circuit breaker disposed, cooldown timer cancelled");
        }
    }

    /// Current state; never triggers a transition
    pub fn state(&self) -> BreakerState {
        self.inner.core.lock().state
    }

    /// Whether the breaker is `NORMAL`
    pub fn is_normal(&self) -> bool {
        self.state() == BreakerState::Normal
    }

    /// Whether the breaker is `TRIPPED`
    pub fn is_tripped(&self) -> bool {
        self.state() == BreakerState::Tripped
    }

    /// Whether the breaker is `PROBING`
    pub fn is_probing(&self) -> bool {
        self.state() == BreakerState::Probing
    }

    /// Snapshot of state and counters, taken atomically
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let core = self.inner.core.lock();
        CircuitBreakerMetrics {
            state: core.state,
            failure_count: core.failure_count,
            success_count: core.success_count,
            cooldown_deadline: core.cooldown_deadline,
            in_flight_probes: core.in_flight_probes,
            total_calls: core.total_calls,
            rejected_calls: core.rejected_calls,
            last_transition: core.last_transition,
        }
    }

    /// Configuration the breaker was built with
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.inner.config
    }

    /// Whether a cooldown timer is currently scheduled
    pub fn has_pending_cooldown(&self) -> bool {
        self.inner.core.lock().cooldown_timer.is_some()
    }

    /// Decide whether a call may proceed; `Err` carries the retry hint
    fn admit(&self) -> Result<Permit, Duration> {
        let now = self.inner.clock.now();
        let mut entered_probing = None;

        let admission = {
            let mut core = self.inner.core.lock();
            let state = core.state;
            let deadline = core.cooldown_deadline;

            let admission = match state {
                BreakerState::Normal => Ok(Permit { epoch: core.epoch, probe: false }),
                BreakerState::Tripped => match deadline {
                    Some(deadline) if now < deadline => Err(deadline - now),
                    _ => {
                        Self::enter_probing(&mut core, now);
                        entered_probing = Some(core.epoch);
                        core.in_flight_probes += 1;
                        Ok(Permit { epoch: core.epoch, probe: true })
                    }
                },
                BreakerState::Probing => {
                    if core.in_flight_probes < self.inner.config.max_probe_calls {
                        core.in_flight_probes += 1;
                        Ok(Permit { epoch: core.epoch, probe: true })
                    } else {
                        Err(self.inner.config.cooldown.min(PROBE_BUSY_RETRY))
                    }
                }
            };

            match admission {
                Ok(_) => core.total_calls += 1,
                Err(retry_after) => {
                    core.rejected_calls += 1;
                    debug!(
                        state = %core.state,
                        retry_after_ms = retry_after.as_millis() as u64,
                        "Circuit breaker rejecting call"
                    );
                }
            }
            admission
        };

        if let Some(epoch) = entered_probing {
            self.notify(BreakerState::Probing, epoch);
        }
        admission
    }

    /// Apply a finished call's outcome; `None` means no outcome (cancelled)
    fn record(&self, permit: Permit, outcome: Option<Outcome>) {
        let now = self.inner.clock.now();

        let entered = {
            let mut core = self.inner.core.lock();
            if core.epoch != permit.epoch {
                debug!(
                    admitted_epoch = permit.epoch,
                    current_epoch = core.epoch,
                    "Circuit breaker ignoring outcome from an earlier state"
                );
                return;
            }
            if permit.probe {
                core.in_flight_probes = core.in_flight_probes.saturating_sub(1);
            }

            match (core.state, outcome) {
                (_, None) => None,
                (BreakerState::Normal, Some(Outcome::Success)) => {
                    core.failure_count = 0;
                    None
                }
                (BreakerState::Normal, Some(Outcome::Failure)) => {
                    core.failure_count += 1;
                    if core.failure_count >= self.inner.config.failure_threshold {
                        warn!(
                            failure_count = core.failure_count,
                            "Circuit breaker tripped after consecutive failures"
                        );
                        self.enter_tripped(&mut core, now);
                        Some((BreakerState::Tripped, core.epoch))
                    } else {
                        None
                    }
                }
                (BreakerState::Probing, Some(Outcome::Success)) => {
                    core.success_count += 1;
                    if core.success_count >= self.inner.config.success_threshold {
                        info!(
                            success_count = core.success_count,
                            "Circuit breaker recovered after trial successes"
                        );
                        Self::enter_normal(&mut core, now);
                        Some((BreakerState::Normal, core.epoch))
                    } else {
                        None
                    }
                }
                (BreakerState::Probing, Some(Outcome::Failure)) => {
                    warn!("Circuit breaker re-tripped by a failed trial call");
                    self.enter_tripped(&mut core, now);
                    Some((BreakerState::Tripped, core.epoch))
                }
                (BreakerState::Tripped, Some(_)) => None,
            }
        };

        if let Some((state, epoch)) = entered {
            self.notify(state, epoch);
        }
    }

    /// Cooldown timer body: move a still-tripped breaker to `PROBING`
    fn cooldown_elapsed(&self, epoch: u64) {
        let now = self.inner.clock.now();
        let entered = {
            let mut core = self.inner.core.lock();
            if core.state != BreakerState::Tripped || core.epoch != epoch {
                return;
            }
            Self::enter_probing(&mut core, now);
            core.epoch
        };
        self.notify(BreakerState::Probing, entered);
    }

    /// Hand a transition to observers unless a newer one already went out
    fn notify(&self, state: BreakerState, epoch: u64) {
        let delivered = self.inner.notified_epoch.fetch_max(epoch, Ordering::SeqCst);
        if delivered >= epoch {
            debug!(
                state = %state,
                epoch,
                delivered,
                "Circuit breaker skipping superseded notification"
            );
            return;
        }
        self.inner.observers.notify(state);
    }

    fn enter_tripped(&self, core: &mut Core, now: Instant) {
        let cooldown = self.inner.config.cooldown;
        let from = core.state;

        core.state = BreakerState::Tripped;
        core.failure_count = 0;
        core.success_count = 0;
        core.in_flight_probes = 0;
        core.epoch += 1;
        core.last_transition = now;
        core.cooldown_deadline =
            Some(now.checked_add(cooldown).unwrap_or_else(|| now + FAR_FUTURE));

        // Replacing the handle cancels any timer left from an earlier trip.
        core.cooldown_timer = None;
        if !core.disposed {
            let weak: Weak<Inner<C>> = Arc::downgrade(&self.inner);
            let epoch = core.epoch;
            let runtime = self.inner.runtime.as_ref();
            core.cooldown_timer = timer::schedule(runtime, cooldown, move || {
                if let Some(inner) = weak.upgrade() {
                    CircuitBreaker { inner }.cooldown_elapsed(epoch);
                }
            });
            if core.cooldown_timer.is_none() {
                warn!("No tokio runtime, cooldown will be applied lazily");
            }
        }

        info!(
            from = %from,
            to = %core.state,
            cooldown_ms = cooldown.as_millis() as u64,
            "Circuit breaker state transition"
        );
    }

    fn enter_probing(core: &mut Core, now: Instant) {
        let from = core.state;

        core.state = BreakerState::Probing;
        core.failure_count = 0;
        core.success_count = 0;
        core.in_flight_probes = 0;
        core.epoch += 1;
        core.last_transition = now;
        core.cooldown_deadline = None;
        core.cooldown_timer = None;

        info!(from = %from, to = %core.state, "Circuit breaker state transition");
    }

    fn enter_normal(core: &mut Core, now: Instant) {
        let from = core.state;

        core.state = BreakerState::Normal;
        core.failure_count = 0;
        core.success_count = 0;
        core.in_flight_probes = 0;
        core.epoch += 1;
        core.last_transition = now;
        core.cooldown_deadline = None;
        core.cooldown_timer = None;

        info!(from = %from, to = %core.state, "Circuit breaker state transition");
    }
}

/// Builder for a [`CircuitBreaker`] with observers and a custom clock
pub struct CircuitBreakerBuilder<C: Clock = SystemClock> {
    config: CircuitBreakerConfig,
    clock: C,
    observers: Observers,
}

impl<C: Clock> CircuitBreakerBuilder<C> {
    pub(crate) fn from_config(config: CircuitBreakerConfig, clock: C) -> Self {
        Self { config, clock, observers: Observers::new() }
    }

    /// Consecutive failures in `NORMAL` that trip the breaker
    pub fn failure_threshold(mut self, threshold: u64) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    /// Consecutive trial successes in `PROBING` that close the breaker
    pub fn success_threshold(mut self, threshold: u64) -> Self {
        self.config.success_threshold = threshold;
        self
    }

    /// Time spent in `TRIPPED` before trial calls are allowed
    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.config.cooldown = cooldown;
        self
    }

    /// Trial calls allowed in flight at once while `PROBING`
    pub fn max_probe_calls(mut self, max_calls: u64) -> Self {
        self.config.max_probe_calls = max_calls;
        self
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: CircuitBreakerConfig) -> Self {
        self.config = config;
        self
    }

    /// Swap the clock
    pub fn clock<D: Clock>(self, clock: D) -> CircuitBreakerBuilder<D> {
        CircuitBreakerBuilder { config: self.config, clock, observers: self.observers }
    }

    /// Add a hook fired on entry into `TRIPPED`
    pub fn on_tripped<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.observers.on_tripped(hook);
        self
    }

    /// Add a hook fired on entry into `NORMAL`
    pub fn on_normal<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.observers.on_normal(hook);
        self
    }

    /// Add a hook fired on entry into `PROBING`
    pub fn on_probing<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.observers.on_probing(hook);
        self
    }

    /// Replace all registered hooks with a prepared set
    pub fn observers(mut self, observers: Observers) -> Self {
        self.observers = observers;
        self
    }

    /// Validate the configuration and build the breaker
    pub fn build(self) -> ConfigResult<CircuitBreaker<C>> {
        self.config.validate()?;
        Ok(CircuitBreaker::from_parts(self.config, self.clock, self.observers))
    }
}

impl<C: Clock + fmt::Debug> fmt::Debug for CircuitBreakerBuilder<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerBuilder")
            .field("config", &self.config)
            .field("clock", &self.clock)
            .field("observers", &self.observers)
            .finish()
    }
}
