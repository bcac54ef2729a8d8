//! Lifecycle observers
//!
//! Zero-argument hooks fired when a breaker enters a state. Hooks run after
//! the breaker has released its internal lock, so a hook may freely inspect
//! (or even drive) the breaker that called it.
//!
//! The breaker drops a notification whose transition has been superseded by
//! one already delivered, so the last state observers see is the breaker's
//! latest. Hooks for different transitions may still run concurrently on
//! different threads.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::error;

use crate::breaker::BreakerState;

/// A registered observer hook
pub type Hook = Arc<dyn Fn() + Send + Sync + 'static>;

/// Hooks grouped by the state whose entry triggers them
#[derive(Clone, Default)]
pub struct Observers {
    on_tripped: Vec<Hook>,
    on_normal: Vec<Hook>,
    on_probing: Vec<Hook>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook fired on every entry into `TRIPPED`
    pub fn on_tripped<F>(&mut self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_tripped.push(Arc::new(hook));
    }

    /// Register a hook fired on every entry into `NORMAL`
    pub fn on_normal<F>(&mut self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_normal.push(Arc::new(hook));
    }

    /// Register a hook fired on every entry into `PROBING`
    pub fn on_probing<F>(&mut self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_probing.push(Arc::new(hook));
    }

    /// Total number of registered hooks
    pub fn len(&self) -> usize {
        self.on_tripped.len() + self.on_normal.len() + self.on_probing.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn hooks_for(&self, state: BreakerState) -> &[Hook] {
        match state {
            BreakerState::Tripped => &self.on_tripped,
            BreakerState::Normal => &self.on_normal,
            BreakerState::Probing => &self.on_probing,
        }
    }

    /// Fire every hook registered for entry into `state`
    ///
    /// A panicking hook is logged and skipped; the remaining hooks still run.
    pub(crate) fn notify(&self, state: BreakerState) {
        for (index, hook) in self.hooks_for(state).iter().enumerate() {
            if catch_unwind(AssertUnwindSafe(|| hook())).is_err() {
                error!(state = %state, hook = index, "Circuit breaker observer panicked");
            }
        }
    }
}

impl fmt::Debug for Observers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observers")
            .field("on_tripped", &self.on_tripped.len())
            .field("on_normal", &self.on_normal.len())
            .field("on_probing", &self.on_probing.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn counting(counter: &Arc<AtomicU32>) -> impl Fn() + Send + Sync + 'static {
        let counter = Arc::clone(counter);
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_notify_routes_by_state() {
        let tripped = Arc::new(AtomicU32::new(0));
        let normal = Arc::new(AtomicU32::new(0));
        let probing = Arc::new(AtomicU32::new(0));

        let mut observers = Observers::new();
        observers.on_tripped(counting(&tripped));
        observers.on_normal(counting(&normal));
        observers.on_probing(counting(&probing));
        assert_eq!(observers.len(), 3);

        observers.notify(BreakerState::Tripped);
        observers.notify(BreakerState::Tripped);
        observers.notify(BreakerState::Probing);

        assert_eq!(tripped.load(Ordering::SeqCst), 2);
        assert_eq!(probing.load(Ordering::SeqCst), 1);
        assert_eq!(normal.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panicking_hook_does_not_stop_others() {
        let after = Arc::new(AtomicU32::new(0));

        let mut observers = Observers::new();
        observers.on_normal(|| panic!("observer failure"));
        observers.on_normal(counting(&after));

        observers.notify(BreakerState::Normal);
        assert_eq!(after.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_debug_shows_counts() {
        let mut observers = Observers::new();
        assert!(observers.is_empty());
        observers.on_probing(|| {});

        let rendered = format!("{observers:?}");
        assert!(rendered.contains("on_probing: 1"));
    }
}
