//! Cooperative cancellation of a run

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Mechanism to tell every component of a run to stop
///
/// A cancellation flag can be raised from any thread (typically from a signal
/// handler), and once it has been raised, it will remain raised for the rest
/// of its lifetime. Raising it multiple times is harmless.
///
/// Clones share the same underlying flag.
///
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);
//
impl CancelFlag {
    /// Create a flag that has not been raised yet
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask every observer of this flag to stop
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Truth that cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Shared atomic flag, for registration with OS signal handlers
    pub fn as_atomic(&self) -> Arc<AtomicBool> {
        self.0.clone()
    }
}

/// How a cancellable wait or burn ended
#[must_use]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Completion {
    /// The requested duration fully elapsed
    Finished,

    /// Cancellation was observed before the requested duration elapsed
    Cancelled,
}
