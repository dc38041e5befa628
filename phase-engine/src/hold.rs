//! Cancellable waiting

use crate::cancel::{CancelFlag, Completion};
use std::time::{Duration, Instant};

/// Maximal amount of time spent sleeping without checking for cancellation
pub const HOLD_CHUNK: Duration = Duration::from_secs(1);

/// Idle for `duration`, or until `cancel` is raised
///
/// Cancellation is checked at least once per [`HOLD_CHUNK`], so an interrupt
/// shortens the wait to at most one chunk. A zero duration returns
/// immediately.
///
pub fn hold(duration: Duration, cancel: &CancelFlag) -> Completion {
    wait_in_chunks(Instant::now(), duration, HOLD_CHUNK, cancel)
}

/// Sleep until `duration` has elapsed since `start`, waking up at least once
/// per `chunk` to check for cancellation
///
/// Deadlines are computed from the monotonic clock, so oversleeping in one
/// chunk shortens the next one instead of accumulating.
///
pub(crate) fn wait_in_chunks(
    start: Instant,
    duration: Duration,
    chunk: Duration,
    cancel: &CancelFlag,
) -> Completion {
    debug_assert!(!chunk.is_zero(), "Waiting in zero-sized chunks would spin");
    loop {
        let remaining = duration.saturating_sub(start.elapsed());
        if remaining.is_zero() {
            return Completion::Finished;
        }
        if cancel.is_cancelled() {
            return Completion::Cancelled;
        }
        std::thread::sleep(remaining.min(chunk));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use more_asserts::{assert_ge, assert_lt};

    #[test]
    fn zero_duration() {
        let start = Instant::now();
        assert_eq!(hold(Duration::ZERO, &CancelFlag::new()), Completion::Finished);
        assert_lt!(start.elapsed(), Duration::from_millis(100));
    }

    #[test]
    fn full_duration() {
        let start = Instant::now();
        let duration = Duration::from_millis(150);
        assert_eq!(hold(duration, &CancelFlag::new()), Completion::Finished);
        assert_ge!(start.elapsed(), duration);
    }

    #[test]
    fn already_cancelled() {
        let cancel = CancelFlag::new();
        cancel.cancel();
        let start = Instant::now();
        assert_eq!(hold(Duration::from_secs(60), &cancel), Completion::Cancelled);
        assert_lt!(start.elapsed(), Duration::from_millis(100));
    }

    #[test]
    fn cancel_mid_hold() {
        let cancel = CancelFlag::new();
        let start = Instant::now();
        let completion = std::thread::scope(|s| {
            s.spawn(|| {
                std::thread::sleep(Duration::from_millis(200));
                cancel.cancel();
            });
            hold(Duration::from_secs(60), &cancel)
        });
        assert_eq!(completion, Completion::Cancelled);
        // Cancellation lands within one chunk of being requested
        let deadline = Duration::from_millis(200) + HOLD_CHUNK + Duration::from_millis(300);
        assert_lt!(start.elapsed(), deadline);
    }

    #[test]
    fn chunked_wait_catches_up() {
        let cancel = CancelFlag::new();
        let start = Instant::now();
        std::thread::sleep(Duration::from_millis(50));
        let completion = wait_in_chunks(
            start,
            Duration::from_millis(100),
            Duration::from_millis(10),
            &cancel,
        );
        assert_eq!(completion, Completion::Finished);
        assert_lt!(start.elapsed(), Duration::from_millis(400));
    }
}
