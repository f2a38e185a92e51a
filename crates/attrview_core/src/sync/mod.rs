//! Background synchronization barrier.
//!
//! # Responsibility
//! - Let hosts mark storage synchronization in progress.
//! - Block read paths until synchronization quiesces.
//!
//! # Invariants
//! - The in-flight counter never underflows; guards end what they begin.

use log::{debug, warn};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Upper bound a reader waits before proceeding anyway.
pub const MAX_SYNC_WAIT: Duration = Duration::from_secs(30);

#[derive(Debug, Default)]
pub struct SyncBarrier {
    in_flight: Mutex<usize>,
    quiet: Condvar,
}

/// Marks one synchronization as running until dropped.
#[must_use = "synchronization ends when the guard is dropped"]
pub struct SyncGuard<'a> {
    barrier: &'a SyncBarrier,
}

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.barrier.end();
    }
}

impl SyncBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self) -> MutexGuard<'_, usize> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks synchronization as started.
    pub fn begin(&self) -> SyncGuard<'_> {
        *self.counter() += 1;
        SyncGuard { barrier: self }
    }

    fn end(&self) {
        let mut in_flight = self.counter();
        *in_flight = in_flight.saturating_sub(1);
        if *in_flight == 0 {
            self.quiet.notify_all();
        }
    }

    pub fn is_syncing(&self) -> bool {
        *self.counter() > 0
    }

    /// Blocks until no synchronization is running or `timeout` elapses.
    ///
    /// Returns `false` on timeout.
    pub fn wait_quiescent(&self, timeout: Duration) -> bool {
        let started_at = Instant::now();
        let mut in_flight = self.counter();
        while *in_flight > 0 {
            let Some(remaining) = timeout.checked_sub(started_at.elapsed()) else {
                warn!("event=sync_wait module=sync status=degraded reason=timeout in_flight={}", *in_flight);
                return false;
            };
            in_flight = match self.quiet.wait_timeout(in_flight, remaining) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        if started_at.elapsed() > Duration::from_millis(1) {
            debug!(
                "event=sync_wait module=sync status=ok waited_ms={}",
                started_at.elapsed().as_millis()
            );
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::SyncBarrier;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn idle_barrier_does_not_block() {
        let barrier = SyncBarrier::new();
        assert!(!barrier.is_syncing());
        assert!(barrier.wait_quiescent(Duration::from_millis(10)));
    }

    #[test]
    fn wait_times_out_while_syncing_and_resumes_after_end() {
        let barrier = Arc::new(SyncBarrier::new());
        let guard = barrier.begin();
        assert!(barrier.is_syncing());
        assert!(!barrier.wait_quiescent(Duration::from_millis(20)));
        drop(guard);

        let _guard = barrier.begin();
        let waiter = {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || barrier.wait_quiescent(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        drop(_guard);
        assert!(waiter.join().unwrap());
    }
}
