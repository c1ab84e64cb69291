//! Deferred-leave timers
//!
//! Each armed timer is a Tokio task that sleeps for the grace period and then
//! runs its callback. Per (stream, id) the lifecycle is:
//!
//! ```text
//! NONE -> ARMED -> FIRED
//!           |
//!           +----> CANCELLED -> NONE   (re-join, immediate leave, re-arm)
//! ```
//!
//! The scheduler itself keeps no per-member state: the owning
//! [`PresenceSet`](super::set::PresenceSet) stores the [`ArmedTimer`] and the
//! fire path compares generations under the stream lock, so a cancel that
//! races with a wake-up always wins.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tokio::time::Instant;

/// Deadline used when `now + delay` does not fit in an `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Handle to an armed deferred-leave timer
#[derive(Debug)]
pub struct ArmedTimer {
    generation: u64,
    handle: AbortHandle,
}

impl ArmedTimer {
    /// Unique generation of this timer
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Cancel the timer. A fire already in flight is discarded by the
    /// generation check on the stream.
    pub fn cancel(self) {
        self.handle.abort();
    }
}

/// Spawns deferred-leave timers on a Tokio runtime
#[derive(Debug)]
pub struct ExpiryScheduler {
    runtime: Handle,
    generation: AtomicU64,
}

impl ExpiryScheduler {
    /// Create a scheduler bound to the current Tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a Tokio runtime.
    pub fn new() -> Self {
        Self::with_handle(Handle::current())
    }

    /// Create a scheduler that spawns timers on the given runtime
    pub fn with_handle(runtime: Handle) -> Self {
        Self {
            runtime,
            generation: AtomicU64::new(1),
        }
    }

    /// Arm a timer that runs `on_fire` with its generation after `delay`
    pub fn arm<F>(&self, delay: Duration, on_fire: F) -> ArmedTimer
    where
        F: FnOnce(u64) + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let deadline = now.checked_add(delay).unwrap_or(now + FAR_FUTURE);

        let task = self.runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            on_fire(generation);
        });

        ArmedTimer {
            generation,
            handle: task.abort_handle(),
        }
    }
}

impl Default for ExpiryScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_delay() {
        let scheduler = ExpiryScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();

        let timer = scheduler.arm(Duration::from_secs(5), move |_| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert!(timer.generation() > 0);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timer_never_fires() {
        let scheduler = ExpiryScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();

        let timer = scheduler.arm(Duration::from_secs(1), move |_| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });
        timer.cancel();

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_delay_does_not_overflow() {
        let scheduler = ExpiryScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();

        let timer = scheduler.arm(Duration::MAX, move |_| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(86400 * 365)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        timer.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_generations_are_unique() {
        let scheduler = ExpiryScheduler::new();
        let a = scheduler.arm(Duration::from_secs(1), |_| {});
        let b = scheduler.arm(Duration::from_secs(1), |_| {});
        assert_ne!(a.generation(), b.generation());

        let seen = Arc::new(AtomicU64::new(0));
        let seen_clone = seen.clone();
        let c = scheduler.arm(Duration::from_millis(10), move |generation| {
            seen_clone.store(generation, Ordering::SeqCst);
        });
        let expected = c.generation();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(seen.load(Ordering::SeqCst), expected);
    }
}
