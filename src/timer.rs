//! Periodic callbacks with drift compensation.
//!
//! Every scheduled callback runs on its own tokio task:
//!
//! ```text
//! wait ──(stop signaled)──► exit
//!   │
//!   └─(wait elapsed)─► callback(id) ─► measure ─► next wait = interval - elapsed
//! ```
//!
//! The next wait subtracts the time the callback took, floored at
//! [`MIN_WAIT`], so a callback running long does not push later ticks back.
//! Ticks that are missed entirely are not made up. Stopping is cooperative:
//! a timer notices the stop signal at its next wait, so the latency is at most
//! one callback.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Lower bound for the wait between two ticks.
pub const MIN_WAIT: Duration = Duration::from_micros(1);

/// Wait before the next tick, given how long the last callback took.
pub fn next_wait(interval: Duration, elapsed: Duration) -> Duration {
    interval.saturating_sub(elapsed).max(MIN_WAIT)
}

/// Handle to a single scheduled callback.
#[derive(Debug)]
pub struct TimerHandle {
    id: u32,
    abort: AbortHandle,
}

impl TimerHandle {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Cancel this timer only. A callback already running completes first.
    pub fn cancel(&self) {
        self.abort.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }
}

/// A group of periodic callbacks sharing one stop signal.
///
/// Once [`stop_all`](Self::stop_all) has been called the group stays stopped:
/// timers scheduled afterwards exit at their first wait.
pub struct PeriodicTimer {
    stop: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    callback_budget: Option<Duration>,
}

impl Default for PeriodicTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl PeriodicTimer {
    pub fn new() -> Self {
        Self {
            stop: watch::Sender::new(false),
            tasks: Mutex::new(Vec::new()),
            callback_budget: None,
        }
    }

    /// Log a warning whenever a callback runs longer than `budget`.
    pub fn with_callback_budget(mut self, budget: Option<Duration>) -> Self {
        self.callback_budget = budget;
        self
    }

    /// Run `callback(id)` every `interval` (once if not `recurring`).
    ///
    /// The first call happens one `interval` after scheduling. Must be called
    /// within a tokio runtime.
    pub fn schedule<F>(&self, mut callback: F, id: u32, interval: Duration, recurring: bool) -> TimerHandle
    where
        F: FnMut(u32) + Send + 'static,
    {
        let mut stop = self.stop.subscribe();
        let budget = self.callback_budget;
        debug!(id, ?interval, recurring, "scheduling timer");

        let task = tokio::spawn(async move {
            let mut wait = interval;
            loop {
                tokio::select! {
                    biased;
                    // An Err means the sender is gone, which also stops the timer.
                    _ = stop.wait_for(|stopped| *stopped) => break,
                    () = tokio::time::sleep(wait) => {}
                }

                let started = Instant::now();
                callback(id);
                let elapsed = started.elapsed();

                if let Some(budget) = budget {
                    if elapsed > budget {
                        warn!(id, ?elapsed, ?budget, "timer callback exceeded its budget");
                    }
                }
                if !recurring {
                    break;
                }
                wait = next_wait(interval, elapsed);
                trace!(id, ?elapsed, ?wait, "timer tick");
            }
            trace!(id, "timer finished");
        });

        let handle = TimerHandle {
            id,
            abort: task.abort_handle(),
        };
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
        handle
    }

    /// Signal every timer to exit. Idempotent, never blocks.
    pub fn stop_all(&self) {
        if !self.stop.send_replace(true) {
            debug!("stopping all timers");
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    /// Number of timers whose task has not finished yet.
    pub fn active(&self) -> usize {
        let tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.iter().filter(|t| !t.is_finished()).count()
    }

    /// Stop every timer and wait for their tasks to end.
    ///
    /// A task cannot wait for itself: when called from inside one of the
    /// timer tasks, that task is detached instead of joined.
    pub async fn shutdown(&self) {
        self.stop_all();
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        let current = tokio::task::try_id();
        let joinable = tasks.into_iter().filter(|task| {
            let is_current = Some(task.id()) == current;
            if is_current {
                debug!("detaching the timer task that requested shutdown");
            }
            !is_current
        });
        for result in join_all(joinable).await {
            if let Err(e) = result {
                if e.is_panic() {
                    warn!("timer task panicked: {e}");
                }
            }
        }
    }
}

impl Drop for PeriodicTimer {
    fn drop(&mut self) {
        self.stop_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_wait_compensates_callback_time() {
        let interval = Duration::from_millis(10);
        assert_eq!(next_wait(interval, Duration::ZERO), interval);
        assert_eq!(next_wait(interval, Duration::from_millis(3)), Duration::from_millis(7));
        assert_eq!(next_wait(interval, Duration::from_millis(10)), MIN_WAIT);
        assert_eq!(next_wait(interval, Duration::from_millis(25)), MIN_WAIT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_all_is_idempotent() {
        let timer = PeriodicTimer::new();
        timer.schedule(|_| {}, 1, Duration::from_millis(5), true);
        timer.stop_all();
        timer.stop_all();
        assert!(timer.is_stopped());
        timer.shutdown().await;
        assert_eq!(timer.active(), 0);
    }
}
