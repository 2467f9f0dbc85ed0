//! Discrete-event scheduler abstraction.
//!
//! Backed by tokio's virtual clock (`tokio::time::pause`) rather than a
//! hand-rolled event loop: `now()` reads `tokio::time::Instant::now()`,
//! `timeout` is `tokio::time::sleep`, `spawn` is `tokio::task::spawn`, and
//! `interrupt` is `JoinHandle::abort()`. Cancellation is only observed at
//! the spawned task's next `.await` point, matching the "delivered at next
//! suspension" semantics the simulator requires. Passing `--realtime`
//! leaves the clock unpaused and tasks run against wall time at
//! `rt_factor`.

use std::time::Duration;
use tokio::task::JoinHandle;

/// A handle to a spawned task. Dropping it does not cancel the task (same
/// as `tokio::task::JoinHandle`); call `interrupt()` explicitly.
pub struct TaskHandle<T> {
    inner: JoinHandle<T>,
}

impl<T> TaskHandle<T> {
    /// Cancel the task. The cancellation is delivered at the task's next
    /// suspension point (its next `.await`), not synchronously.
    pub fn interrupt(&self) {
        self.inner.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }

    pub async fn join(self) -> Result<T, tokio::task::JoinError> {
        self.inner.await
    }
}

/// Virtual (or, under `--realtime`, real) time source.
#[derive(Clone, Copy, Debug, Default)]
pub struct Scheduler {
    rt_factor: RtFactor,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            rt_factor: RtFactor::IDENTITY,
        }
    }

    /// Scenario entry point for `--realtime --rt-factor <f>`: every
    /// `timeout` call is scaled by `rt_factor` before sleeping. Under a
    /// paused clock the scaling is immaterial since the sleep resolves
    /// instantly regardless of its requested length.
    pub fn with_rt_factor(rt_factor: RtFactor) -> Self {
        Self { rt_factor }
    }

    pub fn now(&self) -> tokio::time::Instant {
        tokio::time::Instant::now()
    }

    /// Suspends the current task for `dt`, scaled by `rt_factor`. Under a
    /// paused clock this advances instantly to the next scheduled wakeup;
    /// under `--realtime` it actually sleeps.
    pub async fn timeout(&self, dt: Duration) {
        tokio::time::sleep(self.rt_factor.scale(dt)).await;
    }

    /// Spawns a cooperative task onto the current tokio runtime.
    pub fn spawn<F>(&self, task: F) -> TaskHandle<F::Output>
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        TaskHandle {
            inner: tokio::task::spawn(task),
        }
    }
}

/// Wraps a real-time scaling factor so `--rt-factor` can be applied to any
/// `timeout` call without threading a config struct through every layer.
#[derive(Clone, Copy, Debug)]
pub struct RtFactor(pub f64);

impl Default for RtFactor {
    fn default() -> Self {
        RtFactor::IDENTITY
    }
}

impl RtFactor {
    pub const IDENTITY: RtFactor = RtFactor(1.0);

    pub fn scale(&self, dt: Duration) -> Duration {
        if (self.0 - 1.0).abs() < f64::EPSILON {
            return dt;
        }
        Duration::from_secs_f64(dt.as_secs_f64() * self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn timeout_advances_virtual_clock() {
        let sched = Scheduler::new();
        let start = sched.now();
        sched.timeout(Duration::from_secs(5)).await;
        assert_eq!(sched.now() - start, Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_is_observed_at_next_suspension() {
        let sched = Scheduler::new();
        let handle = sched.spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            42
        });
        handle.interrupt();
        let result = handle.join().await;
        assert!(result.unwrap_err().is_cancelled());
    }

    #[test]
    fn rt_factor_scales_duration() {
        let f = RtFactor(0.5);
        assert_eq!(f.scale(Duration::from_secs(10)), Duration::from_secs(5));
        assert_eq!(RtFactor::IDENTITY.scale(Duration::from_secs(10)), Duration::from_secs(10));
    }
}
