//! Mining session: current target, job registry, and (pool-side) the
//! vardiff control loop.
//!
//! Grounded on `sim_primitives/pool.py`'s `MiningSession` and §4.10 of the
//! simulation's vardiff design. The source subclasses `MiningSession` per
//! protocol (a `clz=MiningSession` override at construction time); per the
//! "dynamic kwargs / subclass hooks" design note we replace that with a
//! plain builder instead of a generic — nothing about session behavior
//! actually varies by protocol, only who constructs and owns one.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::hashrate::HashrateMeter;
use crate::job::{MiningJob, MiningJobRegistry};
use crate::scheduler::{Scheduler, TaskHandle};
use crate::target::Target;

/// Invoked once per vardiff retarget, after the session's target has
/// already been updated. The session is owned by a channel (V2) or
/// connection (V1); rather than a back-reference from session to owner
/// (the source's cyclic `MiningSession.owner`), the owner supplies this
/// closure at `run()` time, capturing whatever id it needs to reach
/// itself through its own registry.
pub type VardiffListener = Arc<dyn Fn(&MiningSession) + Send + Sync>;

pub struct MiningSession {
    pub name: String,
    scheduler: Scheduler,
    target: Mutex<Target>,
    enable_vardiff: bool,
    vardiff_window: Duration,
    desired_submits_per_sec: f64,
    meter: Option<HashrateMeter>,
    registry: Mutex<MiningJobRegistry>,
    vardiff_task: Mutex<Option<TaskHandle<()>>>,
    running: AtomicBool,
    next_seq_num: AtomicU64,
}

/// Builder for a `MiningSession`, replacing the source's `clz=` override
/// hook at session-creation time.
pub struct MiningSessionBuilder {
    name: String,
    scheduler: Scheduler,
    target: Target,
    enable_vardiff: bool,
    vardiff_window: Duration,
    desired_submits_per_sec: f64,
    meter_window: Duration,
    meter_granularity: Duration,
}

impl MiningSessionBuilder {
    pub fn new(scheduler: Scheduler, name: impl Into<String>, target: Target) -> Self {
        Self {
            name: name.into(),
            scheduler,
            target,
            enable_vardiff: false,
            vardiff_window: Duration::from_secs(60),
            desired_submits_per_sec: 0.3,
            meter_window: Duration::from_secs(60),
            meter_granularity: Duration::from_secs(5),
        }
    }

    pub fn enable_vardiff(mut self, desired_submits_per_sec: f64, window: Duration) -> Self {
        self.enable_vardiff = true;
        self.desired_submits_per_sec = desired_submits_per_sec;
        self.vardiff_window = window;
        self
    }

    pub fn meter_shape(mut self, window: Duration, granularity: Duration) -> Self {
        self.meter_window = window;
        self.meter_granularity = granularity;
        self
    }

    pub fn build(self) -> MiningSession {
        let meter = if self.enable_vardiff {
            Some(HashrateMeter::new(
                self.scheduler,
                self.meter_window,
                self.meter_granularity,
                None,
            ))
        } else {
            None
        };
        MiningSession {
            name: self.name,
            scheduler: self.scheduler,
            target: Mutex::new(self.target),
            enable_vardiff: self.enable_vardiff,
            vardiff_window: self.vardiff_window,
            desired_submits_per_sec: self.desired_submits_per_sec,
            meter,
            registry: Mutex::new(MiningJobRegistry::new()),
            vardiff_task: Mutex::new(None),
            running: AtomicBool::new(false),
            next_seq_num: AtomicU64::new(0),
        }
    }
}

impl MiningSession {
    pub fn current_target(&self) -> Target {
        *self.target.lock().unwrap()
    }

    pub fn set_target(&self, target: Target) {
        *self.target.lock().unwrap() = target;
    }

    pub fn registry(&self) -> std::sync::MutexGuard<'_, MiningJobRegistry> {
        self.registry.lock().unwrap()
    }

    pub fn meter(&self) -> Option<&HashrateMeter> {
        self.meter.as_ref()
    }

    /// Monotonic per-channel submit sequence number, used by V2 miner
    /// processors when building `SubmitSharesStandard`.
    pub fn next_sequence_number(&self) -> u64 {
        self.next_seq_num.fetch_add(1, Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Activates the session: starts the vardiff loop if enabled. Between
    /// channel/connection setup and `run()`, no jobs are mined — callers
    /// must not issue jobs before calling this.
    pub fn run(self: &Arc<Self>, on_vardiff_change: VardiffListener) {
        self.running.store(true, Ordering::Release);
        if !self.enable_vardiff {
            return;
        }
        let session = self.clone();
        let window = self.vardiff_window;
        let task = self.scheduler.spawn(async move {
            loop {
                session.scheduler.timeout(window).await;
                session.retarget(&on_vardiff_change);
            }
        });
        *self.vardiff_task.lock().unwrap() = Some(task);
    }

    /// One vardiff retarget step (spec §4.10): `r` = observed submits/sec
    /// (treated as 0 when the meter hasn't warmed up), `f = r==0 ? 0.5 :
    /// r/desired`, clamped to [0.25, 4], `target /= f`.
    fn retarget(&self, on_vardiff_change: &VardiffListener) {
        let Some(meter) = &self.meter else { return };
        let r = meter.get_submits_per_sec().unwrap_or(0.0);
        let f = if r == 0.0 {
            0.5
        } else {
            (r / self.desired_submits_per_sec).clamp(0.25, 4.0)
        };
        {
            let mut target = self.target.lock().unwrap();
            *target = target.div_by_factor(f);
        }
        tracing::debug!(session = %self.name, factor = f, submits_per_sec = r, "vardiff retarget");
        on_vardiff_change(self);
    }

    /// Cancels the vardiff task and stops the meter. Idempotent.
    pub fn terminate(&self) {
        if let Some(task) = self.vardiff_task.lock().unwrap().take() {
            task.interrupt();
        }
        self.running.store(false, Ordering::Release);
    }

    pub fn new_job(&self) -> MiningJob {
        let target = self.current_target();
        self.registry.lock().unwrap().new_job(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::U256;
    use std::sync::atomic::AtomicUsize;

    fn diff1() -> U256 {
        U256::from(0xFFFFu64) << 208
    }

    #[tokio::test(start_paused = true)]
    async fn terminating_an_already_terminated_session_is_a_no_op() {
        let sched = Scheduler::new();
        let session = Arc::new(
            MiningSessionBuilder::new(sched, "s", Target::from_difficulty(1000, diff1())).build(),
        );
        session.terminate();
        session.terminate();
    }

    #[tokio::test(start_paused = true)]
    async fn vardiff_drops_target_by_factor_two_with_no_submits() {
        let sched = Scheduler::new();
        let session = Arc::new(
            MiningSessionBuilder::new(sched, "s", Target::from_difficulty(100_000, diff1()))
                .enable_vardiff(0.3, Duration::from_secs(60))
                .build(),
        );
        let initial = session.current_target().to_difficulty();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        session.run(Arc::new(move |_s: &MiningSession| {
            calls2.fetch_add(1, Ordering::SeqCst);
        }));
        tokio::time::advance(Duration::from_secs(60)).await;
        tokio::task::yield_now().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // target increased (factor 0.5 applied) => difficulty halved
        let after = session.current_target().to_difficulty();
        assert_eq!(after * U256::from(2u32), initial);
        session.terminate();
    }
}
