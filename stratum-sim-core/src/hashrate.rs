//! Rolling-window hashrate meter.
//!
//! Grounded on `examples/original_source/.../sim_primitives/hashrate_meter.py`.
//! The buffers are accumulated-difficulty-per-slot floats (the original
//! also uses numpy float64 arrays here, so this is not a precision
//! regression versus the source). A background task rolls the window
//! every `granularity`; an idle miner's silence is absorbed into the
//! "frozen time" buffer instead of diluting the speed estimate.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use crate::scheduler::{Scheduler, TaskHandle};

/// 2^32 / 1e9, converts accumulated difficulty-seconds into a rate; see
/// `get_speed`'s docstring in the source for the derivation.
const SPEED_CONST: f64 = 4.294967296;

struct MeterState {
    time_started: tokio::time::Instant,
    pow_buffer: VecDeque<f64>,
    submit_buffer: VecDeque<f64>,
    frozen_time_buffer: VecDeque<f64>,
    on_hold: bool,
    hold_task: Option<TaskHandle<()>>,
}

impl MeterState {
    fn fresh(slots: usize, time_started: tokio::time::Instant) -> Self {
        Self {
            time_started,
            pow_buffer: VecDeque::from(vec![0.0; slots]),
            submit_buffer: VecDeque::from(vec![0.0; slots]),
            frozen_time_buffer: VecDeque::from(vec![0.0; slots]),
            on_hold: false,
            hold_task: None,
        }
    }
}

pub struct HashrateMeter {
    state: std::sync::Arc<Mutex<MeterState>>,
    scheduler: Scheduler,
    window_size: Duration,
    granularity: Duration,
    auto_hold_threshold: Option<Duration>,
    roll_task: Option<TaskHandle<()>>,
}

impl HashrateMeter {
    /// `window_size` must be an exact multiple of `granularity`.
    pub fn new(
        scheduler: Scheduler,
        window_size: Duration,
        granularity: Duration,
        auto_hold_threshold: Option<Duration>,
    ) -> Self {
        let slots = (window_size.as_secs_f64() / granularity.as_secs_f64()).round() as usize;
        debug_assert!(slots > 0, "window_size must be >= granularity");
        let state = std::sync::Arc::new(Mutex::new(MeterState::fresh(slots, scheduler.now())));

        let roll_task = {
            let state = state.clone();
            let scheduler = scheduler;
            let granularity = granularity;
            Some(scheduler.spawn(async move {
                loop {
                    scheduler.timeout(granularity).await;
                    let mut s = state.lock().unwrap();
                    if !s.on_hold {
                        s.pow_buffer.pop_back();
                        s.pow_buffer.push_front(0.0);
                        s.submit_buffer.pop_back();
                        s.submit_buffer.push_front(0.0);
                        s.frozen_time_buffer.pop_back();
                        s.frozen_time_buffer.push_front(0.0);
                    } else if let Some(front) = s.frozen_time_buffer.front_mut() {
                        *front += granularity.as_secs_f64();
                    }
                }
            }))
        };

        Self {
            state,
            scheduler,
            window_size,
            granularity,
            auto_hold_threshold,
            roll_task,
        }
    }

    /// Clears all buffers and restarts the window at `time_started`.
    pub fn reset(&self, time_started: tokio::time::Instant) {
        let slots = (self.window_size.as_secs_f64() / self.granularity.as_secs_f64()).round() as usize;
        let mut s = self.state.lock().unwrap();
        if let Some(hold) = s.hold_task.take() {
            hold.interrupt();
        }
        *s = MeterState::fresh(slots, time_started);
    }

    /// Records a submitted share of the given difficulty.
    pub fn measure(&self, share_diff: f64) {
        let mut s = self.state.lock().unwrap();
        if let Some(front) = s.pow_buffer.front_mut() {
            *front += share_diff;
        }
        if let Some(front) = s.submit_buffer.front_mut() {
            *front += 1.0;
        }
        s.on_hold = false;
        if let Some(hold) = s.hold_task.take() {
            hold.interrupt();
        }
        if let Some(threshold) = self.auto_hold_threshold {
            let state = self.state.clone();
            let scheduler = self.scheduler;
            s.hold_task = Some(scheduler.spawn(async move {
                scheduler.timeout(threshold).await;
                let mut s = state.lock().unwrap();
                s.on_hold = true;
                s.hold_task = None;
            }));
        }
    }

    fn elapsed_secs(&self, s: &MeterState) -> f64 {
        let total_held: f64 = s.frozen_time_buffer.iter().sum();
        (self.scheduler.now() - s.time_started).as_secs_f64() - total_held
    }

    /// `None` when fewer than 1 second of unfrozen time has elapsed, or no
    /// work has been measured in the window.
    pub fn get_speed(&self) -> Option<f64> {
        let s = self.state.lock().unwrap();
        let mut elapsed = self.elapsed_secs(&s);
        let total_work: f64 = s.pow_buffer.iter().sum();
        if elapsed > self.window_size.as_secs_f64() {
            elapsed = self.window_size.as_secs_f64();
        }
        if elapsed < 1.0 || total_work == 0.0 {
            return None;
        }
        Some(total_work * SPEED_CONST / elapsed)
    }

    /// `None` when fewer than 1 second of unfrozen time has elapsed. Unlike
    /// `get_speed`, a zero-work window still returns `Some(0.0)`.
    pub fn get_submits_per_sec(&self) -> Option<f64> {
        let s = self.state.lock().unwrap();
        let mut elapsed = self.elapsed_secs(&s);
        if elapsed < 1.0 {
            return None;
        }
        if elapsed > self.window_size.as_secs_f64() {
            elapsed = self.window_size.as_secs_f64();
        }
        let total_submits: f64 = s.submit_buffer.iter().sum();
        Some(total_submits / elapsed)
    }

    pub fn is_on_hold(&self) -> bool {
        self.state.lock().unwrap().on_hold
    }

    /// Idempotent: cancels the roll task and any outstanding hold task.
    pub fn terminate(&mut self) {
        if let Some(roll) = self.roll_task.take() {
            roll.interrupt();
        }
        let mut s = self.state.lock().unwrap();
        if let Some(hold) = s.hold_task.take() {
            hold.interrupt();
        }
    }
}

impl Drop for HashrateMeter {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn speed_is_none_before_one_second_elapsed() {
        let sched = Scheduler::new();
        let meter = HashrateMeter::new(sched, Duration::from_secs(60), Duration::from_secs(5), None);
        meter.measure(1000.0);
        assert_eq!(meter.get_speed(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn speed_is_none_with_no_work() {
        let sched = Scheduler::new();
        let meter = HashrateMeter::new(sched, Duration::from_secs(60), Duration::from_secs(5), None);
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(meter.get_speed(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn speed_reflects_measured_work() {
        let sched = Scheduler::new();
        let meter = HashrateMeter::new(sched, Duration::from_secs(60), Duration::from_secs(5), None);
        meter.measure(1_000_000.0);
        tokio::time::advance(Duration::from_secs(10)).await;
        let speed = meter.get_speed().unwrap();
        assert!(speed > 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_period_is_frozen_not_diluting_speed() {
        let sched = Scheduler::new();
        let meter = HashrateMeter::new(
            sched,
            Duration::from_secs(60),
            Duration::from_secs(5),
            Some(Duration::from_secs(2)),
        );
        meter.measure(1_000_000.0);
        // advance well past the auto-hold threshold with no further shares
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(meter.is_on_hold());
    }
}
