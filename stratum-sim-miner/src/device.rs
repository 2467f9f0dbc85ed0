//! Hashrate-producing miner device.
//!
//! Grounded on `examples/original_source/.../sim_primitives/miner.py`'s
//! `Miner.mine`/`mine_on_new_job`. A single background task repeatedly
//! samples a share-discovery delay (`Exponential(avg_time)` unless
//! `--no-luck`, where `avg_time = share_diff * 4.294967296 / speed_ghps`)
//! and, on firing, records the share on its own work meter and hands it to
//! whatever protocol processor is bound as the `ShareSubmitter`.
//!
//! `flush_any_pending_work=true` (a block-boundary job switch) preempts an
//! in-flight wait immediately via a `tokio::sync::Notify`; `false` (a
//! mid-window vardiff/queue update) only updates the job the loop will pick
//! up the next time it naturally wakes, matching spec §4.6/§4.8's
//! distinction between an immediate flush and a queued switch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Exp};
use tokio::sync::Notify;

use stratum_sim_core::{
    EventBus, HashrateMeter, MinerDevice, MiningJob, Scheduler, ShareSubmitter, TaskHandle,
};

/// 2^32 / 1e9, the same constant `HashrateMeter::get_speed` uses to convert
/// accumulated difficulty into a rate — here used in reverse, to convert a
/// difficulty into an expected share-finding time at a given hashrate.
const SPEED_CONST: f64 = 4.294967296;

pub struct HashrateProcess {
    name: String,
    bus: Arc<EventBus>,
    connection_uid: u64,
    scheduler: Scheduler,
    speed_ghps: f64,
    simulate_luck: bool,
    rng: Mutex<ChaCha8Rng>,
    job_slot: Mutex<Option<MiningJob>>,
    job_changed: Notify,
    submitter: Mutex<Option<Arc<dyn ShareSubmitter>>>,
    work_meter: HashrateMeter,
    is_mining: AtomicBool,
    mine_task: Mutex<Option<TaskHandle<()>>>,
}

impl HashrateProcess {
    pub fn new(
        name: impl Into<String>,
        bus: Arc<EventBus>,
        connection_uid: u64,
        scheduler: Scheduler,
        speed_ghps: f64,
        simulate_luck: bool,
        seed: u64,
    ) -> Arc<Self> {
        let device = Arc::new(Self {
            name: name.into(),
            bus,
            connection_uid,
            scheduler,
            speed_ghps,
            simulate_luck,
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
            job_slot: Mutex::new(None),
            job_changed: Notify::new(),
            submitter: Mutex::new(None),
            work_meter: HashrateMeter::new(
                scheduler,
                Duration::from_secs(60),
                Duration::from_secs(5),
                None,
            ),
            is_mining: AtomicBool::new(true),
            mine_task: Mutex::new(None),
        });
        let task = {
            let device = device.clone();
            scheduler.spawn(async move { device.mine_loop().await })
        };
        *device.mine_task.lock().unwrap() = Some(task);
        device
    }

    /// Bound after construction, since the protocol processor (the
    /// `ShareSubmitter`) is itself constructed with this device as its
    /// `MinerDevice` — see spec §4.9's note on cyclic back-references, the
    /// same shape resolved here for the miner side's device/processor pair.
    pub fn bind_submitter(&self, submitter: Arc<dyn ShareSubmitter>) {
        *self.submitter.lock().unwrap() = Some(submitter);
    }

    pub fn set_is_mining(&self, is_mining: bool) {
        self.is_mining.store(is_mining, Ordering::Release);
    }

    pub fn work_meter(&self) -> &HashrateMeter {
        &self.work_meter
    }

    fn log(&self, message: impl Into<String>) {
        self.bus
            .publish(&self.name, Some(self.connection_uid), message, None);
    }

    fn sample_delay(&self, avg_time: f64) -> Duration {
        if !self.simulate_luck {
            return Duration::from_secs_f64(avg_time);
        }
        let dist = Exp::new(1.0 / avg_time.max(1e-9)).expect("positive rate");
        let sampled = dist.sample(&mut *self.rng.lock().unwrap());
        Duration::from_secs_f64(sampled)
    }

    async fn mine_loop(self: Arc<Self>) {
        loop {
            let job = *self.job_slot.lock().unwrap();
            let Some(job) = job else {
                self.job_changed.notified().await;
                continue;
            };
            let diff = job.diff_target.diff_as_f64();
            let avg_time = diff * SPEED_CONST / self.speed_ghps;
            let dt = self.sample_delay(avg_time);

            tokio::select! {
                _ = self.scheduler.timeout(dt) => {
                    if self.is_mining.load(Ordering::Acquire) {
                        self.work_meter.measure(diff);
                        self.log(format!("solution found for job {}", job.uid));
                        if let Some(submitter) = self.submitter.lock().unwrap().clone() {
                            submitter.submit_share(job);
                        }
                    }
                }
                _ = self.job_changed.notified() => {
                    // a flushing mine_on_new_job preempted this wait; loop
                    // around and pick up the new job_slot value.
                }
            }
        }
    }
}

impl MinerDevice for HashrateProcess {
    fn mine_on_new_job(&self, job: MiningJob, flush_any_pending_work: bool) {
        *self.job_slot.lock().unwrap() = Some(job);
        if flush_any_pending_work {
            self.job_changed.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratum_sim_core::{Target, U256};
    use std::sync::atomic::AtomicUsize;

    struct CountingSubmitter(Arc<AtomicUsize>);
    impl ShareSubmitter for CountingSubmitter {
        fn submit_share(&self, _job: MiningJob) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn diff1() -> U256 {
        U256::from(0xFFFFu64) << 208
    }

    #[tokio::test(start_paused = true)]
    async fn idle_device_submits_nothing() {
        let sched = Scheduler::new();
        let bus = Arc::new(EventBus::new(sched.now()));
        let device = HashrateProcess::new("m", bus, 0, sched, 1_000_000.0, false, 1);
        let count = Arc::new(AtomicUsize::new(0));
        device.bind_submitter(Arc::new(CountingSubmitter(count.clone())));
        tokio::time::advance(Duration::from_secs(10)).await;
        tokio::task::yield_now().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn device_submits_shares_on_schedule() {
        let sched = Scheduler::new();
        let bus = Arc::new(EventBus::new(sched.now()));
        let device = HashrateProcess::new("m", bus, 0, sched, 1_000_000_000.0, false, 1);
        let count = Arc::new(AtomicUsize::new(0));
        device.bind_submitter(Arc::new(CountingSubmitter(count.clone())));

        let job = MiningJob {
            uid: 0,
            diff_target: Target::from_difficulty(1, diff1()),
        };
        device.mine_on_new_job(job, true);
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_secs(5)).await;
        tokio::task::yield_now().await;
        assert!(count.load(Ordering::SeqCst) > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_preempts_the_current_wait_immediately() {
        let sched = Scheduler::new();
        let bus = Arc::new(EventBus::new(sched.now()));
        // very low hashrate against a very high difficulty: without the
        // flush, we'd be waiting a long time.
        let device = HashrateProcess::new("m", bus, 0, sched, 1.0, false, 1);
        let count = Arc::new(AtomicUsize::new(0));
        device.bind_submitter(Arc::new(CountingSubmitter(count.clone())));

        let slow_job = MiningJob {
            uid: 0,
            diff_target: Target::from_difficulty(1_000_000, diff1()),
        };
        device.mine_on_new_job(slow_job, true);
        tokio::task::yield_now().await;

        let fast_job = MiningJob {
            uid: 1,
            diff_target: Target::from_difficulty(1, diff1()),
        };
        device.mine_on_new_job(fast_job, true);
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_secs(10)).await;
        tokio::task::yield_now().await;
        assert!(count.load(Ordering::SeqCst) > 0);
    }
}
