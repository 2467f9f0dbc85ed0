//! Pool-wide share accounting.
//!
//! Grounded on `examples/original_source/.../sim_primitives/pool.py`'s
//! `Pool.account_accepted_shares`/`account_stale_shares`/
//! `account_rejected_submits`/`process_submit`. Implements
//! `stratum_sim_core::ShareAccounting` so `stratum-sim-v1`/
//! `stratum-sim-v2`/`stratum-sim-translator` never need to depend on this
//! crate directly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use stratum_sim_core::{HashrateMeter, MiningSession, Scheduler, ShareAccounting, SubmitOutcome};

/// Snapshot of the pool's aggregate counters, returned by `--plain-output`
/// (spec §6) and used by the end-to-end scenario assertions in §8.
#[derive(Debug, Clone, Copy, Default)]
pub struct AggregateSnapshot {
    pub accepted_submits: u64,
    pub accepted_shares: f64,
    pub stale_submits: u64,
    pub stale_shares: f64,
    pub rejected_submits: u64,
}

pub struct PoolAggregate {
    accepted_submits: AtomicU64,
    stale_submits: AtomicU64,
    rejected_submits: AtomicU64,
    accepted_shares: Mutex<f64>,
    stale_shares: Mutex<f64>,
    meter_accepted: HashrateMeter,
    meter_stale: HashrateMeter,
}

impl PoolAggregate {
    pub fn new(scheduler: Scheduler) -> Self {
        Self {
            accepted_submits: AtomicU64::new(0),
            stale_submits: AtomicU64::new(0),
            rejected_submits: AtomicU64::new(0),
            accepted_shares: Mutex::new(0.0),
            stale_shares: Mutex::new(0.0),
            meter_accepted: HashrateMeter::new(scheduler, Duration::from_secs(60), Duration::from_secs(5), None),
            meter_stale: HashrateMeter::new(scheduler, Duration::from_secs(60), Duration::from_secs(5), None),
        }
    }

    pub fn snapshot(&self) -> AggregateSnapshot {
        AggregateSnapshot {
            accepted_submits: self.accepted_submits.load(Ordering::Relaxed),
            accepted_shares: *self.accepted_shares.lock().unwrap(),
            stale_submits: self.stale_submits.load(Ordering::Relaxed),
            stale_shares: *self.stale_shares.lock().unwrap(),
            rejected_submits: self.rejected_submits.load(Ordering::Relaxed),
        }
    }

    pub fn meter_accepted(&self) -> &HashrateMeter {
        &self.meter_accepted
    }

    pub fn meter_stale(&self) -> &HashrateMeter {
        &self.meter_stale
    }
}

impl ShareAccounting for PoolAggregate {
    /// Spec §4.4's classification, unconditionally:
    /// - unknown job_uid → rejected
    /// - known and `uid >= min_valid_uid` → accepted
    /// - known but retired → stale
    fn process_submit(&self, job_uid: u64, session: &MiningSession) -> SubmitOutcome {
        let job = session.registry().get(job_uid);
        let Some(job) = job else {
            self.rejected_submits.fetch_add(1, Ordering::Relaxed);
            return SubmitOutcome::Rejected { target: None };
        };

        let diff = job.diff_target.diff_as_f64();
        if session.registry().is_valid(job_uid) {
            self.accepted_submits.fetch_add(1, Ordering::Relaxed);
            *self.accepted_shares.lock().unwrap() += diff;
            self.meter_accepted.measure(diff);
            if let Some(meter) = session.meter() {
                meter.measure(diff);
            }
            SubmitOutcome::Accepted { target: job.diff_target }
        } else {
            self.stale_submits.fetch_add(1, Ordering::Relaxed);
            *self.stale_shares.lock().unwrap() += diff;
            self.meter_stale.measure(diff);
            SubmitOutcome::Rejected { target: Some(job.diff_target) }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratum_sim_core::{MiningSessionBuilder, Target, U256};

    fn diff1() -> U256 {
        U256::from(0xFFFFu64) << 208
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_job_is_rejected_not_stale() {
        let sched = Scheduler::new();
        let aggregate = PoolAggregate::new(sched);
        let session = MiningSessionBuilder::new(sched, "s", Target::from_difficulty(1000, diff1())).build();
        let outcome = aggregate.process_submit(42, &session);
        assert!(!outcome.is_accepted());
        assert!(!outcome.is_stale());
        assert_eq!(aggregate.snapshot().rejected_submits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn valid_job_is_accepted() {
        let sched = Scheduler::new();
        let aggregate = PoolAggregate::new(sched);
        let session = MiningSessionBuilder::new(sched, "s", Target::from_difficulty(1000, diff1())).build();
        let job = session.new_job();
        let outcome = aggregate.process_submit(job.uid, &session);
        assert!(outcome.is_accepted());
        let snap = aggregate.snapshot();
        assert_eq!(snap.accepted_submits, 1);
        assert!(snap.accepted_shares > 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn retired_job_is_stale() {
        let sched = Scheduler::new();
        let aggregate = PoolAggregate::new(sched);
        let session = MiningSessionBuilder::new(sched, "s", Target::from_difficulty(1000, diff1())).build();
        let job = session.new_job();
        session.registry().retire_all_jobs();
        let outcome = aggregate.process_submit(job.uid, &session);
        assert!(!outcome.is_accepted());
        assert!(outcome.is_stale());
        assert_eq!(aggregate.snapshot().stale_submits, 1);
    }
}
