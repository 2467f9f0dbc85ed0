//! In-memory connection link with per-message latency.
//!
//! Grounded on `examples/original_source/.../sim_primitives/network.py`.
//! Two directed FIFO queues connect a downstream (miner-like) peer to an
//! upstream (pool-like) peer. `put` is immediate; `get` pops the head of
//! the queue and then sleeps for a freshly sampled latency before handing
//! the message back — because one reader drains its own queue
//! sequentially, this preserves FIFO order within a direction even though
//! each message's delay is independently sampled (the "stale share" test
//! in the testable-properties table depends on exactly this: a submit
//! enqueued before a block arrives but delivered after it).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use tokio::sync::Notify;

use crate::error::{CoreError, CoreResult};
use crate::scheduler::Scheduler;

/// Monotonic uid generator, shared by any number of `Connection`s —
/// replaces the source's module-level `gen_uid(env)` counter with an
/// explicit, injectable instance.
#[derive(Default)]
pub struct UidGenerator {
    next: AtomicU64,
}

impl UidGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_uid(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

struct ConnectionStore<M> {
    queue: Mutex<VecDeque<M>>,
    notify: Notify,
    mean_latency: Duration,
    stddev_percent: f64,
    rng: Mutex<ChaCha8Rng>,
    scheduler: Scheduler,
}

impl<M> ConnectionStore<M> {
    fn new(scheduler: Scheduler, mean_latency: Duration, stddev_percent: f64, seed: u64) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            mean_latency,
            stddev_percent,
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
            scheduler,
        }
    }

    fn put(&self, msg: M) {
        self.queue.lock().unwrap().push_back(msg);
        self.notify.notify_one();
    }

    fn sample_latency(&self) -> Duration {
        let mean = self.mean_latency.as_secs_f64();
        if mean <= 0.0 || self.stddev_percent <= 0.0 {
            return self.mean_latency;
        }
        let stddev = mean * self.stddev_percent / 100.0;
        let dist = Normal::new(mean, stddev).expect("valid normal parameters");
        let mut rng = self.rng.lock().unwrap();
        let sampled = dist.sample(&mut *rng).max(0.0);
        Duration::from_secs_f64(sampled)
    }

    async fn get(&self) -> M {
        loop {
            let popped = self.queue.lock().unwrap().pop_front();
            if let Some(msg) = popped {
                let latency = self.sample_latency();
                self.scheduler.timeout(latency).await;
                return msg;
            }
            self.notify.notified().await;
        }
    }
}

/// A bidirectional link between a downstream (miner/translator-as-miner)
/// peer and an upstream (pool/translator-as-pool) peer.
pub struct Connection<M> {
    pub uid: u64,
    pub port: String,
    downstream_to_upstream: ConnectionStore<M>,
    upstream_to_downstream: ConnectionStore<M>,
    connected: AtomicBool,
}

impl<M> Connection<M> {
    pub fn new(
        scheduler: Scheduler,
        uid: u64,
        port: impl Into<String>,
        mean_latency: Duration,
        latency_stddev_percent: f64,
        seed: u64,
    ) -> Self {
        Self {
            uid,
            port: port.into(),
            downstream_to_upstream: ConnectionStore::new(
                scheduler,
                mean_latency,
                latency_stddev_percent,
                seed,
            ),
            upstream_to_downstream: ConnectionStore::new(
                scheduler,
                mean_latency,
                latency_stddev_percent,
                seed.wrapping_add(1),
            ),
            connected: AtomicBool::new(true),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Disconnecting an already-disconnected connection fails loudly,
    /// matching the invariant in spec §3.
    pub fn disconnect(&self) -> CoreResult<()> {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return Err(CoreError::AlreadyDisconnected(self.uid));
        }
        Ok(())
    }

    pub fn send_to_upstream(&self, msg: M) {
        self.downstream_to_upstream.put(msg);
    }

    pub fn send_to_downstream(&self, msg: M) {
        self.upstream_to_downstream.put(msg);
    }

    pub async fn recv_as_upstream(&self) -> CoreResult<M> {
        if !self.is_connected() {
            return Err(CoreError::TransportClosed(self.uid));
        }
        Ok(self.downstream_to_upstream.get().await)
    }

    pub async fn recv_as_downstream(&self) -> CoreResult<M> {
        if !self.is_connected() {
            return Err(CoreError::TransportClosed(self.uid));
        }
        Ok(self.upstream_to_downstream.get().await)
    }
}

/// Builds `Connection`s sharing a common port label, mean latency and
/// jitter, and a common uid generator.
pub struct ConnectionFactory {
    scheduler: Scheduler,
    uids: UidGenerator,
    port: String,
    mean_latency: Duration,
    latency_stddev_percent: f64,
    seed_counter: AtomicU64,
}

impl ConnectionFactory {
    pub fn new(
        scheduler: Scheduler,
        port: impl Into<String>,
        mean_latency: Duration,
        latency_stddev_percent: f64,
        base_seed: u64,
    ) -> Self {
        Self {
            scheduler,
            uids: UidGenerator::new(),
            port: port.into(),
            mean_latency,
            latency_stddev_percent,
            seed_counter: AtomicU64::new(base_seed),
        }
    }

    pub fn connect<M>(&self) -> Connection<M> {
        let uid = self.uids.next_uid();
        let seed = self.seed_counter.fetch_add(2, Ordering::Relaxed);
        Connection::new(
            self.scheduler,
            uid,
            self.port.clone(),
            self.mean_latency,
            self.latency_stddev_percent,
            seed,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn fifo_order_preserved_across_independent_latencies() {
        let sched = Scheduler::new();
        let conn = Connection::<u32>::new(sched, 0, "stratum", Duration::from_millis(10), 50.0, 1);
        conn.send_to_upstream(1);
        conn.send_to_upstream(2);
        conn.send_to_upstream(3);
        let a = conn.recv_as_upstream().await.unwrap();
        let b = conn.recv_as_upstream().await.unwrap();
        let c = conn.recv_as_upstream().await.unwrap();
        assert_eq!((a, b, c), (1, 2, 3));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_is_not_idempotent() {
        let sched = Scheduler::new();
        let conn = Connection::<u32>::new(sched, 0, "stratum", Duration::ZERO, 0.0, 1);
        conn.disconnect().unwrap();
        assert!(conn.disconnect().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn uid_generator_is_monotonic() {
        let g = UidGenerator::new();
        let a = g.next_uid();
        let b = g.next_uid();
        assert!(b > a);
    }
}
