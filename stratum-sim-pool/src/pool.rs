//! Pool: the block clock, connection acceptance, and the aggregate speed
//! logger.
//!
//! Grounded on `examples/original_source/.../sim_primitives/pool.py`'s
//! `Pool`. Construction immediately spawns the block clock (`__pow_update`)
//! and the aggregate speed logger (`__pool_speed_meter`), per spec §4.4.
//! `prev_hash` generation is opaque (spec §3): we hash the virtual-time
//! nanosecond count with `DefaultHasher` rather than computing a real
//! SHA-256, since cryptographic hashing is a Non-goal (spec §1).

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Exp};

use stratum_sim_core::{Connection, EventBus, NewBlockListener, Scheduler, Target, TaskHandle};
use stratum_sim_v1::{Message as V1Message, PoolV1};
use stratum_sim_v2::{Message as V2Message, PoolV2};

use crate::aggregate::PoolAggregate;

/// Construction parameters for a `Pool`; mirrors the source's `Pool.__init__`
/// keyword arguments (spec §4.4).
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub name: String,
    pub default_diff: u64,
    pub diff_1_target: stratum_sim_core::U256,
    pub extranonce2_size: u32,
    pub avg_block_time: Duration,
    pub enable_vardiff: bool,
    pub desired_submits_per_sec: f64,
    pub vardiff_window: Duration,
    pub simulate_luck: bool,
    pub seed: u64,
}

impl PoolConfig {
    pub fn default_target(&self) -> Target {
        Target::from_difficulty(self.default_diff, self.diff_1_target)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "pool".to_string(),
            default_diff: 100_000,
            diff_1_target: stratum_sim_core::U256::from(0xFFFFu64) << 208,
            extranonce2_size: 8,
            avg_block_time: Duration::from_secs(60),
            enable_vardiff: false,
            desired_submits_per_sec: 0.3,
            vardiff_window: Duration::from_secs(60),
            simulate_luck: true,
            seed: 1,
        }
    }
}

pub struct Pool {
    pub name: String,
    bus: Arc<EventBus>,
    scheduler: Scheduler,
    config: PoolConfig,
    aggregate: Arc<PoolAggregate>,
    prev_hash: AtomicU64,
    listeners: Arc<Mutex<HashMap<u64, Arc<dyn NewBlockListener>>>>,
    _block_clock: TaskHandle<()>,
    _speed_logger: TaskHandle<()>,
}

impl Pool {
    pub fn new(bus: Arc<EventBus>, scheduler: Scheduler, config: PoolConfig) -> Arc<Self> {
        let aggregate = Arc::new(PoolAggregate::new(scheduler));
        let prev_hash = AtomicU64::new(Self::hash_time(scheduler));

        let listeners: Arc<Mutex<HashMap<u64, Arc<dyn NewBlockListener>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let block_clock = {
            let bus = bus.clone();
            let name = config.name.clone();
            let avg_block_time = config.avg_block_time;
            let simulate_luck = config.simulate_luck;
            let listeners = listeners.clone();
            let rng = Mutex::new(ChaCha8Rng::seed_from_u64(config.seed));
            scheduler.spawn(async move {
                loop {
                    let dt = if simulate_luck {
                        let mean = avg_block_time.as_secs_f64().max(1e-9);
                        let dist = Exp::new(1.0 / mean).expect("positive rate");
                        let sampled = dist.sample(&mut *rng.lock().unwrap());
                        Duration::from_secs_f64(sampled)
                    } else {
                        avg_block_time
                    };
                    scheduler.timeout(dt).await;
                    let prev_hash = Self::hash_time(scheduler);
                    bus.publish(&name, None, format!("NEW_BLOCK: {prev_hash:016x}"), None);
                    for listener in listeners.lock().unwrap().values() {
                        listener.on_new_block(prev_hash);
                    }
                }
            })
        };

        let speed_logger = {
            let bus = bus.clone();
            let name = config.name.clone();
            let aggregate = aggregate.clone();
            scheduler.spawn(async move {
                loop {
                    scheduler.timeout(Duration::from_secs(60)).await;
                    match (
                        aggregate.meter_accepted().get_speed(),
                        aggregate.meter_accepted().get_submits_per_sec(),
                    ) {
                        (Some(speed), Some(submit_speed)) => bus.publish(
                            &name,
                            None,
                            format!("SPEED: {speed:.2} Gh/s, {submit_speed:.4} submits/s"),
                            None,
                        ),
                        _ => bus.publish(&name, None, "SPEED: N/A Gh/s, N/A submits/s", None),
                    }
                }
            })
        };

        Arc::new(Self {
            name: config.name.clone(),
            bus,
            scheduler,
            config,
            aggregate,
            prev_hash,
            listeners,
            _block_clock: block_clock,
            _speed_logger: speed_logger,
        })
    }

    fn hash_time(scheduler: Scheduler) -> u64 {
        let mut hasher = DefaultHasher::new();
        scheduler.now().elapsed().as_nanos().hash(&mut hasher);
        std::time::Instant::now().hash(&mut hasher);
        hasher.finish()
    }

    pub fn aggregate(&self) -> &Arc<PoolAggregate> {
        &self.aggregate
    }

    pub fn prev_hash(&self) -> u64 {
        self.prev_hash.load(Ordering::Relaxed)
    }

    pub fn default_target(&self) -> Target {
        self.config.default_target()
    }

    /// Accepts a V1 downstream connection: builds a `PoolV1`, registers it
    /// for block-clock broadcast, and spawns its receive loop.
    pub fn accept_v1(self: &Arc<Self>, connection: Arc<Connection<V1Message>>) -> Arc<PoolV1> {
        let processor = PoolV1::new(
            self.name.clone(),
            connection.clone(),
            self.bus.clone(),
            self.aggregate.clone(),
            self.config.default_target(),
            self.config.extranonce2_size,
            self.config.desired_submits_per_sec,
            self.config.vardiff_window,
            self.config.enable_vardiff,
            self.scheduler,
        );
        self.listeners
            .lock()
            .unwrap()
            .insert(connection.uid, processor.clone());
        self.scheduler.spawn({
            let processor = processor.clone();
            async move { processor.run().await }
        });
        processor
    }

    /// Accepts a V2 downstream connection: builds a `PoolV2`, registers it,
    /// and spawns its receive loop.
    pub fn accept_v2(self: &Arc<Self>, connection: Arc<Connection<V2Message>>) -> Arc<PoolV2> {
        let processor = PoolV2::new(
            self.name.clone(),
            connection.clone(),
            self.bus.clone(),
            self.aggregate.clone(),
            self.config.default_target(),
            self.config.extranonce2_size,
            self.config.desired_submits_per_sec,
            self.config.vardiff_window,
            self.config.enable_vardiff,
            self.scheduler,
        );
        self.listeners
            .lock()
            .unwrap()
            .insert(connection.uid, processor.clone());
        self.scheduler.spawn({
            let processor = processor.clone();
            async move { processor.run().await }
        });
        processor
    }

    pub fn disconnect(&self, connection_uid: u64) {
        self.listeners.lock().unwrap().remove(&connection_uid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratum_sim_core::ConnectionFactory;

    fn test_pool(enable_vardiff: bool) -> (Arc<Pool>, ConnectionFactory) {
        let sched = Scheduler::new();
        let bus = Arc::new(EventBus::new(sched.now()));
        let config = PoolConfig {
            avg_block_time: Duration::from_secs(600),
            simulate_luck: false,
            enable_vardiff,
            ..PoolConfig::default()
        };
        let pool = Pool::new(bus, sched, config);
        let factory = ConnectionFactory::new(sched, "stratum", Duration::ZERO, 0.0, 7);
        (pool, factory)
    }

    #[tokio::test(start_paused = true)]
    async fn accept_v1_responds_to_subscribe_and_submit() {
        let (pool, factory) = test_pool(false);
        let conn = Arc::new(factory.connect::<V1Message>());
        let processor = pool.accept_v1(conn.clone());
        tokio::task::yield_now().await;

        conn.send_to_upstream(V1Message::Subscribe { req_id: 0 });
        tokio::task::yield_now().await;
        let resp = conn.recv_as_downstream().await.unwrap();
        assert!(matches!(resp, V1Message::SubscribeResponse { .. }));

        let job = processor.session().new_job();
        conn.send_to_upstream(V1Message::Submit {
            req_id: 1,
            user: "worker1".to_string(),
            job_id: job.uid,
            ntime: 0,
            nonce: 0,
        });
        tokio::task::yield_now().await;
        let resp = conn.recv_as_downstream().await.unwrap();
        assert!(matches!(resp, V1Message::OkResult { req_id: 1 }));
        assert_eq!(pool.aggregate().snapshot().accepted_submits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn on_new_block_retires_prior_job_as_stale() {
        let (pool, factory) = test_pool(false);
        let conn = Arc::new(factory.connect::<V1Message>());
        let processor = pool.accept_v1(conn.clone());
        tokio::task::yield_now().await;
        conn.send_to_upstream(V1Message::Subscribe { req_id: 0 });
        tokio::task::yield_now().await;
        let _ = conn.recv_as_downstream().await.unwrap();

        let stale_job = processor.session().new_job();
        processor.on_new_block(0xdead);
        let _notify = conn.recv_as_downstream().await.unwrap();

        conn.send_to_upstream(V1Message::Submit {
            req_id: 5,
            user: "worker1".to_string(),
            job_id: stale_job.uid,
            ntime: 0,
            nonce: 0,
        });
        tokio::task::yield_now().await;
        let resp = conn.recv_as_downstream().await.unwrap();
        assert!(matches!(
            resp,
            V1Message::ErrorResult { req_id: 5, code: -3, .. }
        ));
        assert_eq!(pool.aggregate().snapshot().stale_submits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn block_clock_broadcasts_to_registered_connections() {
        let (pool, factory) = test_pool(false);
        let conn = Arc::new(factory.connect::<V1Message>());
        pool.accept_v1(conn.clone());
        tokio::task::yield_now().await;
        conn.send_to_upstream(V1Message::Subscribe { req_id: 0 });
        tokio::task::yield_now().await;
        let _ = conn.recv_as_downstream().await.unwrap();

        let before = pool.prev_hash();
        tokio::time::advance(Duration::from_secs(601)).await;
        tokio::task::yield_now().await;
        assert_ne!(pool.prev_hash(), before);
        // the block clock's broadcast produced a Notify for the subscribed session
        let notify = conn.recv_as_downstream().await.unwrap();
        assert!(matches!(notify, V1Message::Notify { clean_jobs: true, .. }));
    }
}
