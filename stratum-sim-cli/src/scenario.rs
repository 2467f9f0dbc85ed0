//! Wires a `ScenarioConfig` into a running simulation: the pool, its
//! downstream miners (direct V1, direct V2, or V2 miners behind a
//! translating proxy in front of a V1 pool), runs the virtual clock for
//! `limit` seconds, and returns the pool's aggregate snapshot.

use std::sync::Arc;
use std::time::Duration;

use stratum_sim_core::{Connection, ConnectionFactory, EventBus, RtFactor, Scheduler, U256};
use stratum_sim_pool::{AggregateSnapshot, Pool, PoolConfig};
use stratum_sim_translator::{Proxy, ProxyConfig, UpstreamAcceptor};
use stratum_sim_v1::Message as V1Message;
use stratum_sim_v2::Message as V2Message;

use crate::config::{ProtocolMode, ScenarioConfig};

/// Implements `UpstreamAcceptor` for the real `Pool` so
/// `stratum-sim-translator` can hand the proxy a freshly-opened V1
/// connection without depending on `stratum-sim-pool` directly (the trait
/// lives in the translator crate; this newtype satisfies Rust's orphan
/// rule by being local to the binary that wires both crates together).
struct PoolAcceptor(Arc<Pool>);

impl UpstreamAcceptor for PoolAcceptor {
    fn accept_v1(&self, connection: Arc<Connection<V1Message>>) {
        self.0.accept_v1(connection);
    }
}

/// 0xFFFF << 208, spec §8's end-to-end scenario table fixes this as the
/// shared difficulty-1 target across every scenario.
fn diff_1_target() -> U256 {
    U256::from(0xFFFFu64) << 208
}

/// Runs one scenario to completion and returns the pool's final aggregate
/// counters (spec §6's `--plain-output` fields).
pub async fn run(config: &ScenarioConfig) -> anyhow::Result<AggregateSnapshot> {
    let scheduler = if config.realtime {
        Scheduler::with_rt_factor(RtFactor(config.rt_factor))
    } else {
        Scheduler::new()
    };
    let bus = Arc::new(EventBus::new(scheduler.now()));
    if config.verbose {
        bus.subscribe(Arc::new(stratum_sim_core::TracingSink));
    }

    let mean_latency = config.mean_latency();
    let simulate_luck = config.simulate_luck();

    let pool_config = PoolConfig {
        name: "pool".to_string(),
        diff_1_target: diff_1_target(),
        simulate_luck,
        seed: config.seed,
        ..PoolConfig::default()
    };
    let pool = Pool::new(bus.clone(), scheduler, pool_config);

    let miner_config = stratum_sim_miner::MinerConfig {
        diff_1_target: diff_1_target(),
        simulate_luck,
        seed: config.seed,
        ..stratum_sim_miner::MinerConfig::default()
    };

    match config.protocol {
        ProtocolMode::V1 => {
            let factory = ConnectionFactory::new(scheduler, "stratum", mean_latency, 10.0, config.seed);
            spawn_miners_v1(&config.miners, &bus, scheduler, &factory, &pool, &miner_config);
        }
        ProtocolMode::V2 => {
            let factory = ConnectionFactory::new(scheduler, "stratum", mean_latency, 10.0, config.seed);
            spawn_miners_v2(&config.miners, &bus, scheduler, &factory, &pool, &miner_config);
        }
        ProtocolMode::V2v1 => {
            let downstream_factory =
                ConnectionFactory::new(scheduler, "stratum", mean_latency, 10.0, config.seed);
            let proxy = Proxy::new(
                bus.clone(),
                scheduler,
                Arc::new(PoolAcceptor(pool.clone())),
                ProxyConfig {
                    name: "proxy".to_string(),
                    upstream_mean_latency: mean_latency,
                    upstream_latency_stddev_percent: 10.0,
                    seed: config.seed.wrapping_add(1),
                    ..ProxyConfig::default()
                },
            );
            let mut next_id: u64 = 0;
            for group in &config.miners {
                for _ in 0..group.count {
                    let conn = Arc::new(downstream_factory.connect::<V2Message>());
                    proxy.accept(conn.clone());
                    let name = format!("miner-{next_id}");
                    next_id += 1;
                    let per_miner_config = stratum_sim_miner::MinerConfig {
                        name: name.clone(),
                        speed_ghps: group.speed_ghps,
                        seed: config.seed.wrapping_add(next_id),
                        ..miner_config.clone()
                    };
                    stratum_sim_miner::connect_v2(bus.clone(), scheduler, conn, &per_miner_config);
                }
            }
        }
    }

    scheduler.timeout(Duration::from_secs(config.limit_secs)).await;

    Ok(pool.aggregate().snapshot())
}

fn spawn_miners_v1(
    groups: &[crate::config::MinerGroup],
    bus: &Arc<EventBus>,
    scheduler: Scheduler,
    factory: &ConnectionFactory,
    pool: &Arc<Pool>,
    base_config: &stratum_sim_miner::MinerConfig,
) {
    let mut next_id: u64 = 0;
    for group in groups {
        for _ in 0..group.count {
            let conn = Arc::new(factory.connect::<V1Message>());
            pool.accept_v1(conn.clone());
            let name = format!("miner-{next_id}");
            next_id += 1;
            let config = stratum_sim_miner::MinerConfig {
                name,
                speed_ghps: group.speed_ghps,
                seed: base_config.seed.wrapping_add(next_id),
                ..base_config.clone()
            };
            stratum_sim_miner::connect_v1(bus.clone(), scheduler, conn, &config);
        }
    }
}

fn spawn_miners_v2(
    groups: &[crate::config::MinerGroup],
    bus: &Arc<EventBus>,
    scheduler: Scheduler,
    factory: &ConnectionFactory,
    pool: &Arc<Pool>,
    base_config: &stratum_sim_miner::MinerConfig,
) {
    let mut next_id: u64 = 0;
    for group in groups {
        for _ in 0..group.count {
            let conn = Arc::new(factory.connect::<V2Message>());
            pool.accept_v2(conn.clone());
            let name = format!("miner-{next_id}");
            next_id += 1;
            let config = stratum_sim_miner::MinerConfig {
                name,
                speed_ghps: group.speed_ghps,
                seed: base_config.seed.wrapping_add(next_id),
                ..base_config.clone()
            };
            stratum_sim_miner::connect_v2(bus.clone(), scheduler, conn, &config);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MinerGroup;

    fn base_config(protocol: ProtocolMode) -> ScenarioConfig {
        ScenarioConfig {
            realtime: false,
            limit_secs: 50,
            no_luck: true,
            protocol,
            miners: vec![MinerGroup { count: 2, speed_ghps: 10_000.0 }],
            seed: 123,
            ..ScenarioConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn v1_scenario_accrues_accepted_submits_with_no_rejections() {
        let config = base_config(ProtocolMode::V1);
        let snapshot = run(&config).await.unwrap();
        assert!(snapshot.accepted_submits > 0);
        assert_eq!(snapshot.rejected_submits, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn v2_scenario_accrues_accepted_submits_with_no_rejections() {
        let config = base_config(ProtocolMode::V2);
        let snapshot = run(&config).await.unwrap();
        assert!(snapshot.accepted_submits > 0);
        assert_eq!(snapshot.rejected_submits, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn v2v1_scenario_accrues_accepted_submits() {
        let config = base_config(ProtocolMode::V2v1);
        let snapshot = run(&config).await.unwrap();
        assert!(snapshot.accepted_submits > 0);
    }
}
