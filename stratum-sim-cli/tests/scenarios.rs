//! End-to-end scenario coverage, grounded in spec's scenario table:
//! running the same seeded scenario twice must reproduce identical
//! aggregate counters (the "record on first run, regression-check
//! thereafter" property a fixed seed is supposed to buy).

use stratum_sim_cli::config::{MinerGroup, ProtocolMode, ScenarioConfig};
use stratum_sim_cli::scenario;

fn deterministic_config() -> ScenarioConfig {
    ScenarioConfig {
        realtime: false,
        limit_secs: 500,
        no_luck: false,
        protocol: ProtocolMode::V1,
        miners: vec![MinerGroup { count: 2, speed_ghps: 10_000.0 }],
        seed: 123,
        ..ScenarioConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn same_seed_reproduces_identical_aggregate_counters() {
    let config = deterministic_config();
    let first = scenario::run(&config).await.unwrap();

    // A fresh virtual clock per test function, same seed and topology:
    // every sampled delay must replay identically.
    let second = scenario::run(&config).await.unwrap();

    assert_eq!(first.accepted_submits, second.accepted_submits);
    assert_eq!(first.stale_submits, second.stale_submits);
    assert_eq!(first.rejected_submits, second.rejected_submits);
    assert_eq!(first.accepted_shares, second.accepted_shares);
    assert_eq!(first.stale_shares, second.stale_shares);
}

#[tokio::test(start_paused = true)]
async fn v1_pair_has_bounded_stale_fraction() {
    let config = ScenarioConfig {
        no_luck: true,
        protocol: ProtocolMode::V1,
        miners: vec![
            MinerGroup { count: 1, speed_ghps: 10_000.0 },
            MinerGroup { count: 1, speed_ghps: 8_000.0 },
        ],
        ..deterministic_config()
    };
    let snapshot = scenario::run(&config).await.unwrap();
    assert!(snapshot.accepted_submits > 0);
    assert_eq!(snapshot.rejected_submits, 0);
    assert!(snapshot.stale_shares <= snapshot.accepted_shares * 0.05 + 1e-9);
}
