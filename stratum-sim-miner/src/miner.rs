//! Binds a `HashrateProcess` to a protocol connection processor (V1 or V2)
//! and spawns its receive loop, producing one runnable simulated miner.
//!
//! Grounded on `examples/original_source/.../sim_primitives/miner.py`'s
//! `Miner`, which owns both the mining loop and the stratum connection
//! state in one object; here the two halves are separate crates joined by
//! the `MinerDevice`/`ShareSubmitter` seam (spec §4.9's note on keeping
//! protocol crates independent of the miner's hashrate simulation).

use std::sync::Arc;
use std::time::Duration;

use stratum_sim_core::{Connection, EventBus, Scheduler, TaskHandle, U256};
use stratum_sim_v1::{Message as V1Message, MinerV1};
use stratum_sim_v2::{DeviceInfo, Message as V2Message, MinerV2};

use crate::device::HashrateProcess;

/// Per-miner construction parameters, common to both protocols.
#[derive(Debug, Clone)]
pub struct MinerConfig {
    pub name: String,
    pub speed_ghps: f64,
    pub simulate_luck: bool,
    pub seed: u64,
    pub diff_1_target: U256,
    /// V1-only: sizes the session's starting difficulty (spec §4.6).
    pub desired_submits_per_sec: f64,
    pub enable_vardiff: bool,
    pub vardiff_window: Duration,
    /// V2-only: identity fields sent in `SetupConnection`.
    pub device_info: DeviceInfo,
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            name: "miner".to_string(),
            speed_ghps: 1_000_000.0,
            simulate_luck: true,
            seed: 1,
            diff_1_target: U256::from(0xFFFFu64) << 208,
            desired_submits_per_sec: 0.3,
            enable_vardiff: false,
            vardiff_window: Duration::from_secs(60),
            device_info: DeviceInfo::default(),
        }
    }
}

pub enum MinerProcessor {
    V1(Arc<MinerV1>),
    V2(Arc<MinerV2>),
}

/// One running simulated miner: the hashrate process plus whichever
/// protocol processor is relaying its shares upstream.
pub struct Miner {
    pub device: Arc<HashrateProcess>,
    pub processor: MinerProcessor,
    _run_task: TaskHandle<()>,
}

impl Miner {
    pub fn work_meter(&self) -> &stratum_sim_core::HashrateMeter {
        self.device.work_meter()
    }
}

/// Connects a V1 miner over `connection`, wiring the device and processor
/// to each other and spawning the processor's receive loop.
pub fn connect_v1(
    bus: Arc<EventBus>,
    scheduler: Scheduler,
    connection: Arc<Connection<V1Message>>,
    config: &MinerConfig,
) -> Arc<Miner> {
    let device = HashrateProcess::new(
        config.name.clone(),
        bus.clone(),
        connection.uid,
        scheduler,
        config.speed_ghps,
        config.simulate_luck,
        config.seed,
    );

    let processor = MinerV1::new(
        config.name.clone(),
        connection,
        bus,
        device.clone(),
        config.speed_ghps,
        config.desired_submits_per_sec,
        config.diff_1_target,
        config.enable_vardiff,
        config.vardiff_window,
        scheduler,
    );
    device.bind_submitter(processor.clone());

    let run_task = {
        let processor = processor.clone();
        scheduler.spawn(async move { processor.run().await })
    };

    Arc::new(Miner {
        device,
        processor: MinerProcessor::V1(processor),
        _run_task: run_task,
    })
}

/// Connects a V2 miner over `connection`.
pub fn connect_v2(
    bus: Arc<EventBus>,
    scheduler: Scheduler,
    connection: Arc<Connection<V2Message>>,
    config: &MinerConfig,
) -> Arc<Miner> {
    let device = HashrateProcess::new(
        config.name.clone(),
        bus.clone(),
        connection.uid,
        scheduler,
        config.speed_ghps,
        config.simulate_luck,
        config.seed,
    );

    let processor = MinerV2::new(
        config.name.clone(),
        connection,
        bus,
        device.clone(),
        config.name.clone(),
        config.speed_ghps,
        config.diff_1_target,
        scheduler,
        config.device_info.clone(),
    );
    device.bind_submitter(processor.clone());

    let run_task = {
        let processor = processor.clone();
        scheduler.spawn(async move { processor.run().await })
    };

    Arc::new(Miner {
        device,
        processor: MinerProcessor::V2(processor),
        _run_task: run_task,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratum_sim_core::ConnectionFactory;

    fn test_env() -> (Arc<EventBus>, Scheduler, ConnectionFactory) {
        let sched = Scheduler::new();
        let bus = Arc::new(EventBus::new(sched.now()));
        let factory = ConnectionFactory::new(sched, "stratum", Duration::ZERO, 0.0, 11);
        (bus, sched, factory)
    }

    #[tokio::test(start_paused = true)]
    async fn v1_miner_subscribes_and_authorizes_on_connect() {
        let (bus, sched, factory) = test_env();
        let conn = Arc::new(factory.connect::<V1Message>());
        let config = MinerConfig {
            simulate_luck: false,
            ..MinerConfig::default()
        };
        let _miner = connect_v1(bus, sched, conn.clone(), &config);
        tokio::task::yield_now().await;

        let first = conn.recv_as_upstream().await.unwrap();
        let second = conn.recv_as_upstream().await.unwrap();
        assert!(matches!(first, V1Message::Authorize { .. }));
        assert!(matches!(second, V1Message::Subscribe { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn v2_miner_sends_setup_connection_on_connect() {
        let (bus, sched, factory) = test_env();
        let conn = Arc::new(factory.connect::<V2Message>());
        let config = MinerConfig {
            simulate_luck: false,
            ..MinerConfig::default()
        };
        let _miner = connect_v2(bus, sched, conn.clone(), &config);
        tokio::task::yield_now().await;

        let first = conn.recv_as_upstream().await.unwrap();
        assert!(matches!(first, V2Message::SetupConnection { .. }));
    }
}
