//! V2 miner connection processor.
//!
//! Grounded on `examples/original_source/.../sim_primitives/stratum_v2/
//! miner.py`'s `MinerV2`. Unlike the pool-side channel, the miner's
//! mirror of a channel never runs its own vardiff loop or future-job
//! pipeline — it only tracks the session the pool told it to use and
//! reacts to `SetTarget`/`SetNewPrevHash`/`NewMiningJob` (per spec §4.8
//! and §4.9's translator note that "stale-share semantics derive
//! entirely from the upstream pool's behavior").

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use stratum_sim_core::{
    Connection, EventBus, MinerDevice, MiningSession, MiningSessionBuilder, RequestRegistry,
    ShareSubmitter, Target, U256,
};

use crate::messages::Message;
use crate::types::{downstream_flags, DeviceInfo, ProtocolType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateV2 {
    Init,
    ConnectionSetup,
    Operational,
}

#[derive(Debug, Clone, Copy)]
enum Outstanding {
    OpenChannel,
}

struct MinerChannel {
    channel_id: u32,
    session: Arc<MiningSession>,
}

pub struct MinerV2 {
    topic: String,
    connection: Arc<Connection<Message>>,
    bus: Arc<EventBus>,
    device: Arc<dyn MinerDevice>,
    name: String,
    speed_ghps: f64,
    diff_1_target: U256,
    scheduler: stratum_sim_core::Scheduler,
    state: Mutex<StateV2>,
    request_registry: RequestRegistry<Outstanding>,
    channel: Mutex<Option<Arc<MinerChannel>>>,
    next_req_id: AtomicU32,
    accepted_shares: AtomicU64,
    rejected_shares: AtomicU64,
}

impl MinerV2 {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        topic: impl Into<String>,
        connection: Arc<Connection<Message>>,
        bus: Arc<EventBus>,
        device: Arc<dyn MinerDevice>,
        name: impl Into<String>,
        speed_ghps: f64,
        diff_1_target: U256,
        scheduler: stratum_sim_core::Scheduler,
        device_info: DeviceInfo,
    ) -> Arc<Self> {
        let name = name.into();
        let miner = Arc::new(Self {
            topic: topic.into(),
            connection,
            bus,
            device,
            name,
            speed_ghps,
            diff_1_target,
            scheduler,
            state: Mutex::new(StateV2::Init),
            request_registry: RequestRegistry::new(),
            channel: Mutex::new(None),
            next_req_id: AtomicU32::new(0),
            accepted_shares: AtomicU64::new(0),
            rejected_shares: AtomicU64::new(0),
        });
        miner.send_setup_connection(device_info);
        miner
    }

    fn log(&self, message: impl Into<String>) {
        self.bus
            .publish(&self.topic, Some(self.connection.uid), message, None);
    }

    fn alloc_req_id(&self) -> u32 {
        self.next_req_id.fetch_add(1, Ordering::Relaxed)
    }

    fn send_setup_connection(&self, device_info: DeviceInfo) {
        self.connection.send_to_upstream(Message::SetupConnection {
            req_id: self.alloc_req_id(),
            protocol: ProtocolType::Mining,
            min_version: 2,
            max_version: 2,
            flags: downstream_flags::REQUIRES_STANDARD_JOBS,
            endpoint_host: "sim".to_string(),
            endpoint_port: 0,
            device: device_info,
        });
    }

    pub async fn run(self: Arc<Self>) {
        loop {
            match self.connection.recv_as_downstream().await {
                Ok(msg) => self.handle_message(msg).await,
                Err(_) => {
                    self.log("DISCONNECTED");
                    if let Some(channel) = self.channel.lock().unwrap().take() {
                        channel.session.terminate();
                    }
                    break;
                }
            }
        }
    }

    async fn handle_message(&self, msg: Message) {
        self.log(format!("recv {}", msg.tag()));
        match msg {
            Message::SetupConnectionSuccess { .. } => self.visit_setup_connection_success(),
            Message::SetupConnectionError { error_code } => {
                self.log(format!("connection setup failed: {error_code}"));
            }
            Message::OpenStandardMiningChannelSuccess {
                req_id,
                channel_id,
                target,
                ..
            } => self.visit_open_standard_mining_channel_success(req_id, channel_id, target),
            Message::OpenMiningChannelError { req_id, error_code } => {
                let req = self.request_registry.pop(req_id);
                self.log(format!(
                    "open mining channel failed (orig request found: {}): {error_code}",
                    req.is_some()
                ));
            }
            Message::SetTarget {
                channel_id,
                max_target,
            } => self.visit_set_target(channel_id, max_target),
            Message::SetNewPrevHash {
                channel_id, job_id, ..
            } => self.visit_set_new_prev_hash(channel_id, job_id),
            Message::NewMiningJob {
                channel_id,
                job_id,
                future_job,
                ..
            } => self.visit_new_mining_job(channel_id, job_id, future_job),
            Message::SubmitSharesSuccess {
                channel_id,
                new_shares_sum,
                ..
            } => self.visit_submit_shares_success(channel_id, new_shares_sum),
            Message::SubmitSharesError { channel_id, .. } => {
                self.visit_submit_shares_error(channel_id)
            }
            other => self.log(format!("unrecognized message: {}", other.tag())),
        }
    }

    fn visit_setup_connection_success(&self) {
        *self.state.lock().unwrap() = StateV2::ConnectionSetup;
        let req_id = self.alloc_req_id();
        self.request_registry.push(Outstanding::OpenChannel);
        self.connection.send_to_upstream(Message::OpenStandardMiningChannel {
            req_id,
            user_identity: self.name.clone(),
            nominal_hashrate: self.speed_ghps * 1e9,
            max_target: Target::from_difficulty(1, self.diff_1_target),
        });
    }

    fn visit_open_standard_mining_channel_success(&self, req_id: u32, channel_id: u32, target: Target) {
        if self.request_registry.pop(req_id).is_none() {
            self.log("cannot find matching OpenMiningChannel request");
            return;
        }
        let session = Arc::new(
            MiningSessionBuilder::new(
                self.scheduler,
                "miner-v2-session",
                Target::new(target.value(), self.diff_1_target),
            )
            .build(),
        );
        *self.channel.lock().unwrap() = Some(Arc::new(MinerChannel {
            channel_id,
            session: session.clone(),
        }));
        // Miner-side channel never runs vardiff; target changes arrive
        // exclusively via SetTarget from the pool.
        session.run(Arc::new(|_session: &MiningSession| {}));
        *self.state.lock().unwrap() = StateV2::Operational;
    }

    fn visit_set_target(&self, channel_id: u32, max_target: Target) {
        let Some(channel) = self.current_channel(channel_id) else {
            return;
        };
        channel.session.set_target(max_target);
    }

    fn visit_set_new_prev_hash(&self, channel_id: u32, job_id: u64) {
        let Some(channel) = self.current_channel(channel_id) else {
            return;
        };
        let job = { channel.session.registry().get(job_id) };
        if let Some(job) = job {
            self.device.mine_on_new_job(job, true);
        }
    }

    fn visit_new_mining_job(&self, channel_id: u32, job_id: u64, future_job: bool) {
        let Some(channel) = self.current_channel(channel_id) else {
            return;
        };
        let target = channel.session.current_target();
        let job = channel.session.registry().insert_job(job_id, target);
        if !future_job {
            self.device.mine_on_new_job(job, false);
        }
    }

    fn visit_submit_shares_success(&self, channel_id: u32, new_shares_sum: f64) {
        if self.current_channel(channel_id).is_none() {
            return;
        }
        let _ = new_shares_sum;
        self.accepted_shares.fetch_add(1, Ordering::Relaxed);
    }

    fn visit_submit_shares_error(&self, channel_id: u32) {
        if self.current_channel(channel_id).is_none() {
            return;
        }
        self.rejected_shares.fetch_add(1, Ordering::Relaxed);
    }

    /// Validates the referenced channel is the one this miner opened,
    /// logging the same "channel not established"/"unknown channel"
    /// cases the source's `__is_channel_valid` distinguishes.
    fn current_channel(&self, channel_id: u32) -> Option<Arc<MinerChannel>> {
        let channel = self.channel.lock().unwrap().clone();
        match channel {
            None => {
                self.log(format!(
                    "mining channel not established yet, received channel message with channel id {channel_id}"
                ));
                None
            }
            Some(channel) if channel.channel_id != channel_id => {
                self.log(format!(
                    "unknown channel (expected {}, actual {channel_id})",
                    channel.channel_id
                ));
                None
            }
            Some(channel) => Some(channel),
        }
    }
}

impl ShareSubmitter for MinerV2 {
    fn submit_share(&self, job: stratum_sim_core::MiningJob) {
        let Some(channel) = self.channel.lock().unwrap().clone() else {
            return;
        };
        self.connection.send_to_upstream(Message::SubmitSharesStandard {
            channel_id: channel.channel_id,
            sequence_number: channel.session.next_sequence_number(),
            job_id: job.uid,
            nonce: 0,
            ntime: 0,
            version: 0,
        });
    }
}

impl std::fmt::Debug for MinerV2 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MinerV2")
            .field("topic", &self.topic)
            .field("state", &*self.state.lock().unwrap())
            .finish()
    }
}
