//! V2 pool connection processor.
//!
//! Grounded on `examples/original_source/.../sim_primitives/stratum_v2/
//! pool.py`'s `PoolV2`. Resolves an ambiguity the source leaves
//! dangling: `on_new_block` calls `job_registry.add_job(future_job)`,
//! a method that doesn't exist anywhere in the source (it would raise
//! `AttributeError` at runtime) — see DESIGN.md. We re-register the
//! taken future job under a freshly-allocated uid at the same
//! `diff_target` instead of reinserting it at its original uid, which
//! would immediately fall below the just-advanced watermark and make it
//! invalid on arrival. This keeps spec §8's invariants #3 and #6 (uids
//! strictly monotonic, never reused) intact while preserving the
//! intended behavior: the job that was "future" becomes current.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use stratum_sim_core::{
    Connection, EventBus, MiningSession, MiningSessionBuilder, ShareAccounting, SubmitOutcome,
    Target,
};

use crate::channel::{ChannelRegistry, MiningChannel};
use crate::messages::Message;
use crate::types::{upstream_flags, ChannelType};

pub struct PoolV2 {
    topic: String,
    connection: Arc<Connection<Message>>,
    bus: Arc<EventBus>,
    accounting: Arc<dyn ShareAccounting>,
    default_target: Target,
    extranonce2_size: u32,
    desired_submits_per_sec: f64,
    vardiff_window: std::time::Duration,
    enable_vardiff: bool,
    scheduler: stratum_sim_core::Scheduler,
    connection_configured: AtomicBool,
    channels: ChannelRegistry,
}

impl PoolV2 {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        topic: impl Into<String>,
        connection: Arc<Connection<Message>>,
        bus: Arc<EventBus>,
        accounting: Arc<dyn ShareAccounting>,
        default_target: Target,
        extranonce2_size: u32,
        desired_submits_per_sec: f64,
        vardiff_window: std::time::Duration,
        enable_vardiff: bool,
        scheduler: stratum_sim_core::Scheduler,
    ) -> Arc<Self> {
        Arc::new(Self {
            topic: topic.into(),
            connection,
            bus,
            accounting,
            default_target,
            extranonce2_size,
            desired_submits_per_sec,
            vardiff_window,
            enable_vardiff,
            scheduler,
            connection_configured: AtomicBool::new(false),
            channels: ChannelRegistry::new(),
        })
    }

    fn log(&self, message: impl Into<String>) {
        self.bus
            .publish(&self.topic, Some(self.connection.uid), message, None);
    }

    pub async fn run(self: Arc<Self>) {
        loop {
            match self.connection.recv_as_upstream().await {
                Ok(msg) => self.handle_message(msg).await,
                Err(_) => {
                    self.log("DISCONNECTED");
                    self.channels.terminate_all();
                    break;
                }
            }
        }
    }

    async fn handle_message(self: &Arc<Self>, msg: Message) {
        self.log(format!("recv {}", msg.tag()));
        if let Some(channel_id) = msg.channel_id() {
            match self.channels.get(channel_id) {
                Some(channel) if channel.conn_uid == self.connection.uid => {
                    self.dispatch_channel_message(channel, msg);
                    return;
                }
                Some(_) => {
                    tracing::error!(channel_id, "BUG: channel does not belong to this connection");
                    return;
                }
                None => {
                    tracing::error!(channel_id, "BUG: unknown channel referenced by message");
                    return;
                }
            }
        }

        match msg {
            Message::SetupConnection { req_id: _, .. } => self.visit_setup_connection(msg),
            Message::OpenStandardMiningChannel { .. } | Message::OpenExtendedMiningChannel { .. } => {
                self.visit_open_mining_channel(msg)
            }
            other => {
                self.log(format!("ignored unrecognized message: {}", other.tag()));
            }
        }
    }

    fn dispatch_channel_message(self: &Arc<Self>, channel: Arc<MiningChannel>, msg: Message) {
        match msg {
            Message::SubmitSharesStandard {
                sequence_number,
                job_id,
                ..
            }
            | Message::SubmitSharesExtended {
                sequence_number,
                job_id,
                ..
            } => self.visit_submit_shares(channel, sequence_number, job_id),
            other => self.log(format!("ignored unrecognized channel message: {}", other.tag())),
        }
    }

    /// A `SetupConnection` may only be processed once per connection;
    /// subsequent attempts are a protocol violation (§4.7).
    fn visit_setup_connection(&self, msg: Message) {
        let Message::SetupConnection {
            req_id: _,
            min_version,
            max_version,
            ..
        } = msg
        else {
            unreachable!()
        };
        if self
            .connection_configured
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.connection.send_to_downstream(Message::SetupConnectionSuccess {
                used_version: min_version.min(max_version),
                flags: upstream_flags::SUPPORTS_EXTENDED_CHANNELS,
            });
        } else {
            self.connection.send_to_downstream(Message::SetupConnectionError {
                error_code: "connection can only be set up once".to_string(),
            });
        }
    }

    fn visit_open_mining_channel(self: &Arc<Self>, msg: Message) {
        if !self.connection_configured.load(Ordering::Acquire) {
            let req_id = msg.req_id().unwrap_or(0);
            self.connection.send_to_downstream(Message::OpenMiningChannelError {
                req_id,
                error_code: "SetupConnection has not completed".to_string(),
            });
            let _ = self.connection.disconnect();
            return;
        }

        let channel_type = msg.requested_channel_type().expect("checked by caller");
        let (req_id, max_target, min_extranonce_size) = match &msg {
            Message::OpenStandardMiningChannel {
                req_id, max_target, ..
            } => (*req_id, *max_target, 0u32),
            Message::OpenExtendedMiningChannel {
                req_id,
                max_target,
                min_extranonce_size,
                ..
            } => (*req_id, *max_target, *min_extranonce_size),
            _ => unreachable!(),
        };

        // Spec §4.7: "only accept if max_target <= pool.default_target.diff_1_target"
        // — the requester's max target is compared against the network's
        // diff-1 constant, not against the pool's own current target.
        let compatible = max_target.value() <= self.default_target.diff_1_target()
            && min_extranonce_size <= self.extranonce2_size;
        if !compatible {
            self.connection.send_to_downstream(Message::OpenMiningChannelError {
                req_id,
                error_code: "cannot open mining channel: incompatible target/extranonce size"
                    .to_string(),
            });
            return;
        }

        let channel_id = self.channels.next_channel_id();
        let mut builder = MiningSessionBuilder::new(self.scheduler, "pool-channel-session", self.default_target);
        if self.enable_vardiff {
            builder = builder.enable_vardiff(self.desired_submits_per_sec, self.vardiff_window);
        }
        let session = Arc::new(builder.build());
        let channel = Arc::new(MiningChannel::new(
            channel_id,
            self.connection.uid,
            channel_type,
            session.clone(),
        ));
        self.channels.push(channel.clone());

        match channel_type {
            ChannelType::Standard => {
                self.connection.send_to_downstream(Message::OpenStandardMiningChannelSuccess {
                    req_id,
                    channel_id,
                    target: session.current_target(),
                    extranonce_prefix: self.connection.uid,
                    group_channel_id: 0,
                });
            }
            ChannelType::Extended => {
                self.connection.send_to_downstream(Message::OpenExtendedMiningChannelSuccess {
                    req_id,
                    channel_id,
                    target: session.current_target(),
                    extranonce_size: self.extranonce2_size,
                    extranonce_prefix: self.connection.uid,
                });
            }
        }

        // Pre-arm a future job, send it, then immediately take it to
        // become the channel's current job via SetNewPrevHash — this
        // pipeline is load-bearing (spec §4.7 step 3).
        let j0 = session.new_job();
        channel.add_future_job(j0).expect("slot just created, empty");
        self.send_new_job_msg(&channel, j0, true);

        let taken = channel.take_future_job().expect("just armed above");
        debug_assert_eq!(taken.uid, j0.uid);
        self.connection.send_to_downstream(Message::SetNewPrevHash {
            channel_id,
            job_id: taken.uid,
            prev_hash: 0,
            min_ntime: 0,
            nbits: 0,
            max_ntime_offset: 7200,
        });

        // Re-arm the future-job slot for the next prev-hash change.
        let j1 = session.new_job();
        channel.add_future_job(j1).expect("slot freed by the take above");
        self.send_new_job_msg(&channel, j1, true);

        let on_vardiff_change: stratum_sim_core::VardiffListener = {
            let pool = self.clone();
            let channel_id = channel.channel_id;
            Arc::new(move |session: &MiningSession| {
                pool.on_vardiff_change(channel_id, session);
            })
        };
        session.run(on_vardiff_change);
    }

    fn send_new_job_msg(&self, channel: &MiningChannel, job: stratum_sim_core::MiningJob, future_job: bool) {
        match channel.channel_type {
            ChannelType::Standard => {
                self.connection.send_to_downstream(Message::NewMiningJob {
                    channel_id: channel.channel_id,
                    job_id: job.uid,
                    future_job,
                    version: 0,
                    merkle_root: job.uid,
                });
            }
            ChannelType::Extended => {
                self.connection.send_to_downstream(Message::NewExtendedMiningJob {
                    channel_id: channel.channel_id,
                    job_id: job.uid,
                    future_job,
                    version: 0,
                    version_rolling_allowed: true,
                    merkle_path: job.uid,
                    cb_prefix: job.uid,
                    cb_suffix: job.uid,
                });
            }
        }
    }

    fn on_vardiff_change(&self, channel_id: u32, session: &MiningSession) {
        let Some(channel) = self.channels.get(channel_id) else {
            return;
        };
        self.connection.send_to_downstream(Message::SetTarget {
            channel_id,
            max_target: session.current_target(),
        });
        let job = session.new_job();
        self.send_new_job_msg(&channel, job, false);
    }

    fn visit_submit_shares(&self, channel: Arc<MiningChannel>, seq_num: u64, job_id: u64) {
        let outcome = self.accounting.process_submit(job_id, &channel.session);
        match outcome {
            SubmitOutcome::Accepted { target } => {
                self.connection.send_to_downstream(Message::SubmitSharesSuccess {
                    channel_id: channel.channel_id,
                    last_sequence_number: seq_num,
                    new_submits_accepted_count: 1,
                    new_shares_sum: target.diff_as_f64(),
                });
            }
            SubmitOutcome::Rejected { .. } => {
                self.connection.send_to_downstream(Message::SubmitSharesError {
                    channel_id: channel.channel_id,
                    sequence_number: seq_num,
                    error_code: "Share rejected".to_string(),
                });
            }
        }
    }

    /// Broadcast on a new block: every channel's future job becomes its
    /// current job (see the module doc for the uid-reuse resolution),
    /// then a new future job is armed for the channel.
    pub fn on_new_block(&self, prev_hash: u64) {
        let mut taken_per_channel = Vec::new();
        for channel in self.channels.all() {
            if channel.is_closed() {
                continue;
            }
            let Ok(future) = channel.take_future_job() else {
                tracing::error!(channel_id = channel.channel_id, "BUG: no future job armed at new-block time");
                continue;
            };
            let current = {
                let mut registry = channel.session.registry();
                registry.retire_all_jobs();
                registry.new_job(future.diff_target)
            };
            self.connection.send_to_downstream(Message::SetNewPrevHash {
                channel_id: channel.channel_id,
                job_id: current.uid,
                prev_hash,
                min_ntime: 0,
                nbits: 0,
                max_ntime_offset: 7200,
            });
            taken_per_channel.push(channel);
        }

        for channel in taken_per_channel {
            let next_future = channel.session.new_job();
            channel
                .add_future_job(next_future)
                .expect("slot freed by take_future_job above");
            self.send_new_job_msg(&channel, next_future, true);
        }
        self.log("NEW_BLOCK");
    }
}

impl stratum_sim_core::NewBlockListener for PoolV2 {
    fn on_new_block(&self, prev_hash: u64) {
        PoolV2::on_new_block(self, prev_hash);
    }
}

impl std::fmt::Debug for PoolV2 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolV2")
            .field("topic", &self.topic)
            .finish()
    }
}
