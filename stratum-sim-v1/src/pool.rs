//! V1 pool connection processor.
//!
//! Grounded on `examples/original_source/.../sim_primitives/stratum_v1/
//! pool.py`'s `MiningSessionV1`/`PoolV1`. The receive loop pattern (spawn,
//! match on message, wrap every handler so no panic escapes) mirrors the
//! teacher's `pool/src/stratum/server_v2.rs` connection-handling loop;
//! the 8-byte extranonce1 derivation mirrors `pool/src/stratum/
//! connection_v2.rs`'s `DefaultHasher`-based approach.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use stratum_sim_core::{
    Connection, EventBus, MiningSession, MiningSessionBuilder, ShareAccounting, SubmitOutcome,
    Target,
};

use crate::messages::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateV1 {
    Init,
    Configured,
    Authorized,
    Subscribed,
    Running,
}

pub struct PoolV1 {
    topic: String,
    connection: Arc<Connection<Message>>,
    bus: Arc<EventBus>,
    accounting: Arc<dyn ShareAccounting>,
    session: Arc<MiningSession>,
    state: Mutex<StateV1>,
    authorize_list: Mutex<Vec<String>>,
    extranonce1: u64,
    extranonce2_size: u32,
}

impl PoolV1 {
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
        let mut builder = MiningSessionBuilder::new(scheduler, "pool-session", default_target);
        if enable_vardiff {
            builder = builder.enable_vardiff(desired_submits_per_sec, vardiff_window);
        }
        let session = Arc::new(builder.build());

        let mut hasher = DefaultHasher::new();
        connection.uid.hash(&mut hasher);
        let extranonce1 = hasher.finish();

        Arc::new(Self {
            topic: topic.into(),
            connection,
            bus,
            accounting,
            session,
            state: Mutex::new(StateV1::Init),
            authorize_list: Mutex::new(Vec::new()),
            extranonce1,
            extranonce2_size,
        })
    }

    pub fn session(&self) -> &Arc<MiningSession> {
        &self.session
    }

    fn log(&self, message: impl Into<String>) {
        self.bus
            .publish(&self.topic, Some(self.connection.uid), message, None);
    }

    fn state(&self) -> StateV1 {
        *self.state.lock().unwrap()
    }

    /// Drives the receive loop until the connection is closed. No handler
    /// panic is allowed to escape: every branch below converts failures
    /// into a protocol error reply or a bus log.
    pub async fn run(self: Arc<Self>) {
        loop {
            match self.connection.recv_as_upstream().await {
                Ok(msg) => self.handle_message(msg).await,
                Err(_) => {
                    self.log("DISCONNECTED");
                    self.session.terminate();
                    break;
                }
            }
        }
    }

    async fn handle_message(&self, msg: Message) {
        self.log(format!("recv {}", msg.tag()));
        match msg {
            Message::Configure { req_id } => {
                let mut state = self.state.lock().unwrap();
                if *state == StateV1::Init {
                    *state = StateV1::Configured;
                }
                drop(state);
                self.connection
                    .send_to_downstream(Message::ConfigureResponse { req_id });
            }
            Message::Subscribe { req_id } => self.visit_subscribe(req_id),
            Message::Authorize { req_id, username } => self.visit_authorize(req_id, username),
            Message::Submit {
                req_id, job_id, ..
            } => self.visit_submit(req_id, job_id),
            other => {
                self.log(format!("unrecognized message: {}", other.tag()));
                if let Some(req_id) = other.req_id() {
                    self.connection.send_to_downstream(Message::ErrorResult {
                        req_id,
                        code: -2,
                        msg: "Unrecognized message".to_string(),
                    });
                }
            }
        }
    }

    fn visit_subscribe(&self, req_id: u64) {
        let mut state = self.state.lock().unwrap();
        let allowed = matches!(*state, StateV1::Init | StateV1::Authorized);
        if !allowed {
            let err_state = *state;
            drop(state);
            self.connection.send_to_downstream(Message::ErrorResult {
                req_id,
                code: -1,
                msg: format!("Subscribe not expected when in: {:?}", err_state),
            });
            return;
        }
        *state = StateV1::Subscribed;
        drop(state);

        self.connection.send_to_downstream(Message::SubscribeResponse {
            req_id,
            extranonce1: self.extranonce1,
            extranonce2_size: self.extranonce2_size,
        });

        let bus = self.bus.clone();
        let topic = self.topic.clone();
        let connection = self.connection.clone();
        let on_vardiff_change = Arc::new(move |session: &MiningSession| {
            let job = session.new_job();
            connection.send_to_downstream(Message::SetDifficulty {
                target: session.current_target(),
            });
            connection.send_to_downstream(Message::Notify {
                job_id: job.uid,
                prev_hash: 0,
                clean_jobs: false,
            });
            bus.publish(&topic, Some(connection.uid), "vardiff change", None);
        });
        self.session.run(on_vardiff_change);
        let mut state = self.state.lock().unwrap();
        *state = StateV1::Running;
    }

    fn visit_authorize(&self, req_id: u64, username: String) {
        // Username-based authorization is unimplemented upstream (spec
        // §9 Open Question); we accept unconditionally, same as the
        // source's actual (if not its documented) behavior.
        self.authorize_list.lock().unwrap().push(username);
        let mut state = self.state.lock().unwrap();
        if *state == StateV1::Init || *state == StateV1::Configured {
            *state = StateV1::Authorized;
        }
        drop(state);
        self.connection
            .send_to_downstream(Message::OkResult { req_id });
    }

    fn visit_submit(&self, req_id: u64, job_id: u64) {
        let outcome = self.accounting.process_submit(job_id, &self.session);
        match outcome {
            SubmitOutcome::Accepted { .. } => {
                self.connection
                    .send_to_downstream(Message::OkResult { req_id });
            }
            SubmitOutcome::Rejected { .. } => {
                self.connection.send_to_downstream(Message::ErrorResult {
                    req_id,
                    code: -3,
                    msg: "Too low difficulty".to_string(),
                });
            }
        }
    }

    /// Broadcast on a new block: retire all existing jobs, then issue and
    /// notify a new one at the session's current target. `clean_jobs=true`
    /// tells the miner to drop in-flight work.
    pub fn on_new_block(&self, prev_hash: u64) {
        if self.state() != StateV1::Running {
            return;
        }
        self.session.registry().retire_all_jobs();
        let job = self.session.new_job();
        self.connection.send_to_downstream(Message::Notify {
            job_id: job.uid,
            prev_hash,
            clean_jobs: true,
        });
        self.log("NEW_BLOCK");
    }
}

impl stratum_sim_core::NewBlockListener for PoolV1 {
    fn on_new_block(&self, prev_hash: u64) {
        PoolV1::on_new_block(self, prev_hash);
    }
}

impl std::fmt::Debug for PoolV1 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolV1")
            .field("topic", &self.topic)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
    use std::time::Duration;
    use stratum_sim_core::{ConnectionFactory, MiningSession, Scheduler, ShareAccounting, U256};

    /// Accepts every submit whose job_uid is known to the session's
    /// registry and rejects everything else; stale-vs-rejected
    /// distinctions are exercised in `stratum-sim-pool`'s own tests.
    #[derive(Default)]
    struct AcceptAllKnown {
        accepted: AtomicU64,
    }

    impl ShareAccounting for AcceptAllKnown {
        fn process_submit(&self, job_uid: u64, session: &MiningSession) -> SubmitOutcome {
            match session.registry().get(job_uid) {
                Some(job) => {
                    self.accepted.fetch_add(1, AtomicOrdering::Relaxed);
                    SubmitOutcome::Accepted { target: job.diff_target }
                }
                None => SubmitOutcome::Rejected { target: None },
            }
        }
    }

    fn diff1() -> U256 {
        U256::from(0xFFFFu64) << 208
    }

    fn test_pool() -> (Arc<PoolV1>, Arc<Connection<Message>>, Arc<AcceptAllKnown>) {
        let sched = Scheduler::new();
        let bus = Arc::new(EventBus::new(sched.now()));
        let factory = ConnectionFactory::new(sched, "stratum", Duration::ZERO, 0.0, 3);
        let conn = Arc::new(factory.connect::<Message>());
        let accounting = Arc::new(AcceptAllKnown::default());
        let pool = PoolV1::new(
            "pool",
            conn.clone(),
            bus,
            accounting.clone(),
            Target::from_difficulty(100_000, diff1()),
            8,
            0.3,
            Duration::from_secs(60),
            false,
            sched,
        );
        (pool, conn, accounting)
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_before_authorize_still_reaches_running() {
        let (pool, conn, _accounting) = test_pool();
        let handle = tokio::spawn({
            let pool = pool.clone();
            async move { pool.run().await }
        });
        tokio::task::yield_now().await;

        conn.send_to_upstream(Message::Subscribe { req_id: 0 });
        tokio::task::yield_now().await;
        let resp = conn.recv_as_downstream().await.unwrap();
        assert!(matches!(resp, Message::SubscribeResponse { .. }));
        assert_eq!(pool.state(), StateV1::Running);
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn submit_for_unknown_job_is_rejected() {
        let (pool, conn, _accounting) = test_pool();
        let handle = tokio::spawn({
            let pool = pool.clone();
            async move { pool.run().await }
        });
        conn.send_to_upstream(Message::Subscribe { req_id: 0 });
        tokio::task::yield_now().await;
        let _ = conn.recv_as_downstream().await.unwrap();

        conn.send_to_upstream(Message::Submit {
            req_id: 1,
            user: "worker1".to_string(),
            job_id: 999,
            ntime: 0,
            nonce: 0,
        });
        tokio::task::yield_now().await;
        let resp = conn.recv_as_downstream().await.unwrap();
        assert!(matches!(resp, Message::ErrorResult { req_id: 1, code: -3, .. }));
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn on_new_block_is_a_no_op_before_subscribe() {
        let (pool, conn, _accounting) = test_pool();
        pool.on_new_block(0xfeed);
        // without a subscribed session no Notify was queued; the
        // connection is still idle rather than carrying a stale message.
        assert_eq!(pool.state(), StateV1::Init);
        let _ = conn;
    }
}
