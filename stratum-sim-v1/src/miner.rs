//! V1 miner connection processor.
//!
//! Grounded on `examples/original_source/.../sim_primitives/stratum_v1/
//! miner.py`'s `MinerV1`. Request/response correlation uses the shared
//! `RequestRegistry` (generalized from the source's `protocol.py`).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use stratum_sim_core::{
    Connection, EventBus, MinerDevice, MiningSession, MiningSessionBuilder, RequestRegistry,
    ShareSubmitter, Target,
};

use crate::messages::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StateV1 {
    Init,
    Authorized,
    Subscribed,
    AuthorizedAndSubscribed,
    Running,
}

/// What an outstanding request was, so `visit_ok_result`/`visit_error_result`
/// know which half of setup just completed.
#[derive(Debug, Clone, Copy)]
enum Outstanding {
    Authorize,
    Subscribe,
    Submit,
}

pub struct MinerV1 {
    topic: String,
    connection: Arc<Connection<Message>>,
    bus: Arc<EventBus>,
    device: Arc<dyn MinerDevice>,
    session: Arc<MiningSession>,
    state: Mutex<StateV1>,
    request_registry: RequestRegistry<Outstanding>,
    extranonce1: Mutex<Option<u64>>,
    next_req_id: AtomicU64,
}

impl MinerV1 {
    /// `speed_ghps` sizes the session's starting difficulty so the
    /// expected submit rate tracks `desired_submits_per_sec` even before
    /// vardiff (if enabled) converges: `diff = (speed_ghps * 1e9) /
    /// (2^32 * desired_submits_per_sec)`, per spec §4.6.
    pub fn new(
        topic: impl Into<String>,
        connection: Arc<Connection<Message>>,
        bus: Arc<EventBus>,
        device: Arc<dyn MinerDevice>,
        speed_ghps: f64,
        desired_submits_per_sec: f64,
        diff_1_target: stratum_sim_core::U256,
        enable_vardiff: bool,
        vardiff_window: std::time::Duration,
        scheduler: stratum_sim_core::Scheduler,
    ) -> Arc<Self> {
        let default_diff =
            ((speed_ghps * 1e9) / (4.294967296e9 * desired_submits_per_sec)).max(1.0) as u64;
        let target = Target::from_difficulty(default_diff, diff_1_target);

        let mut builder = MiningSessionBuilder::new(scheduler, "miner-session", target);
        if enable_vardiff {
            builder = builder.enable_vardiff(desired_submits_per_sec, vardiff_window);
        }
        let session = Arc::new(builder.build());

        let miner = Arc::new(Self {
            topic: topic.into(),
            connection,
            bus,
            device,
            session,
            state: Mutex::new(StateV1::Init),
            request_registry: RequestRegistry::new(),
            extranonce1: Mutex::new(None),
            next_req_id: AtomicU64::new(0),
        });
        miner.setup();
        miner
    }

    pub fn session(&self) -> &Arc<MiningSession> {
        &self.session
    }

    fn log(&self, message: impl Into<String>) {
        self.bus
            .publish(&self.topic, Some(self.connection.uid), message, None);
    }

    fn alloc_req_id(&self) -> u64 {
        self.next_req_id.fetch_add(1, Ordering::Relaxed)
    }

    fn setup(&self) {
        let req_id = self.alloc_req_id();
        self.request_registry.push(Outstanding::Authorize);
        self.connection.send_to_upstream(Message::Authorize {
            req_id,
            username: "some_miner".to_string(),
        });

        let req_id = self.alloc_req_id();
        self.request_registry.push(Outstanding::Subscribe);
        self.connection
            .send_to_upstream(Message::Subscribe { req_id });
    }

    pub async fn run(self: Arc<Self>) {
        loop {
            match self.connection.recv_as_downstream().await {
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
            Message::OkResult { req_id } => self.visit_ok_result(req_id),
            Message::ErrorResult { req_id, code, msg } => {
                self.visit_error_result(req_id, code, msg)
            }
            Message::SubscribeResponse {
                extranonce1,
                ..
            } => self.visit_subscribe_response(extranonce1),
            Message::Notify {
                job_id,
                clean_jobs,
                ..
            } => self.visit_notify(job_id, clean_jobs),
            Message::SetDifficulty { target } => self.visit_set_difficulty(target),
            other => {
                self.log(format!("unrecognized message: {}", other.tag()));
            }
        }
    }

    fn visit_ok_result(&self, req_id: u64) {
        let Some(outstanding) = self.request_registry.pop(req_id as u32) else {
            self.log(format!("unpaired OkResult for req_id {req_id}"));
            return;
        };
        if let Outstanding::Authorize = outstanding {
            let mut state = self.state.lock().unwrap();
            if *state == StateV1::Init {
                *state = StateV1::Authorized;
            } else if *state == StateV1::Subscribed {
                *state = StateV1::AuthorizedAndSubscribed;
            }
        }
    }

    fn visit_error_result(&self, req_id: u64, code: i32, msg: String) {
        if self.request_registry.pop(req_id as u32).is_some() {
            self.log(format!("error code {code}, '{msg}' for request {req_id}"));
        }
    }

    fn visit_subscribe_response(&self, extranonce1: u64) {
        *self.extranonce1.lock().unwrap() = Some(extranonce1);
        let mut state = self.state.lock().unwrap();
        *state = match *state {
            StateV1::Init => StateV1::Subscribed,
            StateV1::Authorized => StateV1::AuthorizedAndSubscribed,
            other => other,
        };
        self.log("connection subscribed");
    }

    fn visit_notify(&self, job_id: u64, clean_jobs: bool) {
        let allowed = {
            let state = self.state.lock().unwrap();
            *state >= StateV1::Subscribed
        };
        if !allowed {
            return;
        }
        let target = self.session.current_target();
        let job = self.session.registry().insert_job(job_id, target);
        self.device.mine_on_new_job(job, clean_jobs);
        let mut state = self.state.lock().unwrap();
        *state = StateV1::Running;
    }

    fn visit_set_difficulty(&self, target: Target) {
        self.session.set_target(target);
        self.log("difficulty updated");
    }
}

impl ShareSubmitter for MinerV1 {
    fn submit_share(&self, job: stratum_sim_core::MiningJob) {
        let req_id = self.alloc_req_id();
        self.request_registry.push(Outstanding::Submit);
        self.connection.send_to_upstream(Message::Submit {
            req_id,
            user: "some_miner".to_string(),
            job_id: job.uid,
            ntime: 0,
            nonce: 0,
        });
    }
}

impl std::fmt::Debug for MinerV1 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MinerV1")
            .field("topic", &self.topic)
            .field("state", &*self.state.lock().unwrap())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use stratum_sim_core::{ConnectionFactory, U256};

    struct RecordingDevice {
        jobs: Mutex<Vec<(stratum_sim_core::MiningJob, bool)>>,
        calls: AtomicUsize,
    }

    impl Default for RecordingDevice {
        fn default() -> Self {
            Self {
                jobs: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl MinerDevice for RecordingDevice {
        fn mine_on_new_job(&self, job: stratum_sim_core::MiningJob, flush_any_pending_work: bool) {
            self.calls.fetch_add(1, Ordering::Relaxed);
            self.jobs.lock().unwrap().push((job, flush_any_pending_work));
        }
    }

    fn diff1() -> U256 {
        U256::from(0xFFFFu64) << 208
    }

    fn test_miner() -> (Arc<MinerV1>, Arc<Connection<Message>>, Arc<RecordingDevice>) {
        let sched = stratum_sim_core::Scheduler::new();
        let bus = Arc::new(EventBus::new(sched.now()));
        let factory = ConnectionFactory::new(sched, "stratum", Duration::ZERO, 0.0, 5);
        let conn = Arc::new(factory.connect::<Message>());
        let device = Arc::new(RecordingDevice::default());
        let miner = MinerV1::new(
            "miner",
            conn.clone(),
            bus,
            device.clone(),
            1_000_000.0,
            0.3,
            diff1(),
            false,
            Duration::from_secs(60),
            sched,
        );
        (miner, conn, device)
    }

    #[tokio::test(start_paused = true)]
    async fn connecting_sends_authorize_then_subscribe() {
        let (_miner, conn, _device) = test_miner();
        let first = conn.recv_as_upstream().await.unwrap();
        let second = conn.recv_as_upstream().await.unwrap();
        assert!(matches!(first, Message::Authorize { .. }));
        assert!(matches!(second, Message::Subscribe { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn notify_before_subscribed_is_ignored() {
        let (miner, conn, device) = test_miner();
        let handle = tokio::spawn({
            let miner = miner.clone();
            async move { miner.run().await }
        });
        let _authorize = conn.recv_as_upstream().await.unwrap();
        let _subscribe = conn.recv_as_upstream().await.unwrap();

        conn.send_to_downstream(Message::Notify {
            job_id: 1,
            prev_hash: 0,
            clean_jobs: true,
        });
        tokio::task::yield_now().await;
        assert_eq!(device.calls.load(Ordering::Relaxed), 0);
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn notify_after_subscribe_response_drives_the_device() {
        let (miner, conn, device) = test_miner();
        let handle = tokio::spawn({
            let miner = miner.clone();
            async move { miner.run().await }
        });
        let _authorize = conn.recv_as_upstream().await.unwrap();
        let subscribe = conn.recv_as_upstream().await.unwrap();
        let req_id = match subscribe {
            Message::Subscribe { req_id } => req_id,
            _ => panic!("expected Subscribe"),
        };
        conn.send_to_downstream(Message::SubscribeResponse {
            req_id,
            extranonce1: 7,
            extranonce2_size: 4,
        });
        tokio::task::yield_now().await;

        conn.send_to_downstream(Message::Notify {
            job_id: 42,
            prev_hash: 0,
            clean_jobs: true,
        });
        tokio::task::yield_now().await;
        assert_eq!(device.calls.load(Ordering::Relaxed), 1);
        assert_eq!(device.jobs.lock().unwrap()[0].0.uid, 42);
        assert!(device.jobs.lock().unwrap()[0].1);
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn share_submitter_sends_submit_upstream() {
        let (miner, conn, _device) = test_miner();
        let _authorize = conn.recv_as_upstream().await.unwrap();
        let _subscribe = conn.recv_as_upstream().await.unwrap();

        let job = stratum_sim_core::MiningJob {
            uid: 3,
            diff_target: Target::from_difficulty(1, diff1()),
        };
        miner.submit_share(job);
        let submit = conn.recv_as_upstream().await.unwrap();
        assert!(matches!(submit, Message::Submit { job_id: 3, .. }));
    }
}
