//! V2→V1 translator.
//!
//! Grounded on `examples/original_source/.../sim_primitives/stratum_v2/
//! proxy.py`'s `V2ToV1Translation`/`V1Client` (the `stratum_v1/proxy.py`
//! counterpart is an empty stub in the source — `class State(enum.Enum):
//! pass` — so this crate implements the V2-driving direction only, which
//! is the one the source actually completes). It is simultaneously the
//! upstream-side handler of a V2 downstream connection (impersonating a
//! pool) and the downstream-side client of a V1 upstream connection
//! (impersonating a miner).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use stratum_sim_core::{Connection, EventBus, RequestRegistry, Target};
use stratum_sim_v1::Message as V1Message;
use stratum_sim_v2::Message as V2Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Init,
    V1Configure,
    ConnectionSetup,
    OpenMiningChannelPending,
    V1SubscribeOrAuthorizeFail,
    Operational,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum V1RequestKind {
    Configure,
    Authorize,
    Subscribe,
    Submit,
}

pub struct Translator {
    topic: String,
    bus: Arc<EventBus>,
    v2_connection: Arc<Connection<V2Message>>,
    v1_connection: Arc<Connection<V1Message>>,
    state: Mutex<State>,
    rng: Mutex<ChaCha8Rng>,
    v1_requests: RequestRegistry<V1RequestKind>,

    open_channel_req_id: Mutex<Option<u32>>,
    channel_id: Mutex<Option<u32>>,
    user_identity: Mutex<Option<String>>,
    extranonce_prefix: Mutex<Option<u64>>,
    target: Mutex<Option<Target>>,
    last_sequence_number: AtomicU64,
    stashed_setup_success: Mutex<Option<V2Message>>,
    v1_authorized: AtomicBool,
    v1_subscribed: AtomicBool,
    channel_error_sent: AtomicBool,
}

impl Translator {
    pub fn new(
        topic: impl Into<String>,
        bus: Arc<EventBus>,
        v2_connection: Arc<Connection<V2Message>>,
        v1_connection: Arc<Connection<V1Message>>,
        channel_id_seed: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            topic: topic.into(),
            bus,
            v2_connection,
            v1_connection,
            state: Mutex::new(State::Init),
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(channel_id_seed)),
            v1_requests: RequestRegistry::new(),
            open_channel_req_id: Mutex::new(None),
            channel_id: Mutex::new(None),
            user_identity: Mutex::new(None),
            extranonce_prefix: Mutex::new(None),
            target: Mutex::new(None),
            last_sequence_number: AtomicU64::new(0),
            stashed_setup_success: Mutex::new(None),
            v1_authorized: AtomicBool::new(false),
            v1_subscribed: AtomicBool::new(false),
            channel_error_sent: AtomicBool::new(false),
        })
    }

    fn log(&self, message: impl Into<String>) {
        self.bus
            .publish(&self.topic, Some(self.v2_connection.uid), message, None);
    }

    fn state(&self) -> State {
        *self.state.lock().unwrap()
    }

    /// The id the request registry assigns IS the V1 `req_id` stamped onto
    /// the outgoing message — there is no separate counter to keep in sync.
    fn send_v1_request(&self, kind: V1RequestKind, build: impl FnOnce(u64) -> V1Message) {
        let id = self.v1_requests.push(kind);
        self.v1_connection.send_to_upstream(build(id as u64));
    }

    /// Drives both halves of the bridge concurrently until either
    /// connection closes.
    pub async fn run(self: Arc<Self>) {
        let v2_side = {
            let this = self.clone();
            tokio::spawn(async move { this.run_v2_side().await })
        };
        let v1_side = {
            let this = self.clone();
            tokio::spawn(async move { this.run_v1_side().await })
        };
        let _ = tokio::join!(v2_side, v1_side);
    }

    async fn run_v2_side(&self) {
        loop {
            match self.v2_connection.recv_as_upstream().await {
                Ok(msg) => self.handle_v2_message(msg),
                Err(_) => {
                    self.log("DISCONNECTED (v2 side)");
                    break;
                }
            }
        }
    }

    async fn run_v1_side(&self) {
        loop {
            match self.v1_connection.recv_as_downstream().await {
                Ok(msg) => self.handle_v1_message(msg),
                Err(_) => {
                    self.log("DISCONNECTED (v1 side)");
                    break;
                }
            }
        }
    }

    fn handle_v2_message(&self, msg: V2Message) {
        self.log(format!("recv (v2) {}", msg.tag()));
        match msg {
            V2Message::SetupConnection {
                min_version,
                max_version,
                ..
            } => self.visit_setup_connection(min_version, max_version),
            V2Message::OpenStandardMiningChannel {
                req_id,
                user_identity,
                ..
            } => self.visit_open_standard_mining_channel(req_id, user_identity),
            V2Message::SubmitSharesStandard {
                sequence_number,
                job_id,
                ntime,
                nonce,
                ..
            } => self.visit_submit_shares_standard(sequence_number, job_id, ntime, nonce),
            other => self.log(format!("ignored v2 message: {}", other.tag())),
        }
    }

    /// A `SetupConnection` may only be processed once, mirroring
    /// `PoolV2::visit_setup_connection`.
    fn visit_setup_connection(&self, min_version: u16, max_version: u16) {
        if self.state() != State::Init {
            self.v2_connection.send_to_downstream(V2Message::SetupConnectionError {
                error_code: "connection can only be set up once".to_string(),
            });
            return;
        }
        let success = V2Message::SetupConnectionSuccess {
            used_version: min_version.min(max_version),
            flags: 0,
        };
        *self.stashed_setup_success.lock().unwrap() = Some(success);
        *self.state.lock().unwrap() = State::V1Configure;

        self.send_v1_request(V1RequestKind::Configure, |req_id| V1Message::Configure {
            req_id,
        });
    }

    fn visit_open_standard_mining_channel(&self, req_id: u32, user_identity: String) {
        *self.state.lock().unwrap() = State::OpenMiningChannelPending;
        let channel_id = self.rng.lock().unwrap().gen::<u32>();
        *self.channel_id.lock().unwrap() = Some(channel_id);
        *self.open_channel_req_id.lock().unwrap() = Some(req_id);
        *self.user_identity.lock().unwrap() = Some(user_identity.clone());

        self.send_v1_request(V1RequestKind::Authorize, move |id| V1Message::Authorize {
            req_id: id,
            username: user_identity.clone(),
        });
        self.send_v1_request(V1RequestKind::Subscribe, |id| V1Message::Subscribe {
            req_id: id,
        });
    }

    fn visit_submit_shares_standard(&self, sequence_number: u64, job_id: u64, ntime: u64, nonce: u64) {
        self.last_sequence_number.store(sequence_number, Ordering::Relaxed);
        let username = self
            .user_identity
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_default();
        self.send_v1_request(V1RequestKind::Submit, move |req_id| V1Message::Submit {
            req_id,
            user: username,
            job_id,
            ntime,
            nonce,
        });
    }

    fn handle_v1_message(&self, msg: V1Message) {
        self.log(format!("recv (v1) {}", msg.tag()));
        match msg {
            V1Message::ConfigureResponse { req_id } => self.handle_configure_response(req_id),
            V1Message::OkResult { req_id } => self.handle_ok_result(req_id),
            V1Message::ErrorResult { req_id, .. } => self.handle_error_result(req_id),
            V1Message::SubscribeResponse {
                req_id,
                extranonce1,
                ..
            } => self.handle_subscribe_response(req_id, extranonce1),
            V1Message::SetDifficulty { target } => self.handle_set_difficulty(target),
            V1Message::Notify {
                job_id, prev_hash, ..
            } => self.handle_notify(job_id, prev_hash),
            other => self.log(format!("ignored v1 message: {}", other.tag())),
        }
    }

    fn handle_configure_response(&self, req_id: u64) {
        if self.v1_requests.pop(req_id as u32) != Some(V1RequestKind::Configure) {
            return;
        }
        if self.state() == State::V1Configure {
            *self.state.lock().unwrap() = State::ConnectionSetup;
            if let Some(success) = self.stashed_setup_success.lock().unwrap().take() {
                self.v2_connection.send_to_downstream(success);
            }
        }
    }

    fn handle_ok_result(&self, req_id: u64) {
        let Some(kind) = self.v1_requests.pop(req_id as u32) else {
            self.log(format!("unpaired V1 OkResult for req_id {req_id}"));
            return;
        };
        match kind {
            V1RequestKind::Authorize => {
                self.v1_authorized.store(true, Ordering::Release);
                self.maybe_complete_channel_open();
            }
            V1RequestKind::Submit => self.emit_submit_success(),
            V1RequestKind::Configure | V1RequestKind::Subscribe => {}
        }
    }

    fn handle_error_result(&self, req_id: u64) {
        let Some(kind) = self.v1_requests.pop(req_id as u32) else {
            return;
        };
        match kind {
            V1RequestKind::Authorize | V1RequestKind::Subscribe => {
                *self.state.lock().unwrap() = State::V1SubscribeOrAuthorizeFail;
                if self
                    .channel_error_sent
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    let req_id = self.open_channel_req_id.lock().unwrap().unwrap_or(0);
                    self.v2_connection.send_to_downstream(V2Message::OpenMiningChannelError {
                        req_id,
                        error_code: "upstream subscribe/authorize failed".to_string(),
                    });
                }
            }
            V1RequestKind::Submit => self.emit_submit_error(),
            V1RequestKind::Configure => {}
        }
    }

    fn handle_subscribe_response(&self, req_id: u64, extranonce1: u64) {
        if self.v1_requests.pop(req_id as u32) != Some(V1RequestKind::Subscribe) {
            return;
        }
        *self.extranonce_prefix.lock().unwrap() = Some(extranonce1);
        self.v1_subscribed.store(true, Ordering::Release);
        self.maybe_complete_channel_open();
    }

    /// Completion rule (spec §4.9): operational once both Authorize and
    /// Subscribe have succeeded, regardless of arrival order.
    fn maybe_complete_channel_open(&self) {
        if self.v1_authorized.load(Ordering::Acquire)
            && self.v1_subscribed.load(Ordering::Acquire)
            && self.state() == State::OpenMiningChannelPending
        {
            *self.state.lock().unwrap() = State::Operational;
            let channel_id = self.channel_id.lock().unwrap().unwrap_or(0);
            let req_id = self.open_channel_req_id.lock().unwrap().unwrap_or(0);
            let extranonce_prefix = self.extranonce_prefix.lock().unwrap().unwrap_or(0);
            let target = self
                .target
                .lock()
                .unwrap()
                .unwrap_or_else(|| Target::from_difficulty(1, stratum_sim_core::U256::from(0xFFFFu64) << 208));
            self.v2_connection.send_to_downstream(V2Message::OpenStandardMiningChannelSuccess {
                req_id,
                channel_id,
                target,
                extranonce_prefix,
                group_channel_id: 0,
            });
        }
    }

    fn handle_set_difficulty(&self, target: Target) {
        *self.target.lock().unwrap() = Some(target);
        let channel_id = self.channel_id.lock().unwrap().unwrap_or(0);
        self.v2_connection.send_to_downstream(V2Message::SetTarget {
            channel_id,
            max_target: target,
        });
    }

    fn handle_notify(&self, job_id: u64, prev_hash: u64) {
        let channel_id = self.channel_id.lock().unwrap().unwrap_or(0);
        self.v2_connection.send_to_downstream(V2Message::SetNewPrevHash {
            channel_id,
            job_id,
            prev_hash,
            min_ntime: 0,
            nbits: 0,
            max_ntime_offset: 7200,
        });
        self.v2_connection.send_to_downstream(V2Message::NewMiningJob {
            channel_id,
            job_id,
            future_job: false,
            version: 0,
            merkle_root: job_id,
        });
    }

    fn emit_submit_success(&self) {
        let channel_id = self.channel_id.lock().unwrap().unwrap_or(0);
        let diff = self
            .target
            .lock()
            .unwrap()
            .map(|t| t.diff_as_f64())
            .unwrap_or(0.0);
        self.v2_connection.send_to_downstream(V2Message::SubmitSharesSuccess {
            channel_id,
            last_sequence_number: self.last_sequence_number.load(Ordering::Relaxed),
            new_submits_accepted_count: 1,
            new_shares_sum: diff,
        });
    }

    fn emit_submit_error(&self) {
        let channel_id = self.channel_id.lock().unwrap().unwrap_or(0);
        self.v2_connection.send_to_downstream(V2Message::SubmitSharesError {
            channel_id,
            sequence_number: self.last_sequence_number.load(Ordering::Relaxed),
            error_code: "Share rejected".to_string(),
        });
    }
}

impl std::fmt::Debug for Translator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Translator")
            .field("topic", &self.topic)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use stratum_sim_core::{ConnectionFactory, Scheduler};

    fn test_env() -> (Arc<EventBus>, Scheduler, ConnectionFactory) {
        let sched = Scheduler::new();
        let bus = Arc::new(EventBus::new(sched.now()));
        let factory = ConnectionFactory::new(sched, "stratum", Duration::ZERO, 0.0, 1);
        (bus, sched, factory)
    }

    async fn run_translator(translator: Arc<Translator>) {
        tokio::spawn(async move { translator.run().await });
        tokio::task::yield_now().await;
    }

    #[tokio::test(start_paused = true)]
    async fn setup_connection_completes_after_v1_configure_response() {
        let (bus, sched, factory) = test_env();
        let v2_conn = Arc::new(factory.connect::<V2Message>());
        let v1_conn = Arc::new(factory.connect::<V1Message>());
        let translator = Translator::new("proxy", bus, v2_conn.clone(), v1_conn.clone(), 7);
        run_translator(translator.clone()).await;

        v2_conn.send_to_upstream(V2Message::SetupConnection {
            req_id: 1,
            protocol: stratum_sim_v2::ProtocolType::Mining,
            min_version: 2,
            max_version: 2,
            flags: 0,
            endpoint_host: "h".to_string(),
            endpoint_port: 0,
            device: stratum_sim_v2::DeviceInfo::default(),
        });
        tokio::task::yield_now().await;

        let configure = v1_conn.recv_as_upstream().await.unwrap();
        assert!(matches!(configure, V1Message::Configure { .. }));
        let req_id = configure.req_id().unwrap();

        v1_conn.send_to_downstream(V1Message::ConfigureResponse { req_id });
        tokio::task::yield_now().await;

        let success = v2_conn.recv_as_downstream().await.unwrap();
        assert!(matches!(success, V2Message::SetupConnectionSuccess { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn channel_open_completes_once_both_v1_requests_succeed() {
        let (bus, sched, factory) = test_env();
        let v2_conn = Arc::new(factory.connect::<V2Message>());
        let v1_conn = Arc::new(factory.connect::<V1Message>());
        let translator = Translator::new("proxy", bus, v2_conn.clone(), v1_conn.clone(), 7);
        run_translator(translator.clone()).await;

        v2_conn.send_to_upstream(V2Message::OpenStandardMiningChannel {
            req_id: 5,
            user_identity: "alice".to_string(),
            nominal_hashrate: 1.0,
            max_target: Target::from_difficulty(1, stratum_sim_core::U256::from(0xFFFFu64) << 208),
        });
        tokio::task::yield_now().await;

        let first = v1_conn.recv_as_upstream().await.unwrap();
        let second = v1_conn.recv_as_upstream().await.unwrap();
        assert!(matches!(first, V1Message::Authorize { .. }));
        assert!(matches!(second, V1Message::Subscribe { .. }));

        v1_conn.send_to_downstream(V1Message::OkResult {
            req_id: first.req_id().unwrap(),
        });
        tokio::task::yield_now().await;
        // only one half done: no success yet
        v1_conn.send_to_downstream(V1Message::SubscribeResponse {
            req_id: second.req_id().unwrap(),
            extranonce1: 99,
            extranonce2_size: 4,
        });
        tokio::task::yield_now().await;

        let success = v2_conn.recv_as_downstream().await.unwrap();
        assert!(matches!(
            success,
            V2Message::OpenStandardMiningChannelSuccess { req_id: 5, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn v1_authorize_failure_surfaces_as_open_mining_channel_error() {
        let (bus, sched, factory) = test_env();
        let v2_conn = Arc::new(factory.connect::<V2Message>());
        let v1_conn = Arc::new(factory.connect::<V1Message>());
        let translator = Translator::new("proxy", bus, v2_conn.clone(), v1_conn.clone(), 7);
        run_translator(translator.clone()).await;

        v2_conn.send_to_upstream(V2Message::OpenStandardMiningChannel {
            req_id: 9,
            user_identity: "bob".to_string(),
            nominal_hashrate: 1.0,
            max_target: Target::from_difficulty(1, stratum_sim_core::U256::from(0xFFFFu64) << 208),
        });
        tokio::task::yield_now().await;
        let authorize = v1_conn.recv_as_upstream().await.unwrap();
        let _subscribe = v1_conn.recv_as_upstream().await.unwrap();

        v1_conn.send_to_downstream(V1Message::ErrorResult {
            req_id: authorize.req_id().unwrap(),
            code: -1,
            msg: "unauthorized".to_string(),
        });
        tokio::task::yield_now().await;

        let error = v2_conn.recv_as_downstream().await.unwrap();
        assert!(matches!(
            error,
            V2Message::OpenMiningChannelError { req_id: 9, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn notify_translates_to_set_new_prev_hash_and_new_mining_job() {
        let (bus, sched, factory) = test_env();
        let v2_conn = Arc::new(factory.connect::<V2Message>());
        let v1_conn = Arc::new(factory.connect::<V1Message>());
        let translator = Translator::new("proxy", bus, v2_conn.clone(), v1_conn.clone(), 7);
        run_translator(translator.clone()).await;

        v1_conn.send_to_downstream(V1Message::Notify {
            job_id: 42,
            prev_hash: 0xabc,
            clean_jobs: true,
        });
        tokio::task::yield_now().await;

        let first = v2_conn.recv_as_downstream().await.unwrap();
        let second = v2_conn.recv_as_downstream().await.unwrap();
        assert!(matches!(
            first,
            V2Message::SetNewPrevHash { job_id: 42, prev_hash: 0xabc, .. }
        ));
        assert!(matches!(second, V2Message::NewMiningJob { job_id: 42, .. }));
        let _ = sched;
    }
}
