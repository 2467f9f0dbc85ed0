//! Stratum V1 wire messages.
//!
//! Grounded on `examples/original_source/.../sim_primitives/stratum_v1/
//! messages.py`. Dispatch is a sealed enum + `match` (Design Notes option
//! (a)) rather than the source's snake-case method-name reflection;
//! binary/JSON-RPC encoding is out of scope per spec §6.

use stratum_sim_core::Target;

#[derive(Debug, Clone)]
pub enum Message {
    Configure { req_id: u64 },
    ConfigureResponse { req_id: u64 },
    Authorize { req_id: u64, username: String },
    Subscribe { req_id: u64 },
    SubscribeResponse {
        req_id: u64,
        extranonce1: u64,
        extranonce2_size: u32,
    },
    SetDifficulty { target: Target },
    Submit {
        req_id: u64,
        user: String,
        job_id: u64,
        ntime: u64,
        nonce: u64,
    },
    Notify {
        job_id: u64,
        prev_hash: u64,
        clean_jobs: bool,
    },
    OkResult { req_id: u64 },
    ErrorResult { req_id: u64, code: i32, msg: String },
}

impl Message {
    pub fn req_id(&self) -> Option<u64> {
        match self {
            Message::Configure { req_id }
            | Message::ConfigureResponse { req_id }
            | Message::Authorize { req_id, .. }
            | Message::Subscribe { req_id }
            | Message::Submit { req_id, .. }
            | Message::OkResult { req_id }
            | Message::ErrorResult { req_id, .. } => Some(*req_id),
            Message::SubscribeResponse { req_id, .. } => Some(*req_id),
            Message::SetDifficulty { .. } | Message::Notify { .. } => None,
        }
    }

    /// Canonical tag, used only for bus logging (not for dispatch — that's
    /// a `match` in the pool/miner processors).
    pub fn tag(&self) -> &'static str {
        match self {
            Message::Configure { .. } => "configure",
            Message::ConfigureResponse { .. } => "configure_response",
            Message::Authorize { .. } => "authorize",
            Message::Subscribe { .. } => "subscribe",
            Message::SubscribeResponse { .. } => "subscribe_response",
            Message::SetDifficulty { .. } => "set_difficulty",
            Message::Submit { .. } => "submit",
            Message::Notify { .. } => "notify",
            Message::OkResult { .. } => "ok_result",
            Message::ErrorResult { .. } => "error_result",
        }
    }
}
