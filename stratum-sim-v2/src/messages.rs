//! Stratum V2 mining-protocol messages.
//!
//! Grounded on `examples/original_source/.../sim_primitives/stratum_v2/
//! messages.py`. As in `stratum-sim-v1`, dispatch is a sealed enum +
//! `match` rather than the source's snake-case reflection; binary
//! encoding is out of scope per spec §6. Opaque hash-like fields
//! (`prev_hash`, `merkle_root`, coinbase prefix/suffix, extranonce
//! prefix) are represented as `u64` placeholders — spec §4.7 calls these
//! out explicitly as placeholders, since real SHA-256/merkle computation
//! is a Non-goal.

use stratum_sim_core::Target;

use crate::types::{ChannelType, DeviceInfo, ProtocolType};

#[derive(Debug, Clone)]
pub enum Message {
    SetupConnection {
        req_id: u32,
        protocol: ProtocolType,
        min_version: u16,
        max_version: u16,
        flags: u32,
        endpoint_host: String,
        endpoint_port: u16,
        device: DeviceInfo,
    },
    SetupConnectionSuccess {
        used_version: u16,
        flags: u32,
    },
    SetupConnectionError {
        error_code: String,
    },

    OpenStandardMiningChannel {
        req_id: u32,
        user_identity: String,
        nominal_hashrate: f64,
        max_target: Target,
    },
    OpenStandardMiningChannelSuccess {
        req_id: u32,
        channel_id: u32,
        target: Target,
        extranonce_prefix: u64,
        group_channel_id: u32,
    },
    OpenExtendedMiningChannel {
        req_id: u32,
        user_identity: String,
        nominal_hashrate: f64,
        max_target: Target,
        min_extranonce_size: u32,
    },
    OpenExtendedMiningChannelSuccess {
        req_id: u32,
        channel_id: u32,
        target: Target,
        extranonce_size: u32,
        extranonce_prefix: u64,
    },
    OpenMiningChannelError {
        req_id: u32,
        error_code: String,
    },

    UpdateChannel {
        channel_id: u32,
        nominal_hash_rate: f64,
        maximum_target: Target,
    },
    UpdateChannelError {
        channel_id: u32,
        error_code: String,
    },
    CloseChannel {
        channel_id: u32,
        reason_code: String,
    },
    SetExtranoncePrefix {
        channel_id: u32,
        extranonce_prefix: u64,
    },

    SubmitSharesStandard {
        channel_id: u32,
        sequence_number: u64,
        job_id: u64,
        nonce: u64,
        ntime: u64,
        version: u32,
    },
    SubmitSharesExtended {
        channel_id: u32,
        sequence_number: u64,
        job_id: u64,
        nonce: u64,
        ntime: u64,
        version: u32,
        extranonce: u64,
    },
    SubmitSharesSuccess {
        channel_id: u32,
        last_sequence_number: u64,
        new_submits_accepted_count: u32,
        new_shares_sum: f64,
    },
    SubmitSharesError {
        channel_id: u32,
        sequence_number: u64,
        error_code: String,
    },

    NewMiningJob {
        channel_id: u32,
        job_id: u64,
        future_job: bool,
        version: u32,
        merkle_root: u64,
    },
    NewExtendedMiningJob {
        channel_id: u32,
        job_id: u64,
        future_job: bool,
        version: u32,
        version_rolling_allowed: bool,
        merkle_path: u64,
        cb_prefix: u64,
        cb_suffix: u64,
    },
    SetNewPrevHash {
        channel_id: u32,
        job_id: u64,
        prev_hash: u64,
        min_ntime: u64,
        nbits: u32,
        max_ntime_offset: u32,
    },

    SetCustomMiningJob {
        channel_id: u32,
        request_id: u32,
    },
    SetCustomMiningJobSuccess {
        channel_id: u32,
        request_id: u32,
        job_id: u64,
    },
    SetCustomMiningJobError {
        channel_id: u32,
        request_id: u32,
        error_code: String,
    },

    SetTarget {
        channel_id: u32,
        max_target: Target,
    },
    Reconnect {
        new_host: String,
        new_port: u16,
    },
    SetGroupChannel {
        group_channel_id: u32,
        channel_ids: Vec<u32>,
    },
}

impl Message {
    /// The channel this message belongs to, for channel-mismatch checks
    /// (spec §7's "channel_id in a channel message matches a channel on
    /// the same connection" invariant). `None` for connection-scoped
    /// messages.
    pub fn channel_id(&self) -> Option<u32> {
        use Message::*;
        match self {
            OpenStandardMiningChannelSuccess { channel_id, .. }
            | OpenExtendedMiningChannelSuccess { channel_id, .. }
            | UpdateChannel { channel_id, .. }
            | UpdateChannelError { channel_id, .. }
            | CloseChannel { channel_id, .. }
            | SetExtranoncePrefix { channel_id, .. }
            | SubmitSharesStandard { channel_id, .. }
            | SubmitSharesExtended { channel_id, .. }
            | SubmitSharesSuccess { channel_id, .. }
            | SubmitSharesError { channel_id, .. }
            | NewMiningJob { channel_id, .. }
            | NewExtendedMiningJob { channel_id, .. }
            | SetNewPrevHash { channel_id, .. }
            | SetCustomMiningJob { channel_id, .. }
            | SetCustomMiningJobSuccess { channel_id, .. }
            | SetCustomMiningJobError { channel_id, .. }
            | SetTarget { channel_id, .. } => Some(*channel_id),
            _ => None,
        }
    }

    pub fn req_id(&self) -> Option<u32> {
        use Message::*;
        match self {
            SetupConnection { req_id, .. }
            | OpenStandardMiningChannel { req_id, .. }
            | OpenStandardMiningChannelSuccess { req_id, .. }
            | OpenExtendedMiningChannel { req_id, .. }
            | OpenExtendedMiningChannelSuccess { req_id, .. }
            | OpenMiningChannelError { req_id, .. } => Some(*req_id),
            _ => None,
        }
    }

    pub fn tag(&self) -> &'static str {
        use Message::*;
        match self {
            SetupConnection { .. } => "setup_connection",
            SetupConnectionSuccess { .. } => "setup_connection_success",
            SetupConnectionError { .. } => "setup_connection_error",
            OpenStandardMiningChannel { .. } => "open_standard_mining_channel",
            OpenStandardMiningChannelSuccess { .. } => "open_standard_mining_channel_success",
            OpenExtendedMiningChannel { .. } => "open_extended_mining_channel",
            OpenExtendedMiningChannelSuccess { .. } => "open_extended_mining_channel_success",
            OpenMiningChannelError { .. } => "open_mining_channel_error",
            UpdateChannel { .. } => "update_channel",
            UpdateChannelError { .. } => "update_channel_error",
            CloseChannel { .. } => "close_channel",
            SetExtranoncePrefix { .. } => "set_extranonce_prefix",
            SubmitSharesStandard { .. } => "submit_shares_standard",
            SubmitSharesExtended { .. } => "submit_shares_extended",
            SubmitSharesSuccess { .. } => "submit_shares_success",
            SubmitSharesError { .. } => "submit_shares_error",
            NewMiningJob { .. } => "new_mining_job",
            NewExtendedMiningJob { .. } => "new_extended_mining_job",
            SetNewPrevHash { .. } => "set_new_prev_hash",
            SetCustomMiningJob { .. } => "set_custom_mining_job",
            SetCustomMiningJobSuccess { .. } => "set_custom_mining_job_success",
            SetCustomMiningJobError { .. } => "set_custom_mining_job_error",
            SetTarget { .. } => "set_target",
            Reconnect { .. } => "reconnect",
            SetGroupChannel { .. } => "set_group_channel",
        }
    }

    /// `true` for `OpenStandardMiningChannel`/`OpenExtendedMiningChannel`,
    /// used by the channel-open handler to branch on requested type.
    pub fn requested_channel_type(&self) -> Option<ChannelType> {
        match self {
            Message::OpenStandardMiningChannel { .. } => Some(ChannelType::Standard),
            Message::OpenExtendedMiningChannel { .. } => Some(ChannelType::Extended),
            _ => None,
        }
    }
}
