//! Small enums shared by the V2 messages and connection processors.
//!
//! Grounded on `examples/original_source/.../sim_primitives/stratum_v2/
//! types.py`. The original represents flags as a `set` of a small
//! `IntFlag`; a `u32` bitmask (consts below) is the idiomatic-Rust
//! equivalent without pulling in `bitflags` for two flag bits.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolType {
    Mining,
}

pub mod downstream_flags {
    pub const REQUIRES_STANDARD_JOBS: u32 = 1 << 0;
    pub const REQUIRES_VERSION_ROLLING: u32 = 1 << 1;
}

pub mod upstream_flags {
    pub const SUPPORTS_EXTENDED_CHANNELS: u32 = 1 << 0;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelType {
    Standard,
    Extended,
}

/// Device identity fields sent in `SetupConnection`, grounded on the
/// source's `miner.device_information` dict.
#[derive(Debug, Clone, Default)]
pub struct DeviceInfo {
    pub vendor: String,
    pub hardware_version: String,
    pub firmware: String,
    pub device_id: String,
}
