//! Stratum V2 mining-protocol messages, the per-connection channel
//! manager, and the pool/miner connection processors that speak them.

pub mod channel;
pub mod messages;
pub mod miner;
pub mod pool;
pub mod types;

pub use channel::{ChannelRegistry, MiningChannel};
pub use messages::Message;
pub use miner::{MinerV2, StateV2};
pub use pool::PoolV2;
pub use types::{downstream_flags, upstream_flags, ChannelType, DeviceInfo, ProtocolType};
