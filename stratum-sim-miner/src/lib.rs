//! Simulated hashrate-producing miner: a device driving share discovery,
//! bound to either a V1 or V2 protocol connection processor.

pub mod device;
pub mod miner;

pub use device::HashrateProcess;
pub use miner::{connect_v1, connect_v2, Miner, MinerConfig, MinerProcessor};
