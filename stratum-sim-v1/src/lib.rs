//! Stratum V1 wire messages and the pool/miner connection processors that
//! speak them, built on the shared primitives in `stratum-sim-core`.

pub mod messages;
pub mod miner;
pub mod pool;

pub use messages::Message;
pub use miner::{MinerV1, StateV1 as MinerStateV1};
pub use pool::{PoolV1, StateV1};
