//! Pool aggregate state: share accounting across every connection bound to
//! the pool, the block clock, and connection acceptance for both V1 and V2
//! downstreams.

pub mod aggregate;
pub mod pool;

pub use aggregate::{AggregateSnapshot, PoolAggregate};
pub use pool::{Pool, PoolConfig};
