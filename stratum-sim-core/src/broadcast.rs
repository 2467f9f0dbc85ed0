//! Seam the pool's block clock uses to broadcast `on_new_block` to every
//! connection processor bound to it, regardless of which wire protocol
//! (V1, V2, or the translator acting as a V1 upstream client) the
//! processor speaks.

/// Implemented by `PoolV1`, `PoolV2` (and, on the V1 side, the translator's
/// upstream client isn't a listener itself — only pool-facing processors
/// are). Registered with `stratum-sim-pool::Pool` per accepted connection.
pub trait NewBlockListener: Send + Sync {
    fn on_new_block(&self, prev_hash: u64);
}
