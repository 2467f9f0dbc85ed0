//! Seam between a protocol connection processor (V1/V2 miner side) and
//! the hashrate-producing miner device, so neither `stratum-sim-v1`/
//! `stratum-sim-v2` nor `stratum-sim-miner` need to depend on each other.

use crate::job::MiningJob;

/// Implemented by the hashrate simulator (`stratum-sim-miner`). The
/// protocol processor calls this whenever the pool hands it a job to mine.
pub trait MinerDevice: Send + Sync {
    /// `flush_any_pending_work=true` interrupts any share search in
    /// progress immediately; `false` queues the job for the next
    /// interrupt (e.g. the next block).
    fn mine_on_new_job(&self, job: MiningJob, flush_any_pending_work: bool);
}

/// Implemented by the protocol processor. The miner device calls this
/// when its hashrate process discovers a share below the current target.
pub trait ShareSubmitter: Send + Sync {
    fn submit_share(&self, job: MiningJob);
}
