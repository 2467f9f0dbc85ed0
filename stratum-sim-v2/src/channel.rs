//! V2 mining channel and its per-connection registry.
//!
//! Grounded on `examples/original_source/.../sim_primitives/stratum_v2/
//! pool.py`'s `MiningChannel`/`PoolMiningChannel`/`ChannelRegistry`. The
//! channel owns its session (§9 Design Notes: "represent the session as
//! owned by the channel") and the single pending future-job slot (spec
//! §3's `MiningChannel` invariant).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use stratum_sim_core::{CoreError, CoreResult, MiningJob, MiningSession};

use crate::types::ChannelType;

pub struct MiningChannel {
    pub channel_id: u32,
    pub conn_uid: u64,
    pub channel_type: ChannelType,
    pub session: Arc<MiningSession>,
    future_job: Mutex<Option<MiningJob>>,
    closed: AtomicBool,
}

impl MiningChannel {
    pub fn new(
        channel_id: u32,
        conn_uid: u64,
        channel_type: ChannelType,
        session: Arc<MiningSession>,
    ) -> Self {
        Self {
            channel_id,
            conn_uid,
            channel_type,
            session,
            future_job: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Takes the pending future job. Errors (BUG) if the slot is empty —
    /// spec §3: "take future job" requires the slot be occupied.
    pub fn take_future_job(&self) -> CoreResult<MiningJob> {
        self.future_job
            .lock()
            .unwrap()
            .take()
            .ok_or(CoreError::FutureJobEmpty(self.channel_id))
    }

    /// Stores a future job. Errors (BUG) if the slot is already occupied
    /// — spec §3: "add future job" requires `future_job is None`.
    pub fn add_future_job(&self, job: MiningJob) -> CoreResult<()> {
        let mut slot = self.future_job.lock().unwrap();
        if slot.is_some() {
            return Err(CoreError::FutureJobOccupied(self.channel_id));
        }
        *slot = Some(job);
        Ok(())
    }

    pub fn has_future_job(&self) -> bool {
        self.future_job.lock().unwrap().is_some()
    }

    pub fn terminate(&self) {
        self.closed.store(true, Ordering::Release);
        self.session.terminate();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Per-connection vector of channels; `channel_id` is the channel's index,
/// matching spec §3's `ChannelRegistry`.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: Mutex<Vec<Arc<MiningChannel>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `channel` at the next index, returning the assigned id.
    /// Callers build the channel with a placeholder id of `0` then use
    /// the returned id (or construct the channel only after calling
    /// `next_channel_id`); see `PoolV2::visit_open_mining_channel`.
    pub fn next_channel_id(&self) -> u32 {
        self.channels.lock().unwrap().len() as u32
    }

    pub fn push(&self, channel: Arc<MiningChannel>) {
        self.channels.lock().unwrap().push(channel);
    }

    pub fn get(&self, channel_id: u32) -> Option<Arc<MiningChannel>> {
        self.channels
            .lock()
            .unwrap()
            .get(channel_id as usize)
            .cloned()
    }

    pub fn all(&self) -> Vec<Arc<MiningChannel>> {
        self.channels.lock().unwrap().clone()
    }

    pub fn terminate_all(&self) {
        for channel in self.channels.lock().unwrap().iter() {
            channel.terminate();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratum_sim_core::{MiningSessionBuilder, Scheduler, Target, U256};

    fn session() -> Arc<MiningSession> {
        let target = Target::from_difficulty(1000, U256::from(0xFFFFu64) << 208);
        Arc::new(MiningSessionBuilder::new(Scheduler::new(), "s", target).build())
    }

    #[test]
    fn future_job_slot_enforces_single_occupancy() {
        let channel = MiningChannel::new(0, 0, ChannelType::Standard, session());
        let job = MiningJob {
            uid: 1,
            diff_target: Target::from_difficulty(1, U256::from(0xFFFFu64) << 208),
        };
        channel.add_future_job(job).unwrap();
        assert!(channel.add_future_job(job).is_err());
        channel.take_future_job().unwrap();
        assert!(channel.take_future_job().is_err());
    }

    #[test]
    fn registry_assigns_sequential_ids() {
        let reg = ChannelRegistry::new();
        let id0 = reg.next_channel_id();
        reg.push(Arc::new(MiningChannel::new(
            id0,
            0,
            ChannelType::Standard,
            session(),
        )));
        let id1 = reg.next_channel_id();
        assert_eq!((id0, id1), (0, 1));
    }
}
