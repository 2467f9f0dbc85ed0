//! Shared primitives for the Stratum pool/miner simulator: the scheduler
//! abstraction, 256-bit target arithmetic, the rolling hashrate meter, the
//! latency-carrying connection link, the event bus, and the mining job
//! registry + session that both the V1 and V2 protocol crates build on.

pub mod accounting;
pub mod broadcast;
pub mod bus;
pub mod device;
pub mod error;
pub mod hashrate;
pub mod job;
pub mod network;
pub mod request;
pub mod scheduler;
pub mod session;
pub mod target;

pub use accounting::{ShareAccounting, SubmitOutcome};
pub use broadcast::NewBlockListener;
pub use bus::{BusRecord, BusSink, EventBus, RecordingSink, TracingSink};
pub use device::{MinerDevice, ShareSubmitter};
pub use error::{CoreError, CoreResult};
pub use hashrate::HashrateMeter;
pub use job::{MiningJob, MiningJobRegistry};
pub use network::{Connection, ConnectionFactory, UidGenerator};
pub use request::RequestRegistry;
pub use scheduler::{RtFactor, Scheduler, TaskHandle};
pub use session::{MiningSession, MiningSessionBuilder, VardiffListener};
pub use target::{Target, U256};
