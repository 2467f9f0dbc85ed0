use thiserror::Error;

/// Errors raised by the shared simulation primitives.
///
/// Protocol-level state violations are represented as protocol reply
/// messages (see the `stratum-sim-v1`/`stratum-sim-v2` crates), not as
/// `CoreError` — this enum only covers failures in the primitives
/// themselves (scheduler, link, registry, meter).
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("connection {0} already disconnected")]
    AlreadyDisconnected(u64),

    #[error("connection {0} has no peer endpoint")]
    NotConnected(u64),

    #[error("transport closed on connection {0}")]
    TransportClosed(u64),

    #[error("channel {0} mismatch: not registered on this connection")]
    ChannelMismatch(u32),

    #[error("future job slot already occupied on channel {0}")]
    FutureJobOccupied(u32),

    #[error("future job slot empty on channel {0}")]
    FutureJobEmpty(u32),

    #[error("no handler registered for message tag {0}")]
    NoHandler(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
