//! Request/response correlation registry.
//!
//! Grounded on `examples/original_source/.../sim_primitives/protocol.py`'s
//! `RequestRegistry`, generalized from "registry of `Message`" to any `T`
//! so both `stratum-sim-v1` and `stratum-sim-v2` (whose request types
//! differ) can share one implementation instead of each rolling its own.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

/// Monotonically-increasing 32-bit request id → outstanding request.
/// `push` assigns the id and stores the request; `pop` returns and removes
/// it. An unpaired response (no outstanding request with that id) should
/// be logged and ignored by the caller, per spec §7.
pub struct RequestRegistry<T> {
    next_id: AtomicU32,
    requests: Mutex<HashMap<u32, T>>,
}

impl<T> Default for RequestRegistry<T> {
    fn default() -> Self {
        Self {
            next_id: AtomicU32::new(0),
            requests: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> RequestRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns the next request id, stores `req` under it, and returns the
    /// assigned id so the caller can stamp it onto the outgoing message.
    pub fn push(&self, req: T) -> u32 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut requests = self.requests.lock().unwrap();
        debug_assert!(
            !requests.contains_key(&id),
            "BUG: request id already present {id}"
        );
        requests.insert(id, req);
        id
    }

    /// Returns and forgets the request registered under `req_id`, or
    /// `None` if no such request is outstanding (an unpaired response).
    pub fn pop(&self, req_id: u32) -> Option<T> {
        self.requests.lock().unwrap().remove(&req_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_assigns_monotonic_ids() {
        let reg: RequestRegistry<&str> = RequestRegistry::new();
        let a = reg.push("first");
        let b = reg.push("second");
        assert!(b > a);
    }

    #[test]
    fn pop_removes_and_returns_once() {
        let reg: RequestRegistry<&str> = RequestRegistry::new();
        let id = reg.push("only");
        assert_eq!(reg.pop(id), Some("only"));
        assert_eq!(reg.pop(id), None);
    }

    #[test]
    fn unpaired_pop_is_none() {
        let reg: RequestRegistry<&str> = RequestRegistry::new();
        assert_eq!(reg.pop(999), None);
    }
}
