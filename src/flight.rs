//! Keyed single-flight guard.
//!
//! Serializes work per key (question id, document id) without a global lock:
//! acquiring a key that is already held fails immediately, and the permit
//! releases the key on drop — including when the holding task panics or is
//! aborted. Different keys never contend.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

#[derive(Clone, Default)]
pub struct FlightGuard {
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl FlightGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `key`. Returns `None` when another holder has it.
    pub fn try_acquire(&self, key: &str) -> Option<FlightPermit> {
        let mut set = self.in_flight.lock().unwrap();
        if set.insert(key.to_string()) {
            Some(FlightPermit {
                key: key.to_string(),
                in_flight: Arc::clone(&self.in_flight),
            })
        } else {
            None
        }
    }

    /// Whether `key` is currently held.
    pub fn is_held(&self, key: &str) -> bool {
        self.in_flight.lock().unwrap().contains(key)
    }
}

pub struct FlightPermit {
    key: String,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl Drop for FlightPermit {
    fn drop(&mut self) {
        self.in_flight.lock().unwrap().remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_until_release() {
        let guard = FlightGuard::new();
        let permit = guard.try_acquire("q1").unwrap();
        assert!(guard.try_acquire("q1").is_none());
        drop(permit);
        assert!(guard.try_acquire("q1").is_some());
    }

    #[test]
    fn distinct_keys_do_not_contend() {
        let guard = FlightGuard::new();
        let _a = guard.try_acquire("q1").unwrap();
        let _b = guard.try_acquire("q2").unwrap();
        assert!(guard.is_held("q1"));
        assert!(guard.is_held("q2"));
    }
}
