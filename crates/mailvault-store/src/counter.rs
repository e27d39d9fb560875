//! Monotonic per-key counters with TTL.
//!
//! An in-memory counter store for short-lived tallies such as
//! authentication-failure windows. Counters expire as a whole: the TTL is
//! fixed when a key first appears and later bumps do not extend it.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Slot {
    value: u64,
    expires_at: Instant,
}

/// In-memory TTL counter store.
#[derive(Debug, Default)]
pub struct CounterService {
    slots: Mutex<HashMap<String, Slot>>,
}

impl CounterService {
    /// Creates an empty counter store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Increments the counter under `key` and returns the new value.
    ///
    /// A missing or expired counter restarts at 1 with a fresh TTL.
    pub fn bump(&self, key: &str, ttl: Duration) -> u64 {
        let now = Instant::now();
        let mut slots = self.slots.lock().expect("counter lock");
        match slots.get_mut(key) {
            Some(slot) if slot.expires_at > now => {
                slot.value += 1;
                slot.value
            }
            _ => {
                slots.insert(
                    key.to_string(),
                    Slot {
                        value: 1,
                        expires_at: now + ttl,
                    },
                );
                1
            }
        }
    }

    /// Returns the current value under `key`, or 0 if absent or expired.
    #[must_use]
    pub fn get(&self, key: &str) -> u64 {
        let now = Instant::now();
        let slots = self.slots.lock().expect("counter lock");
        slots
            .get(key)
            .filter(|slot| slot.expires_at > now)
            .map_or(0, |slot| slot.value)
    }

    /// Removes the counter under `key`.
    pub fn clear(&self, key: &str) {
        self.slots.lock().expect("counter lock").remove(key);
    }

    /// Drops all expired counters.
    pub fn purge(&self) {
        let now = Instant::now();
        self.slots
            .lock()
            .expect("counter lock")
            .retain(|_, slot| slot.expires_at > now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[test]
    fn bump_is_monotonic_per_key() {
        let counters = CounterService::new();
        assert_eq!(counters.bump("a", TTL), 1);
        assert_eq!(counters.bump("a", TTL), 2);
        assert_eq!(counters.bump("b", TTL), 1);
        assert_eq!(counters.get("a"), 2);
    }

    #[test]
    fn expired_counter_restarts() {
        let counters = CounterService::new();
        counters.bump("a", Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(counters.get("a"), 0);
        assert_eq!(counters.bump("a", TTL), 1);
    }

    #[test]
    fn clear_and_purge() {
        let counters = CounterService::new();
        counters.bump("keep", TTL);
        counters.bump("gone", Duration::from_millis(1));
        counters.clear("keep");
        assert_eq!(counters.get("keep"), 0);
        std::thread::sleep(Duration::from_millis(5));
        counters.purge();
        assert_eq!(counters.get("gone"), 0);
    }
}
