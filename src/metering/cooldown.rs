//! Capacity-bounded per-key TTL cache for call-initiation cooldowns.
//!
//! Keys are (caller, callee) pairs. Entries expire after the configured TTL;
//! when the cache is full, expired entries are evicted first and then the
//! oldest live entry, so memory stays bounded no matter how many pairs dial
//! each other.

use crate::domain::TimeMs;
use std::collections::HashMap;
use std::sync::Mutex;

pub struct CooldownCache {
    capacity: usize,
    ttl_ms: i64,
    entries: Mutex<HashMap<(String, String), TimeMs>>,
}

impl CooldownCache {
    pub fn new(capacity: usize, ttl_ms: i64) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl_ms,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns true and records the attempt if the pair is off cooldown;
    /// returns false if a prior attempt is still within the TTL.
    pub fn check_and_touch(&self, caller: &str, callee: &str, now: TimeMs) -> bool {
        let mut entries = self.entries.lock().unwrap();
        let key = (caller.to_string(), callee.to_string());

        if let Some(&last) = entries.get(&key) {
            if now.since(last) < self.ttl_ms {
                return false;
            }
        }

        if entries.len() >= self.capacity && !entries.contains_key(&key) {
            let ttl = self.ttl_ms;
            entries.retain(|_, &mut last| now.since(last) < ttl);
            if entries.len() >= self.capacity {
                if let Some(oldest) = entries
                    .iter()
                    .min_by_key(|(_, &last)| last)
                    .map(|(k, _)| k.clone())
                {
                    entries.remove(&oldest);
                }
            }
        }

        entries.insert(key, now);
        true
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}
