// ── Key/Value cache ────────────────────────────────────────────────────────
// Process-local KV store backing the engine's cache keys:
//   balance:<userId>             (TTL 10 s, evicted on ledger write)
//   tool.websearch:<query>       (TTL 1 h)
//   rate:<userId>:<action>       (token bucket state, no TTL)
// Replicas share no state; limits are per-user so this is correct, just not
// optimal for cache hit rate.

use crate::engine::clock::SharedClock;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    /// `ttl_secs = None` stores without expiry.
    fn set(&self, key: &str, value: &str, ttl_secs: Option<i64>);
    fn delete(&self, key: &str);
}

struct Entry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

pub struct MemoryKv {
    clock: SharedClock,
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryKv {
    pub fn new(clock: SharedClock) -> Self {
        MemoryKv {
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Drop expired entries. Called opportunistically from `set`.
    fn sweep(&self, entries: &mut HashMap<String, Entry>) {
        let now = self.clock.now();
        entries.retain(|_, e| e.expires_at.map(|at| at > now).unwrap_or(true));
    }
}

impl KeyValueStore for MemoryKv {
    fn get(&self, key: &str) -> Option<String> {
        let entries = self.entries.lock();
        let entry = entries.get(key)?;
        if let Some(at) = entry.expires_at {
            if at <= self.clock.now() {
                return None;
            }
        }
        Some(entry.value.clone())
    }

    fn set(&self, key: &str, value: &str, ttl_secs: Option<i64>) {
        let mut entries = self.entries.lock();
        if entries.len() > 4096 {
            self.sweep(&mut entries);
        }
        let expires_at = ttl_secs.map(|s| self.clock.now() + Duration::seconds(s));
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
    }

    fn delete(&self, key: &str) {
        self.entries.lock().remove(key);
    }
}
