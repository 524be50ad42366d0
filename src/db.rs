use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;

/// Shared keyspace handle. Cloning is shallow: all clones point at the
/// same map, and the map takes care of its own synchronization so
/// readers and writers on different connections never contend on an
/// outer lock.
#[derive(Debug, Clone)]
pub struct Db {
    entries: Arc<DashMap<String, Entry>>,
}

/// A stored value, either plain or with an absolute expiration deadline.
/// Entries are only ever replaced wholesale, never mutated in place,
/// which is what makes the compare-and-delete in `get` sound.
#[derive(Debug, Clone, PartialEq)]
struct Entry {
    data: Bytes,
    expires_at: Option<Instant>,
}

impl Db {
    pub fn new() -> Db {
        Db {
            entries: Arc::new(DashMap::new()),
        }
    }

    /// Looks up `key`. A value whose deadline has passed is treated as
    /// absent and removed lazily, but only if it is still the exact value
    /// this lookup observed: a concurrent SET that replaced it in the
    /// meantime must survive.
    pub fn get(&self, key: &str) -> Option<Bytes> {
        let seen = self.entries.get(key)?.value().clone();

        match seen.expires_at {
            Some(deadline) if deadline <= Instant::now() => {
                self.entries.remove_if(key, |_, current| *current == seen);
                None
            }
            _ => Some(seen.data),
        }
    }

    /// Stores `value` under `key`, replacing any previous entry. With
    /// `expire` set the entry is readable for that duration and treated
    /// as absent afterwards.
    pub fn set(&self, key: String, value: Bytes, expire: Option<Duration>) {
        let expires_at = expire.map(|duration| Instant::now() + duration);

        self.entries.insert(
            key,
            Entry {
                data: value,
                expires_at,
            },
        );
    }
}

impl Default for Db {
    fn default() -> Self {
        Self::new()
    }
}
