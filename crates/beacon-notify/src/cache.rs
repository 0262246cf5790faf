//! Process-local TTL cache for read-mostly records.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Entries expire `ttl` after insertion and can be evicted explicitly.
/// There is no coherency across processes.
pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: Mutex<HashMap<K, (Instant, Arc<V>)>>,
}

impl<K: Eq + Hash, V> TtlCache<K, V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, (Instant, Arc<V>)>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                // A stale entry is the worst outcome; keep serving.
                tracing::error!("cache lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Returns the cached value unless it has expired.
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        let mut entries = self.lock();
        match entries.get(key) {
            Some((inserted, value)) if inserted.elapsed() < self.ttl => Some(Arc::clone(value)),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: K, value: V) -> Arc<V> {
        let value = Arc::new(value);
        let mut entries = self.lock();
        // Drop expired entries so the map does not grow without bound.
        let ttl = self.ttl;
        entries.retain(|_, (inserted, _)| inserted.elapsed() < ttl);
        entries.insert(key, (Instant::now(), Arc::clone(&value)));
        value
    }

    /// Evicts one key. Returns whether it was cached.
    pub fn invalidate(&self, key: &K) -> bool {
        self.lock().remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_until_invalidated() {
        let cache = TtlCache::new(Duration::from_secs(60));
        cache.insert("a".to_string(), 1);
        assert_eq!(cache.get(&"a".to_string()).as_deref(), Some(&1));

        assert!(cache.invalidate(&"a".to_string()));
        assert!(cache.get(&"a".to_string()).is_none());
        assert!(!cache.invalidate(&"a".to_string()));
    }

    #[test]
    fn expired_entries_miss() {
        let cache = TtlCache::new(Duration::ZERO);
        cache.insert(1u32, "x");
        assert!(cache.get(&1).is_none());
        assert!(cache.is_empty());
    }
}
