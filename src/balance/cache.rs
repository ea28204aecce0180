//! The task selection cache.
//!
//! Maps a task name to the node that last served it, with a TTL. Entries
//! are advice, not authority: a fresh entry may name a node whose health
//! has since degraded, and the sweep evicts the whole map at once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

struct CacheEntry {
    node_id: String,
    stored_at: Instant,
}

#[derive(Clone)]
pub struct SelectionCache {
    entries: Arc<Mutex<HashMap<String, CacheEntry>>>,
    ttl: Duration,
}

impl SelectionCache {
    pub fn new(ttl: Duration) -> SelectionCache {
        SelectionCache {
            entries: Arc::new(Mutex::new(HashMap::new())),
            ttl: ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// The cached node for a task, if the entry is still fresh.
    pub fn get(&self, task: &str) -> Option<String> {
        let entries = self.entries.lock().expect("selection cache lock poisoned");
        entries.get(task).and_then(|entry| {
            if entry.stored_at.elapsed() <= self.ttl {
                Some(entry.node_id.clone())
            } else {
                None
            }
        })
    }

    pub fn put(&self, task: &str, node_id: &str) {
        let mut entries = self.entries.lock().expect("selection cache lock poisoned");
        entries.insert(task.to_owned(),
                       CacheEntry {
                           node_id: node_id.to_owned(),
                           stored_at: Instant::now(),
                       });
    }

    /// Wholesale eviction, called by the sweep loop.
    pub fn clear(&self) {
        let mut entries = self.entries.lock().expect("selection cache lock poisoned");
        if !entries.is_empty() {
            trace!("evicting {} selection cache entries", entries.len());
            entries.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("selection cache lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use super::SelectionCache;

    #[test]
    fn fresh_entries_hit_and_stale_entries_miss() {
        let cache = SelectionCache::new(Duration::from_secs(60));
        assert_eq!(cache.get("ocr"), None);
        cache.put("ocr", "worker-1@10.0.0.2:4004");
        assert_eq!(cache.get("ocr"), Some("worker-1@10.0.0.2:4004".into()));

        let expired = SelectionCache::new(Duration::from_millis(0));
        expired.put("ocr", "worker-1@10.0.0.2:4004");
        ::std::thread::sleep(Duration::from_millis(5));
        assert_eq!(expired.get("ocr"), None);
    }

    #[test]
    fn clear_evicts_everything() {
        let cache = SelectionCache::new(Duration::from_secs(60));
        cache.put("ocr", "a@10.0.0.2:1");
        cache.put("embed", "b@10.0.0.3:1");
        assert_eq!(cache.len(), 2);
        cache.clear();
        assert_eq!(cache.len(), 0);
    }
}
