//! Byte-bounded completion cache attached to a running model.

use moka::sync::Cache;
use std::sync::Arc;

/// Cheap to clone; clones share the same storage.
#[derive(Clone)]
pub struct PromptCache {
    inner: Cache<String, Arc<str>>,
    capacity_bytes: u64,
}

impl PromptCache {
    pub fn new(capacity_bytes: u64) -> Self {
        let inner = Cache::builder()
            .max_capacity(capacity_bytes)
            .weigher(|key: &String, value: &Arc<str>| {
                (key.len() + value.len()).try_into().unwrap_or(u32::MAX)
            })
            .build();
        Self { inner, capacity_bytes }
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    pub fn get(&self, key: &str) -> Option<Arc<str>> {
        self.inner.get(key)
    }

    pub fn insert(&self, key: String, value: &str) {
        self.inner.insert(key, Arc::from(value));
    }

    pub fn clear(&self) {
        self.inner.invalidate_all();
    }

    pub fn weighted_size(&self) -> u64 {
        self.inner.run_pending_tasks();
        self.inner.weighted_size()
    }
}

impl std::fmt::Debug for PromptCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromptCache")
            .field("capacity_bytes", &self.capacity_bytes)
            .field("entries", &self.inner.entry_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_after_insert() {
        let cache = PromptCache::new(1024);
        cache.insert("prompt".to_string(), "answer");
        assert_eq!(cache.get("prompt").as_deref(), Some("answer"));
    }

    #[test]
    fn test_stays_within_byte_budget() {
        let cache = PromptCache::new(64);
        for i in 0..50 {
            cache.insert(format!("key-{i}"), "0123456789");
        }
        assert!(cache.weighted_size() <= 64);
    }

    #[test]
    fn test_clear_drops_entries() {
        let cache = PromptCache::new(1024);
        cache.insert("a".to_string(), "b");
        cache.clear();
        assert!(cache.get("a").is_none());
    }
}
