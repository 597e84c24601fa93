use super::platform::KeyValueStore;
use bytes::Bytes;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

// Stable across processes: operation, temperature and payload bytes in little-endian order.
pub fn cache_key(model: &str, operation: &str, temperature: f32, payload: &[f32]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(operation.as_bytes());
    hasher.update([0u8]);
    hasher.update(temperature.to_le_bytes());
    for value in payload {
        hasher.update(value.to_le_bytes());
    }
    format!("response:{}:{:x}", model, hasher.finalize())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

pub struct ResponseCache {
    store: Option<Arc<dyn KeyValueStore>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResponseCache {
    pub fn new(store: Option<Arc<dyn KeyValueStore>>, ttl: Duration) -> Self {
        Self { store, ttl, hits: AtomicU64::new(0), misses: AtomicU64::new(0) }
    }

    pub fn disabled() -> Self {
        Self::new(None, Duration::ZERO)
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    // Store failures and undecodable entries count as misses.
    pub async fn get(&self, key: &str) -> Option<Vec<f32>> {
        let store = self.store.as_ref()?;
        let found = match store.get(key).await {
            Ok(Some(raw)) => match serde_json::from_slice::<Vec<f32>>(&raw) {
                Ok(data) => Some(data),
                Err(e) => {
                    tracing::warn!("discarding corrupt cache entry {}: {}", key, e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("cache read failed for {}: {:#}", key, e);
                None
            }
        };
        let counter = if found.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    pub async fn put(&self, key: &str, data: &[f32]) {
        let Some(store) = &self.store else {
            return;
        };
        let encoded = match serde_json::to_vec(data) {
            Ok(encoded) => Bytes::from(encoded),
            Err(e) => {
                tracing::warn!("could not encode cache entry {}: {}", key, e);
                return;
            }
        };
        if let Err(e) = store.put(key, encoded, Some(self.ttl)).await {
            tracing::warn!("cache write failed for {}: {:#}", key, e);
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::edge::platform::MemoryStore;

    #[test]
    fn test_key_is_stable_and_discriminating() {
        let a = cache_key("m", "inference", 1.0, &[1.0, 2.0]);
        assert_eq!(a, cache_key("m", "inference", 1.0, &[1.0, 2.0]));
        assert_ne!(a, cache_key("m", "embed", 1.0, &[1.0, 2.0]));
        assert_ne!(a, cache_key("m", "inference", 0.5, &[1.0, 2.0]));
        assert_ne!(a, cache_key("m", "inference", 1.0, &[2.0, 1.0]));
        assert_ne!(a, cache_key("other", "inference", 1.0, &[1.0, 2.0]));
        assert!(a.starts_with("response:m:"));
    }

    #[tokio::test]
    async fn test_hit_and_miss_counting() {
        let cache = ResponseCache::new(Some(MemoryStore::shared()), Duration::from_secs(60));
        assert_eq!(cache.get("k").await, None);
        cache.put("k", &[1.5, -2.0]).await;
        assert_eq!(cache.get("k").await, Some(vec![1.5, -2.0]));
        assert_eq!(cache.stats(), CacheStats { hits: 1, misses: 1 });
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_a_miss() {
        let store = MemoryStore::shared();
        store.put("k", Bytes::from_static(b"not json"), None).await.unwrap();
        let cache = ResponseCache::new(Some(store), Duration::from_secs(60));
        assert_eq!(cache.get("k").await, None);
        assert_eq!(cache.stats().misses, 1);
    }

    #[tokio::test]
    async fn test_disabled_cache() {
        let cache = ResponseCache::disabled();
        cache.put("k", &[1.0]).await;
        assert!(!cache.is_enabled());
        assert_eq!(cache.get("k").await, None);
        assert_eq!(cache.stats(), CacheStats::default());
    }
}
