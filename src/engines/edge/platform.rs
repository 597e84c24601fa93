use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

// Key-value storage provided by the hosting platform. Reads may be stale; writes
// from concurrent invocations race and the last one wins.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    async fn put(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<bool>;
}

// In-process substitute used when the platform provides no store.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, (Bytes, Option<Instant>)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .values()
            .filter(|(_, expires)| expires.map_or(true, |at| at > now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let expired = match self.entries.read().get(key) {
            None => return Ok(None),
            Some((value, expires)) => match expires {
                Some(at) if *at <= Instant::now() => true,
                _ => return Ok(Some(value.clone())),
            },
        };
        if expired {
            self.entries.write().remove(key);
        }
        Ok(None)
    }

    async fn put(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()> {
        let expires = ttl.map(|ttl| Instant::now() + ttl);
        self.entries.write().insert(key.to_string(), (value, expires));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.write().remove(key).is_some())
    }
}

#[derive(Clone, Default)]
pub struct PlatformBindings {
    pub kv: Option<Arc<dyn KeyValueStore>>,
    pub durable: Option<Arc<dyn KeyValueStore>>,
    pub cache: Option<Arc<dyn KeyValueStore>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlatformCapabilities {
    pub kv: bool,
    pub durable: bool,
    pub cache: bool,
}

impl PlatformBindings {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_kv(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.kv = Some(store);
        self
    }

    pub fn with_durable(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.durable = Some(store);
        self
    }

    pub fn with_cache(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.cache = Some(store);
        self
    }

    pub fn capabilities(&self) -> PlatformCapabilities {
        PlatformCapabilities {
            kv: self.kv.is_some(),
            durable: self.durable.is_some(),
            cache: self.cache.is_some(),
        }
    }

    // Where response entries go: native cache, then kv.
    pub fn response_store(&self) -> Option<Arc<dyn KeyValueStore>> {
        self.cache.clone().or_else(|| self.kv.clone())
    }

    // Where materialized models are persisted across cold starts: kv, then durable state.
    pub fn model_store(&self) -> Option<Arc<dyn KeyValueStore>> {
        self.kv.clone().or_else(|| self.durable.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_ttl() {
        let store = MemoryStore::new();
        store.put("a", Bytes::from_static(b"1"), None).await.unwrap();
        store.put("b", Bytes::from_static(b"2"), Some(Duration::from_millis(10))).await.unwrap();
        assert_eq!(store.len(), 2);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.get("a").await.unwrap(), Some(Bytes::from_static(b"1")));
        assert_eq!(store.get("b").await.unwrap(), None);
        assert_eq!(store.len(), 1);

        assert!(store.delete("a").await.unwrap());
        assert!(!store.delete("a").await.unwrap());
        assert!(store.is_empty());
    }

    #[test]
    fn test_bindings_precedence() {
        let kv: Arc<dyn KeyValueStore> = MemoryStore::shared();
        let cache: Arc<dyn KeyValueStore> = MemoryStore::shared();
        let bindings = PlatformBindings::none().with_kv(kv.clone());
        assert_eq!(bindings.capabilities(), PlatformCapabilities { kv: true, durable: false, cache: false });
        assert!(Arc::ptr_eq(&bindings.response_store().unwrap(), &kv));

        let bindings = bindings.with_cache(cache.clone());
        assert!(Arc::ptr_eq(&bindings.response_store().unwrap(), &cache));
        assert!(Arc::ptr_eq(&bindings.model_store().unwrap(), &kv));
        assert!(PlatformBindings::none().model_store().is_none());
    }
}
