use bytes::Bytes;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    #[default]
    Lru,
    Fifo,
}

/// Storage behind [`PictureCache`]. Implementations decide which entry goes
/// when the store is full.
pub trait EvictionStore: Send {
    fn get(&mut self, key: &str) -> Option<Bytes>;
    fn contains(&self, key: &str) -> bool;
    /// Returns the evicted key, if any. With `overwrite == false` an existing
    /// key is left untouched.
    fn insert(&mut self, key: String, payload: Bytes, overwrite: bool) -> Option<String>;
    fn len(&self) -> usize;
    fn capacity(&self) -> usize;
    fn clear(&mut self);
}

pub struct LruStore {
    entries: LruCache<String, Bytes>,
}

impl LruStore {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
        }
    }
}

impl EvictionStore for LruStore {
    fn get(&mut self, key: &str) -> Option<Bytes> {
        self.entries.get(key).cloned()
    }

    fn contains(&self, key: &str) -> bool {
        self.entries.contains(key)
    }

    fn insert(&mut self, key: String, payload: Bytes, overwrite: bool) -> Option<String> {
        if !overwrite && self.entries.contains(&key) {
            return None;
        }
        // push hands back either the replaced entry (same key) or the evicted one
        match self.entries.push(key.clone(), payload) {
            Some((old, _)) if old != key => Some(old),
            _ => None,
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn capacity(&self) -> usize {
        self.entries.cap().get()
    }

    fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Strict insertion order; reads never change what goes next.
pub struct FifoStore {
    entries: HashMap<String, Bytes>,
    order: VecDeque<String>,
    capacity: usize,
}

impl FifoStore {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }
}

impl EvictionStore for FifoStore {
    fn get(&mut self, key: &str) -> Option<Bytes> {
        self.entries.get(key).cloned()
    }

    fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    fn insert(&mut self, key: String, payload: Bytes, overwrite: bool) -> Option<String> {
        if let Some(existing) = self.entries.get_mut(&key) {
            // overwriting keeps the original queue position
            if overwrite {
                *existing = payload;
            }
            return None;
        }

        let mut evicted = None;
        if self.entries.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
                evicted = Some(oldest);
            }
        }
        self.order.push_back(key.clone());
        self.entries.insert(key, payload);
        evicted
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

/// Bounded picture-id → image-bytes cache shared by every fetch job.
///
/// Each call takes the lock once; nothing awaits network I/O while holding it.
/// Payloads are handed out as cheap `Bytes` clones, never as references into
/// the store.
#[derive(Clone)]
pub struct PictureCache {
    inner: Arc<Mutex<Box<dyn EvictionStore>>>,
    policy: EvictionPolicy,
}

impl PictureCache {
    pub fn new(capacity: usize, policy: EvictionPolicy) -> Self {
        let store: Box<dyn EvictionStore> = match policy {
            EvictionPolicy::Lru => Box::new(LruStore::new(capacity)),
            EvictionPolicy::Fifo => Box::new(FifoStore::new(capacity)),
        };
        Self {
            inner: Arc::new(Mutex::new(store)),
            policy,
        }
    }

    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    pub async fn get(&self, key: &str) -> Option<Bytes> {
        self.inner.lock().await.get(key)
    }

    pub async fn has(&self, key: &str) -> bool {
        self.inner.lock().await.contains(key)
    }

    /// Inserts or replaces `key`, evicting silently when full.
    pub async fn put(&self, key: impl Into<String>, payload: Bytes) {
        self.insert(key.into(), payload, true).await;
    }

    /// Inserts only when `key` is absent.
    pub async fn put_if_absent(&self, key: impl Into<String>, payload: Bytes) {
        self.insert(key.into(), payload, false).await;
    }

    async fn insert(&self, key: String, payload: Bytes, overwrite: bool) {
        let evicted = self.inner.lock().await.insert(key, payload, overwrite);
        if let Some(evicted) = evicted {
            log::debug!("cache evicted {}", evicted);
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn capacity(&self) -> usize {
        self.inner.lock().await.capacity()
    }

    pub async fn clear(&self) {
        self.inner.lock().await.clear();
    }
}

impl Default for PictureCache {
    fn default() -> Self {
        Self::new(48, EvictionPolicy::Lru)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(n: u8) -> Bytes {
        Bytes::from(vec![n; 4])
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        for policy in [EvictionPolicy::Lru, EvictionPolicy::Fifo] {
            let cache = PictureCache::new(2, policy);
            cache.put("a", payload(1)).await;
            assert_eq!(cache.get("a").await, Some(payload(1)));
            cache.put("a", payload(2)).await;
            assert_eq!(cache.get("a").await, Some(payload(2)));
            assert_eq!(cache.get("missing").await, None);
        }
    }

    #[tokio::test]
    async fn lru_evicts_least_recently_touched() {
        let cache = PictureCache::new(3, EvictionPolicy::Lru);
        for (i, key) in ["a", "b", "c"].into_iter().enumerate() {
            cache.put(key, payload(i as u8)).await;
        }
        cache.put("d", payload(9)).await;

        assert_eq!(cache.len().await, 3);
        assert!(!cache.has("a").await);
        assert!(cache.has("b").await && cache.has("c").await && cache.has("d").await);
    }

    #[tokio::test]
    async fn lru_access_protects_entry() {
        let cache = PictureCache::new(3, EvictionPolicy::Lru);
        for key in ["a", "b", "c"] {
            cache.put(key, payload(0)).await;
        }
        assert!(cache.get("a").await.is_some());
        cache.put("d", payload(0)).await;

        assert!(cache.has("a").await);
        assert!(!cache.has("b").await);
    }

    #[tokio::test]
    async fn has_does_not_promote() {
        let cache = PictureCache::new(2, EvictionPolicy::Lru);
        cache.put("a", payload(0)).await;
        cache.put("b", payload(0)).await;
        assert!(cache.has("a").await);
        cache.put("c", payload(0)).await;
        assert!(!cache.has("a").await);
    }

    #[tokio::test]
    async fn fifo_ignores_access_order() {
        let cache = PictureCache::new(3, EvictionPolicy::Fifo);
        for key in ["a", "b", "c"] {
            cache.put(key, payload(0)).await;
        }
        assert!(cache.get("a").await.is_some());
        cache.put("d", payload(0)).await;

        assert!(!cache.has("a").await);
        assert_eq!(cache.len().await, 3);
    }

    #[tokio::test]
    async fn fifo_overwrite_flag() {
        let cache = PictureCache::new(2, EvictionPolicy::Fifo);
        cache.put("a", payload(1)).await;
        cache.put_if_absent("a", payload(2)).await;
        assert_eq!(cache.get("a").await, Some(payload(1)));

        cache.put("a", payload(3)).await;
        assert_eq!(cache.get("a").await, Some(payload(3)));

        // overwrite keeps "a" at the front of the queue
        cache.put("b", payload(0)).await;
        cache.put("c", payload(0)).await;
        assert!(!cache.has("a").await);
        assert!(cache.has("b").await);
    }

    #[tokio::test]
    async fn zero_capacity_still_holds_one() {
        let cache = PictureCache::new(0, EvictionPolicy::Lru);
        assert_eq!(cache.capacity().await, 1);
        cache.put("a", payload(0)).await;
        cache.put("b", payload(0)).await;
        assert_eq!(cache.len().await, 1);
        cache.clear().await;
        assert!(cache.is_empty().await);
    }
}
