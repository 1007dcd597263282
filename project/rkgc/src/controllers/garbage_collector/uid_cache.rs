use std::num::NonZeroUsize;

use lru::LruCache;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Bounded record of owner UIDs confirmed absent from the store. Losing an
/// entry only costs an extra lookup.
pub struct UidCache {
    cache: Mutex<LruCache<Uuid, ()>>,
}

impl UidCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub async fn add(&self, uid: Uuid) {
        self.cache.lock().await.put(uid, ());
    }

    /// Checks membership and refreshes the entry's recency.
    pub async fn has(&self, uid: &Uuid) -> bool {
        self.cache.lock().await.get(uid).is_some()
    }

    pub async fn len(&self) -> usize {
        self.cache.lock().await.len()
    }
}
