//! Per-viewer "already seen" filters
//!
//! One bloom filter per viewer over `videoId:viewerId` elements. Filters live
//! in a bounded LRU cache; a miss reloads the persisted copy or starts empty.
//! Eviction does not persist, feed reads trigger `save_async` after mutating.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::bloom::{self, VideoFilter};
use crate::config::BloomConfig;
use crate::error::{AppError, Result};
use crate::metrics;
use crate::models::FeedItem;
use crate::store::{keys, CacheStore, StoreCommand};

pub type SharedFilter = Arc<RwLock<VideoFilter>>;

pub struct BloomFilterManager {
    store: Arc<dyn CacheStore>,
    config: BloomConfig,
    cache: Mutex<LruCache<i64, SharedFilter>>,
    /// Guards construction on a cache miss only
    init_lock: tokio::sync::Mutex<()>,
}

/// Element recorded for one viewer having been shown one video.
pub fn seen_element(video_id: i64, viewer_id: i64) -> String {
    format!("{}:{}", video_id, viewer_id)
}

impl BloomFilterManager {
    pub fn new(store: Arc<dyn CacheStore>, config: BloomConfig) -> Self {
        let capacity = NonZeroUsize::new(config.cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            store,
            config,
            cache: Mutex::new(LruCache::new(capacity)),
            init_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn cached(&self, viewer_id: i64) -> Result<Option<SharedFilter>> {
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| AppError::Internal("bloom cache lock poisoned".to_string()))?;
        Ok(cache.get(&viewer_id).cloned())
    }

    pub async fn get_or_create(&self, viewer_id: i64) -> Result<SharedFilter> {
        if let Some(filter) = self.cached(viewer_id)? {
            return Ok(filter);
        }

        let _init = self.init_lock.lock().await;
        if let Some(filter) = self.cached(viewer_id)? {
            return Ok(filter);
        }

        let filter = match self.store.get(&keys::user_bloom(viewer_id)).await? {
            Some(bytes) => match bloom::decode(&bytes) {
                Ok(filter) => {
                    debug!(viewer_id, "Loaded persisted bloom filter");
                    filter
                }
                Err(e) => {
                    warn!(viewer_id, error = %e, "Discarding unreadable bloom filter");
                    self.fresh_filter()
                }
            },
            None => self.fresh_filter(),
        };

        let filter = Arc::new(RwLock::new(filter));
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| AppError::Internal("bloom cache lock poisoned".to_string()))?;
        cache.put(viewer_id, Arc::clone(&filter));
        Ok(filter)
    }

    fn fresh_filter(&self) -> VideoFilter {
        bloom::sized_filter(self.config.expected_items, self.config.false_positive_rate)
    }

    pub async fn test(&self, viewer_id: i64, video_id: i64) -> Result<bool> {
        let filter = self.get_or_create(viewer_id).await?;
        let guard = filter.read().await;
        Ok(guard.check(&seen_element(video_id, viewer_id)))
    }

    pub async fn add(&self, viewer_id: i64, video_id: i64) -> Result<()> {
        let filter = self.get_or_create(viewer_id).await?;
        filter
            .write()
            .await
            .set(&seen_element(video_id, viewer_id));
        Ok(())
    }

    /// Mark the video as seen, returning whether it had been seen before.
    pub async fn test_and_add(&self, viewer_id: i64, video_id: i64) -> Result<bool> {
        let filter = self.get_or_create(viewer_id).await?;
        let mut guard = filter.write().await;
        Ok(guard.check_and_set(&seen_element(video_id, viewer_id)))
    }

    /// Persist the cached filter for `viewer_id`; a viewer with no cached
    /// filter has nothing to save.
    pub async fn save(&self, viewer_id: i64) -> Result<()> {
        let Some(filter) = self.cached(viewer_id)? else {
            return Ok(());
        };

        let bytes = bloom::encode(&*filter.read().await)?;
        self.store
            .exec_atomic(vec![StoreCommand::Set {
                key: keys::user_bloom(viewer_id),
                value: bytes,
                ttl_secs: Some(self.config.persist_ttl_secs),
            }])
            .await
    }

    /// Persist on a detached task with its own time budget, so a cancelled
    /// caller does not abort the write.
    pub fn save_async(self: &Arc<Self>, viewer_id: i64) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let budget = Duration::from_secs(self.config.save_timeout_secs);
        tokio::spawn(async move {
            match tokio::time::timeout(budget, manager.save(viewer_id)).await {
                Ok(Ok(())) => debug!(viewer_id, "Bloom filter saved"),
                Ok(Err(e)) => warn!(viewer_id, error = %e, "Bloom filter save failed"),
                Err(_) => warn!(viewer_id, "Bloom filter save timed out"),
            }
        })
    }

    /// Keep at most `limit` items the viewer has not seen yet and mark those
    /// as seen. Anonymous viewers and filter failures pass items through.
    pub async fn filter_items(
        self: &Arc<Self>,
        viewer_id: i64,
        items: Vec<FeedItem>,
        limit: usize,
    ) -> Vec<FeedItem> {
        if viewer_id == 0 {
            let mut items = items;
            items.truncate(limit);
            return items;
        }

        let filter = match self.get_or_create(viewer_id).await {
            Ok(filter) => filter,
            Err(e) => {
                warn!(viewer_id, error = %e, "Dedup unavailable, returning unfiltered items");
                let mut items = items;
                items.truncate(limit);
                return items;
            }
        };

        let total = items.len();
        let mut kept = Vec::with_capacity(limit.min(total));
        let mut dropped = 0usize;
        {
            let mut guard = filter.write().await;
            for item in items {
                if kept.len() >= limit {
                    break;
                }
                if guard.check_and_set(&seen_element(item.video_id, viewer_id)) {
                    dropped += 1;
                } else {
                    kept.push(item);
                }
            }
        }

        if dropped > 0 {
            metrics::record_deduped_items(dropped);
            debug!(viewer_id, dropped, total, "Filtered seen feed items");
        }
        self.save_async(viewer_id);
        kept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn small_config() -> BloomConfig {
        BloomConfig {
            expected_items: 1_000,
            false_positive_rate: 0.0001,
            cache_capacity: 2,
            ..BloomConfig::default()
        }
    }

    fn item(video_id: i64, timestamp: i64) -> FeedItem {
        FeedItem {
            video_id,
            author_id: 1,
            timestamp,
            score: timestamp as f64,
        }
    }

    #[tokio::test]
    async fn test_added_elements_always_test_true() {
        let manager = BloomFilterManager::new(Arc::new(MemoryStore::new()), small_config());
        for video in 0..50 {
            manager.add(7, video).await.unwrap();
        }
        for video in 0..50 {
            assert!(manager.test(7, video).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_filters_are_per_viewer() {
        let manager = BloomFilterManager::new(Arc::new(MemoryStore::new()), small_config());
        assert!(!manager.test_and_add(7, 42).await.unwrap());
        assert!(manager.test_and_add(7, 42).await.unwrap());
        assert!(!manager.test(8, 42).await.unwrap());
    }

    #[tokio::test]
    async fn test_saved_filter_reloads_after_eviction() {
        let store = Arc::new(MemoryStore::new());
        let manager = BloomFilterManager::new(store.clone(), small_config());

        manager.add(1, 100).await.unwrap();
        manager.save(1).await.unwrap();
        assert!(store.ttl(&keys::user_bloom(1)).is_some());

        // Capacity 2: touching two other viewers evicts viewer 1
        manager.get_or_create(2).await.unwrap();
        manager.get_or_create(3).await.unwrap();

        assert!(manager.test(1, 100).await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_first_access_shares_one_filter() {
        let manager = Arc::new(BloomFilterManager::new(
            Arc::new(MemoryStore::new()),
            small_config(),
        ));
        let (a, b) = tokio::join!(manager.get_or_create(5), manager.get_or_create(5));
        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
    }

    #[tokio::test]
    async fn test_filter_items_marks_only_returned_items() {
        let store = Arc::new(MemoryStore::new());
        let manager = Arc::new(BloomFilterManager::new(store.clone(), small_config()));
        let candidates: Vec<FeedItem> = (1..=6).map(|v| item(v, 100 + v)).collect();

        let first = manager.filter_items(7, candidates.clone(), 3).await;
        assert_eq!(
            first.iter().map(|i| i.video_id).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );

        let second = manager.filter_items(7, candidates, 3).await;
        assert_eq!(
            second.iter().map(|i| i.video_id).collect::<Vec<_>>(),
            vec![4, 5, 6]
        );

        manager.save_async(7).await.unwrap();
        assert!(store.exists(&keys::user_bloom(7)));
    }

    #[tokio::test]
    async fn test_anonymous_viewer_skips_dedup() {
        let store = Arc::new(MemoryStore::new());
        let manager = Arc::new(BloomFilterManager::new(store.clone(), small_config()));
        let items = vec![item(1, 10), item(1, 10)];

        let kept = manager.filter_items(0, items, 10).await;
        assert_eq!(kept.len(), 2);
        assert!(!store.exists(&keys::user_bloom(0)));
    }
}
