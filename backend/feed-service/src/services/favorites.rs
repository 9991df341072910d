//! Like/unlike aggregation
//!
//! Like events are buffered in a [`BoundedBatcher`]. Each flush collapses the
//! batch to the latest event per favorite relation and writes the result in
//! one repository transaction.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::batcher::BoundedBatcher;
use crate::config::LikeBatchConfig;
use crate::db::FeedRepository;
use crate::error::Result;
use crate::models::LikeEvent;

pub struct FavoriteAggregator {
    batcher: BoundedBatcher<LikeEvent>,
}

/// Keep the newest event per (user, target, target type, favorite type).
/// Ties on timestamp go to the later arrival.
pub fn collapse_latest(events: Vec<LikeEvent>) -> Vec<LikeEvent> {
    let mut latest: HashMap<(i64, i64, i32, i32), LikeEvent> = HashMap::with_capacity(events.len());
    for event in events {
        match latest.get(&event.key()) {
            Some(current) if current.timestamp > event.timestamp => {}
            _ => {
                latest.insert(event.key(), event);
            }
        }
    }

    let mut collapsed: Vec<LikeEvent> = latest.into_values().collect();
    collapsed.sort_by_key(|e| (e.user_id, e.target_id, e.target_type, e.favorite_type));
    collapsed
}

async fn persist_batch(repo: Arc<dyn FeedRepository>, events: Vec<LikeEvent>) -> Result<()> {
    let received = events.len();
    let collapsed = collapse_latest(events);
    repo.apply_favorites(&collapsed).await?;
    debug!(received, applied = collapsed.len(), "Favorite batch applied");
    Ok(())
}

impl FavoriteAggregator {
    /// Must be called inside a tokio runtime.
    pub fn new(repo: Arc<dyn FeedRepository>, config: &LikeBatchConfig) -> Self {
        let batcher = BoundedBatcher::new(
            config.batch_size,
            config.flush_interval(),
            move |events: Vec<LikeEvent>| persist_batch(Arc::clone(&repo), events),
        );
        Self { batcher }
    }

    pub fn submit(&self, event: LikeEvent) {
        self.batcher.add(event);
    }

    pub async fn flush(&self) {
        self.batcher.flush().await;
    }

    /// Stop the flush timer and write out everything still buffered.
    pub async fn stop(&self) {
        self.batcher.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryRepository;
    use std::time::Duration;

    fn like(user_id: i64, target_id: i64, is_deleted: bool, timestamp: i64) -> LikeEvent {
        LikeEvent {
            user_id,
            target_id,
            target_type: 1,
            favorite_type: 1,
            is_deleted,
            timestamp,
        }
    }

    #[test]
    fn test_latest_timestamp_wins() {
        let collapsed = collapse_latest(vec![
            like(1, 10, false, 100),
            like(1, 10, true, 300),
            like(1, 10, false, 200),
            like(2, 10, false, 50),
        ]);

        assert_eq!(collapsed.len(), 2);
        assert_eq!(collapsed[0], like(1, 10, true, 300));
        assert_eq!(collapsed[1], like(2, 10, false, 50));
    }

    #[test]
    fn test_relation_includes_favorite_type() {
        let mut other = like(1, 10, false, 100);
        other.favorite_type = 2;
        let collapsed = collapse_latest(vec![like(1, 10, false, 100), other]);
        assert_eq!(collapsed.len(), 2);
    }

    #[tokio::test]
    async fn test_stop_persists_buffered_events() {
        let repo = Arc::new(MemoryRepository::new());
        let aggregator = FavoriteAggregator::new(
            repo.clone(),
            &LikeBatchConfig {
                batch_size: 100,
                flush_interval_ms: Duration::from_secs(3600).as_millis() as u64,
            },
        );

        aggregator.submit(like(1, 10, false, 100));
        aggregator.submit(like(1, 10, true, 200));
        aggregator.stop().await;

        let stored = repo.stored_favorite((1, 10, 1, 1)).unwrap();
        assert!(stored.is_deleted);
        assert_eq!(repo.favorite_transactions(), 1);
    }

    #[tokio::test]
    async fn test_older_batch_does_not_overwrite_newer_state() {
        let repo = Arc::new(MemoryRepository::new());
        let aggregator = FavoriteAggregator::new(
            repo.clone(),
            &LikeBatchConfig {
                batch_size: 1,
                flush_interval_ms: 3_600_000,
            },
        );

        aggregator.submit(like(1, 10, true, 500));
        aggregator.flush().await;
        aggregator.submit(like(1, 10, false, 100));
        aggregator.stop().await;

        assert!(repo.stored_favorite((1, 10, 1, 1)).unwrap().is_deleted);
    }
}
