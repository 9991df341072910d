//! Global video existence filter
//!
//! Rejects lookups for video ids that were never published before they reach
//! the cache or database. Elements are bare video ids, unrelated to the
//! per-viewer `videoId:viewerId` filters.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::bloom::{self, VideoFilter};
use crate::config::ExistenceConfig;
use crate::db::FeedRepository;
use crate::error::Result;
use crate::jobs::PeriodicJob;

pub struct GlobalExistenceFilter {
    repo: Arc<dyn FeedRepository>,
    config: ExistenceConfig,
    filter: RwLock<VideoFilter>,
}

impl GlobalExistenceFilter {
    /// Empty filter; call [`GlobalExistenceFilter::init`] before serving.
    pub fn new(repo: Arc<dyn FeedRepository>, config: ExistenceConfig) -> Self {
        let filter = bloom::sized_filter(config.expected_items, config.false_positive_rate);
        Self {
            repo,
            config,
            filter: RwLock::new(filter),
        }
    }

    pub async fn init(&self) -> Result<usize> {
        self.rebuild().await
    }

    /// Page through the whole catalog into a new filter, then swap it in.
    pub async fn rebuild(&self) -> Result<usize> {
        let page_size = self.config.page_size.max(1);
        let mut next =
            bloom::sized_filter(self.config.expected_items, self.config.false_positive_rate);
        let mut offset = 0i64;
        let mut total = 0usize;

        loop {
            let ids = self.repo.list_video_ids(offset, page_size).await?;
            let fetched = ids.len();
            for id in ids {
                next.set(&id.to_string());
            }
            total += fetched;
            offset += fetched as i64;

            debug!(offset, fetched, "Existence filter page loaded");
            if (fetched as i64) < page_size {
                break;
            }
        }

        *self.filter.write().await = next;
        info!(videos = total, "Existence filter rebuilt");
        Ok(total)
    }

    /// `false` means the video certainly does not exist.
    pub async fn exists(&self, video_id: i64) -> bool {
        self.filter.read().await.check(&video_id.to_string())
    }

    /// Record a video published between rebuilds.
    pub async fn add(&self, video_id: i64) {
        self.filter.write().await.set(&video_id.to_string());
    }
}

/// Scheduled wholesale rebuild
#[async_trait]
impl PeriodicJob for GlobalExistenceFilter {
    fn name(&self) -> &'static str {
        "existence_rebuild"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(self.config.rebuild_interval_secs)
    }

    async fn run_once(&self) -> Result<usize> {
        self.rebuild().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MemoryRepository, MockFeedRepository};
    use crate::error::AppError;
    use crate::models::VideoStats;

    fn video(video_id: i64) -> VideoStats {
        VideoStats {
            video_id,
            author_id: 1,
            like_count: 0,
            comment_count: 0,
            created_at: 1_000,
        }
    }

    fn config() -> ExistenceConfig {
        ExistenceConfig {
            expected_items: 10_000,
            false_positive_rate: 0.0001,
            page_size: 4,
            ..ExistenceConfig::default()
        }
    }

    #[tokio::test]
    async fn test_rebuild_pages_whole_catalog() {
        let repo = Arc::new(MemoryRepository::new());
        for id in 1..=10 {
            repo.add_video(video(id));
        }
        let filter = GlobalExistenceFilter::new(repo, config());

        assert_eq!(filter.init().await.unwrap(), 10);
        for id in 1..=10 {
            assert!(filter.exists(id).await);
        }
        assert!(!filter.exists(999_999).await);
    }

    #[tokio::test]
    async fn test_add_between_rebuilds() {
        let repo = Arc::new(MemoryRepository::new());
        let filter = GlobalExistenceFilter::new(repo.clone(), config());
        filter.init().await.unwrap();

        assert!(!filter.exists(77).await);
        filter.add(77).await;
        assert!(filter.exists(77).await);

        // A rebuild only reflects the catalog
        repo.add_video(video(78));
        filter.rebuild().await.unwrap();
        assert!(filter.exists(78).await);
    }

    #[tokio::test]
    async fn test_failed_rebuild_keeps_current_filter() {
        let mut repo = MockFeedRepository::new();
        repo.expect_list_video_ids()
            .returning(|_, _| Err(AppError::Internal("catalog down".to_string())));

        let filter = GlobalExistenceFilter::new(Arc::new(repo), config());
        filter.add(5).await;
        tokio_test::assert_err!(filter.rebuild().await);
        assert!(filter.exists(5).await);
    }
}
