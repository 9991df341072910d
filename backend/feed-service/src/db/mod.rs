//! Durable store capability
//!
//! The relational catalog (videos, follows, counters, favorites) is owned by
//! other services; the feed core only needs the paged reads and transactional
//! writes below.

mod memory;
mod postgres;

pub use memory::MemoryRepository;
pub use postgres::PgFeedRepository;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{LikeEvent, Page, UserCounters, VideoRecord, VideoStats};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FeedRepository: Send + Sync {
    /// Published video ids ordered by id.
    async fn list_video_ids(&self, offset: i64, limit: i64) -> Result<Vec<i64>>;

    /// Engagement-ranked candidates for the hot pool.
    async fn list_hot_candidates(&self, limit: i64) -> Result<Vec<VideoStats>>;

    async fn count_followers(&self, author_id: i64) -> Result<i64>;

    async fn list_followers(&self, author_id: i64, offset: i64, limit: i64) -> Result<Page<i64>>;

    async fn list_followings(&self, viewer_id: i64, limit: i64) -> Result<Vec<i64>>;

    /// Latest uploads of `author_ids` strictly before `before`, newest first.
    async fn list_videos_before(
        &self,
        author_ids: &[i64],
        before: i64,
        limit: i64,
    ) -> Result<Vec<VideoRecord>>;

    /// Write absolute counter values for every user inside one transaction.
    async fn update_user_counters(&self, counters: &[UserCounters]) -> Result<()>;

    /// Apply favorite/unfavorite events inside one transaction.
    async fn apply_favorites(&self, events: &[LikeEvent]) -> Result<()>;
}
