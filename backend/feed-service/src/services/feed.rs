//! Feed assembly
//!
//! `get_feed` dispatches on the feed type:
//! - following: push-mode timeline below the cursor, topped up by pulling
//!   recent uploads of followed authors that are not big-V (big-V content
//!   reaches timelines through the broker instead)
//! - recommend / hot: the global hot pool by score
//! - mixed: following and recommend fetched concurrently, then shuffled
//!
//! Every path over-fetches, drops what the viewer has already seen, and cuts
//! the result to the page size. Dedup problems never fail a read.

use chrono::Utc;
use futures::future::try_join_all;
use rand::seq::SliceRandom;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

use super::dedup::BloomFilterManager;
use super::fanout::FanoutDispatcher;
use super::hot_pool::HotPoolService;
use crate::config::FeedConfig;
use crate::db::FeedRepository;
use crate::error::Result;
use crate::metrics;
use crate::models::{FeedItem, FeedPage, FeedRequest, FeedType, TimelineEntry};
use crate::store::{keys, CacheStore};

pub struct FeedOrchestrator {
    store: Arc<dyn CacheStore>,
    repo: Arc<dyn FeedRepository>,
    hot_pool: Arc<HotPoolService>,
    fanout: Arc<FanoutDispatcher>,
    dedup: Arc<BloomFilterManager>,
    config: FeedConfig,
}

impl FeedOrchestrator {
    pub fn new(
        store: Arc<dyn CacheStore>,
        repo: Arc<dyn FeedRepository>,
        hot_pool: Arc<HotPoolService>,
        fanout: Arc<FanoutDispatcher>,
        dedup: Arc<BloomFilterManager>,
        config: FeedConfig,
    ) -> Self {
        Self {
            store,
            repo,
            hot_pool,
            fanout,
            dedup,
            config,
        }
    }

    pub async fn get_feed(&self, request: FeedRequest) -> Result<FeedPage> {
        let feed_type = request.feed_type;
        let result = self.assemble(request).await;
        let outcome = if result.is_ok() { "ok" } else { "error" };
        metrics::record_feed_request(feed_type.as_str(), outcome);
        result
    }

    async fn assemble(&self, request: FeedRequest) -> Result<FeedPage> {
        let page_size = request.page_size.clamp(1, self.config.max_page_size.max(1));
        let fetch = page_size * self.config.candidate_overfetch.max(1);

        let candidates = match request.feed_type {
            FeedType::Following => {
                self.following(request.viewer_id, request.cursor, fetch)
                    .await?
            }
            FeedType::Recommend | FeedType::Hot => self.hot_pool.top(fetch).await?,
            FeedType::Mixed => self.mixed(request.viewer_id, request.cursor, fetch).await?,
        };

        let fetched = candidates.len();
        let items = self
            .dedup
            .filter_items(request.viewer_id, candidates, page_size)
            .await;

        let next_cursor = items
            .iter()
            .map(|item| item.timestamp)
            .min()
            .map(|oldest| oldest - 1)
            .unwrap_or_else(|| Utc::now().timestamp());

        debug!(
            viewer_id = request.viewer_id,
            feed_type = request.feed_type.as_str(),
            fetched,
            returned = items.len(),
            next_cursor,
            "Feed assembled"
        );
        Ok(FeedPage { items, next_cursor })
    }

    async fn mixed(&self, viewer_id: i64, cursor: i64, fetch: usize) -> Result<Vec<FeedItem>> {
        let ratio = self.config.mixed_following_ratio.clamp(0.0, 1.0);
        let following_share = ((fetch as f64) * ratio).ceil() as usize;
        let recommend_share = fetch.saturating_sub(following_share);

        let (mut items, recommended) = futures::try_join!(
            self.following(viewer_id, cursor, following_share),
            self.hot_pool.top(recommend_share),
        )?;
        items.extend(recommended);
        items.shuffle(&mut rand::thread_rng());
        Ok(items)
    }

    /// Timeline entries strictly older than `cursor`, newest first, topped up
    /// from followed authors when the timeline runs short.
    async fn following(&self, viewer_id: i64, cursor: i64, limit: usize) -> Result<Vec<FeedItem>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut items = self.timeline_before(viewer_id, cursor, limit).await?;
        if items.len() >= limit {
            return Ok(items);
        }

        let pulled = self.pull_from_followings(viewer_id, cursor, limit).await?;
        if pulled.is_empty() {
            return Ok(items);
        }

        let mut seen: HashSet<i64> = items.iter().map(|item| item.video_id).collect();
        items.extend(pulled.into_iter().filter(|item| seen.insert(item.video_id)));
        items.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| b.video_id.cmp(&a.video_id))
        });
        items.truncate(limit);
        Ok(items)
    }

    async fn timeline_before(&self, viewer_id: i64, cursor: i64, limit: usize) -> Result<Vec<FeedItem>> {
        let members = self
            .store
            .zrevrangebyscore_withscores(&keys::timeline(viewer_id), cursor as f64, limit)
            .await?;

        Ok(members
            .into_iter()
            .filter_map(|(member, score)| match TimelineEntry::decode(&member) {
                Ok(entry) if entry.timestamp < cursor => Some(entry.into_feed_item(score)),
                Ok(_) => None,
                Err(e) => {
                    warn!(viewer_id, error = %e, "Skipping malformed timeline member");
                    None
                }
            })
            .collect())
    }

    async fn pull_from_followings(
        &self,
        viewer_id: i64,
        cursor: i64,
        limit: usize,
    ) -> Result<Vec<FeedItem>> {
        let followings = self
            .repo
            .list_followings(viewer_id, self.config.follow_pull_limit as i64)
            .await?;
        if followings.is_empty() {
            return Ok(Vec::new());
        }

        let flags = try_join_all(followings.iter().map(|author| self.fanout.is_big_v(*author))).await?;
        let authors: Vec<i64> = followings
            .into_iter()
            .zip(flags)
            .filter_map(|(author, big_v)| (!big_v).then_some(author))
            .collect();
        if authors.is_empty() {
            return Ok(Vec::new());
        }

        let videos = self
            .repo
            .list_videos_before(&authors, cursor, limit as i64)
            .await?;

        debug!(
            viewer_id,
            authors = authors.len(),
            pulled = videos.len(),
            "Pulled from followed authors"
        );
        Ok(videos
            .into_iter()
            .map(|video| FeedItem {
                video_id: video.video_id,
                author_id: video.author_id,
                timestamp: video.created_at,
                score: video.created_at as f64,
            })
            .collect())
    }
}
