/// Hot Pool Service
///
/// Maintains the global `feed:hot_pool` sorted set:
/// - periodic refresh: score engagement-ranked candidates and replace the
///   whole pool in one atomic batch (the old pool stays readable until then)
/// - incremental insert of freshly published videos, scored by publish time
///   until the next refresh recomputes them
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::HotPoolConfig;
use crate::db::FeedRepository;
use crate::error::Result;
use crate::jobs::PeriodicJob;
use crate::metrics;
use crate::models::{FeedItem, TimelineEntry, VideoStats};
use crate::store::{keys, CacheStore, StoreCommand};

/// z for a 95% confidence interval
const WILSON_Z: f64 = 1.96;
const LIKE_WEIGHT: f64 = 1.5;
const COMMENT_WEIGHT: f64 = 1.0;
const HALF_LIFE_HOURS: f64 = 24.0;
const SCORE_SCALE: f64 = 1000.0;

/// Wilson lower bound over weighted engagement, halved every 24 hours.
pub fn calculate_hot_score(like_count: i64, comment_count: i64, age_hours: f64) -> f64 {
    let weighted_likes = LIKE_WEIGHT * like_count.max(0) as f64;
    let n = weighted_likes + COMMENT_WEIGHT * comment_count.max(0) as f64;
    if n <= 0.0 {
        return 0.0;
    }

    let p = weighted_likes / n;
    let z2 = WILSON_Z * WILSON_Z;
    let lower = (p + z2 / (2.0 * n) - WILSON_Z * ((p * (1.0 - p) + z2 / (4.0 * n)) / n).sqrt())
        / (1.0 + z2 / n);

    let decay = 0.5_f64.powf(age_hours.max(0.0) / HALF_LIFE_HOURS);
    (lower * decay * SCORE_SCALE).max(0.0)
}

pub struct HotPoolService {
    store: Arc<dyn CacheStore>,
    repo: Arc<dyn FeedRepository>,
    config: HotPoolConfig,
}

impl HotPoolService {
    pub fn new(
        store: Arc<dyn CacheStore>,
        repo: Arc<dyn FeedRepository>,
        config: HotPoolConfig,
    ) -> Self {
        Self {
            store,
            repo,
            config,
        }
    }

    pub async fn refresh(&self) -> Result<usize> {
        self.refresh_at(Utc::now().timestamp()).await
    }

    /// Rebuild the pool with ages measured from `now` (unix seconds).
    pub async fn refresh_at(&self, now: i64) -> Result<usize> {
        let candidates = self
            .repo
            .list_hot_candidates(self.config.candidate_limit)
            .await?;

        if candidates.is_empty() {
            info!("No hot pool candidates, keeping current pool");
            return Ok(0);
        }

        let mut scored: Vec<(f64, String)> = candidates
            .iter()
            .map(|video| (score_at(video, now), entry_of(video).encode()))
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        scored.truncate(self.config.max_size);
        let size = scored.len();

        self.store
            .exec_atomic(vec![
                StoreCommand::Del {
                    key: keys::HOT_POOL.to_string(),
                },
                StoreCommand::ZAdd {
                    key: keys::HOT_POOL.to_string(),
                    members: scored,
                },
                StoreCommand::Expire {
                    key: keys::HOT_POOL.to_string(),
                    ttl_secs: self.config.ttl_secs,
                },
            ])
            .await?;

        metrics::set_hot_pool_size(size);
        info!(
            candidates = candidates.len(),
            pool_size = size,
            "Hot pool refreshed"
        );
        Ok(size)
    }

    /// Insert a just-published video. The publish timestamp stands in as its
    /// score until the next refresh.
    pub async fn add_video(&self, video_id: i64, author_id: i64, timestamp: i64) -> Result<()> {
        let entry = TimelineEntry::new(video_id, author_id, timestamp);
        self.store
            .exec_atomic(vec![
                StoreCommand::ZAdd {
                    key: keys::HOT_POOL.to_string(),
                    members: vec![(timestamp as f64, entry.encode())],
                },
                StoreCommand::trim_to(keys::HOT_POOL, self.config.max_size),
                StoreCommand::Expire {
                    key: keys::HOT_POOL.to_string(),
                    ttl_secs: self.config.ttl_secs,
                },
            ])
            .await?;

        debug!(video_id, author_id, "Video added to hot pool");
        Ok(())
    }

    /// Highest-scored pool entries, best first.
    pub async fn top(&self, limit: usize) -> Result<Vec<FeedItem>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let members = self
            .store
            .zrevrange_withscores(keys::HOT_POOL, 0, limit as isize - 1)
            .await?;

        Ok(members
            .into_iter()
            .filter_map(|(member, score)| match TimelineEntry::decode(&member) {
                Ok(entry) => Some(entry.into_feed_item(score)),
                Err(e) => {
                    warn!(error = %e, "Skipping malformed hot pool member");
                    None
                }
            })
            .collect())
    }
}

fn entry_of(video: &VideoStats) -> TimelineEntry {
    TimelineEntry::new(video.video_id, video.author_id, video.created_at)
}

fn score_at(video: &VideoStats, now: i64) -> f64 {
    let age_hours = (now - video.created_at).max(0) as f64 / 3600.0;
    calculate_hot_score(video.like_count, video.comment_count, age_hours)
}

#[async_trait]
impl PeriodicJob for HotPoolService {
    fn name(&self) -> &'static str {
        "hot_pool_refresh"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(self.config.refresh_interval_secs)
    }

    async fn run_once(&self) -> Result<usize> {
        self.refresh().await
    }

    fn run_on_start(&self) -> bool {
        true
    }
}
