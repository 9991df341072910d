//! Traffic-based hot video detection
//!
//! Request counts land in per-window sorted sets that expire after two
//! windows. Each tick merges the current and previous window, keeps the top N
//! and republishes them as the snapshot set read by `is_hot_video`.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::HotVideoConfig;
use crate::error::Result;
use crate::jobs::PeriodicJob;
use crate::store::{keys, CacheStore, StoreCommand};

pub struct HotVideoDetector {
    store: Arc<dyn CacheStore>,
    config: HotVideoConfig,
}

impl HotVideoDetector {
    pub fn new(store: Arc<dyn CacheStore>, config: HotVideoConfig) -> Self {
        Self { store, config }
    }

    fn window_secs(&self) -> i64 {
        self.config.window_secs.max(1) as i64
    }

    fn bucket(&self, unix_secs: i64) -> i64 {
        unix_secs.div_euclid(self.window_secs())
    }

    pub async fn incr_request_count(&self, video_id: i64) -> Result<()> {
        self.incr_request_count_at(video_id, Utc::now().timestamp())
            .await
    }

    pub async fn incr_request_count_at(&self, video_id: i64, unix_secs: i64) -> Result<()> {
        let key = keys::hot_video_window(self.bucket(unix_secs));
        self.store
            .exec_atomic(vec![
                StoreCommand::ZIncrBy {
                    key: key.clone(),
                    member: video_id.to_string(),
                    delta: 1.0,
                },
                StoreCommand::Expire {
                    key,
                    ttl_secs: 2 * self.window_secs() as u64,
                },
            ])
            .await
    }

    /// Recompute the snapshot from the windows covering `unix_secs`.
    pub async fn tick_at(&self, unix_secs: i64) -> Result<usize> {
        let top_n = self.config.top_n;
        if top_n == 0 {
            return Ok(0);
        }

        let current = self.bucket(unix_secs);
        let mut merged: HashMap<i64, f64> = HashMap::new();
        for bucket in [current - 1, current] {
            let counts = self
                .store
                .zrevrange_withscores(&keys::hot_video_window(bucket), 0, top_n as isize - 1)
                .await?;
            for (member, count) in counts {
                match member.parse::<i64>() {
                    Ok(video_id) => *merged.entry(video_id).or_insert(0.0) += count,
                    Err(_) => warn!(member = %member, "Ignoring malformed hot video member"),
                }
            }
        }

        let mut ranked: Vec<(i64, f64)> = merged.into_iter().collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
        ranked.truncate(top_n);

        let mut commands = vec![StoreCommand::Del {
            key: keys::HOT_VIDEO_TOP.to_string(),
        }];
        if !ranked.is_empty() {
            commands.push(StoreCommand::SAdd {
                key: keys::HOT_VIDEO_TOP.to_string(),
                members: ranked.iter().map(|(id, _)| id.to_string()).collect(),
            });
            commands.push(StoreCommand::Expire {
                key: keys::HOT_VIDEO_TOP.to_string(),
                ttl_secs: self.config.snapshot_ttl_secs,
            });
        }
        self.store.exec_atomic(commands).await?;

        debug!(hot = ranked.len(), bucket = current, "Hot video snapshot published");
        Ok(ranked.len())
    }

    /// Reads the last snapshot; a cold or unreachable cache answers `false`.
    pub async fn is_hot_video(&self, video_id: i64) -> bool {
        match self
            .store
            .sismember(keys::HOT_VIDEO_TOP, &video_id.to_string())
            .await
        {
            Ok(hot) => hot,
            Err(e) => {
                warn!(video_id, error = %e, "Hot video lookup failed");
                false
            }
        }
    }

    pub async fn hot_videos(&self) -> Result<Vec<i64>> {
        let members = self.store.smembers(keys::HOT_VIDEO_TOP).await?;
        let mut ids: Vec<i64> = members.iter().filter_map(|m| m.parse().ok()).collect();
        ids.sort_unstable();
        Ok(ids)
    }
}

#[async_trait]
impl PeriodicJob for HotVideoDetector {
    fn name(&self) -> &'static str {
        "hot_video_tick"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(self.window_secs() as u64)
    }

    async fn run_once(&self) -> Result<usize> {
        self.tick_at(Utc::now().timestamp()).await
    }
}
