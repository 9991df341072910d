//! In-process repository for tests and local runs.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::FeedRepository;
use crate::error::{AppError, Result};
use crate::models::{LikeEvent, Page, UserCounters, VideoRecord, VideoStats};

#[derive(Default)]
struct Catalog {
    videos: Vec<VideoStats>,
    /// (follower, followee)
    follows: Vec<(i64, i64)>,
    counters: HashMap<i64, HashMap<String, i64>>,
    favorites: HashMap<(i64, i64, i32, i32), LikeEvent>,
    counter_transactions: usize,
    favorite_transactions: usize,
}

#[derive(Default)]
pub struct MemoryRepository {
    catalog: Mutex<Catalog>,
    failing_transactions: AtomicUsize,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Catalog>> {
        self.catalog
            .lock()
            .map_err(|_| AppError::Internal("memory repository lock poisoned".to_string()))
    }

    pub fn add_video(&self, video: VideoStats) {
        if let Ok(mut catalog) = self.lock() {
            catalog.videos.push(video);
        }
    }

    pub fn follow(&self, follower_id: i64, followee_id: i64) {
        if let Ok(mut catalog) = self.lock() {
            catalog.follows.push((follower_id, followee_id));
        }
    }

    /// Make the next `n` write transactions fail and roll back.
    pub fn fail_next_transactions(&self, n: usize) {
        self.failing_transactions.store(n, Ordering::SeqCst);
    }

    pub fn stored_counters(&self, user_id: i64) -> HashMap<String, i64> {
        self.lock()
            .ok()
            .and_then(|c| c.counters.get(&user_id).cloned())
            .unwrap_or_default()
    }

    pub fn stored_favorite(&self, key: (i64, i64, i32, i32)) -> Option<LikeEvent> {
        self.lock().ok().and_then(|c| c.favorites.get(&key).cloned())
    }

    /// Committed counter-sync transactions so far.
    pub fn counter_transactions(&self) -> usize {
        self.lock().map(|c| c.counter_transactions).unwrap_or(0)
    }

    pub fn favorite_transactions(&self) -> usize {
        self.lock().map(|c| c.favorite_transactions).unwrap_or(0)
    }

    fn take_failure(&self) -> Result<()> {
        if self
            .failing_transactions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(AppError::Internal("injected transaction failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl FeedRepository for MemoryRepository {
    async fn list_video_ids(&self, offset: i64, limit: i64) -> Result<Vec<i64>> {
        let catalog = self.lock()?;
        let mut ids: Vec<i64> = catalog.videos.iter().map(|v| v.video_id).collect();
        ids.sort_unstable();
        Ok(ids
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn list_hot_candidates(&self, limit: i64) -> Result<Vec<VideoStats>> {
        let catalog = self.lock()?;
        let mut videos = catalog.videos.clone();
        videos.sort_by(|a, b| {
            (b.like_count + b.comment_count)
                .cmp(&(a.like_count + a.comment_count))
                .then_with(|| b.created_at.cmp(&a.created_at))
        });
        videos.truncate(limit.max(0) as usize);
        Ok(videos)
    }

    async fn count_followers(&self, author_id: i64) -> Result<i64> {
        let catalog = self.lock()?;
        Ok(catalog.follows.iter().filter(|(_, f)| *f == author_id).count() as i64)
    }

    async fn list_followers(&self, author_id: i64, offset: i64, limit: i64) -> Result<Page<i64>> {
        let catalog = self.lock()?;
        let mut followers: Vec<i64> = catalog
            .follows
            .iter()
            .filter(|(_, followee)| *followee == author_id)
            .map(|(follower, _)| *follower)
            .collect();
        followers.sort_unstable();
        let total = followers.len() as i64;
        let items = followers
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect();
        Ok(Page { items, total })
    }

    async fn list_followings(&self, viewer_id: i64, limit: i64) -> Result<Vec<i64>> {
        let catalog = self.lock()?;
        Ok(catalog
            .follows
            .iter()
            .filter(|(follower, _)| *follower == viewer_id)
            .map(|(_, followee)| *followee)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn list_videos_before(
        &self,
        author_ids: &[i64],
        before: i64,
        limit: i64,
    ) -> Result<Vec<VideoRecord>> {
        let catalog = self.lock()?;
        let mut videos: Vec<VideoRecord> = catalog
            .videos
            .iter()
            .filter(|v| author_ids.contains(&v.author_id) && v.created_at < before)
            .map(|v| VideoRecord {
                video_id: v.video_id,
                author_id: v.author_id,
                created_at: v.created_at,
            })
            .collect();
        videos.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        videos.truncate(limit.max(0) as usize);
        Ok(videos)
    }

    async fn update_user_counters(&self, counters: &[UserCounters]) -> Result<()> {
        self.take_failure()?;
        let mut catalog = self.lock()?;
        for user in counters {
            let stored = catalog.counters.entry(user.user_id).or_default();
            for (field, value) in &user.fields {
                stored.insert(field.clone(), *value);
            }
        }
        catalog.counter_transactions += 1;
        Ok(())
    }

    async fn apply_favorites(&self, events: &[LikeEvent]) -> Result<()> {
        self.take_failure()?;
        let mut catalog = self.lock()?;
        for event in events {
            let newer = catalog
                .favorites
                .get(&event.key())
                .map(|stored| stored.timestamp <= event.timestamp)
                .unwrap_or(true);
            if newer {
                catalog.favorites.insert(event.key(), event.clone());
            }
        }
        catalog.favorite_transactions += 1;
        Ok(())
    }
}
