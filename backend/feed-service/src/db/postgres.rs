/// Postgres Repository
///
/// Read-side queries against the catalog tables and the two transactional
/// write paths (counter sync, favorite batches).
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{debug, error};

use super::FeedRepository;
use crate::config::DatabaseConfig;
use crate::error::{AppError, Result};
use crate::models::{LikeEvent, Page, UserCounters, VideoRecord, VideoStats};

/// Only videos uploaded in this window are hot-pool candidates
const HOT_CANDIDATE_WINDOW_DAYS: i32 = 7;

#[derive(Clone)]
pub struct PgFeedRepository {
    pool: PgPool,
}

impl PgFeedRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await?;
        Ok(Self::new(pool))
    }
}

fn to_datetime(unix_secs: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_opt(unix_secs, 0)
        .single()
        .ok_or_else(|| AppError::InvalidInput(format!("timestamp out of range: {}", unix_secs)))
}

#[async_trait]
impl FeedRepository for PgFeedRepository {
    async fn list_video_ids(&self, offset: i64, limit: i64) -> Result<Vec<i64>> {
        let ids = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT id
            FROM videos
            WHERE deleted_at IS NULL
            ORDER BY id
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    async fn list_hot_candidates(&self, limit: i64) -> Result<Vec<VideoStats>> {
        let rows = sqlx::query_as::<_, (i64, i64, i64, i64, DateTime<Utc>)>(
            r#"
            SELECT id, author_id, like_count, comment_count, created_at
            FROM videos
            WHERE deleted_at IS NULL
              AND created_at > NOW() - make_interval(days => $2)
            ORDER BY (like_count + comment_count) DESC, created_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .bind(HOT_CANDIDATE_WINDOW_DAYS)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to fetch hot candidates: {}", e);
            AppError::Database(e)
        })?;

        Ok(rows
            .into_iter()
            .map(
                |(video_id, author_id, like_count, comment_count, created_at)| VideoStats {
                    video_id,
                    author_id,
                    like_count,
                    comment_count,
                    created_at: created_at.timestamp(),
                },
            )
            .collect())
    }

    async fn count_followers(&self, author_id: i64) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM follows WHERE followee_id = $1 AND deleted_at IS NULL",
        )
        .bind(author_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn list_followers(&self, author_id: i64, offset: i64, limit: i64) -> Result<Page<i64>> {
        let items = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT follower_id
            FROM follows
            WHERE followee_id = $1 AND deleted_at IS NULL
            ORDER BY follower_id
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(author_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let total = self.count_followers(author_id).await?;
        Ok(Page { items, total })
    }

    async fn list_followings(&self, viewer_id: i64, limit: i64) -> Result<Vec<i64>> {
        let ids = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT followee_id
            FROM follows
            WHERE follower_id = $1 AND deleted_at IS NULL
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(viewer_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    async fn list_videos_before(
        &self,
        author_ids: &[i64],
        before: i64,
        limit: i64,
    ) -> Result<Vec<VideoRecord>> {
        if author_ids.is_empty() || limit <= 0 {
            return Ok(Vec::new());
        }

        // Open-ended cursors (i64::MAX) clamp to the present
        let before = to_datetime(before.min(Utc::now().timestamp() + 1))?;

        let rows = sqlx::query_as::<_, (i64, i64, DateTime<Utc>)>(
            r#"
            SELECT id, author_id, created_at
            FROM videos
            WHERE author_id = ANY($1)
              AND created_at < $2
              AND deleted_at IS NULL
            ORDER BY created_at DESC
            LIMIT $3
            "#,
        )
        .bind(author_ids)
        .bind(before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(video_id, author_id, created_at)| VideoRecord {
                video_id,
                author_id,
                created_at: created_at.timestamp(),
            })
            .collect())
    }

    async fn update_user_counters(&self, counters: &[UserCounters]) -> Result<()> {
        if counters.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        for user in counters {
            for (field, value) in &user.fields {
                sqlx::query(
                    r#"
                    INSERT INTO user_counters (user_id, field, value, updated_at)
                    VALUES ($1, $2, $3, NOW())
                    ON CONFLICT (user_id, field)
                    DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()
                    "#,
                )
                .bind(user.user_id)
                .bind(field)
                .bind(value)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        debug!(users = counters.len(), "Persisted user counters");
        Ok(())
    }

    async fn apply_favorites(&self, events: &[LikeEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        for event in events {
            // Older events never overwrite a newer state
            sqlx::query(
                r#"
                INSERT INTO favorites (user_id, target_id, target_type, favorite_type, is_deleted, event_ts, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, NOW())
                ON CONFLICT (user_id, target_id, target_type, favorite_type)
                DO UPDATE SET is_deleted = EXCLUDED.is_deleted,
                              event_ts = EXCLUDED.event_ts,
                              updated_at = NOW()
                WHERE favorites.event_ts <= EXCLUDED.event_ts
                "#,
            )
            .bind(event.user_id)
            .bind(event.target_id)
            .bind(event.target_type)
            .bind(event.favorite_type)
            .bind(event.is_deleted)
            .bind(event.timestamp)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(events = events.len(), "Applied favorite batch");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_datetime_round_trips_seconds() {
        let dt = to_datetime(1_700_000_000).unwrap();
        assert_eq!(dt.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_to_datetime_rejects_out_of_range() {
        assert!(to_datetime(i64::MAX).is_err());
    }
}
