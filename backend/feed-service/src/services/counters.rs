//! Per-user counter cache with dirty tracking
//!
//! The cache is the source of truth between sync cycles; every mutation also
//! marks the user dirty so `UserCounterSyncJob` picks it up.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::CounterConfig;
use crate::error::Result;
use crate::models::UserCounters;
use crate::store::{keys, CacheStore, StoreCommand};

pub mod fields {
    pub const FOLLOW_COUNT: &str = "follow_count";
    pub const FOLLOWER_COUNT: &str = "follower_count";
    pub const FAVORITE_COUNT: &str = "favorite_count";
    pub const TOTAL_FAVORITED: &str = "total_favorited";
    pub const WORK_COUNT: &str = "work_count";
}

pub struct CounterCache {
    store: Arc<dyn CacheStore>,
    config: CounterConfig,
}

impl CounterCache {
    pub fn new(store: Arc<dyn CacheStore>, config: CounterConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &CounterConfig {
        &self.config
    }

    /// Apply `delta` to one field, mark the user dirty and roll the expiry,
    /// all in one batch.
    pub async fn incr_user_counter(&self, user_id: i64, field: &str, delta: i64) -> Result<()> {
        let key = keys::user_counters(user_id);
        self.store
            .exec_atomic(vec![
                StoreCommand::HIncrBy {
                    key: key.clone(),
                    field: field.to_string(),
                    delta,
                },
                StoreCommand::SAdd {
                    key: keys::DIRTY_COUNTERS.to_string(),
                    members: vec![user_id.to_string()],
                },
                StoreCommand::Expire {
                    key,
                    ttl_secs: self.config.ttl_secs,
                },
            ])
            .await?;

        debug!(user_id, field, delta, "User counter updated");
        Ok(())
    }

    pub async fn decr_user_counter(&self, user_id: i64, field: &str, delta: i64) -> Result<()> {
        self.incr_user_counter(user_id, field, -delta).await
    }

    pub async fn get_user_counters(&self, user_id: i64) -> Result<UserCounters> {
        let mut counters = self.batch_get_user_counters(&[user_id]).await?;
        Ok(counters.pop().unwrap_or(UserCounters {
            user_id,
            fields: Default::default(),
        }))
    }

    /// Counters in the order of `user_ids`; unknown users come back empty.
    pub async fn batch_get_user_counters(&self, user_ids: &[i64]) -> Result<Vec<UserCounters>> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = user_ids.iter().map(|id| keys::user_counters(*id)).collect();
        let hashes = self.store.hgetall_many(&keys).await?;

        Ok(user_ids
            .iter()
            .zip(hashes)
            .map(|(user_id, fields)| UserCounters {
                user_id: *user_id,
                fields,
            })
            .collect())
    }

    pub async fn get_dirty_user_ids(&self) -> Result<Vec<i64>> {
        let members = self.store.smembers(keys::DIRTY_COUNTERS).await?;
        let mut ids = Vec::with_capacity(members.len());
        for member in members {
            match member.parse::<i64>() {
                Ok(id) => ids.push(id),
                Err(_) => warn!(member = %member, "Ignoring malformed dirty counter entry"),
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// Flag users for the next sync without touching their counters.
    pub async fn mark_dirty(&self, user_ids: &[i64]) -> Result<()> {
        if user_ids.is_empty() {
            return Ok(());
        }
        self.store
            .exec_atomic(vec![StoreCommand::SAdd {
                key: keys::DIRTY_COUNTERS.to_string(),
                members: user_ids.iter().map(|id| id.to_string()).collect(),
            }])
            .await
    }

    pub async fn clear_dirty_flags(&self, user_ids: &[i64]) -> Result<()> {
        if user_ids.is_empty() {
            return Ok(());
        }
        self.store
            .exec_atomic(vec![StoreCommand::SRem {
                key: keys::DIRTY_COUNTERS.to_string(),
                members: user_ids.iter().map(|id| id.to_string()).collect(),
            }])
            .await
    }
}
