//! User Counter Sync Job
//!
//! Writes dirty cached counters back to the database. One cycle:
//! 1. read the dirty user ids
//! 2. clear the dirty flags of exactly those users
//! 3. bulk-read their counters from the cache
//! 4. persist all of them in one transaction
//!
//! Flags are cleared before the read, so an increment racing the cycle marks
//! its user dirty again and is picked up next time. A failed read or
//! transaction re-marks the users so the next cycle retries them.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::PeriodicJob;
use crate::db::FeedRepository;
use crate::error::Result;
use crate::metrics;
use crate::services::CounterCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Syncing,
}

const IDLE: u8 = 0;
const SYNCING: u8 = 1;

pub struct UserCounterSyncJob {
    counters: Arc<CounterCache>,
    repo: Arc<dyn FeedRepository>,
    state: AtomicU8,
}

/// Resets the state to idle however the cycle ends
struct SyncGuard<'a>(&'a AtomicU8);

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.0.store(IDLE, Ordering::SeqCst);
    }
}

impl UserCounterSyncJob {
    pub fn new(counters: Arc<CounterCache>, repo: Arc<dyn FeedRepository>) -> Self {
        Self {
            counters,
            repo,
            state: AtomicU8::new(IDLE),
        }
    }

    pub fn state(&self) -> SyncState {
        match self.state.load(Ordering::SeqCst) {
            SYNCING => SyncState::Syncing,
            _ => SyncState::Idle,
        }
    }

    /// Run one cycle, returning how many users were persisted. A cycle that
    /// finds another one in progress does nothing.
    pub async fn sync(&self) -> Result<usize> {
        if self
            .state
            .compare_exchange(IDLE, SYNCING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("Counter sync already running, skipping cycle");
            return Ok(0);
        }
        let _guard = SyncGuard(&self.state);

        let dirty = self.counters.get_dirty_user_ids().await?;
        if dirty.is_empty() {
            debug!("No dirty user counters");
            return Ok(0);
        }

        self.counters.clear_dirty_flags(&dirty).await?;

        if let Err(e) = self.persist(&dirty).await {
            if let Err(remark) = self.counters.mark_dirty(&dirty).await {
                error!(
                    users = dirty.len(),
                    error = %remark,
                    "Failed to re-mark users after sync failure"
                );
            }
            return Err(e);
        }

        metrics::record_users_synced(dirty.len());
        info!(users = dirty.len(), "User counters synced");
        Ok(dirty.len())
    }

    async fn persist(&self, user_ids: &[i64]) -> Result<()> {
        let snapshots = self.counters.batch_get_user_counters(user_ids).await?;
        self.repo.update_user_counters(&snapshots).await
    }
}

#[async_trait]
impl PeriodicJob for UserCounterSyncJob {
    fn name(&self) -> &'static str {
        "counter_sync"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(self.counters.config().sync_interval_secs)
    }

    async fn run_once(&self) -> Result<usize> {
        self.sync().await
    }
}
