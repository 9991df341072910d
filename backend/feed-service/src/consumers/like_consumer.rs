//! `video.like` listener: hands like events to the favorite aggregator.
//! The offset is committed once the event is buffered, so a failed batch
//! write is not redelivered.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use super::PayloadHandler;
use crate::error::Result;
use crate::models::LikeEvent;
use crate::services::FavoriteAggregator;

pub struct LikeEventHandler {
    aggregator: Arc<FavoriteAggregator>,
}

impl LikeEventHandler {
    pub fn new(aggregator: Arc<FavoriteAggregator>) -> Self {
        Self { aggregator }
    }
}

#[async_trait]
impl PayloadHandler for LikeEventHandler {
    fn name(&self) -> &'static str {
        "like"
    }

    async fn handle(&self, payload: &[u8]) -> Result<()> {
        let event: LikeEvent = serde_json::from_slice(payload)?;
        debug!(
            user_id = event.user_id,
            target_id = event.target_id,
            is_deleted = event.is_deleted,
            "Like event buffered"
        );
        self.aggregator.submit(event);
        Ok(())
    }
}
