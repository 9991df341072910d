//! `video.fanout` listener: deferred delivery for big-V publishes.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use super::PayloadHandler;
use crate::error::Result;
use crate::models::FanoutEvent;
use crate::services::FanoutDispatcher;

pub struct FanoutEventHandler {
    dispatcher: Arc<FanoutDispatcher>,
}

impl FanoutEventHandler {
    pub fn new(dispatcher: Arc<FanoutDispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl PayloadHandler for FanoutEventHandler {
    fn name(&self) -> &'static str {
        "fanout"
    }

    async fn handle(&self, payload: &[u8]) -> Result<()> {
        let event: FanoutEvent = serde_json::from_slice(payload)?;
        let written = self.dispatcher.deliver(&event).await?;
        info!(
            video_id = event.video_id,
            author_id = event.author_id,
            timelines = written,
            "Deferred fan-out delivered"
        );
        Ok(())
    }
}
