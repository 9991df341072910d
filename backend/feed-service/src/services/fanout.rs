//! Publish fan-out
//!
//! Normal authors are pushed synchronously into every follower timeline, one
//! atomic batch per page of followers. Authors at or above the push threshold
//! ("big-V") are handed to the broker and delivered out of band by the
//! fan-out listener, which runs the same paging through [`FanoutDispatcher::deliver`].
//! Either way the video goes into the hot pool and the existence filter.
//!
//! The big-V flag is cached for `classification_ttl_secs`; an author crossing
//! the threshold keeps the old classification until the flag expires.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::existence::GlobalExistenceFilter;
use super::hot_pool::HotPoolService;
use crate::broker::EventPublisher;
use crate::config::{FanoutConfig, FeedConfig};
use crate::db::FeedRepository;
use crate::error::Result;
use crate::metrics;
use crate::models::{FanoutEvent, TimelineEntry};
use crate::store::{keys, CacheStore, StoreCommand};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanoutMode {
    /// Timelines written during the publish call
    Push,
    /// Handed to the broker for deferred delivery
    Broker,
}

impl FanoutMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FanoutMode::Push => "push",
            FanoutMode::Broker => "broker",
        }
    }
}

pub struct FanoutDispatcher {
    store: Arc<dyn CacheStore>,
    repo: Arc<dyn FeedRepository>,
    publisher: Arc<dyn EventPublisher>,
    hot_pool: Arc<HotPoolService>,
    existence: Arc<GlobalExistenceFilter>,
    feed: FeedConfig,
    config: FanoutConfig,
}

impl FanoutDispatcher {
    pub fn new(
        store: Arc<dyn CacheStore>,
        repo: Arc<dyn FeedRepository>,
        publisher: Arc<dyn EventPublisher>,
        hot_pool: Arc<HotPoolService>,
        existence: Arc<GlobalExistenceFilter>,
        feed: FeedConfig,
        config: FanoutConfig,
    ) -> Self {
        Self {
            store,
            repo,
            publisher,
            hot_pool,
            existence,
            feed,
            config,
        }
    }

    pub async fn video_published(&self, video_id: i64, author_id: i64) -> Result<FanoutMode> {
        self.video_published_at(video_id, author_id, Utc::now().timestamp())
            .await
    }

    pub async fn video_published_at(
        &self,
        video_id: i64,
        author_id: i64,
        timestamp: i64,
    ) -> Result<FanoutMode> {
        let event = FanoutEvent {
            video_id,
            author_id,
            timestamp,
        };

        self.existence.add(video_id).await;
        let delivered = self.dispatch(&event).await;
        let pooled = self
            .hot_pool
            .add_video(video_id, author_id, timestamp)
            .await;

        let mode = delivered?;
        pooled?;

        metrics::record_fanout(mode.as_str());
        info!(video_id, author_id, mode = mode.as_str(), "Video published");
        Ok(mode)
    }

    async fn dispatch(&self, event: &FanoutEvent) -> Result<FanoutMode> {
        if self.is_big_v(event.author_id).await? {
            self.publisher.publish_fanout(event).await?;
            Ok(FanoutMode::Broker)
        } else {
            self.push_to_followers(event).await?;
            Ok(FanoutMode::Push)
        }
    }

    /// Run a publish on its own task under the detached budget, so the
    /// caller going away does not cut the fan-out short.
    pub fn dispatch_detached(
        self: &Arc<Self>,
        video_id: i64,
        author_id: i64,
        timestamp: i64,
    ) -> JoinHandle<()> {
        let dispatcher = Arc::clone(self);
        let budget = Duration::from_secs(self.config.detached_budget_secs);
        tokio::spawn(async move {
            let publish = dispatcher.video_published_at(video_id, author_id, timestamp);
            match tokio::time::timeout(budget, publish).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => error!(video_id, author_id, error = %e, "Detached fan-out failed"),
                Err(_) => warn!(video_id, author_id, "Detached fan-out exceeded its budget"),
            }
        })
    }

    pub async fn is_big_v(&self, author_id: i64) -> Result<bool> {
        let key = keys::big_v(author_id);
        if let Some(flag) = self.store.get(&key).await? {
            return Ok(flag.as_slice() == b"1");
        }

        let followers = self.repo.count_followers(author_id).await?;
        let big_v = followers >= self.config.push_threshold;

        let flag = if big_v { b"1".to_vec() } else { b"0".to_vec() };
        if let Err(e) = self
            .store
            .exec_atomic(vec![StoreCommand::Set {
                key,
                value: flag,
                ttl_secs: Some(self.config.classification_ttl_secs),
            }])
            .await
        {
            warn!(author_id, error = %e, "Failed to cache author classification");
        }

        debug!(author_id, followers, big_v, "Author classified");
        Ok(big_v)
    }

    /// Broker listener entry point.
    pub async fn deliver(&self, event: &FanoutEvent) -> Result<usize> {
        self.push_to_followers(event).await
    }

    /// Page through the author's followers and push the entry into each
    /// timeline. A failed batch is logged and skipped; a failed follower read
    /// aborts. Returns the number of timelines written.
    pub async fn push_to_followers(&self, event: &FanoutEvent) -> Result<usize> {
        let batch_size = self.config.batch_size.max(1);
        let entry = event.entry();
        let mut offset = 0i64;
        let mut written = 0usize;

        loop {
            let page = self
                .repo
                .list_followers(event.author_id, offset, batch_size)
                .await?;
            let fetched = page.items.len();
            if fetched == 0 {
                break;
            }

            let commands: Vec<StoreCommand> = page
                .items
                .iter()
                .flat_map(|follower| self.timeline_commands(*follower, &[entry]))
                .collect();

            match self.store.exec_atomic(commands).await {
                Ok(()) => written += fetched,
                Err(e) => {
                    metrics::record_fanout_batch_failure();
                    warn!(
                        video_id = event.video_id,
                        author_id = event.author_id,
                        offset,
                        batch = fetched,
                        error = %e,
                        "Fan-out batch failed, skipping"
                    );
                }
            }

            offset += fetched as i64;
            if (fetched as i64) < batch_size || offset >= page.total {
                break;
            }
        }

        metrics::record_timelines_written(written);
        debug!(
            video_id = event.video_id,
            author_id = event.author_id,
            written,
            "Fan-out to followers finished"
        );
        Ok(written)
    }

    pub async fn push_to_user_timeline(
        &self,
        viewer_id: i64,
        entries: &[TimelineEntry],
    ) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.store
            .exec_atomic(self.timeline_commands(viewer_id, entries))
            .await
    }

    /// Append, trim to the newest `timeline_max_size` and roll the expiry.
    fn timeline_commands(&self, viewer_id: i64, entries: &[TimelineEntry]) -> Vec<StoreCommand> {
        let key = keys::timeline(viewer_id);
        vec![
            StoreCommand::ZAdd {
                key: key.clone(),
                members: entries
                    .iter()
                    .map(|e| (e.timestamp as f64, e.encode()))
                    .collect(),
            },
            StoreCommand::trim_to(key.clone(), self.feed.timeline_max_size),
            StoreCommand::Expire {
                key,
                ttl_secs: self.feed.timeline_ttl_secs,
            },
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MockEventPublisher;
    use crate::config::{ExistenceConfig, HotPoolConfig};
    use crate::db::MemoryRepository;
    use crate::error::AppError;
    use crate::store::MemoryStore;

    struct Fixture {
        store: Arc<MemoryStore>,
        repo: Arc<MemoryRepository>,
        hot_pool: Arc<HotPoolService>,
        existence: Arc<GlobalExistenceFilter>,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(MemoryStore::new());
            let repo = Arc::new(MemoryRepository::new());
            let hot_pool = Arc::new(HotPoolService::new(
                store.clone(),
                repo.clone(),
                HotPoolConfig::default(),
            ));
            let existence = Arc::new(GlobalExistenceFilter::new(
                repo.clone(),
                ExistenceConfig {
                    expected_items: 1_000,
                    ..ExistenceConfig::default()
                },
            ));
            Self {
                store,
                repo,
                hot_pool,
                existence,
            }
        }

        fn dispatcher(&self, publisher: MockEventPublisher, config: FanoutConfig) -> FanoutDispatcher {
            FanoutDispatcher::new(
                self.store.clone(),
                self.repo.clone(),
                Arc::new(publisher),
                self.hot_pool.clone(),
                self.existence.clone(),
                FeedConfig {
                    timeline_max_size: 3,
                    ..FeedConfig::default()
                },
                config,
            )
        }

        async fn timeline(&self, viewer_id: i64) -> Vec<String> {
            self.store
                .zrevrange_withscores(&keys::timeline(viewer_id), 0, -1)
                .await
                .unwrap()
                .into_iter()
                .map(|(member, _)| member)
                .collect()
        }
    }

    fn silent_publisher() -> MockEventPublisher {
        let mut publisher = MockEventPublisher::new();
        publisher.expect_publish_fanout().times(0);
        publisher
    }

    #[tokio::test]
    async fn test_normal_author_pushes_to_every_follower() {
        let fx = Fixture::new();
        for follower in 1..=5 {
            fx.repo.follow(follower, 100);
        }
        let dispatcher = fx.dispatcher(silent_publisher(), FanoutConfig::default());

        let mode = dispatcher.video_published_at(42, 100, 1_000).await.unwrap();
        assert_eq!(mode, FanoutMode::Push);
        for follower in 1..=5 {
            assert_eq!(fx.timeline(follower).await, vec!["42:100:1000".to_string()]);
        }

        let pool = fx.hot_pool.top(10).await.unwrap();
        assert_eq!(pool[0].video_id, 42);
        assert_eq!(pool[0].score, 1_000.0);
    }

    #[tokio::test]
    async fn test_big_v_goes_through_broker() {
        let fx = Fixture::new();
        for follower in 1..=5 {
            fx.repo.follow(follower, 100);
        }
        let mut publisher = MockEventPublisher::new();
        publisher
            .expect_publish_fanout()
            .withf(|event| event.video_id == 42 && event.author_id == 100 && event.timestamp == 1_000)
            .times(1)
            .returning(|_| Ok(()));

        let dispatcher = fx.dispatcher(
            publisher,
            FanoutConfig {
                push_threshold: 5,
                ..FanoutConfig::default()
            },
        );

        assert_eq!(
            dispatcher.video_published_at(42, 100, 1_000).await.unwrap(),
            FanoutMode::Broker
        );
        assert!(fx.timeline(1).await.is_empty());
        assert_eq!(fx.hot_pool.top(1).await.unwrap()[0].video_id, 42);
    }

    #[tokio::test]
    async fn test_broker_failure_still_pools_video() {
        let fx = Fixture::new();
        fx.repo.follow(1, 100);
        let mut publisher = MockEventPublisher::new();
        publisher
            .expect_publish_fanout()
            .returning(|_| Err(AppError::Internal("broker down".to_string())));
        let dispatcher = fx.dispatcher(
            publisher,
            FanoutConfig {
                push_threshold: 1,
                ..FanoutConfig::default()
            },
        );

        tokio_test::assert_err!(dispatcher.video_published_at(42, 100, 1_000).await);
        assert_eq!(fx.hot_pool.top(1).await.unwrap()[0].video_id, 42);
        assert!(fx.existence.exists(42).await);
    }

    #[tokio::test]
    async fn test_published_video_exists_before_next_rebuild() {
        let fx = Fixture::new();
        fx.existence.init().await.unwrap();
        assert!(!fx.existence.exists(42).await);

        let dispatcher = fx.dispatcher(silent_publisher(), FanoutConfig::default());
        dispatcher.video_published_at(42, 100, 1_000).await.unwrap();

        assert!(fx.existence.exists(42).await);
    }

    #[tokio::test]
    async fn test_classification_is_cached() {
        let fx = Fixture::new();
        let dispatcher = fx.dispatcher(
            silent_publisher(),
            FanoutConfig {
                push_threshold: 2,
                ..FanoutConfig::default()
            },
        );

        assert!(!dispatcher.is_big_v(100).await.unwrap());
        assert!(fx.store.ttl(&keys::big_v(100)).is_some());

        fx.repo.follow(1, 100);
        fx.repo.follow(2, 100);
        // Stale until the cached flag expires
        assert!(!dispatcher.is_big_v(100).await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_batch_is_skipped() {
        let fx = Fixture::new();
        for follower in 1..=5 {
            fx.repo.follow(follower, 100);
        }
        let dispatcher = fx.dispatcher(
            silent_publisher(),
            FanoutConfig {
                batch_size: 2,
                ..FanoutConfig::default()
            },
        );

        let event = FanoutEvent {
            video_id: 42,
            author_id: 100,
            timestamp: 1_000,
        };
        fx.store.fail_next_batches(1);
        assert_eq!(dispatcher.deliver(&event).await.unwrap(), 3);

        assert!(fx.timeline(1).await.is_empty());
        assert!(fx.timeline(2).await.is_empty());
        for follower in 3..=5 {
            assert_eq!(fx.timeline(follower).await.len(), 1);
        }
    }

    #[tokio::test]
    async fn test_user_timeline_keeps_newest_entries() {
        let fx = Fixture::new();
        let dispatcher = fx.dispatcher(silent_publisher(), FanoutConfig::default());

        let entries: Vec<TimelineEntry> = (1..=5)
            .map(|i| TimelineEntry::new(i, 9, 1_000 + i))
            .collect();
        dispatcher.push_to_user_timeline(7, &entries).await.unwrap();

        assert_eq!(
            fx.timeline(7).await,
            vec!["5:9:1005", "4:9:1004", "3:9:1003"]
        );
        assert!(fx.store.ttl(&keys::timeline(7)).is_some());
    }

    #[tokio::test]
    async fn test_detached_dispatch_completes() {
        let fx = Fixture::new();
        fx.repo.follow(1, 100);
        let dispatcher = Arc::new(fx.dispatcher(silent_publisher(), FanoutConfig::default()));

        dispatcher.dispatch_detached(42, 100, 1_000).await.unwrap();
        assert_eq!(fx.timeline(1).await.len(), 1);
    }
}
