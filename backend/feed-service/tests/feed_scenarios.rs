//! End-to-end behaviour of the feed core on the in-memory backends.

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use feed_service::broker::EventPublisher;
use feed_service::config::{
    BloomConfig, CounterConfig, ExistenceConfig, FanoutConfig, FeedConfig, HotPoolConfig,
};
use feed_service::db::MemoryRepository;
use feed_service::jobs::UserCounterSyncJob;
use feed_service::models::{FanoutEvent, FeedRequest, FeedType, TimelineEntry};
use feed_service::services::counters::fields;
use feed_service::store::{keys, CacheStore, MemoryStore};
use feed_service::{
    BloomFilterManager, CounterCache, FanoutDispatcher, FanoutMode, FeedOrchestrator,
    GlobalExistenceFilter, HotPoolService, Result,
};

/// Records published events instead of talking to a broker
#[derive(Default)]
struct RecordingPublisher {
    events: Mutex<Vec<FanoutEvent>>,
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish_fanout(&self, event: &FanoutEvent) -> Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    repo: Arc<MemoryRepository>,
    publisher: Arc<RecordingPublisher>,
    hot_pool: Arc<HotPoolService>,
    existence: Arc<GlobalExistenceFilter>,
    fanout: Arc<FanoutDispatcher>,
    feed: FeedOrchestrator,
}

impl Harness {
    fn new(feed_config: FeedConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let repo = Arc::new(MemoryRepository::new());
        let publisher = Arc::new(RecordingPublisher::default());
        let hot_pool = Arc::new(HotPoolService::new(
            store.clone(),
            repo.clone(),
            HotPoolConfig::default(),
        ));
        let existence = Arc::new(GlobalExistenceFilter::new(
            repo.clone(),
            ExistenceConfig {
                expected_items: 10_000,
                ..ExistenceConfig::default()
            },
        ));
        let fanout = Arc::new(FanoutDispatcher::new(
            store.clone(),
            repo.clone(),
            publisher.clone(),
            hot_pool.clone(),
            existence.clone(),
            feed_config.clone(),
            FanoutConfig::default(),
        ));
        let dedup = Arc::new(BloomFilterManager::new(
            store.clone(),
            BloomConfig {
                expected_items: 10_000,
                ..BloomConfig::default()
            },
        ));
        let feed = FeedOrchestrator::new(
            store.clone(),
            repo.clone(),
            hot_pool.clone(),
            fanout.clone(),
            dedup,
            feed_config,
        );

        Self {
            store,
            repo,
            publisher,
            hot_pool,
            existence,
            fanout,
            feed,
        }
    }

    async fn timeline(&self, viewer_id: i64) -> Vec<(String, f64)> {
        self.store
            .zrevrange_withscores(&keys::timeline(viewer_id), 0, -1)
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn scenario_a_small_author_publish_reaches_all_followers() {
    let harness = Harness::new(FeedConfig::default());
    for follower in 1..=5 {
        harness.repo.follow(follower, 100);
    }

    let mode = harness
        .fanout
        .video_published_at(42, 100, 1_000)
        .await
        .unwrap();

    assert_eq!(mode, FanoutMode::Push);
    assert!(harness.publisher.events.lock().unwrap().is_empty());
    for follower in 1..=5 {
        assert_eq!(
            harness.timeline(follower).await,
            vec![("42:100:1000".to_string(), 1_000.0)]
        );
    }

    let pool = harness.hot_pool.top(10).await.unwrap();
    assert_eq!(pool.len(), 1);
    assert_eq!(pool[0].video_id, 42);
    assert_eq!(pool[0].score, 1_000.0);
    assert!(harness.existence.exists(42).await);
}

#[tokio::test]
async fn scenario_b_repeated_following_reads_are_disjoint() {
    let harness = Harness::new(FeedConfig::default());
    let entries: Vec<TimelineEntry> = (1..=40)
        .map(|i| TimelineEntry::new(i, 3, 10_000 + i * 10))
        .collect();
    harness
        .fanout
        .push_to_user_timeline(7, &entries)
        .await
        .unwrap();

    let request = FeedRequest {
        viewer_id: 7,
        cursor: i64::MAX,
        page_size: 10,
        feed_type: FeedType::Following,
    };
    let first = harness.feed.get_feed(request.clone()).await.unwrap();
    let second = harness.feed.get_feed(request).await.unwrap();

    assert_eq!(first.items.len(), 10);
    assert_eq!(second.items.len(), 10);

    let first_ids: HashSet<i64> = first.items.iter().map(|i| i.video_id).collect();
    let second_ids: HashSet<i64> = second.items.iter().map(|i| i.video_id).collect();
    assert!(first_ids.is_disjoint(&second_ids));

    for item in &first.items {
        assert!(first.next_cursor < item.timestamp);
    }
}

#[tokio::test]
async fn big_author_publish_is_deferred_to_broker() {
    let harness = Harness::new(FeedConfig::default());
    let dispatcher = FanoutDispatcher::new(
        harness.store.clone(),
        harness.repo.clone(),
        harness.publisher.clone(),
        harness.hot_pool.clone(),
        harness.existence.clone(),
        FeedConfig::default(),
        FanoutConfig {
            push_threshold: 3,
            ..FanoutConfig::default()
        },
    );
    for follower in 1..=4 {
        harness.repo.follow(follower, 100);
    }

    assert_eq!(
        dispatcher.video_published_at(7, 100, 2_000).await.unwrap(),
        FanoutMode::Broker
    );
    assert!(harness.timeline(1).await.is_empty());

    // The listener path delivers exactly what the synchronous path would
    let event = harness.publisher.events.lock().unwrap()[0].clone();
    assert_eq!(dispatcher.deliver(&event).await.unwrap(), 4);
    for follower in 1..=4 {
        assert_eq!(
            harness.timeline(follower).await,
            vec![("7:100:2000".to_string(), 2_000.0)]
        );
    }
}

#[tokio::test]
async fn timeline_keeps_only_newest_entries() {
    let max_size = 25;
    let harness = Harness::new(FeedConfig {
        timeline_max_size: max_size,
        ..FeedConfig::default()
    });

    let mut timestamps: Vec<i64> = (1..=200).collect();
    timestamps.shuffle(&mut StdRng::seed_from_u64(7));

    for ts in &timestamps {
        harness
            .fanout
            .push_to_user_timeline(9, &[TimelineEntry::new(*ts, 1, *ts)])
            .await
            .unwrap();
        assert!(harness.store.zcard(&keys::timeline(9)).await.unwrap() <= max_size as u64);
    }

    let retained: Vec<i64> = harness
        .timeline(9)
        .await
        .into_iter()
        .map(|(member, _)| TimelineEntry::decode(&member).unwrap().timestamp)
        .collect();
    let expected: Vec<i64> = (176..=200).rev().collect();
    assert_eq!(retained, expected);
}

#[tokio::test]
async fn counter_sync_twice_is_idempotent() {
    let store = Arc::new(MemoryStore::new());
    let repo = Arc::new(MemoryRepository::new());
    let counters = Arc::new(CounterCache::new(store, CounterConfig::default()));
    let job = UserCounterSyncJob::new(counters.clone(), repo.clone());

    counters
        .incr_user_counter(1, fields::FOLLOW_COUNT, 3)
        .await
        .unwrap();
    counters
        .incr_user_counter(2, fields::TOTAL_FAVORITED, 8)
        .await
        .unwrap();
    counters
        .decr_user_counter(2, fields::TOTAL_FAVORITED, 1)
        .await
        .unwrap();

    assert_eq!(job.sync().await.unwrap(), 2);
    let first = (repo.stored_counters(1), repo.stored_counters(2));
    assert_eq!(first.1.get(fields::TOTAL_FAVORITED), Some(&7));

    assert_eq!(job.sync().await.unwrap(), 0);
    assert_eq!((repo.stored_counters(1), repo.stored_counters(2)), first);
    assert_eq!(repo.counter_transactions(), 1);
}
