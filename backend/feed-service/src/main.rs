use anyhow::Context;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use feed_service::broker::KafkaEventPublisher;
use feed_service::consumers::{run_listener, FanoutEventHandler, LikeEventHandler};
use feed_service::db::PgFeedRepository;
use feed_service::jobs::{TaskArena, UserCounterSyncJob};
use feed_service::store::RedisStore;
use feed_service::{
    BloomFilterManager, Config, CounterCache, FanoutDispatcher, FavoriteAggregator,
    FeedOrchestrator, GlobalExistenceFilter, HotPoolService, HotVideoDetector,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_line_number(true)
                .with_target(true),
        )
        .init();

    let config = Config::from_env().context("Failed to load configuration")?;
    info!(env = %config.app.env, "Starting feed-service");

    let store = Arc::new(
        RedisStore::connect(&config.redis.url)
            .await
            .context("Failed to connect to Redis")?,
    );
    store.ping().await.context("Redis health check failed")?;

    let repo = Arc::new(
        PgFeedRepository::connect(&config.database)
            .await
            .context("Failed to connect to database")?,
    );
    let publisher = Arc::new(
        KafkaEventPublisher::new(&config.kafka).context("Failed to create Kafka producer")?,
    );

    let hot_pool = Arc::new(HotPoolService::new(
        store.clone(),
        repo.clone(),
        config.hot_pool.clone(),
    ));
    let existence = Arc::new(GlobalExistenceFilter::new(
        repo.clone(),
        config.existence.clone(),
    ));
    let fanout = Arc::new(FanoutDispatcher::new(
        store.clone(),
        repo.clone(),
        publisher,
        hot_pool.clone(),
        existence.clone(),
        config.feed.clone(),
        config.fanout.clone(),
    ));
    let dedup = Arc::new(BloomFilterManager::new(store.clone(), config.bloom.clone()));
    let counters = Arc::new(CounterCache::new(store.clone(), config.counters.clone()));
    let hot_videos = Arc::new(HotVideoDetector::new(
        store.clone(),
        config.hot_video.clone(),
    ));
    let favorites = Arc::new(FavoriteAggregator::new(repo.clone(), &config.likes));

    // Transport layers hold on to the orchestrator; the core only builds it
    let _feed = Arc::new(FeedOrchestrator::new(
        store.clone(),
        repo.clone(),
        hot_pool.clone(),
        fanout.clone(),
        dedup,
        config.feed.clone(),
    ));

    match existence.init().await {
        Ok(videos) => info!(videos, "Existence filter initialized"),
        Err(e) => warn!(error = %e, "Existence filter init failed, waiting for next rebuild"),
    }

    let mut arena = TaskArena::new();
    arena.spawn_periodic(hot_pool);
    arena.spawn_periodic(hot_videos);
    arena.spawn_periodic(existence);
    arena.spawn_periodic(Arc::new(UserCounterSyncJob::new(counters, repo)));

    let fanout_shutdown = arena.shutdown_signal();
    arena.spawn(
        "fanout-listener",
        run_listener(
            config.kafka.clone(),
            config.kafka.fanout_topic.clone(),
            FanoutEventHandler::new(fanout),
            fanout_shutdown,
        ),
    );
    let like_shutdown = arena.shutdown_signal();
    arena.spawn(
        "like-listener",
        run_listener(
            config.kafka.clone(),
            config.kafka.like_topic.clone(),
            LikeEventHandler::new(favorites.clone()),
            like_shutdown,
        ),
    );

    info!(tasks = arena.len(), "feed-service running");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("Shutdown requested");
    arena.shutdown().await;
    favorites.stop().await;
    info!("feed-service stopped");
    Ok(())
}
