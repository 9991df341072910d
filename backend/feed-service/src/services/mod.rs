//! Service layer for feed-service
//!
//! Leaves first:
//! - batcher: size/time triggered batching
//! - bloom, dedup: per-viewer seen filters
//! - existence: global video existence filter
//! - counters: dirty-tracked user counters
//! - hot_detector: request-window hot video snapshot
//! - hot_pool: Wilson-score ranked global pool
//! - fanout: publish push/broker dispatch
//! - favorites: like event aggregation
//! - feed: feed assembly

pub mod batcher;
pub mod bloom;
pub mod counters;
pub mod dedup;
pub mod existence;
pub mod fanout;
pub mod favorites;
pub mod feed;
pub mod hot_detector;
pub mod hot_pool;

pub use batcher::BoundedBatcher;
pub use bloom::VideoFilter;
pub use counters::CounterCache;
pub use dedup::BloomFilterManager;
pub use existence::GlobalExistenceFilter;
pub use fanout::{FanoutDispatcher, FanoutMode};
pub use favorites::FavoriteAggregator;
pub use feed::FeedOrchestrator;
pub use hot_detector::HotVideoDetector;
pub use hot_pool::{calculate_hot_score, HotPoolService};
