pub mod broker;
pub mod config;
pub mod consumers;
pub mod db;
pub mod error;
pub mod jobs;
pub mod metrics;
pub mod models;
pub mod services;
pub mod store;

pub use config::Config;
pub use error::{AppError, Result};

pub use services::{
    calculate_hot_score, BloomFilterManager, BoundedBatcher, CounterCache, FanoutDispatcher,
    FanoutMode, FavoriteAggregator, FeedOrchestrator, GlobalExistenceFilter, HotPoolService,
    HotVideoDetector,
};
