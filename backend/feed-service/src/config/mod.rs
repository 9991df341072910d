use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{AppError, Result};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub app: AppConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    #[serde(default)]
    pub kafka: KafkaConfig,
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub fanout: FanoutConfig,
    #[serde(default)]
    pub hot_pool: HotPoolConfig,
    #[serde(default)]
    pub hot_video: HotVideoConfig,
    #[serde(default)]
    pub bloom: BloomConfig,
    #[serde(default)]
    pub existence: ExistenceConfig,
    #[serde(default)]
    pub counters: CounterConfig,
    #[serde(default)]
    pub likes: LikeBatchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub env: String,
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            env: "development".to_string(),
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/feed".to_string(),
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    #[serde(default = "default_kafka_bootstrap_servers")]
    pub bootstrap_servers: String,
    #[serde(default = "default_kafka_group_id")]
    pub group_id: String,
    pub fanout_topic: String,
    pub like_topic: String,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: default_kafka_bootstrap_servers(),
            group_id: default_kafka_group_id(),
            fanout_topic: "video.fanout".to_string(),
            like_topic: "video.like".to_string(),
        }
    }
}

/// Read-path settings for feed assembly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Maximum entries kept per viewer timeline
    pub timeline_max_size: usize,
    /// Timeline expiry after inactivity (seconds)
    pub timeline_ttl_secs: u64,
    /// Cap on followed authors queried in pull mode
    pub follow_pull_limit: usize,
    /// Share of a mixed page filled from the following path
    pub mixed_following_ratio: f64,
    /// Candidates fetched per requested item, before dedup
    pub candidate_overfetch: usize,
    pub max_page_size: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            timeline_max_size: 1000,
            timeline_ttl_secs: 7 * 24 * 3600,
            follow_pull_limit: 200,
            mixed_following_ratio: 0.3,
            candidate_overfetch: 3,
            max_page_size: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanoutConfig {
    /// Authors with at least this many followers go through the broker
    pub push_threshold: i64,
    pub batch_size: i64,
    pub classification_ttl_secs: u64,
    /// Budget for fan-out work detached from the triggering request
    pub detached_budget_secs: u64,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            push_threshold: 10_000,
            batch_size: 500,
            classification_ttl_secs: 3600,
            detached_budget_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HotPoolConfig {
    pub refresh_interval_secs: u64,
    pub candidate_limit: i64,
    pub max_size: usize,
    pub ttl_secs: u64,
}

impl Default for HotPoolConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 600,
            candidate_limit: 2000,
            max_size: 1000,
            ttl_secs: 24 * 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HotVideoConfig {
    pub window_secs: u64,
    pub top_n: usize,
    pub snapshot_ttl_secs: u64,
}

impl Default for HotVideoConfig {
    fn default() -> Self {
        Self {
            window_secs: 60,
            top_n: 100,
            snapshot_ttl_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BloomConfig {
    pub expected_items: usize,
    pub false_positive_rate: f64,
    /// Number of per-viewer filters held in memory
    pub cache_capacity: usize,
    pub persist_ttl_secs: u64,
    pub save_timeout_secs: u64,
}

impl Default for BloomConfig {
    fn default() -> Self {
        Self {
            expected_items: 1_000_000,
            false_positive_rate: 0.0001,
            cache_capacity: 10_000,
            persist_ttl_secs: 7 * 24 * 3600,
            save_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExistenceConfig {
    pub expected_items: usize,
    pub false_positive_rate: f64,
    pub page_size: i64,
    pub rebuild_interval_secs: u64,
}

impl Default for ExistenceConfig {
    fn default() -> Self {
        Self {
            expected_items: 10_000_000,
            false_positive_rate: 0.001,
            page_size: 1000,
            rebuild_interval_secs: 24 * 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterConfig {
    pub ttl_secs: u64,
    pub sync_interval_secs: u64,
}

impl Default for CounterConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 7 * 24 * 3600,
            sync_interval_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LikeBatchConfig {
    pub batch_size: usize,
    pub flush_interval_ms: u64,
}

impl Default for LikeBatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_interval_ms: 1000,
        }
    }
}

impl LikeBatchConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let defaults = Config::default();

        Ok(Config {
            app: AppConfig {
                env: std::env::var("APP_ENV").unwrap_or(defaults.app.env),
                log_level: std::env::var("LOG_LEVEL").unwrap_or(defaults.app.log_level),
            },
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL")
                    .map_err(|_| AppError::Config("DATABASE_URL must be set".to_string()))?,
                max_connections: env_or("DATABASE_MAX_CONNECTIONS", defaults.database.max_connections)?,
            },
            redis: RedisConfig {
                url: std::env::var("REDIS_URL").unwrap_or(defaults.redis.url),
            },
            kafka: KafkaConfig {
                bootstrap_servers: std::env::var("KAFKA_BOOTSTRAP_SERVERS")
                    .unwrap_or_else(|_| default_kafka_bootstrap_servers()),
                group_id: std::env::var("KAFKA_GROUP_ID")
                    .unwrap_or_else(|_| default_kafka_group_id()),
                fanout_topic: std::env::var("KAFKA_FANOUT_TOPIC")
                    .unwrap_or(defaults.kafka.fanout_topic),
                like_topic: std::env::var("KAFKA_LIKE_TOPIC").unwrap_or(defaults.kafka.like_topic),
            },
            feed: FeedConfig {
                timeline_max_size: env_or("TIMELINE_MAX_SIZE", defaults.feed.timeline_max_size)?,
                timeline_ttl_secs: env_or("TIMELINE_TTL_SECS", defaults.feed.timeline_ttl_secs)?,
                follow_pull_limit: env_or("FOLLOW_PULL_LIMIT", defaults.feed.follow_pull_limit)?,
                mixed_following_ratio: env_or(
                    "MIXED_FOLLOWING_RATIO",
                    defaults.feed.mixed_following_ratio,
                )?,
                candidate_overfetch: env_or(
                    "FEED_CANDIDATE_OVERFETCH",
                    defaults.feed.candidate_overfetch,
                )?,
                max_page_size: env_or("FEED_MAX_PAGE_SIZE", defaults.feed.max_page_size)?,
            },
            fanout: FanoutConfig {
                push_threshold: env_or("PUSH_THRESHOLD", defaults.fanout.push_threshold)?,
                batch_size: env_or("FANOUT_BATCH_SIZE", defaults.fanout.batch_size)?,
                classification_ttl_secs: env_or(
                    "FANOUT_CLASSIFICATION_TTL_SECS",
                    defaults.fanout.classification_ttl_secs,
                )?,
                detached_budget_secs: env_or(
                    "FANOUT_DETACHED_BUDGET_SECS",
                    defaults.fanout.detached_budget_secs,
                )?,
            },
            hot_pool: HotPoolConfig {
                refresh_interval_secs: env_or(
                    "HOT_POOL_REFRESH_SECS",
                    defaults.hot_pool.refresh_interval_secs,
                )?,
                candidate_limit: env_or("HOT_POOL_CANDIDATES", defaults.hot_pool.candidate_limit)?,
                max_size: env_or("HOT_POOL_MAX_SIZE", defaults.hot_pool.max_size)?,
                ttl_secs: defaults.hot_pool.ttl_secs,
            },
            hot_video: HotVideoConfig {
                window_secs: env_or("HOT_VIDEO_WINDOW_SECS", defaults.hot_video.window_secs)?,
                top_n: env_or("HOT_VIDEO_TOP_N", defaults.hot_video.top_n)?,
                snapshot_ttl_secs: defaults.hot_video.snapshot_ttl_secs,
            },
            bloom: BloomConfig {
                expected_items: env_or("BLOOM_EXPECTED_ITEMS", defaults.bloom.expected_items)?,
                false_positive_rate: env_or(
                    "BLOOM_FALSE_POSITIVE_RATE",
                    defaults.bloom.false_positive_rate,
                )?,
                cache_capacity: env_or("BLOOM_CACHE_CAPACITY", defaults.bloom.cache_capacity)?,
                persist_ttl_secs: defaults.bloom.persist_ttl_secs,
                save_timeout_secs: defaults.bloom.save_timeout_secs,
            },
            existence: ExistenceConfig {
                expected_items: env_or(
                    "EXISTENCE_EXPECTED_ITEMS",
                    defaults.existence.expected_items,
                )?,
                false_positive_rate: defaults.existence.false_positive_rate,
                page_size: defaults.existence.page_size,
                rebuild_interval_secs: env_or(
                    "EXISTENCE_REBUILD_SECS",
                    defaults.existence.rebuild_interval_secs,
                )?,
            },
            counters: CounterConfig {
                ttl_secs: defaults.counters.ttl_secs,
                sync_interval_secs: env_or(
                    "COUNTER_SYNC_INTERVAL_SECS",
                    defaults.counters.sync_interval_secs,
                )?,
            },
            likes: LikeBatchConfig {
                batch_size: env_or("LIKE_BATCH_SIZE", defaults.likes.batch_size)?,
                flush_interval_ms: env_or(
                    "LIKE_FLUSH_INTERVAL_MS",
                    defaults.likes.flush_interval_ms,
                )?,
            },
        })
    }
}

/// Parse an optional environment variable, falling back to `default` when unset.
fn env_or<T: FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| AppError::Config(format!("{} has an invalid value: {}", name, raw))),
        Err(_) => Ok(default),
    }
}

fn default_kafka_bootstrap_servers() -> String {
    "localhost:9092".to_string()
}

fn default_kafka_group_id() -> String {
    "feed-service-group".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_service_contract() {
        let config = Config::default();
        assert_eq!(config.fanout.push_threshold, 10_000);
        assert_eq!(config.fanout.batch_size, 500);
        assert_eq!(config.hot_pool.candidate_limit, 2000);
        assert_eq!(config.hot_pool.refresh_interval_secs, 600);
        assert_eq!(config.hot_video.snapshot_ttl_secs, 300);
        assert_eq!(config.bloom.persist_ttl_secs, 604_800);
        assert_eq!(config.counters.sync_interval_secs, 300);
    }

    #[test]
    fn test_env_or_falls_back_when_unset() {
        let value: usize = env_or("FEED_SERVICE_TEST_SURELY_UNSET", 42).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_env_or_rejects_garbage() {
        std::env::set_var("FEED_SERVICE_TEST_GARBAGE", "not-a-number");
        let value: Result<u64> = env_or("FEED_SERVICE_TEST_GARBAGE", 1);
        assert!(matches!(value, Err(AppError::Config(_))));
    }
}
