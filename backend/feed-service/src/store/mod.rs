//! Fast cache store capability
//!
//! Everything the feed core keeps in the cache (timelines, the hot pool,
//! request windows, filters, classification flags, counters) goes through
//! [`CacheStore`]. Multi-step mutations on one logical entity are issued as a
//! single [`CacheStore::exec_atomic`] batch, which applies every command or
//! none of them.
//!
//! Key schema:
//! - `feed:timeline:{viewer_id}` → sorted set of `videoId:authorId:ts`, score = ts
//! - `feed:hot_pool` → sorted set, score = hot score
//! - `hot:video:req:{bucket}` → sorted set, score = request count
//! - `hot:video:top` → set of video ids
//! - `bloom:user:{viewer_id}` → bincode filter
//! - `fanout:bigv:{author_id}` → "1" / "0"
//! - `user:counters:{user_id}` → hash field → i64
//! - `user:counters:dirty` → set of user ids

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use async_trait::async_trait;
use std::collections::HashMap;

use crate::error::Result;

/// One mutation inside an atomic batch.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreCommand {
    ZAdd {
        key: String,
        members: Vec<(f64, String)>,
    },
    ZIncrBy {
        key: String,
        member: String,
        delta: f64,
    },
    /// Ranks are ascending by score; negative ranks count from the top.
    ZRemRangeByRank {
        key: String,
        start: isize,
        stop: isize,
    },
    SAdd {
        key: String,
        members: Vec<String>,
    },
    SRem {
        key: String,
        members: Vec<String>,
    },
    HIncrBy {
        key: String,
        field: String,
        delta: i64,
    },
    Set {
        key: String,
        value: Vec<u8>,
        ttl_secs: Option<u64>,
    },
    Expire {
        key: String,
        ttl_secs: u64,
    },
    Del {
        key: String,
    },
}

impl StoreCommand {
    /// Keep only the `max_len` highest-scored members of a sorted set.
    pub fn trim_to(key: impl Into<String>, max_len: usize) -> Self {
        StoreCommand::ZRemRangeByRank {
            key: key.into(),
            start: 0,
            stop: -(max_len as isize) - 1,
        }
    }
}

#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Members by descending score, inclusive rank range.
    async fn zrevrange_withscores(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<(String, f64)>>;

    /// Up to `limit` members with score strictly below `below`, descending.
    async fn zrevrangebyscore_withscores(
        &self,
        key: &str,
        below: f64,
        limit: usize,
    ) -> Result<Vec<(String, f64)>>;

    async fn zcard(&self, key: &str) -> Result<u64>;

    async fn sismember(&self, key: &str, member: &str) -> Result<bool>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    /// Pipelined HGETALL; missing hashes come back empty.
    async fn hgetall_many(&self, keys: &[String]) -> Result<Vec<HashMap<String, i64>>>;

    async fn exec_atomic(&self, commands: Vec<StoreCommand>) -> Result<()>;
}

pub mod keys {
    pub const HOT_POOL: &str = "feed:hot_pool";
    pub const HOT_VIDEO_TOP: &str = "hot:video:top";
    pub const DIRTY_COUNTERS: &str = "user:counters:dirty";

    pub fn timeline(viewer_id: i64) -> String {
        format!("feed:timeline:{}", viewer_id)
    }

    pub fn hot_video_window(bucket: i64) -> String {
        format!("hot:video:req:{}", bucket)
    }

    pub fn user_bloom(viewer_id: i64) -> String {
        format!("bloom:user:{}", viewer_id)
    }

    pub fn big_v(author_id: i64) -> String {
        format!("fanout:bigv:{}", author_id)
    }

    pub fn user_counters(user_id: i64) -> String {
        format!("user:counters:{}", user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_format() {
        assert_eq!(keys::timeline(7), "feed:timeline:7");
        assert_eq!(keys::user_bloom(7), "bloom:user:7");
        assert_eq!(keys::big_v(3), "fanout:bigv:3");
        assert_eq!(keys::user_counters(9), "user:counters:9");
        assert_eq!(keys::hot_video_window(28_000_000), "hot:video:req:28000000");
    }

    #[test]
    fn test_trim_to_keeps_top_members() {
        assert_eq!(
            StoreCommand::trim_to("k", 1000),
            StoreCommand::ZRemRangeByRank {
                key: "k".to_string(),
                start: 0,
                stop: -1001,
            }
        );
    }
}
