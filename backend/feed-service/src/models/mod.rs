use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{AppError, Result};

/// One video reference in an assembled feed page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedItem {
    pub video_id: i64,
    pub author_id: i64,
    pub timestamp: i64,
    /// Publish time for timelines, decayed popularity for the hot pool
    pub score: f64,
}

/// Sorted-set member shared by viewer timelines and the hot pool.
///
/// Encoded as `videoId:authorId:timestamp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub video_id: i64,
    pub author_id: i64,
    pub timestamp: i64,
}

impl TimelineEntry {
    pub fn new(video_id: i64, author_id: i64, timestamp: i64) -> Self {
        Self {
            video_id,
            author_id,
            timestamp,
        }
    }

    pub fn encode(&self) -> String {
        format!("{}:{}:{}", self.video_id, self.author_id, self.timestamp)
    }

    pub fn decode(member: &str) -> Result<Self> {
        let mut parts = member.splitn(3, ':');
        let mut next = |name: &str| -> Result<i64> {
            parts
                .next()
                .ok_or_else(|| AppError::Codec(format!("member {} is missing {}", member, name)))?
                .parse::<i64>()
                .map_err(|_| AppError::Codec(format!("member {} has a bad {}", member, name)))
        };

        let video_id = next("video id")?;
        let author_id = next("author id")?;
        let timestamp = next("timestamp")?;
        Ok(Self::new(video_id, author_id, timestamp))
    }

    pub fn into_feed_item(self, score: f64) -> FeedItem {
        FeedItem {
            video_id: self.video_id,
            author_id: self.author_id,
            timestamp: self.timestamp,
            score,
        }
    }
}

/// Requested feed flavour. Wire codes: 1 following, 2 recommend, 3 hot, 4 mixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeedType {
    Following,
    Recommend,
    Hot,
    Mixed,
}

impl FeedType {
    /// Unknown codes fall back to the mixed feed.
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => FeedType::Following,
            2 => FeedType::Recommend,
            3 => FeedType::Hot,
            _ => FeedType::Mixed,
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            FeedType::Following => 1,
            FeedType::Recommend => 2,
            FeedType::Hot => 3,
            FeedType::Mixed => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FeedType::Following => "following",
            FeedType::Recommend => "recommend",
            FeedType::Hot => "hot",
            FeedType::Mixed => "mixed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FeedRequest {
    /// 0 means anonymous
    pub viewer_id: i64,
    /// Only items strictly older than this are returned
    pub cursor: i64,
    pub page_size: usize,
    pub feed_type: FeedType,
}

#[derive(Debug, Clone, Default)]
pub struct FeedPage {
    pub items: Vec<FeedItem>,
    pub next_cursor: i64,
}

/// Publish payload handed to the broker for high-fanout authors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanoutEvent {
    pub video_id: i64,
    pub author_id: i64,
    pub timestamp: i64,
}

impl FanoutEvent {
    pub fn entry(&self) -> TimelineEntry {
        TimelineEntry::new(self.video_id, self.author_id, self.timestamp)
    }
}

/// Like/unlike event consumed from the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LikeEvent {
    pub user_id: i64,
    pub target_id: i64,
    pub target_type: i32,
    pub favorite_type: i32,
    #[serde(default)]
    pub is_deleted: bool,
    pub timestamp: i64,
}

impl LikeEvent {
    /// Identity of the favorite relation this event mutates.
    pub fn key(&self) -> (i64, i64, i32, i32) {
        (
            self.user_id,
            self.target_id,
            self.target_type,
            self.favorite_type,
        )
    }
}

/// Engagement statistics for one hot-pool candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoStats {
    pub video_id: i64,
    pub author_id: i64,
    pub like_count: i64,
    pub comment_count: i64,
    /// Upload time, unix seconds
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoRecord {
    pub video_id: i64,
    pub author_id: i64,
    pub created_at: i64,
}

/// Counter snapshot for one user, field name to value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserCounters {
    pub user_id: i64,
    pub fields: HashMap<String, i64>,
}

impl UserCounters {
    pub fn get(&self, field: &str) -> i64 {
        self.fields.get(field).copied().unwrap_or(0)
    }
}

/// One page of a paged repository read.
#[derive(Debug, Clone, Default)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeline_entry_member_format() {
        let entry = TimelineEntry::new(42, 7, 1000);
        assert_eq!(entry.encode(), "42:7:1000");
        assert_eq!(TimelineEntry::decode("42:7:1000").unwrap(), entry);
    }

    #[test]
    fn test_timeline_entry_rejects_malformed_member() {
        assert!(TimelineEntry::decode("42:7").is_err());
        assert!(TimelineEntry::decode("x:7:1000").is_err());
        assert!(TimelineEntry::decode("").is_err());
    }

    #[test]
    fn test_feed_type_unknown_code_is_mixed() {
        assert_eq!(FeedType::from_code(1), FeedType::Following);
        assert_eq!(FeedType::from_code(3), FeedType::Hot);
        assert_eq!(FeedType::from_code(0), FeedType::Mixed);
        assert_eq!(FeedType::from_code(99), FeedType::Mixed);
    }

    #[test]
    fn test_like_event_defaults_is_deleted() {
        let json = r#"{"user_id":1,"target_id":2,"target_type":1,"favorite_type":1,"timestamp":5}"#;
        let event: LikeEvent = serde_json::from_str(json).unwrap();
        assert!(!event.is_deleted);
        assert_eq!(event.key(), (1, 2, 1, 1));
    }

    #[test]
    fn test_user_counters_missing_field_is_zero() {
        let counters = UserCounters::default();
        assert_eq!(counters.get("follow_count"), 0);
    }
}
