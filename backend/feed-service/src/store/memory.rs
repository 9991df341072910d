//! In-process cache store
//!
//! Mirrors the Redis semantics the feed core relies on (score ordering,
//! rank ranges, lazy TTL expiry, empty collections disappear). Used by the
//! test suites and for single-node local runs.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::{CacheStore, StoreCommand};
use crate::error::{AppError, Result};

#[derive(Debug, Clone)]
enum Value {
    Bytes(Vec<u8>),
    ZSet(HashMap<String, f64>),
    Set(HashSet<String>),
    Hash(HashMap<String, i64>),
}

impl Value {
    fn is_empty(&self) -> bool {
        match self {
            Value::Bytes(_) => false,
            Value::ZSet(m) => m.is_empty(),
            Value::Set(s) => s.is_empty(),
            Value::Hash(h) => h.is_empty(),
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    failing_batches: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` atomic batches fail without applying anything.
    pub fn fail_next_batches(&self, n: usize) {
        self.failing_batches.store(n, Ordering::SeqCst);
    }

    /// Remaining time to live of a key, `None` when missing or persistent.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let mut entries = self.lock().ok()?;
        let entry = live_entry(&mut entries, key)?;
        entry
            .expires_at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn exists(&self, key: &str) -> bool {
        self.lock()
            .map(|mut entries| live_entry(&mut entries, key).is_some())
            .unwrap_or(false)
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Entry>>> {
        self.entries
            .lock()
            .map_err(|_| AppError::Internal("memory store lock poisoned".to_string()))
    }
}

fn live_entry<'a>(entries: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
    let expired = entries
        .get(key)
        .and_then(|e| e.expires_at)
        .map(|at| at <= Instant::now())
        .unwrap_or(false);
    if expired {
        entries.remove(key);
        return None;
    }
    entries.get_mut(key)
}

fn wrong_type(key: &str) -> AppError {
    AppError::Internal(format!(
        "WRONGTYPE operation against key {} holding the wrong kind of value",
        key
    ))
}

/// Resolve a Redis-style inclusive rank range against `len` members.
fn rank_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { start + len } else { start }.max(0);
    let stop = if stop < 0 { stop + len } else { stop }.min(len - 1);
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

/// Members ordered by descending score, ties by descending member.
fn sorted_desc(zset: &HashMap<String, f64>) -> Vec<(String, f64)> {
    let mut members: Vec<(String, f64)> = zset.iter().map(|(m, s)| (m.clone(), *s)).collect();
    members.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
    members
}

fn zset_mut<'a>(entries: &'a mut HashMap<String, Entry>, key: &str) -> Result<&'a mut HashMap<String, f64>> {
    if live_entry(entries, key).is_none() {
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::ZSet(HashMap::new()),
                expires_at: None,
            },
        );
    }
    match entries.get_mut(key).map(|e| &mut e.value) {
        Some(Value::ZSet(zset)) => Ok(zset),
        _ => Err(wrong_type(key)),
    }
}

fn set_mut<'a>(entries: &'a mut HashMap<String, Entry>, key: &str) -> Result<&'a mut HashSet<String>> {
    if live_entry(entries, key).is_none() {
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Set(HashSet::new()),
                expires_at: None,
            },
        );
    }
    match entries.get_mut(key).map(|e| &mut e.value) {
        Some(Value::Set(set)) => Ok(set),
        _ => Err(wrong_type(key)),
    }
}

fn hash_mut<'a>(entries: &'a mut HashMap<String, Entry>, key: &str) -> Result<&'a mut HashMap<String, i64>> {
    if live_entry(entries, key).is_none() {
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Hash(HashMap::new()),
                expires_at: None,
            },
        );
    }
    match entries.get_mut(key).map(|e| &mut e.value) {
        Some(Value::Hash(hash)) => Ok(hash),
        _ => Err(wrong_type(key)),
    }
}

fn command_key(command: &StoreCommand) -> &str {
    match command {
        StoreCommand::ZAdd { key, .. }
        | StoreCommand::ZIncrBy { key, .. }
        | StoreCommand::ZRemRangeByRank { key, .. }
        | StoreCommand::SAdd { key, .. }
        | StoreCommand::SRem { key, .. }
        | StoreCommand::HIncrBy { key, .. }
        | StoreCommand::Set { key, .. }
        | StoreCommand::Expire { key, .. }
        | StoreCommand::Del { key } => key,
    }
}

fn apply(entries: &mut HashMap<String, Entry>, command: StoreCommand) -> Result<()> {
    match command {
        StoreCommand::ZAdd { key, members } => {
            if members.is_empty() {
                return Ok(());
            }
            let zset = zset_mut(entries, &key)?;
            for (score, member) in members {
                zset.insert(member, score);
            }
        }
        StoreCommand::ZIncrBy { key, member, delta } => {
            let zset = zset_mut(entries, &key)?;
            *zset.entry(member).or_insert(0.0) += delta;
        }
        StoreCommand::ZRemRangeByRank { key, start, stop } => {
            if live_entry(entries, &key).is_none() {
                return Ok(());
            }
            let zset = zset_mut(entries, &key)?;
            let mut ascending = sorted_desc(zset);
            ascending.reverse();
            if let Some((from, to)) = rank_range(ascending.len(), start, stop) {
                for (member, _) in &ascending[from..=to] {
                    zset.remove(member);
                }
            }
        }
        StoreCommand::SAdd { key, members } => {
            if members.is_empty() {
                return Ok(());
            }
            set_mut(entries, &key)?.extend(members);
        }
        StoreCommand::SRem { key, members } => {
            if live_entry(entries, &key).is_none() {
                return Ok(());
            }
            let set = set_mut(entries, &key)?;
            for member in &members {
                set.remove(member);
            }
        }
        StoreCommand::HIncrBy { key, field, delta } => {
            *hash_mut(entries, &key)?.entry(field).or_insert(0) += delta;
        }
        StoreCommand::Set {
            key,
            value,
            ttl_secs,
        } => {
            entries.insert(
                key,
                Entry {
                    value: Value::Bytes(value),
                    expires_at: ttl_secs.map(|ttl| Instant::now() + Duration::from_secs(ttl)),
                },
            );
            return Ok(());
        }
        StoreCommand::Expire { key, ttl_secs } => {
            if let Some(entry) = live_entry(entries, &key) {
                entry.expires_at = Some(Instant::now() + Duration::from_secs(ttl_secs));
            }
            return Ok(());
        }
        StoreCommand::Del { key } => {
            entries.remove(&key);
            return Ok(());
        }
    }
    Ok(())
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut entries = self.lock()?;
        match live_entry(&mut entries, key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Bytes(bytes)) => Ok(Some(bytes.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn zrevrange_withscores(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<(String, f64)>> {
        let mut entries = self.lock()?;
        match live_entry(&mut entries, key).map(|e| &e.value) {
            None => Ok(Vec::new()),
            Some(Value::ZSet(zset)) => {
                let members = sorted_desc(zset);
                Ok(match rank_range(members.len(), start, stop) {
                    Some((from, to)) => members[from..=to].to_vec(),
                    None => Vec::new(),
                })
            }
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn zrevrangebyscore_withscores(
        &self,
        key: &str,
        below: f64,
        limit: usize,
    ) -> Result<Vec<(String, f64)>> {
        let mut entries = self.lock()?;
        match live_entry(&mut entries, key).map(|e| &e.value) {
            None => Ok(Vec::new()),
            Some(Value::ZSet(zset)) => Ok(sorted_desc(zset)
                .into_iter()
                .filter(|(_, score)| *score < below)
                .take(limit)
                .collect()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        let mut entries = self.lock()?;
        match live_entry(&mut entries, key).map(|e| &e.value) {
            None => Ok(0),
            Some(Value::ZSet(zset)) => Ok(zset.len() as u64),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        let mut entries = self.lock()?;
        match live_entry(&mut entries, key).map(|e| &e.value) {
            None => Ok(false),
            Some(Value::Set(set)) => Ok(set.contains(member)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut entries = self.lock()?;
        match live_entry(&mut entries, key).map(|e| &e.value) {
            None => Ok(Vec::new()),
            Some(Value::Set(set)) => Ok(set.iter().cloned().collect()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn hgetall_many(&self, keys: &[String]) -> Result<Vec<HashMap<String, i64>>> {
        let mut entries = self.lock()?;
        keys.iter()
            .map(|key| match live_entry(&mut entries, key).map(|e| &e.value) {
                None => Ok(HashMap::new()),
                Some(Value::Hash(hash)) => Ok(hash.clone()),
                Some(_) => Err(wrong_type(key)),
            })
            .collect()
    }

    async fn exec_atomic(&self, commands: Vec<StoreCommand>) -> Result<()> {
        if self
            .failing_batches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(AppError::Internal("injected batch failure".to_string()));
        }

        let mut entries = self.lock()?;

        // Snapshot touched keys so a failing command rolls the whole batch back
        let touched: HashSet<String> = commands.iter().map(|c| command_key(c).to_string()).collect();
        let snapshot: Vec<(String, Option<Entry>)> = touched
            .into_iter()
            .map(|key| {
                let entry = entries.get(&key).cloned();
                (key, entry)
            })
            .collect();

        for command in commands {
            let key = command_key(&command).to_string();
            if let Err(e) = apply(&mut entries, command) {
                for (key, entry) in snapshot {
                    match entry {
                        Some(entry) => entries.insert(key, entry),
                        None => entries.remove(&key),
                    };
                }
                return Err(e);
            }
            if entries.get(&key).map(|e| e.value.is_empty()).unwrap_or(false) {
                entries.remove(&key);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zadd(key: &str, members: &[(f64, &str)]) -> StoreCommand {
        StoreCommand::ZAdd {
            key: key.to_string(),
            members: members.iter().map(|(s, m)| (*s, m.to_string())).collect(),
        }
    }

    #[tokio::test]
    async fn test_zrevrange_orders_by_score_desc() {
        let store = MemoryStore::new();
        store
            .exec_atomic(vec![zadd("z", &[(1.0, "a"), (3.0, "c"), (2.0, "b")])])
            .await
            .unwrap();

        let all = store.zrevrange_withscores("z", 0, -1).await.unwrap();
        let members: Vec<&str> = all.iter().map(|(m, _)| m.as_str()).collect();
        assert_eq!(members, vec!["c", "b", "a"]);

        let top = store.zrevrange_withscores("z", 0, 0).await.unwrap();
        assert_eq!(top, vec![("c".to_string(), 3.0)]);
    }

    #[tokio::test]
    async fn test_zrevrangebyscore_is_exclusive() {
        let store = MemoryStore::new();
        store
            .exec_atomic(vec![zadd("z", &[(10.0, "a"), (20.0, "b"), (30.0, "c")])])
            .await
            .unwrap();

        let below = store.zrevrangebyscore_withscores("z", 30.0, 10).await.unwrap();
        assert_eq!(below.len(), 2);
        assert_eq!(below[0].0, "b");

        let limited = store.zrevrangebyscore_withscores("z", 100.0, 1).await.unwrap();
        assert_eq!(limited, vec![("c".to_string(), 30.0)]);
    }

    #[tokio::test]
    async fn test_remrangebyrank_trims_lowest_scores() {
        let store = MemoryStore::new();
        store
            .exec_atomic(vec![
                zadd("z", &[(1.0, "a"), (2.0, "b"), (3.0, "c"), (4.0, "d")]),
                StoreCommand::trim_to("z", 2),
            ])
            .await
            .unwrap();

        let remaining = store.zrevrange_withscores("z", 0, -1).await.unwrap();
        let members: Vec<&str> = remaining.iter().map(|(m, _)| m.as_str()).collect();
        assert_eq!(members, vec!["d", "c"]);
    }

    #[tokio::test]
    async fn test_failed_batch_leaves_no_partial_state() {
        let store = MemoryStore::new();
        store
            .exec_atomic(vec![StoreCommand::Set {
                key: "bytes".to_string(),
                value: b"v".to_vec(),
                ttl_secs: None,
            }])
            .await
            .unwrap();

        // Second command hits a string key with a hash op and fails
        let result = store
            .exec_atomic(vec![
                zadd("z", &[(1.0, "a")]),
                StoreCommand::HIncrBy {
                    key: "bytes".to_string(),
                    field: "f".to_string(),
                    delta: 1,
                },
            ])
            .await;

        assert!(result.is_err());
        assert_eq!(store.zcard("z").await.unwrap(), 0);
        assert_eq!(store.get("bytes").await.unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn test_injected_failure_consumes_one_batch() {
        let store = MemoryStore::new();
        store.fail_next_batches(1);

        assert!(store.exec_atomic(vec![zadd("z", &[(1.0, "a")])]).await.is_err());
        assert!(store.exec_atomic(vec![zadd("z", &[(1.0, "a")])]).await.is_ok());
        assert_eq!(store.zcard("z").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_expire_and_ttl() {
        let store = MemoryStore::new();
        store
            .exec_atomic(vec![
                zadd("z", &[(1.0, "a")]),
                StoreCommand::Expire {
                    key: "z".to_string(),
                    ttl_secs: 60,
                },
            ])
            .await
            .unwrap();

        let ttl = store.ttl("z").unwrap();
        assert!(ttl <= Duration::from_secs(60));
        assert!(ttl > Duration::from_secs(55));
        assert!(store.ttl("missing").is_none());
    }

    #[tokio::test]
    async fn test_empty_set_disappears() {
        let store = MemoryStore::new();
        store
            .exec_atomic(vec![StoreCommand::SAdd {
                key: "s".to_string(),
                members: vec!["1".to_string()],
            }])
            .await
            .unwrap();
        store
            .exec_atomic(vec![StoreCommand::SRem {
                key: "s".to_string(),
                members: vec!["1".to_string()],
            }])
            .await
            .unwrap();

        assert!(!store.exists("s"));
    }

    #[test]
    fn test_rank_range_resolution() {
        assert_eq!(rank_range(5, 0, -1), Some((0, 4)));
        assert_eq!(rank_range(5, 0, -3), Some((0, 2)));
        assert_eq!(rank_range(3, 0, -4), None);
        assert_eq!(rank_range(0, 0, -1), None);
        assert_eq!(rank_range(5, 2, 100), Some((2, 4)));
    }
}
