//! Redis-backed cache store
//!
//! Atomic batches are sent as one MULTI/EXEC pipeline.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Pipeline};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{CacheStore, StoreCommand};
use crate::error::{AppError, Result};

#[derive(Clone)]
pub struct RedisStore {
    client: Arc<ConnectionManager>,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let manager = ConnectionManager::new(client).await?;

        Ok(Self {
            client: Arc::new(manager),
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.client.as_ref().clone()
    }

    /// Ping Redis to check connection health and keep connection alive
    pub async fn ping(&self) -> Result<()> {
        redis::cmd("PING")
            .query_async::<_, String>(&mut self.conn())
            .await
            .map_err(|e| {
                warn!("Redis PING failed: {}", e);
                AppError::Redis(e)
            })?;
        Ok(())
    }

    fn push_command(pipe: &mut Pipeline, command: &StoreCommand) {
        match command {
            StoreCommand::ZAdd { key, members } => {
                if !members.is_empty() {
                    pipe.zadd_multiple(key, members.as_slice()).ignore();
                }
            }
            StoreCommand::ZIncrBy { key, member, delta } => {
                pipe.zincr(key, member, *delta).ignore();
            }
            StoreCommand::ZRemRangeByRank { key, start, stop } => {
                pipe.zremrangebyrank(key, *start, *stop).ignore();
            }
            StoreCommand::SAdd { key, members } => {
                if !members.is_empty() {
                    pipe.sadd(key, members).ignore();
                }
            }
            StoreCommand::SRem { key, members } => {
                if !members.is_empty() {
                    pipe.srem(key, members).ignore();
                }
            }
            StoreCommand::HIncrBy { key, field, delta } => {
                pipe.hincr(key, field, *delta).ignore();
            }
            StoreCommand::Set {
                key,
                value,
                ttl_secs: Some(ttl),
            } => {
                pipe.set_ex(key, value.as_slice(), *ttl).ignore();
            }
            StoreCommand::Set {
                key,
                value,
                ttl_secs: None,
            } => {
                pipe.set(key, value.as_slice()).ignore();
            }
            StoreCommand::Expire { key, ttl_secs } => {
                pipe.expire(key, *ttl_secs as i64).ignore();
            }
            StoreCommand::Del { key } => {
                pipe.del(key).ignore();
            }
        }
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let value: Option<Vec<u8>> = self.conn().get(key).await?;
        Ok(value)
    }

    async fn zrevrange_withscores(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<(String, f64)>> {
        let members: Vec<(String, f64)> =
            self.conn().zrevrange_withscores(key, start, stop).await?;
        Ok(members)
    }

    async fn zrevrangebyscore_withscores(
        &self,
        key: &str,
        below: f64,
        limit: usize,
    ) -> Result<Vec<(String, f64)>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        // "(" makes the upper bound exclusive
        let max = format!("({}", below);
        let members: Vec<(String, f64)> = self
            .conn()
            .zrevrangebyscore_limit_withscores(key, max, "-inf", 0, limit as isize)
            .await?;
        Ok(members)
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        let count: u64 = self.conn().zcard(key).await?;
        Ok(count)
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        let present: bool = self.conn().sismember(key, member).await?;
        Ok(present)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let members: Vec<String> = self.conn().smembers(key).await?;
        Ok(members)
    }

    async fn hgetall_many(&self, keys: &[String]) -> Result<Vec<HashMap<String, i64>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = Pipeline::new();
        for key in keys {
            pipe.hgetall(key);
        }

        let values: Vec<HashMap<String, i64>> = pipe.query_async(&mut self.conn()).await?;
        Ok(values)
    }

    async fn exec_atomic(&self, commands: Vec<StoreCommand>) -> Result<()> {
        if commands.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for command in &commands {
            Self::push_command(&mut pipe, command);
        }

        pipe.query_async::<_, ()>(&mut self.conn())
            .await
            .map_err(|e| {
                warn!(commands = commands.len(), error = %e, "Redis atomic batch failed");
                AppError::Redis(e)
            })?;

        debug!(commands = commands.len(), "Redis atomic batch applied");
        Ok(())
    }
}
