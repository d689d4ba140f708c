use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use thiserror::Error;

use super::history::{ConversationTurn, HistoryError, TurnCache};
use super::quota::{PeriodKey, QuotaDecision, QuotaStore, QuotaStoreError};

// KEYS[1] = counter
// ARGV[1] = delta, ARGV[2] = limit, ARGV[3] = period end (epoch seconds)
// Returns {allowed (0/1), used after the call}.
const ADJUST_SCRIPT: &str = r#"
local delta = tonumber(ARGV[1])
local limit = tonumber(ARGV[2])
local expires_at = tonumber(ARGV[3])

local existed = redis.call("EXISTS", KEYS[1])
local before = tonumber(redis.call("GET", KEYS[1]) or "0")
local after = before + delta
if after < 0 then
  after = 0
end

if delta > 0 and after > limit then
  return {0, before}
end

if existed == 0 then
  redis.call("SET", KEYS[1], after)
  redis.call("EXPIREAT", KEYS[1], expires_at)
elseif after ~= before then
  redis.call("INCRBY", KEYS[1], after - before)
end
return {1, after}
"#;

#[derive(Clone, Debug)]
pub struct RedisStore {
    client: redis::Client,
    prefix: String,
}

#[derive(Debug, Error)]
pub enum RedisStoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unexpected script response: {0:?}")]
    UnexpectedReply(Vec<i64>),
}

impl From<RedisStoreError> for QuotaStoreError {
    fn from(err: RedisStoreError) -> Self {
        QuotaStoreError::unavailable(err.to_string())
    }
}

impl From<RedisStoreError> for HistoryError {
    fn from(err: RedisStoreError) -> Self {
        HistoryError::cache(err.to_string())
    }
}

impl RedisStore {
    pub fn new(url: impl AsRef<str>) -> Result<Self, RedisStoreError> {
        Ok(Self {
            client: redis::Client::open(url.as_ref())?,
            prefix: "chatgate".to_string(),
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, redis::RedisError> {
        self.client.get_multiplexed_async_connection().await
    }

    pub async fn ping(&self) -> Result<(), RedisStoreError> {
        let mut conn = self.connection().await?;
        let _: Option<String> = conn.get(format!("{}:__ping__", self.prefix)).await?;
        Ok(())
    }

    fn key_quota(&self, user: &str, period: &PeriodKey) -> String {
        format!("{}:quota:{user}:{}", self.prefix, period.label)
    }

    fn key_history(&self, user: &str) -> String {
        format!("{}:history:{user}", self.prefix)
    }

    pub async fn adjust_counter(
        &self,
        user: &str,
        period: &PeriodKey,
        delta: i64,
        limit: i64,
    ) -> Result<QuotaDecision, RedisStoreError> {
        let mut conn = self.connection().await?;
        let expires_at = i64::try_from(period.expires_at).unwrap_or(i64::MAX);

        let script = redis::Script::new(ADJUST_SCRIPT);
        let reply: Vec<i64> = script
            .key(self.key_quota(user, period))
            .arg(delta)
            .arg(limit)
            .arg(expires_at)
            .invoke_async(&mut conn)
            .await?;

        match reply.as_slice() {
            [allowed, used] => Ok(QuotaDecision::new(*allowed == 1, *used, limit)),
            _ => Err(RedisStoreError::UnexpectedReply(reply)),
        }
    }

    pub async fn counter_used(
        &self,
        user: &str,
        period: &PeriodKey,
    ) -> Result<i64, RedisStoreError> {
        let mut conn = self.connection().await?;
        let used: Option<i64> = conn.get(self.key_quota(user, period)).await?;
        Ok(used.unwrap_or(0))
    }

    pub async fn push_turn(
        &self,
        user: &str,
        turn: &ConversationTurn,
        bound: usize,
        ttl: Duration,
    ) -> Result<(), RedisStoreError> {
        let mut conn = self.connection().await?;
        let key = self.key_history(user);
        let payload = serde_json::to_string(turn)?;
        let stop = isize::try_from(bound.max(1)).unwrap_or(isize::MAX) - 1;
        let ttl_secs = i64::try_from(ttl.as_secs().max(1)).unwrap_or(i64::MAX);

        let mut pipe = redis::pipe();
        pipe.atomic()
            .lpush(&key, payload)
            .ignore()
            .ltrim(&key, 0, stop)
            .ignore()
            .expire(&key, ttl_secs)
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    /// Entries that fail to decode are skipped.
    pub async fn range_turns(
        &self,
        user: &str,
        limit: usize,
    ) -> Result<Vec<ConversationTurn>, RedisStoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.connection().await?;
        let stop = isize::try_from(limit).unwrap_or(isize::MAX) - 1;
        let raw: Vec<String> = conn.lrange(self.key_history(user), 0, stop).await?;

        Ok(raw
            .iter()
            .filter_map(|entry| match serde_json::from_str::<ConversationTurn>(entry) {
                Ok(turn) => Some(turn),
                Err(err) => {
                    tracing::debug!(user_id = user, error = %err, "skipping undecodable history entry");
                    None
                }
            })
            .collect())
    }
}

#[async_trait]
impl QuotaStore for RedisStore {
    async fn adjust(
        &self,
        user: &str,
        period: &PeriodKey,
        delta: i64,
        limit: i64,
    ) -> Result<QuotaDecision, QuotaStoreError> {
        Ok(self.adjust_counter(user, period, delta, limit).await?)
    }

    async fn used(&self, user: &str, period: &PeriodKey) -> Result<i64, QuotaStoreError> {
        Ok(self.counter_used(user, period).await?)
    }
}

#[async_trait]
impl TurnCache for RedisStore {
    async fn push(
        &self,
        user: &str,
        turn: &ConversationTurn,
        bound: usize,
        ttl: Duration,
    ) -> Result<(), HistoryError> {
        Ok(self.push_turn(user, turn, bound, ttl).await?)
    }

    async fn range(
        &self,
        user: &str,
        limit: usize,
    ) -> Result<Vec<ConversationTurn>, HistoryError> {
        Ok(self.range_turns(user, limit).await?)
    }
}

#[cfg(test)]
mod tests;
