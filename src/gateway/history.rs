//! Cache-aside conversation log.
//!
//! The durable [`TurnStore`] is the source of truth. The [`TurnCache`] keeps at most
//! `cache_bound` recent turns per user and can be dropped at any time.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::config::HistoryConfig;
use super::now_millis;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = HistoryError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            other => Err(HistoryError::Durable {
                message: format!("unknown role: {other}"),
            }),
        }
    }
}

/// One entry of a user's conversation, as served to readers and kept in the cache.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub text: String,
}

impl ConversationTurn {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
        }
    }
}

/// A durable row. `seq` is assigned by the store and orders a user's turns.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnRecord {
    pub seq: i64,
    pub user_id: String,
    pub role: Role,
    pub text: String,
    pub created_at_ms: i64,
}

impl TurnRecord {
    pub fn turn(&self) -> ConversationTurn {
        ConversationTurn::new(self.role, self.text.clone())
    }
}

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history store error: {message}")]
    Durable { message: String },
    #[error("history cache error: {message}")]
    Cache { message: String },
}

impl HistoryError {
    pub fn durable(message: impl Into<String>) -> Self {
        Self::Durable {
            message: message.into(),
        }
    }

    pub fn cache(message: impl Into<String>) -> Self {
        Self::Cache {
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait TurnStore: Send + Sync {
    async fn append(&self, user: &str, role: Role, text: &str)
    -> Result<TurnRecord, HistoryError>;

    /// Most recent first, at most `limit` rows.
    async fn recent(&self, user: &str, limit: usize)
    -> Result<Vec<ConversationTurn>, HistoryError>;
}

#[async_trait]
pub trait TurnCache: Send + Sync {
    /// Pushes `turn` to the front of the user's list, trims it to `bound` entries and
    /// refreshes its expiry.
    async fn push(
        &self,
        user: &str,
        turn: &ConversationTurn,
        bound: usize,
        ttl: Duration,
    ) -> Result<(), HistoryError>;

    async fn range(&self, user: &str, limit: usize)
    -> Result<Vec<ConversationTurn>, HistoryError>;
}

pub struct HistoryStore {
    durable: Arc<dyn TurnStore>,
    cache: Option<Arc<dyn TurnCache>>,
    config: HistoryConfig,
}

impl HistoryStore {
    pub fn new(durable: Arc<dyn TurnStore>, config: HistoryConfig) -> Self {
        Self {
            durable,
            cache: None,
            config,
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn TurnCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub async fn append(
        &self,
        user: &str,
        role: Role,
        text: &str,
    ) -> Result<TurnRecord, HistoryError> {
        let record = self.durable.append(user, role, text).await?;

        if let Some(cache) = self.cache.as_ref() {
            let ttl = Duration::from_secs(self.config.cache_ttl_secs);
            if let Err(err) = cache
                .push(user, &record.turn(), self.config.cache_bound, ttl)
                .await
            {
                tracing::warn!(user_id = user, error = %err, "history cache write failed");
            }
        }

        Ok(record)
    }

    /// Most recent first. A non-empty cache read is returned as is; otherwise the
    /// durable store answers.
    pub async fn list(
        &self,
        user: &str,
        limit: i64,
    ) -> Result<Vec<ConversationTurn>, HistoryError> {
        let limit = self.normalize_limit(limit);

        if let Some(cache) = self.cache.as_ref() {
            match cache.range(user, limit).await {
                Ok(turns) if !turns.is_empty() => return Ok(turns),
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(user_id = user, error = %err, "history cache read failed");
                }
            }
        }

        self.durable.recent(user, limit).await
    }

    fn normalize_limit(&self, limit: i64) -> usize {
        if limit <= 0 {
            self.config.default_list_limit.max(1)
        } else {
            usize::try_from(limit).unwrap_or(usize::MAX)
        }
    }
}

#[derive(Debug, Default)]
struct MemoryTurnRows {
    rows: Vec<TurnRecord>,
    next_seq: i64,
}

/// In-process durable store, for tests and single-instance deployments without SQLite.
#[derive(Debug, Default)]
pub struct MemoryTurnStore {
    inner: Mutex<MemoryTurnRows>,
}

impl MemoryTurnStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows_for(&self, user: &str) -> Vec<TurnRecord> {
        self.inner
            .lock()
            .map(|inner| {
                inner
                    .rows
                    .iter()
                    .filter(|row| row.user_id == user)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl TurnStore for MemoryTurnStore {
    async fn append(
        &self,
        user: &str,
        role: Role,
        text: &str,
    ) -> Result<TurnRecord, HistoryError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| HistoryError::durable("memory history lock poisoned"))?;
        inner.next_seq += 1;
        let record = TurnRecord {
            seq: inner.next_seq,
            user_id: user.to_string(),
            role,
            text: text.to_string(),
            created_at_ms: now_millis(),
        };
        inner.rows.push(record.clone());
        Ok(record)
    }

    async fn recent(
        &self,
        user: &str,
        limit: usize,
    ) -> Result<Vec<ConversationTurn>, HistoryError> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| HistoryError::durable("memory history lock poisoned"))?;
        Ok(inner
            .rows
            .iter()
            .rev()
            .filter(|row| row.user_id == user)
            .take(limit)
            .map(TurnRecord::turn)
            .collect())
    }
}

#[derive(Debug)]
struct CachedTurns {
    turns: VecDeque<ConversationTurn>,
    expires_at: Instant,
}

const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
struct CachedLists {
    entries: HashMap<String, CachedTurns>,
    swept_at: Option<Instant>,
}

impl CachedLists {
    fn sweep_expired(&mut self, now: Instant, interval: Duration) {
        let due = self
            .swept_at
            .is_none_or(|swept_at| now.duration_since(swept_at) >= interval);
        if due {
            self.entries.retain(|_, entry| entry.expires_at > now);
            self.swept_at = Some(now);
        }
    }
}

#[derive(Debug)]
pub struct MemoryTurnCache {
    lists: Mutex<CachedLists>,
    sweep_interval: Duration,
}

impl Default for MemoryTurnCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTurnCache {
    pub fn new() -> Self {
        Self {
            lists: Mutex::new(CachedLists::default()),
            sweep_interval: CACHE_SWEEP_INTERVAL,
        }
    }

    /// Minimum time between sweeps of expired lists on write.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Drops the cached list for `user`, as an expiry or eviction would.
    pub fn invalidate(&self, user: &str) {
        if let Ok(mut lists) = self.lists.lock() {
            lists.entries.remove(user);
        }
    }

    pub fn len(&self) -> usize {
        self.lists
            .lock()
            .map(|lists| lists.entries.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TurnCache for MemoryTurnCache {
    async fn push(
        &self,
        user: &str,
        turn: &ConversationTurn,
        bound: usize,
        ttl: Duration,
    ) -> Result<(), HistoryError> {
        let now = Instant::now();
        let mut lists = self
            .lists
            .lock()
            .map_err(|_| HistoryError::cache("memory cache lock poisoned"))?;
        lists.sweep_expired(now, self.sweep_interval);

        let entry = lists
            .entries
            .entry(user.to_string())
            .or_insert_with(|| CachedTurns {
                turns: VecDeque::new(),
                expires_at: now,
            });
        if entry.expires_at <= now {
            entry.turns.clear();
        }
        entry.turns.push_front(turn.clone());
        entry.turns.truncate(bound);
        entry.expires_at = now + ttl;
        Ok(())
    }

    async fn range(
        &self,
        user: &str,
        limit: usize,
    ) -> Result<Vec<ConversationTurn>, HistoryError> {
        let now = Instant::now();
        let mut lists = self
            .lists
            .lock()
            .map_err(|_| HistoryError::cache("memory cache lock poisoned"))?;
        let expired = lists
            .entries
            .get(user)
            .is_some_and(|entry| entry.expires_at <= now);
        if expired {
            lists.entries.remove(user);
            return Ok(Vec::new());
        }
        Ok(lists
            .entries
            .get(user)
            .map(|entry| entry.turns.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct UnreachableCache;

    #[async_trait]
    impl TurnCache for UnreachableCache {
        async fn push(
            &self,
            _user: &str,
            _turn: &ConversationTurn,
            _bound: usize,
            _ttl: Duration,
        ) -> Result<(), HistoryError> {
            Err(HistoryError::cache("connection refused"))
        }

        async fn range(
            &self,
            _user: &str,
            _limit: usize,
        ) -> Result<Vec<ConversationTurn>, HistoryError> {
            Err(HistoryError::cache("connection refused"))
        }
    }

    fn config(bound: usize) -> HistoryConfig {
        HistoryConfig {
            cache_bound: bound,
            ..HistoryConfig::default()
        }
    }

    fn text(n: usize) -> String {
        format!("turn-{n}")
    }

    #[tokio::test]
    async fn cache_holds_at_most_bound_turns_matching_durable_tail() {
        let durable = Arc::new(MemoryTurnStore::new());
        let cache = Arc::new(MemoryTurnCache::new());
        let store = HistoryStore::new(durable.clone(), config(4)).with_cache(cache.clone());

        for n in 0..7 {
            store.append("u1", Role::User, &text(n)).await.expect("append");
        }

        let cached = cache.range("u1", 100).await.expect("range");
        assert_eq!(cached.len(), 4);

        let listed = store.list("u1", 10).await.expect("list");
        assert_eq!(listed, cached);
        let expected: Vec<_> = durable
            .rows_for("u1")
            .iter()
            .rev()
            .take(4)
            .map(TurnRecord::turn)
            .collect();
        assert_eq!(listed, expected);
        assert_eq!(listed[0].text, "turn-6");
        assert_eq!(listed[3].text, "turn-3");
    }

    #[tokio::test]
    async fn unreachable_cache_falls_back_to_durable_store() {
        let durable = Arc::new(MemoryTurnStore::new());
        let store = HistoryStore::new(durable, config(40)).with_cache(Arc::new(UnreachableCache));

        store.append("u1", Role::User, "hello").await.expect("append survives cache failure");
        store
            .append("u1", Role::Assistant, "hi there")
            .await
            .expect("append survives cache failure");

        let listed = store.list("u1", 5).await.expect("list");
        assert_eq!(
            listed,
            vec![
                ConversationTurn::new(Role::Assistant, "hi there"),
                ConversationTurn::new(Role::User, "hello"),
            ]
        );
    }

    #[tokio::test]
    async fn empty_cache_falls_back_and_nonpositive_limit_uses_default() {
        let durable = Arc::new(MemoryTurnStore::new());
        let cache = Arc::new(MemoryTurnCache::new());
        let store = HistoryStore::new(durable, config(40)).with_cache(cache.clone());
        for n in 0..25 {
            store.append("u1", Role::User, &text(n)).await.expect("append");
        }
        cache.invalidate("u1");

        let listed = store.list("u1", 0).await.expect("list");
        assert_eq!(listed.len(), 20);
        assert_eq!(listed[0].text, "turn-24");

        let listed = store.list("u1", -3).await.expect("list");
        assert_eq!(listed.len(), 20);
    }

    #[tokio::test]
    async fn users_do_not_see_each_others_turns() {
        let store = HistoryStore::new(Arc::new(MemoryTurnStore::new()), config(40))
            .with_cache(Arc::new(MemoryTurnCache::new()));
        store.append("a", Role::User, "from a").await.expect("append");
        store.append("b", Role::User, "from b").await.expect("append");

        let listed = store.list("a", 10).await.expect("list");
        assert_eq!(listed, vec![ConversationTurn::new(Role::User, "from a")]);
        assert!(store.list("nobody", 10).await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn expired_cache_entry_reads_as_miss() {
        let cache = MemoryTurnCache::new();
        let turn = ConversationTurn::new(Role::User, "short lived");
        cache
            .push("u1", &turn, 40, Duration::from_millis(0))
            .await
            .expect("push");
        assert!(cache.range("u1", 10).await.expect("range").is_empty());
    }

    #[tokio::test]
    async fn writes_sweep_expired_lists_of_other_users() {
        let cache = MemoryTurnCache::new().with_sweep_interval(Duration::ZERO);
        let turn = ConversationTurn::new(Role::User, "hello");
        for user in ["idle-1", "idle-2", "idle-3"] {
            cache
                .push(user, &turn, 40, Duration::from_millis(0))
                .await
                .expect("push");
        }
        cache
            .push("active", &turn, 40, Duration::from_secs(60))
            .await
            .expect("push");

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.range("active", 10).await.expect("range"), vec![turn]);
    }

    #[test]
    fn roles_round_trip_through_strings() {
        assert_eq!("assistant".parse::<Role>().unwrap(), Role::Assistant);
        assert_eq!(Role::User.to_string(), "user");
        assert!("system".parse::<Role>().is_err());
    }
}
