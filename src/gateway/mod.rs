pub mod config;
pub mod generation;
pub mod guardrails;
pub mod history;
pub mod http;
pub mod limits;
pub mod observability;
pub mod pipeline;
pub mod quota;
pub mod telemetry;

#[cfg(feature = "store-redis")]
mod redis_store;
#[cfg(feature = "store-sqlite")]
mod sqlite_store;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use config::{
    FilterConfig, GatewayConfig, HistoryConfig, ProviderSettings, QuotaConfig, TimeoutsConfig,
};
pub use generation::{Generation, Generator, ProviderError, ProviderFailure};
pub use guardrails::{FilterError, FilterVerdict, PhraseFilter, TextFilter};
pub use history::{
    ConversationTurn, HistoryError, HistoryStore, MemoryTurnCache, MemoryTurnStore, Role,
    TurnCache, TurnRecord, TurnStore,
};
pub use http::GatewayHttpState;
pub use limits::{LimitsConfig, RateLimiter};
pub use observability::{PipelineMetrics, PipelineMetricsSnapshot};
pub use pipeline::{OrchestrationPipeline, Stage};
pub use quota::{
    MemoryQuotaStore, PeriodKey, QuotaDecision, QuotaLedger, QuotaStore, QuotaStoreError,
    QuotaWindow, Reservation,
};

#[cfg(feature = "store-redis")]
pub use redis_store::{RedisStore, RedisStoreError};
#[cfg(feature = "store-sqlite")]
pub use sqlite_store::{SqliteStore, SqliteStoreError};

/// Inbound chat request as accepted by the front door.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub text: String,
}

impl ChatRequest {
    pub fn new(user_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            text: text.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub cleaned: String,
    pub reply: String,
    pub usage: TokenUsage,
    pub remaining: i64,
}

/// Pipeline stage that produced a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Filter,
    Quota,
    Generation,
    Settlement,
    History,
}

impl StageName {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Filter => "filter",
            Self::Quota => "quota",
            Self::Generation => "generation",
            Self::Settlement => "settlement",
            Self::History => "history",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },
    #[error("text blocked by filter")]
    Blocked,
    #[error("quota exceeded: remaining={remaining}")]
    QuotaExceeded { remaining: i64 },
    #[error("rate limit exceeded: {limit}")]
    RateLimited { limit: String },
    #[error("provider quota exhausted: {message}")]
    ProviderQuota { message: String },
    #[error("provider rate limited: {message}")]
    ProviderRateLimited { message: String },
    #[error("provider error: {message}")]
    Provider { message: String },
    #[error("{stage} failed: {message}")]
    Upstream { stage: StageName, message: String },
    #[error("{stage} timed out")]
    Timeout { stage: StageName },
}

impl GatewayError {
    /// Rejections are business outcomes, not failures of the gateway.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::Blocked | Self::QuotaExceeded { .. } | Self::RateLimited { .. }
        )
    }
}

pub trait Clock: Send + Sync {
    fn now_epoch_seconds(&self) -> u64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch_seconds(&self) -> u64 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_else(|_| std::time::Duration::from_secs(0));
        now.as_secs()
    }
}

pub(crate) fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}
