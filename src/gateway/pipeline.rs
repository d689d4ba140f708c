use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::config::{GatewayConfig, TimeoutsConfig};
use super::generation::{Generation, Generator};
use super::guardrails::TextFilter;
use super::history::{ConversationTurn, HistoryError, HistoryStore, Role};
use super::limits::{LimitsConfig, RateLimiter};
use super::observability::PipelineMetrics;
use super::quota::{QuotaLedger, Reservation};
use super::{ChatRequest, ChatResponse, Clock, GatewayError, StageName, SystemClock};

/// Lifecycle states of one chat request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Received,
    Filtered,
    QuotaReserved,
    Generated,
    QuotaSettled,
    HistorySaved,
    Responded,
    Rejected,
    Failed,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Filtered => "filtered",
            Self::QuotaReserved => "quota_reserved",
            Self::Generated => "generated",
            Self::QuotaSettled => "quota_settled",
            Self::HistorySaved => "history_saved",
            Self::Responded => "responded",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
        }
    }
}

fn transition(user_id: &str, stage: Stage) {
    tracing::debug!(user_id, stage = stage.as_str(), "pipeline transition");
}

/// Runs `fut` under `budget`, mapping collaborator errors and elapsed budgets to
/// stage-tagged gateway errors.
async fn bounded<T, E, F>(stage: StageName, budget: Duration, fut: F) -> Result<T, GatewayError>
where
    E: Display,
    F: Future<Output = Result<T, E>>,
{
    match tokio::time::timeout(budget, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(GatewayError::Upstream {
            stage,
            message: err.to_string(),
        }),
        Err(_) => Err(GatewayError::Timeout { stage }),
    }
}

fn tokens_as_i64(tokens: u64) -> i64 {
    i64::try_from(tokens).unwrap_or(i64::MAX)
}

pub struct OrchestrationPipeline {
    filter: Arc<dyn TextFilter>,
    ledger: Arc<QuotaLedger>,
    generator: Arc<dyn Generator>,
    history: Arc<HistoryStore>,
    timeouts: TimeoutsConfig,
    pre_reserve_tokens: i64,
    limits: LimitsConfig,
    rate_limiter: Mutex<RateLimiter>,
    clock: Arc<dyn Clock>,
    metrics: PipelineMetrics,
}

impl OrchestrationPipeline {
    pub fn new(
        filter: Arc<dyn TextFilter>,
        ledger: Arc<QuotaLedger>,
        generator: Arc<dyn Generator>,
        history: Arc<HistoryStore>,
        config: &GatewayConfig,
    ) -> Self {
        Self {
            filter,
            ledger,
            generator,
            history,
            timeouts: config.timeouts.clone(),
            pre_reserve_tokens: config.quota.pre_reserve_tokens,
            limits: config.limits.clone(),
            rate_limiter: Mutex::new(RateLimiter::default()),
            clock: Arc::new(SystemClock),
            metrics: PipelineMetrics::default(),
        }
    }

    /// Clock used for the front-door rate limiter windows.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }

    pub fn ledger(&self) -> &QuotaLedger {
        &self.ledger
    }

    pub async fn handle(&self, request: ChatRequest) -> Result<ChatResponse, GatewayError> {
        self.metrics.record_request();
        let result = self.run(&request).await;

        match &result {
            Ok(response) => {
                transition(&request.user_id, Stage::Responded);
                tracing::info!(
                    user_id = %request.user_id,
                    total_tokens = response.usage.total_tokens,
                    remaining = response.remaining,
                    "chat completed"
                );
            }
            Err(err) if err.is_rejection() => {
                match err {
                    GatewayError::Blocked => self.metrics.record_blocked(),
                    GatewayError::QuotaExceeded { .. } => self.metrics.record_quota_rejected(),
                    GatewayError::RateLimited { .. } => self.metrics.record_rate_limited(),
                    _ => {}
                }
                tracing::info!(
                    user_id = %request.user_id,
                    stage = Stage::Rejected.as_str(),
                    reason = %err,
                    "chat rejected"
                );
            }
            Err(GatewayError::InvalidRequest { reason }) => {
                tracing::debug!(reason = %reason, "chat request invalid");
            }
            Err(err) => {
                self.metrics.record_failed();
                tracing::warn!(
                    user_id = %request.user_id,
                    stage = Stage::Failed.as_str(),
                    error = %err,
                    "chat failed"
                );
            }
        }

        result
    }

    async fn run(&self, request: &ChatRequest) -> Result<ChatResponse, GatewayError> {
        let user_id = request.user_id.trim();
        if user_id.is_empty() {
            return Err(GatewayError::InvalidRequest {
                reason: "user_id is required".to_string(),
            });
        }
        transition(user_id, Stage::Received);

        self.check_rate_limit(user_id)?;

        let verdict = bounded(
            StageName::Filter,
            self.timeouts.filter(),
            self.filter.filter(&request.text),
        )
        .await?;
        if !verdict.allowed {
            return Err(GatewayError::Blocked);
        }
        let cleaned = verdict.cleaned;
        transition(user_id, Stage::Filtered);

        let (reservation, decision) = bounded(
            StageName::Quota,
            self.timeouts.quota(),
            self.ledger.reserve(user_id, self.pre_reserve_tokens),
        )
        .await?;
        if !decision.allowed {
            return Err(GatewayError::QuotaExceeded {
                remaining: decision.remaining,
            });
        }
        transition(user_id, Stage::QuotaReserved);

        let generation = self.generate(user_id, &cleaned).await?;
        self.metrics.record_generated();
        transition(user_id, Stage::Generated);

        let remaining = self
            .settle(&reservation, &generation, decision.remaining)
            .await;
        transition(user_id, Stage::QuotaSettled);

        self.record_history(user_id, &request.text, &generation.reply)
            .await;

        Ok(ChatResponse {
            cleaned,
            reply: generation.reply,
            usage: generation.usage,
            remaining,
        })
    }

    fn check_rate_limit(&self, user_id: &str) -> Result<(), GatewayError> {
        if self.limits.rpm.is_none() {
            return Ok(());
        }
        let minute = self.clock.now_epoch_seconds() / 60;
        let mut limiter = self
            .rate_limiter
            .lock()
            .map_err(|_| GatewayError::Upstream {
                stage: StageName::Quota,
                message: "rate limiter lock poisoned".to_string(),
            })?;
        limiter.check_and_consume(self.limits.scope(user_id), &self.limits, minute)
    }

    async fn generate(&self, user_id: &str, text: &str) -> Result<Generation, GatewayError> {
        match tokio::time::timeout(
            self.timeouts.generation(),
            self.generator.generate(user_id, text),
        )
        .await
        {
            Ok(Ok(generation)) => Ok(generation),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(GatewayError::Timeout {
                stage: StageName::Generation,
            }),
        }
    }

    /// Best effort. Returns the remaining budget to report.
    async fn settle(
        &self,
        reservation: &Reservation,
        generation: &Generation,
        reserved_remaining: i64,
    ) -> i64 {
        let total = generation.usage.total_tokens;
        if total == 0 {
            return reserved_remaining;
        }

        let settled = bounded(
            StageName::Settlement,
            self.timeouts.quota(),
            self.ledger.settle(reservation, tokens_as_i64(total)),
        )
        .await;

        match settled {
            Ok(Some(decision)) => {
                if !decision.allowed {
                    tracing::debug!(
                        user_id = %reservation.user,
                        total_tokens = total,
                        "settlement over limit rolled back"
                    );
                }
                decision.remaining
            }
            Ok(None) => reserved_remaining,
            Err(err) => {
                self.metrics.record_settlement_failure();
                tracing::warn!(
                    user_id = %reservation.user,
                    stage = StageName::Settlement.as_str(),
                    error = %err,
                    "quota settlement skipped"
                );
                reserved_remaining
            }
        }
    }

    /// Best effort. Both turns share one budget and the outcome never reaches the caller.
    async fn record_history(&self, user_id: &str, raw_text: &str, reply: &str) {
        let appends = async {
            self.history.append(user_id, Role::User, raw_text).await?;
            self.history.append(user_id, Role::Assistant, reply).await?;
            Ok::<(), HistoryError>(())
        };

        match bounded(StageName::History, self.timeouts.history(), appends).await {
            Ok(()) => transition(user_id, Stage::HistorySaved),
            Err(err) => {
                self.metrics.record_history_failure();
                tracing::warn!(
                    user_id,
                    stage = StageName::History.as_str(),
                    error = %err,
                    "history write skipped"
                );
            }
        }
    }

    /// Reads a user's recent turns, most recent first. `limit <= 0` means the default.
    pub async fn list_history(
        &self,
        user_id: &str,
        limit: Option<i64>,
    ) -> Result<Vec<ConversationTurn>, GatewayError> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(GatewayError::InvalidRequest {
                reason: "user_id is required".to_string(),
            });
        }
        bounded(
            StageName::History,
            self.timeouts.history(),
            self.history.list(user_id, limit.unwrap_or(0)),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::gateway::TokenUsage;
    use crate::gateway::generation::ProviderError;
    use crate::gateway::guardrails::PhraseFilter;
    use crate::gateway::history::MemoryTurnStore;
    use crate::gateway::quota::MemoryQuotaStore;

    struct FixedGenerator {
        calls: AtomicUsize,
        total_tokens: u64,
    }

    #[async_trait]
    impl Generator for FixedGenerator {
        async fn generate(&self, _user: &str, text: &str) -> Result<Generation, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Generation {
                reply: format!("echo: {text}"),
                usage: TokenUsage {
                    prompt_tokens: self.total_tokens / 2,
                    completion_tokens: self.total_tokens - self.total_tokens / 2,
                    total_tokens: self.total_tokens,
                },
            })
        }
    }

    fn pipeline(
        config: &GatewayConfig,
        total_tokens: u64,
    ) -> (OrchestrationPipeline, Arc<FixedGenerator>) {
        let generator = Arc::new(FixedGenerator {
            calls: AtomicUsize::new(0),
            total_tokens,
        });
        let ledger = Arc::new(QuotaLedger::new(
            Arc::new(MemoryQuotaStore::new()),
            &config.quota,
        ));
        let history = Arc::new(HistoryStore::new(
            Arc::new(MemoryTurnStore::new()),
            config.history.clone(),
        ));
        let pipeline = OrchestrationPipeline::new(
            Arc::new(PhraseFilter::default()),
            ledger,
            generator.clone(),
            history,
            config,
        );
        (pipeline, generator)
    }

    #[tokio::test]
    async fn zero_usage_keeps_reservation_charged() {
        let config = GatewayConfig::default();
        let (pipeline, _) = pipeline(&config, 0);

        let response = pipeline
            .handle(ChatRequest::new("u1", "hello"))
            .await
            .expect("chat");
        assert_eq!(response.remaining, 4800);

        let period = pipeline.ledger().current_period();
        assert_eq!(pipeline.ledger().used("u1", &period).await.expect("used"), 200);
    }

    #[tokio::test]
    async fn empty_user_is_invalid_and_not_counted_as_failure() {
        let config = GatewayConfig::default();
        let (pipeline, generator) = pipeline(&config, 10);

        let err = pipeline
            .handle(ChatRequest::new("  ", "hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRequest { .. }));
        assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
        assert_eq!(pipeline.metrics().snapshot().failed, 0);
    }

    #[tokio::test]
    async fn rpm_limit_rejects_before_any_stage_runs() {
        let mut config = GatewayConfig::default();
        config.limits.rpm = Some(2);
        let (pipeline, generator) = pipeline(&config, 10);

        for _ in 0..2 {
            pipeline
                .handle(ChatRequest::new("u1", "hi"))
                .await
                .expect("chat");
        }
        let err = pipeline
            .handle(ChatRequest::new("u1", "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::RateLimited { .. }));
        assert_eq!(generator.calls.load(Ordering::SeqCst), 2);
        assert_eq!(pipeline.metrics().snapshot().rate_limited, 1);
    }

    #[tokio::test]
    async fn history_records_raw_text_and_reply() {
        let config = GatewayConfig::default();
        let (pipeline, _) = pipeline(&config, 50);

        pipeline
            .handle(ChatRequest::new("u1", "  spaced   out  "))
            .await
            .expect("chat");

        let turns = pipeline.list_history("u1", None).await.expect("history");
        assert_eq!(
            turns,
            vec![
                ConversationTurn::new(Role::Assistant, "echo: spaced out"),
                ConversationTurn::new(Role::User, "  spaced   out  "),
            ]
        );
        assert!(matches!(
            pipeline.list_history("", Some(5)).await.unwrap_err(),
            GatewayError::InvalidRequest { .. }
        ));
    }
}
