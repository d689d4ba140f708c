//! Per-user, per-period token ledger.
//!
//! Every backend implements [`QuotaStore::adjust`] as one indivisible operation: add the
//! delta, clamp at zero, and roll a positive delta back when it would cross the limit.
//! Callers never read-compare-write a counter themselves.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use time::macros::format_description;

use super::config::QuotaConfig;
use super::{Clock, SystemClock};

const SECONDS_PER_HOUR: u64 = 60 * 60;
const SECONDS_PER_DAY: u64 = 24 * SECONDS_PER_HOUR;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaWindow {
    Hour,
    #[default]
    Day,
}

impl QuotaWindow {
    pub fn span_seconds(self) -> u64 {
        match self {
            Self::Hour => SECONDS_PER_HOUR,
            Self::Day => SECONDS_PER_DAY,
        }
    }

    /// Resolves the UTC bucket containing `now_epoch_seconds`.
    pub fn period_at(self, now_epoch_seconds: u64) -> PeriodKey {
        let span = self.span_seconds();
        let start = now_epoch_seconds - now_epoch_seconds % span;
        PeriodKey {
            label: format_period_label(self, start),
            expires_at: start.saturating_add(span),
        }
    }
}

fn format_period_label(window: QuotaWindow, start: u64) -> String {
    let Ok(ts) = OffsetDateTime::from_unix_timestamp(start as i64) else {
        return start.to_string();
    };
    let formatted = match window {
        QuotaWindow::Day => ts.format(&format_description!("[year]-[month]-[day]")),
        QuotaWindow::Hour => ts.format(&format_description!("[year]-[month]-[day]T[hour]")),
    };
    formatted.unwrap_or_else(|_| start.to_string())
}

/// A coarse time bucket. Counters for different labels are independent.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeriodKey {
    pub label: String,
    /// End of the bucket, epoch seconds. Used as the counter expiry.
    pub expires_at: u64,
}

impl PeriodKey {
    pub fn new(label: impl Into<String>, expires_at: u64) -> Self {
        Self {
            label: label.into(),
            expires_at,
        }
    }
}

pub(crate) fn counter_id(user: &str, period: &PeriodKey) -> String {
    format!("{user}:{}", period.label)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaDecision {
    pub allowed: bool,
    pub used: i64,
    pub remaining: i64,
}

impl QuotaDecision {
    pub fn new(allowed: bool, used: i64, limit: i64) -> Self {
        Self {
            allowed,
            used,
            remaining: limit.saturating_sub(used),
        }
    }
}

/// Applies one adjustment to a counter value. Returns the settled value and whether the
/// adjustment was allowed; a rejected adjustment returns `used` unchanged.
pub(crate) fn apply_adjustment(used: i64, delta: i64, limit: i64) -> (i64, bool) {
    let after = used.saturating_add(delta).max(0);
    if delta > 0 && after > limit {
        return (used, false);
    }
    (after, true)
}

#[derive(Debug, Error)]
pub enum QuotaStoreError {
    #[error("quota store unavailable: {message}")]
    Unavailable { message: String },
}

impl QuotaStoreError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait QuotaStore: Send + Sync {
    /// Atomically adds `delta` to the (user, period) counter, creating it at zero and
    /// arming its expiry on first use.
    async fn adjust(
        &self,
        user: &str,
        period: &PeriodKey,
        delta: i64,
        limit: i64,
    ) -> Result<QuotaDecision, QuotaStoreError>;

    async fn used(&self, user: &str, period: &PeriodKey) -> Result<i64, QuotaStoreError>;
}

#[derive(Clone, Copy, Debug)]
struct MemoryCounter {
    used: i64,
    expires_at: u64,
}

#[derive(Debug, Default)]
struct MemoryCounters {
    entries: HashMap<String, MemoryCounter>,
    last_gc_minute: u64,
}

/// Single-process ledger backend. Does not survive restarts.
pub struct MemoryQuotaStore {
    counters: Mutex<MemoryCounters>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryQuotaStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQuotaStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            counters: Mutex::new(MemoryCounters::default()),
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.counters
            .lock()
            .map(|counters| counters.entries.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl QuotaStore for MemoryQuotaStore {
    async fn adjust(
        &self,
        user: &str,
        period: &PeriodKey,
        delta: i64,
        limit: i64,
    ) -> Result<QuotaDecision, QuotaStoreError> {
        let now = self.clock.now_epoch_seconds();
        let minute = now / 60;
        let mut counters = self
            .counters
            .lock()
            .map_err(|_| QuotaStoreError::unavailable("memory ledger lock poisoned"))?;

        if minute != counters.last_gc_minute {
            counters.entries.retain(|_, counter| counter.expires_at > now);
            counters.last_gc_minute = minute;
        }

        let counter = counters
            .entries
            .entry(counter_id(user, period))
            .or_insert(MemoryCounter {
                used: 0,
                expires_at: period.expires_at,
            });
        if counter.expires_at <= now {
            *counter = MemoryCounter {
                used: 0,
                expires_at: period.expires_at,
            };
        }

        let (used, allowed) = apply_adjustment(counter.used, delta, limit);
        counter.used = used;
        Ok(QuotaDecision::new(allowed, used, limit))
    }

    async fn used(&self, user: &str, period: &PeriodKey) -> Result<i64, QuotaStoreError> {
        let now = self.clock.now_epoch_seconds();
        let counters = self
            .counters
            .lock()
            .map_err(|_| QuotaStoreError::unavailable("memory ledger lock poisoned"))?;
        Ok(counters
            .entries
            .get(&counter_id(user, period))
            .filter(|counter| counter.expires_at > now)
            .map(|counter| counter.used)
            .unwrap_or(0))
    }
}

/// An upfront charge made before the true cost of a call is known.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reservation {
    pub user: String,
    pub period: PeriodKey,
    pub pre_reserved_tokens: i64,
}

impl Reservation {
    pub fn settlement_delta(&self, actual_tokens: i64) -> i64 {
        actual_tokens.saturating_sub(self.pre_reserved_tokens)
    }
}

pub struct QuotaLedger {
    store: Arc<dyn QuotaStore>,
    limit: i64,
    window: QuotaWindow,
    clock: Arc<dyn Clock>,
}

impl QuotaLedger {
    pub fn new(store: Arc<dyn QuotaStore>, config: &QuotaConfig) -> Self {
        Self {
            store,
            limit: config.limit,
            window: config.window,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn current_period(&self) -> PeriodKey {
        self.window.period_at(self.clock.now_epoch_seconds())
    }

    pub async fn adjust(
        &self,
        user: &str,
        period: &PeriodKey,
        delta: i64,
    ) -> Result<QuotaDecision, QuotaStoreError> {
        self.store.adjust(user, period, delta, self.limit).await
    }

    /// Charges `tokens` against the current period. A denied reservation leaves the
    /// counter untouched and is reported through `QuotaDecision::allowed`.
    pub async fn reserve(
        &self,
        user: &str,
        tokens: i64,
    ) -> Result<(Reservation, QuotaDecision), QuotaStoreError> {
        let period = self.current_period();
        let decision = self.adjust(user, &period, tokens).await?;
        let reservation = Reservation {
            user: user.to_string(),
            period,
            pre_reserved_tokens: tokens,
        };
        Ok((reservation, decision))
    }

    /// Corrects a reservation against actual usage. Returns `None` when no correction
    /// was needed and the store was not called.
    pub async fn settle(
        &self,
        reservation: &Reservation,
        actual_tokens: i64,
    ) -> Result<Option<QuotaDecision>, QuotaStoreError> {
        let delta = reservation.settlement_delta(actual_tokens);
        if delta == 0 {
            return Ok(None);
        }
        self.adjust(&reservation.user, &reservation.period, delta)
            .await
            .map(Some)
    }

    pub async fn used(&self, user: &str, period: &PeriodKey) -> Result<i64, QuotaStoreError> {
        self.store.used(user, period).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;

    struct ManualClock(AtomicU64);

    impl Clock for ManualClock {
        fn now_epoch_seconds(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    const NOW: u64 = 1_700_000_000;

    fn ledger(limit: i64) -> (QuotaLedger, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock(AtomicU64::new(NOW)));
        let store = Arc::new(MemoryQuotaStore::with_clock(clock.clone()));
        let config = QuotaConfig {
            limit,
            ..QuotaConfig::default()
        };
        let ledger = QuotaLedger::new(store, &config).with_clock(clock.clone());
        (ledger, clock)
    }

    #[test]
    fn apply_adjustment_clamps_at_zero_and_rolls_back_over_limit() {
        assert_eq!(apply_adjustment(10, -50, 100), (0, true));
        assert_eq!(apply_adjustment(90, 20, 100), (90, false));
        assert_eq!(apply_adjustment(90, 10, 100), (100, true));
        assert_eq!(apply_adjustment(150, 0, 100), (150, true));
        assert_eq!(apply_adjustment(150, -10, 100), (140, true));
    }

    #[test]
    fn period_labels_are_utc_buckets() {
        let day = QuotaWindow::Day.period_at(NOW);
        assert_eq!(day.label, "2023-11-14");
        assert_eq!(day.expires_at, 1_700_006_400);

        let hour = QuotaWindow::Hour.period_at(NOW);
        assert_eq!(hour.label, "2023-11-14T22");
        assert_eq!(hour.expires_at, 1_700_002_800);
    }

    #[tokio::test]
    async fn used_never_goes_below_zero_and_stays_within_limit() {
        let (ledger, _) = ledger(500);
        let period = ledger.current_period();

        let deltas = [120, -300, 480, 40, -10, 30, -1000, 500, 1];
        for delta in deltas {
            let decision = ledger.adjust("u", &period, delta).await.expect("adjust");
            let used = ledger.used("u", &period).await.expect("used");
            assert!(used >= 0);
            assert_eq!(decision.used, used);
            assert_eq!(decision.remaining, 500 - used);
            if delta > 0 && decision.allowed {
                assert!(used <= 500);
            }
        }
    }

    #[tokio::test]
    async fn rejected_reservation_leaves_counter_unchanged() {
        let (ledger, _) = ledger(5000);
        let period = ledger.current_period();
        ledger.adjust("u2", &period, 4900).await.expect("seed");

        let decision = ledger.adjust("u2", &period, 200).await.expect("adjust");
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 100);
        assert_eq!(ledger.used("u2", &period).await.expect("used"), 4900);
    }

    #[tokio::test]
    async fn refund_then_recharge_restores_original_usage() {
        let (ledger, _) = ledger(1000);
        let period = ledger.current_period();
        ledger.adjust("u", &period, 600).await.expect("seed");

        ledger.adjust("u", &period, -250).await.expect("refund");
        let decision = ledger.adjust("u", &period, 250).await.expect("recharge");
        assert!(decision.allowed);
        assert_eq!(decision.used, 600);
    }

    #[tokio::test]
    async fn reserve_then_settle_matches_single_charge() {
        let (ledger, _) = ledger(5000);
        for actual in [0_i64, 150, 200, 320] {
            let user = format!("user-{actual}");
            let (reservation, decision) = ledger.reserve(&user, 200).await.expect("reserve");
            assert!(decision.allowed);
            let settled = ledger.settle(&reservation, actual).await.expect("settle");
            assert_eq!(settled.is_none(), actual == 200);

            let used = ledger
                .used(&user, &reservation.period)
                .await
                .expect("used");
            assert_eq!(used, actual);
        }
    }

    #[tokio::test]
    async fn rolled_over_period_starts_fresh() {
        let (ledger, clock) = ledger(300);
        let (first, decision) = ledger.reserve("u", 300).await.expect("reserve");
        assert!(decision.allowed);
        assert!(!ledger.reserve("u", 1).await.expect("reserve").1.allowed);

        clock.0.store(first.period.expires_at, Ordering::SeqCst);
        let (second, decision) = ledger.reserve("u", 300).await.expect("reserve");
        assert_ne!(first.period, second.period);
        assert!(decision.allowed);
        assert_eq!(ledger.used("u", &first.period).await.expect("used"), 0);
    }

    #[tokio::test]
    async fn expired_counters_are_collected() {
        let clock = Arc::new(ManualClock(AtomicU64::new(NOW)));
        let store = MemoryQuotaStore::with_clock(clock.clone());
        let period = QuotaWindow::Hour.period_at(NOW);
        store.adjust("a", &period, 5, 10).await.expect("adjust");
        assert_eq!(store.len(), 1);

        clock.0.store(period.expires_at + 60, Ordering::SeqCst);
        let next = QuotaWindow::Hour.period_at(period.expires_at + 60);
        store.adjust("b", &next, 5, 10).await.expect("adjust");
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reservations_never_overshoot_limit() {
        let store = Arc::new(MemoryQuotaStore::new());
        let config = QuotaConfig {
            limit: 5000,
            ..QuotaConfig::default()
        };
        let ledger = Arc::new(QuotaLedger::new(store, &config));

        let mut handles = Vec::new();
        for _ in 0..64 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger.reserve("shared", 200).await.expect("reserve").1
            }));
        }

        let mut allowed = 0;
        for handle in handles {
            if handle.await.expect("join").allowed {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 25);
        let period = ledger.current_period();
        assert_eq!(ledger.used("shared", &period).await.expect("used"), 5000);
    }
}
