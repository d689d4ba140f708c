use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineMetricsSnapshot {
    pub requests: u64,
    pub blocked: u64,
    pub quota_rejected: u64,
    pub rate_limited: u64,
    pub generated: u64,
    pub failed: u64,
    pub settlement_failures: u64,
    pub history_failures: u64,
}

/// Lock-free request counters shared by concurrent pipeline invocations.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    requests: AtomicU64,
    blocked: AtomicU64,
    quota_rejected: AtomicU64,
    rate_limited: AtomicU64,
    generated: AtomicU64,
    failed: AtomicU64,
    settlement_failures: AtomicU64,
    history_failures: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl PipelineMetrics {
    pub fn record_request(&self) {
        bump(&self.requests);
    }

    pub fn record_blocked(&self) {
        bump(&self.blocked);
    }

    pub fn record_quota_rejected(&self) {
        bump(&self.quota_rejected);
    }

    pub fn record_rate_limited(&self) {
        bump(&self.rate_limited);
    }

    pub fn record_generated(&self) {
        bump(&self.generated);
    }

    pub fn record_failed(&self) {
        bump(&self.failed);
    }

    pub fn record_settlement_failure(&self) {
        bump(&self.settlement_failures);
    }

    pub fn record_history_failure(&self) {
        bump(&self.history_failures);
    }

    pub fn snapshot(&self) -> PipelineMetricsSnapshot {
        PipelineMetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
            quota_rejected: self.quota_rejected.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            generated: self.generated.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            settlement_failures: self.settlement_failures.load(Ordering::Relaxed),
            history_failures: self.history_failures.load(Ordering::Relaxed),
        }
    }
}
