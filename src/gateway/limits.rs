use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::GatewayError;

pub(crate) const GLOBAL_SCOPE: &str = "*";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Chat requests admitted per minute.
    #[serde(default)]
    pub rpm: Option<u32>,
    /// Count requests per user instead of across the whole gateway.
    #[serde(default)]
    pub per_user: bool,
}

impl LimitsConfig {
    pub fn scope<'a>(&self, user_id: &'a str) -> &'a str {
        if self.per_user { user_id } else { GLOBAL_SCOPE }
    }
}

#[derive(Debug, Default)]
pub struct RateLimiter {
    usage: HashMap<String, MinuteUsage>,
    last_gc_minute: u64,
}

#[derive(Debug, Clone)]
struct MinuteUsage {
    minute: u64,
    requests: u32,
}

impl RateLimiter {
    pub fn check_and_consume(
        &mut self,
        scope: &str,
        limits: &LimitsConfig,
        minute: u64,
    ) -> Result<(), GatewayError> {
        let Some(rpm) = limits.rpm else {
            self.usage.remove(scope);
            return Ok(());
        };

        if minute != self.last_gc_minute {
            // Only the active minute bucket matters.
            self.usage.retain(|_, usage| usage.minute == minute);
            self.last_gc_minute = minute;
        }

        let usage = self.usage.entry(scope.to_string()).or_insert(MinuteUsage {
            minute,
            requests: 0,
        });

        if usage.minute != minute {
            usage.minute = minute;
            usage.requests = 0;
        }

        let next_requests = usage.requests.saturating_add(1);
        if rpm == 0 || next_requests > rpm {
            return Err(GatewayError::RateLimited {
                limit: format!("rpm>{rpm}"),
            });
        }

        usage.requests = next_requests;
        Ok(())
    }
}
