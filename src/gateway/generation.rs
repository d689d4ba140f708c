use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{GatewayError, TokenUsage};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Generation {
    pub reply: String,
    pub usage: TokenUsage,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProviderFailure {
    InsufficientQuota,
    RateLimited,
    Other,
}

/// A failed generation call. Only the message is carried; it is classified by content.
#[derive(Clone, Debug, Error)]
#[error("{message}")]
pub struct ProviderError {
    pub message: String,
}

impl ProviderError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn classify(&self) -> ProviderFailure {
        let message = self.message.as_str();
        if message.contains("insufficient_quota") {
            ProviderFailure::InsufficientQuota
        } else if message.contains("Too Many Requests") || message.contains("rate limit") {
            ProviderFailure::RateLimited
        } else {
            ProviderFailure::Other
        }
    }
}

impl From<ProviderError> for GatewayError {
    fn from(err: ProviderError) -> Self {
        let failure = err.classify();
        let message = err.message;
        match failure {
            ProviderFailure::InsufficientQuota => GatewayError::ProviderQuota { message },
            ProviderFailure::RateLimited => GatewayError::ProviderRateLimited { message },
            ProviderFailure::Other => GatewayError::Provider { message },
        }
    }
}

#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, user_id: &str, text: &str) -> Result<Generation, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_provider_messages_by_marker() {
        let cases = [
            (
                r#"status 429: {"error":{"code":"insufficient_quota"}}"#,
                ProviderFailure::InsufficientQuota,
            ),
            ("429 Too Many Requests", ProviderFailure::RateLimited),
            ("hit the rate limit for model", ProviderFailure::RateLimited),
            ("Rate Limit reached", ProviderFailure::Other),
            ("connection reset by peer", ProviderFailure::Other),
        ];
        for (message, expected) in cases {
            assert_eq!(ProviderError::new(message).classify(), expected, "{message}");
        }
    }

    #[test]
    fn quota_marker_wins_over_rate_limit_marker() {
        let err = ProviderError::new("Too Many Requests: insufficient_quota");
        assert!(matches!(
            GatewayError::from(err),
            GatewayError::ProviderQuota { .. }
        ));
    }

    #[test]
    fn converts_into_gateway_errors() {
        assert!(matches!(
            GatewayError::from(ProviderError::new("rate limit")),
            GatewayError::ProviderRateLimited { .. }
        ));
        match GatewayError::from(ProviderError::new("boom")) {
            GatewayError::Provider { message } => assert_eq!(message, "boom"),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
