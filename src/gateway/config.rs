use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::guardrails::GuardrailsConfig;
use super::limits::LimitsConfig;
use super::quota::QuotaWindow;
use crate::{ChatgateError, Result};

pub type FilterConfig = GuardrailsConfig;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub provider: ProviderSettings,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Tokens a user may consume per period.
    pub limit: i64,
    /// Fixed upfront charge made before each generation call.
    pub pre_reserve_tokens: i64,
    pub window: QuotaWindow,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            limit: 5000,
            pre_reserve_tokens: 200,
            window: QuotaWindow::Day,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Most recent turns kept per user in the cache.
    pub cache_bound: usize,
    pub cache_ttl_secs: u64,
    pub default_list_limit: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            cache_bound: 40,
            cache_ttl_secs: 24 * 60 * 60,
            default_list_limit: 20,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    pub filter_ms: u64,
    pub quota_ms: u64,
    pub generation_ms: u64,
    pub history_ms: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            filter_ms: 800,
            quota_ms: 800,
            generation_ms: 12_000,
            history_ms: 800,
        }
    }
}

impl TimeoutsConfig {
    pub fn filter(&self) -> Duration {
        Duration::from_millis(self.filter_ms)
    }

    pub fn quota(&self) -> Duration {
        Duration::from_millis(self.quota_ms)
    }

    pub fn generation(&self) -> Duration {
        Duration::from_millis(self.generation_ms)
    }

    pub fn history(&self) -> Duration {
        Duration::from_millis(self.history_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    pub model: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
        }
    }
}

impl GatewayConfig {
    /// Loads a `.toml` or `.json` config file. Unknown extensions are parsed as JSON.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let is_toml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
        if is_toml {
            Ok(toml::from_str(&raw)?)
        } else {
            Ok(serde_json::from_str(&raw)?)
        }
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_env_overrides_from(|key| std::env::var(key).ok())
    }

    pub fn apply_env_overrides_from(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<()> {
        let lookup = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(raw) = lookup("DAILY_LIMIT") {
            self.quota.limit = raw
                .trim()
                .parse::<i64>()
                .map_err(|_| ChatgateError::Config(format!("invalid DAILY_LIMIT: {raw}")))?;
        }
        if let Some(model) = lookup("OPENAI_MODEL") {
            self.provider.model = model.trim().to_string();
        }
        if let Some(base_url) = lookup("OPENAI_BASE_URL") {
            self.provider.base_url = Some(base_url.trim().to_string());
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.quota.limit < 0 {
            return Err(ChatgateError::Config("quota.limit must be >= 0".into()));
        }
        if self.quota.pre_reserve_tokens < 0 {
            return Err(ChatgateError::Config(
                "quota.pre_reserve_tokens must be >= 0".into(),
            ));
        }
        if self.history.cache_bound == 0 {
            return Err(ChatgateError::Config(
                "history.cache_bound must be > 0".into(),
            ));
        }
        let timeouts = [
            ("filter_ms", self.timeouts.filter_ms),
            ("quota_ms", self.timeouts.quota_ms),
            ("generation_ms", self.timeouts.generation_ms),
            ("history_ms", self.timeouts.history_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(ChatgateError::Config(format!(
                    "timeouts.{name} must be > 0"
                )));
            }
        }
        self.filter.validate().map_err(ChatgateError::Config)?;
        Ok(())
    }
}
