use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::gateway::{Generation, Generator, ProviderError, ProviderSettings, TokenUsage};
use crate::utils::http::{MAX_ERROR_BODY_BYTES, join_endpoint, response_text_truncated};

pub(crate) const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const HTTP_TIMEOUT: Duration = Duration::from_secs(300);

/// Chat-completions client for OpenAI and servers that speak its protocol.
#[derive(Clone)]
pub struct OpenAICompatible {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl std::fmt::Debug for OpenAICompatible {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAICompatible")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl OpenAICompatible {
    pub fn new(api_key: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            http,
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
            model: ProviderSettings::default().model,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Builds a client from settings, reading the API key from the configured env var.
    pub fn from_settings(settings: &ProviderSettings) -> Self {
        Self::from_settings_with(settings, |key| std::env::var(key).ok())
    }

    pub fn from_settings_with(
        settings: &ProviderSettings,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Self {
        let api_key = lookup(&settings.api_key_env).unwrap_or_default();
        let mut out = Self::new(api_key.trim());
        if let Some(base_url) = settings
            .base_url
            .as_deref()
            .filter(|s| !s.trim().is_empty())
        {
            out = out.with_base_url(base_url.trim());
        }
        if !settings.model.trim().is_empty() {
            out = out.with_model(settings.model.trim());
        }
        out
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn chat_completions_url(&self) -> String {
        join_endpoint(&self.base_url, "chat/completions")
    }

    fn parse_usage(value: &Value) -> TokenUsage {
        let field = |name: &str| value.get(name).and_then(Value::as_u64).unwrap_or(0);
        let prompt_tokens = field("prompt_tokens");
        let completion_tokens = field("completion_tokens");
        let mut total_tokens = field("total_tokens");
        if total_tokens == 0 {
            total_tokens = prompt_tokens.saturating_add(completion_tokens);
        }
        TokenUsage {
            prompt_tokens,
            completion_tokens,
            total_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionsResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<Value>,
}

#[derive(Debug, Deserialize, Default)]
struct ChatChoice {
    #[serde(default)]
    message: ChatMessage,
}

#[derive(Debug, Deserialize, Default)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
impl Generator for OpenAICompatible {
    async fn generate(&self, user_id: &str, text: &str) -> Result<Generation, ProviderError> {
        let body = json!({
            "model": &self.model,
            "messages": [{ "role": "user", "content": text }],
            "user": user_id,
        });

        let mut req = self.http.post(self.chat_completions_url());
        if !self.api_key.trim().is_empty() {
            req = req.bearer_auth(&self.api_key);
        }
        let response = req
            .json(&body)
            .send()
            .await
            .map_err(|err| ProviderError::new(format!("request failed: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response_text_truncated(response, MAX_ERROR_BODY_BYTES).await;
            return Err(ProviderError::new(format!("status {status}: {text}")));
        }

        let parsed = response
            .json::<ChatCompletionsResponse>()
            .await
            .map_err(|err| ProviderError::new(format!("invalid chat/completions response: {err}")))?;

        let reply = parsed
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .unwrap_or_default();
        let usage = parsed
            .usage
            .as_ref()
            .map(Self::parse_usage)
            .unwrap_or_default();

        Ok(Generation { reply, usage })
    }
}
