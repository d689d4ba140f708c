mod error;

pub mod gateway;
pub mod providers;
pub mod utils;

pub use error::{ChatgateError, Result};

pub use gateway::{
    ChatRequest, ChatResponse, GatewayConfig, GatewayError, HistoryStore, OrchestrationPipeline,
    QuotaLedger, TokenUsage,
};
pub use providers::OpenAICompatible;
