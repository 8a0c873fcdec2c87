use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use chorus_core::types::Message;

/// Tool definition offered to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// One completion request: the assembled context plus the tools on offer.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    /// Empty when the model must answer in plain text.
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: u32,
}

/// What the model answered with.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Message {
        content: String,
    },
    /// The model asked for a capability to be invoked.
    FunctionCall {
        id: String,
        name: String,
        arguments: serde_json::Value,
    },
}

/// Language-model collaborator. Implementations own the model name and credentials.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Client name for logging and error messages.
    fn name(&self) -> &str;

    async fn complete(&self, req: &CompletionRequest) -> Result<Completion, ProviderError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Provider unavailable: {0}")]
    Unavailable(String),
}
