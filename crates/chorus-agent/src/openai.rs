use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use chorus_core::config::ProviderConfig;
use chorus_core::types::{Message, Role};

use crate::provider::{Completion, CompletionRequest, LlmClient, ProviderError};

/// Client for any OpenAI-compatible `/v1/chat/completions` endpoint.
pub struct OpenAiClient {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    model: String,
}

impl OpenAiClient {
    pub fn new(api_key: Option<String>, base_url: Option<String>, model: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com".to_string()),
            model,
        }
    }

    pub fn from_config(config: &ProviderConfig) -> Self {
        Self::new(
            config.api_key.clone(),
            Some(config.base_url.trim_end_matches('/').to_string()),
            config.model.clone(),
        )
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(&self, req: &CompletionRequest) -> Result<Completion, ProviderError> {
        let body = build_request_body(&self.model, req);
        let url = format!("{}/v1/chat/completions", self.base_url);

        debug!(model = %self.model, tools = req.tools.len(), "sending request to OpenAI");

        let mut builder = self
            .client
            .post(&url)
            .header("content-type", "application/json")
            .json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let resp = builder.send().await?;

        let status = resp.status().as_u16();
        if status == 429 {
            let retry = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|s| s * 1000) // convert seconds to ms
                .unwrap_or(5000);
            return Err(ProviderError::RateLimited {
                retry_after_ms: retry,
            });
        }

        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "OpenAI API error");
            return Err(ProviderError::Api {
                status,
                message: text,
            });
        }

        let api_resp: ApiResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        parse_response(api_resp)
    }
}

fn wire_message(m: &Message) -> serde_json::Value {
    match (m.role, &m.function_call) {
        // Capability results go back under the function role with their name.
        (Role::Function, Some(call)) => serde_json::json!({
            "role": "function",
            "name": call.name,
            "content": m.content,
        }),
        (role, _) => serde_json::json!({
            "role": role.as_str(),
            "content": m.content,
        }),
    }
}

fn build_request_body(model: &str, req: &CompletionRequest) -> serde_json::Value {
    let messages: Vec<serde_json::Value> = req.messages.iter().map(wire_message).collect();

    let mut body = serde_json::json!({
        "model": model,
        "messages": messages,
        "max_tokens": req.max_tokens,
    });

    if !req.tools.is_empty() {
        let tools: Vec<serde_json::Value> = req
            .tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.input_schema,
                    }
                })
            })
            .collect();
        body["tools"] = serde_json::Value::Array(tools);
    }

    body
}

fn parse_response(resp: ApiResponse) -> Result<Completion, ProviderError> {
    let message = resp
        .choices
        .into_iter()
        .next()
        .map(|c| c.message)
        .ok_or_else(|| ProviderError::Parse("response has no choices".to_string()))?;

    if let Some(call) = message.tool_calls.into_iter().next() {
        // Arguments arrive as a JSON-encoded string.
        let arguments = if call.function.arguments.trim().is_empty() {
            serde_json::Value::Object(Default::default())
        } else {
            serde_json::from_str(&call.function.arguments)
                .map_err(|e| ProviderError::Parse(format!("tool arguments: {e}")))?
        };
        return Ok(Completion::FunctionCall {
            id: call.id,
            name: call.function.name,
            arguments,
        });
    }

    Ok(Completion::Message {
        content: message.content.unwrap_or_default(),
    })
}

// OpenAI API response types (private, deserialization only)

#[derive(Deserialize)]
struct ApiResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCallWire>,
}

#[derive(Deserialize)]
struct ToolCallWire {
    id: String,
    function: FunctionWire,
}

#[derive(Deserialize)]
struct FunctionWire {
    name: String,
    #[serde(default)]
    arguments: String,
}
