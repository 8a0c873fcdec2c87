//! Model call and capability dispatch.
//!
//! One completion is issued with the registered capabilities on offer. A plain
//! reply ends the stage. A function call is parsed, dispatched, and its result
//! handed back to the model for a natural-language explanation. When the
//! explanation fails the raw result is rendered instead; when it times out the
//! rendering is left on the turn as the fallback reply and the stage fails.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use chorus_core::config::{ExecutorConfig, RouterConfig};
use chorus_core::types::{FunctionCallRecord, Message};
use chorus_flow::Node;
use chorus_store::ConversationStore;

use crate::capability::{CapabilityCall, CapabilityOutcome, CapabilityRegistry};
use crate::error::FlowError;
use crate::flows::ChorusPipeline;
use crate::provider::{Completion, CompletionRequest, LlmClient};
use crate::turn::{Turn, TurnState};

/// Extra wall-clock allowance on top of the summed stage timeouts.
const NODE_SLACK: Duration = Duration::from_secs(5);

pub struct FunctionExecutorNode {
    llm: Arc<dyn LlmClient>,
    capabilities: Arc<CapabilityRegistry>,
    config: ExecutorConfig,
    /// Set in the command flow: prefixed capability commands skip the first completion.
    command_prefixes: Option<Vec<String>>,
}

impl FunctionExecutorNode {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        capabilities: Arc<CapabilityRegistry>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            llm,
            capabilities,
            config,
            command_prefixes: None,
        }
    }

    /// Dispatch `!weather`-style commands straight to their capability.
    pub fn with_direct_commands(mut self, router: &RouterConfig) -> Self {
        self.command_prefixes = Some(router.command_prefixes.clone());
        self
    }

    fn completion_timeout(&self) -> Duration {
        Duration::from_millis(self.config.completion_timeout_ms)
    }

    fn explanation_timeout(&self) -> Duration {
        Duration::from_millis(self.config.explanation_timeout_ms)
    }

    async fn first_completion(&self, messages: Vec<Message>) -> Result<Completion, FlowError> {
        let req = CompletionRequest {
            messages,
            tools: self.capabilities.definitions(),
            max_tokens: self.config.max_tokens,
        };
        let limit = self.completion_timeout();
        match tokio::time::timeout(limit, self.llm.complete(&req)).await {
            Ok(Ok(completion)) => Ok(completion),
            Ok(Err(e)) => Err(FlowError::FunctionDispatch(format!(
                "{} completion failed: {e}",
                self.llm.name()
            ))),
            Err(_) => Err(FlowError::ModelTimeout {
                stage: "completion",
                after: limit,
            }),
        }
    }

    async fn dispatch(
        &self,
        turn: &mut Turn,
        call: CapabilityCall,
        context: Vec<Message>,
    ) -> Result<(), FlowError> {
        let kind = call.kind();
        let outcome = self.capabilities.invoke(&call).await?;
        info!(turn = %turn.id, capability = %kind, ok = outcome.ok, "capability dispatched");

        let result = outcome.to_json();
        turn.function_call = Some(FunctionCallRecord {
            name: kind.function_name().to_string(),
            result: result.clone(),
        });
        turn.fallback = Some(outcome.fallback_text(kind));
        turn.advance(TurnState::FunctionDispatched);

        let mut messages = context;
        messages.push(Message::function(kind.function_name(), result, Utc::now()));
        let reply = self.explain(turn, &outcome, messages).await?;

        turn.reply = Some(reply);
        turn.advance(TurnState::ResultExplained);
        Ok(())
    }

    /// Ask the model to phrase `outcome`. Falls back to the raw rendering on
    /// any failure except a timeout, which fails the stage.
    async fn explain(
        &self,
        turn: &Turn,
        outcome: &CapabilityOutcome,
        messages: Vec<Message>,
    ) -> Result<String, FlowError> {
        let fallback = turn.fallback.clone().unwrap_or_default();
        let req = CompletionRequest {
            messages,
            tools: Vec::new(),
            max_tokens: self.config.max_tokens,
        };
        let limit = self.explanation_timeout();
        match tokio::time::timeout(limit, self.llm.complete(&req)).await {
            Ok(Ok(Completion::Message { content })) if !content.trim().is_empty() => Ok(content),
            Ok(Ok(_)) => {
                warn!(turn = %turn.id, ok = outcome.ok, "explanation was not usable text, using raw result");
                Ok(fallback)
            }
            Ok(Err(e)) => {
                warn!(turn = %turn.id, error = %e, "explanation failed, using raw result");
                Ok(fallback)
            }
            Err(_) => Err(FlowError::ModelTimeout {
                stage: "explanation",
                after: limit,
            }),
        }
    }
}

#[async_trait]
impl Node<ChorusPipeline> for FunctionExecutorNode {
    fn name(&self) -> &'static str {
        super::EXECUTOR
    }

    fn timeout(&self) -> Duration {
        self.completion_timeout()
            + Duration::from_millis(self.config.capability_timeout_ms)
            + self.explanation_timeout()
            + NODE_SLACK
    }

    async fn run(&self, _store: &ConversationStore, turn: &mut Turn) -> Result<(), FlowError> {
        let context = turn
            .context
            .as_ref()
            .map(|c| c.messages.clone())
            .ok_or_else(|| FlowError::Context("turn has no context window".to_string()))?;

        if let Some(prefixes) = &self.command_prefixes {
            if let Some(call) = CapabilityCall::from_command(&turn.inbound.content, prefixes)? {
                debug!(turn = %turn.id, capability = %call.kind(), "direct command dispatch");
                return self.dispatch(turn, call, context).await;
            }
        }

        match self.first_completion(context.clone()).await? {
            Completion::Message { content } => {
                turn.reply = Some(content);
                turn.advance(TurnState::DirectResponse);
                Ok(())
            }
            Completion::FunctionCall {
                id,
                name,
                arguments,
            } => {
                debug!(turn = %turn.id, call_id = %id, function = %name, "model requested a function");
                let call = CapabilityCall::parse(&name, &arguments)?;
                self.dispatch(turn, call, context).await
            }
        }
    }
}
