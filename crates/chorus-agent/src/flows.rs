//! The three flow compositions.
//!
//! ```text
//! individual: intent → context(individual) → router ─┬→ executor → persist
//!                                                   └→ context(blended) → executor
//! blended:    intent → context(blended) → router ────┬→ executor → persist
//!                                                   └→ context(individual) → executor
//! command:    intent → context(command) → router → executor → persist
//! ```
//!
//! The rebuild branch is taken when routing picks a mode other than the one
//! the context window was built for.

use std::sync::Arc;

use chorus_core::config::ChorusConfig;
use chorus_core::types::ConversationMode;
use chorus_flow::{BuildError, Flow, FlowBuilder, Pipeline};
use chorus_store::ConversationStore;
use tracing::warn;

use crate::capability::CapabilityRegistry;
use crate::error::FlowError;
use crate::nodes::{
    self, ContextManagerNode, FunctionExecutorNode, IntentDetectionNode, PersistTurnNode,
    ResponseRouterNode,
};
use crate::nodes::persist::BOT_NAME;
use crate::provider::LlmClient;
use crate::turn::Turn;

pub struct ChorusPipeline;

impl Pipeline for ChorusPipeline {
    type Store = ConversationStore;
    type Data = Turn;
    type Error = FlowError;
}

pub type ChorusFlow = Flow<ChorusPipeline>;

/// Collaborators shared by every composition.
#[derive(Clone)]
pub struct FlowDeps {
    pub store: Arc<ConversationStore>,
    pub llm: Arc<dyn LlmClient>,
    pub capabilities: Arc<CapabilityRegistry>,
    pub config: Arc<ChorusConfig>,
}

/// Error edge for every stage: record the failure and reply with the
/// stage's user-safe text, or the raw capability result when one exists.
fn reply_with_error(node: &'static str, error: &FlowError, turn: &mut Turn) {
    warn!(
        turn = %turn.id,
        node,
        error_type = error.error_type(),
        "turn failed"
    );
    turn.fail(node, error);
}

fn common(
    name: &'static str,
    mode: ConversationMode,
    deps: &FlowDeps,
) -> (FlowBuilder<ChorusPipeline>, FunctionExecutorNode) {
    let cfg = &deps.config;
    let builder = FlowBuilder::new(name)
        .entry(Arc::new(IntentDetectionNode::new(
            cfg.router.command_prefixes.clone(),
        )))
        .node(Arc::new(ContextManagerNode::new(mode, cfg.context.clone())))
        .node(Arc::new(ResponseRouterNode::new(cfg.router.clone())))
        .node(Arc::new(PersistTurnNode::new(BOT_NAME)))
        .on_success(nodes::INTENT, nodes::CONTEXT)
        .on_success(nodes::CONTEXT, nodes::ROUTER)
        .on_success(nodes::EXECUTOR, nodes::PERSIST)
        .on_error(nodes::INTENT, reply_with_error)
        .on_error(nodes::CONTEXT, reply_with_error)
        .on_error(nodes::ROUTER, reply_with_error)
        .on_error(nodes::EXECUTOR, reply_with_error)
        .on_error(nodes::PERSIST, reply_with_error)
        .on_any_error(reply_with_error);
    let executor = FunctionExecutorNode::new(
        Arc::clone(&deps.llm),
        Arc::clone(&deps.capabilities),
        cfg.executor.clone(),
    );
    (builder, executor)
}

/// Conversational flow whose context is one user's private history.
pub fn individual_flow(deps: &FlowDeps) -> Result<ChorusFlow, BuildError> {
    let (builder, executor) = common("individual", ConversationMode::Individual, deps);
    builder
        .node(Arc::new(executor))
        .node(Arc::new(ContextManagerNode::named(
            nodes::CONTEXT_BLENDED,
            ConversationMode::Blended,
            deps.config.context.clone(),
        )))
        .on_condition(
            nodes::ROUTER,
            |t: &Turn| t.needs_context_for(ConversationMode::Blended),
            nodes::CONTEXT_BLENDED,
        )
        .on_success(nodes::ROUTER, nodes::EXECUTOR)
        .on_success(nodes::CONTEXT_BLENDED, nodes::EXECUTOR)
        .on_error(nodes::CONTEXT_BLENDED, reply_with_error)
        .build(Arc::clone(&deps.store))
}

/// Conversational flow whose context is the channel's recent activity.
pub fn blended_flow(deps: &FlowDeps) -> Result<ChorusFlow, BuildError> {
    let (builder, executor) = common("blended", ConversationMode::Blended, deps);
    builder
        .node(Arc::new(executor))
        .node(Arc::new(ContextManagerNode::named(
            nodes::CONTEXT_INDIVIDUAL,
            ConversationMode::Individual,
            deps.config.context.clone(),
        )))
        .on_condition(
            nodes::ROUTER,
            |t: &Turn| t.needs_context_for(ConversationMode::Individual),
            nodes::CONTEXT_INDIVIDUAL,
        )
        .on_success(nodes::ROUTER, nodes::EXECUTOR)
        .on_success(nodes::CONTEXT_INDIVIDUAL, nodes::EXECUTOR)
        .on_error(nodes::CONTEXT_INDIVIDUAL, reply_with_error)
        .build(Arc::clone(&deps.store))
}

/// Prefixed commands with a minimal context and direct capability dispatch.
pub fn command_flow(deps: &FlowDeps) -> Result<ChorusFlow, BuildError> {
    let (builder, executor) = common("command", ConversationMode::Command, deps);
    builder
        .node(Arc::new(
            executor.with_direct_commands(&deps.config.router),
        ))
        .on_success(nodes::ROUTER, nodes::EXECUTOR)
        .build(Arc::clone(&deps.store))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{Completion, CompletionRequest, ProviderError};
    use async_trait::async_trait;
    use std::time::Duration;

    struct Silent;

    #[async_trait]
    impl LlmClient for Silent {
        fn name(&self) -> &str {
            "silent"
        }

        async fn complete(&self, _req: &CompletionRequest) -> Result<Completion, ProviderError> {
            Ok(Completion::Message {
                content: "ok".into(),
            })
        }
    }

    fn deps() -> FlowDeps {
        let config = ChorusConfig::default();
        FlowDeps {
            store: Arc::new(ConversationStore::new(
                config.store.clone(),
                config.persona.system_prompt.clone(),
            )),
            llm: Arc::new(Silent),
            capabilities: Arc::new(CapabilityRegistry::new(Duration::from_secs(1))),
            config: Arc::new(config),
        }
    }

    #[test]
    fn all_compositions_build() {
        let d = deps();
        assert_eq!(individual_flow(&d).map(|f| f.name()).ok(), Some("individual"));
        assert_eq!(blended_flow(&d).map(|f| f.name()).ok(), Some("blended"));
        assert_eq!(command_flow(&d).map(|f| f.name()).ok(), Some("command"));
    }
}
