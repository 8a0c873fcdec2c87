//! Per-message data threaded through a flow.

use std::fmt;

use serde::Serialize;

use chorus_core::types::{
    ContextStrategy, ConversationMode, FunctionCallRecord, InboundMessage, Intent, Message,
    RouteReason,
};

use crate::error::FlowError;

/// Processing state of one inbound message.
///
/// ```text
/// Received → IntentClassified → ContextBuilt → Routed
///   → DirectResponse ─────────────────────────┐
///   → FunctionDispatched → ResultExplained ───┴→ Stored → Done
/// ```
///
/// `Error` is reachable from every state except `Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TurnState {
    Received,
    IntentClassified,
    ContextBuilt,
    Routed,
    DirectResponse,
    FunctionDispatched,
    ResultExplained,
    Stored,
    Done,
    Error,
}

impl TurnState {
    pub fn can_advance_to(self, next: TurnState) -> bool {
        use TurnState::*;
        match (self, next) {
            (Done, _) => false,
            (_, Error) => self != Error,
            (Received, IntentClassified)
            | (IntentClassified, ContextBuilt)
            | (ContextBuilt, Routed)
            | (Routed, DirectResponse)
            | (Routed, FunctionDispatched)
            | (FunctionDispatched, ResultExplained)
            | (DirectResponse, Stored)
            | (ResultExplained, Stored)
            | (Stored, Done) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TurnState::Received => "RECEIVED",
            TurnState::IntentClassified => "INTENT_CLASSIFIED",
            TurnState::ContextBuilt => "CONTEXT_BUILT",
            TurnState::Routed => "ROUTED",
            TurnState::DirectResponse => "DIRECT_RESPONSE",
            TurnState::FunctionDispatched => "FUNCTION_DISPATCHED",
            TurnState::ResultExplained => "RESULT_EXPLAINED",
            TurnState::Stored => "STORED",
            TurnState::Done => "DONE",
            TurnState::Error => "ERROR",
        }
    }
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct IntentResult {
    pub intent: Intent,
    /// In `[0, 1]`; reflects how specific the match was.
    pub confidence: f32,
}

/// Optimized context window plus its accounting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextWindow {
    /// Mode the window was assembled for.
    pub mode: ConversationMode,
    pub messages: Vec<Message>,
    pub original_tokens: usize,
    pub optimized_tokens: usize,
    pub messages_removed: usize,
    pub strategy: ContextStrategy,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RouteDecision {
    pub mode: ConversationMode,
    pub reason: RouteReason,
    pub confidence: f32,
}

/// Error recorded on a turn by a stage error handler.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnError {
    pub node: &'static str,
    pub error_type: &'static str,
    /// Log text; never shown to the user.
    pub detail: String,
}

/// Everything known about one inbound message while its flow runs.
#[derive(Debug, Clone)]
pub struct Turn {
    pub id: String,
    pub inbound: InboundMessage,
    /// Mode of the composition running this turn.
    pub flow_mode: ConversationMode,
    /// Overrides the mode's configured token budget.
    pub token_budget: Option<usize>,
    pub state: TurnState,
    /// Every state entered, in order, starting with `Received`.
    pub trail: Vec<TurnState>,
    pub intent: Option<IntentResult>,
    pub context: Option<ContextWindow>,
    pub route: Option<RouteDecision>,
    pub function_call: Option<FunctionCallRecord>,
    pub reply: Option<String>,
    /// Raw capability rendering, used when the result could not be explained.
    pub fallback: Option<String>,
    pub error: Option<TurnError>,
}

impl Turn {
    pub fn new(inbound: InboundMessage, flow_mode: ConversationMode) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            inbound,
            flow_mode,
            token_budget: None,
            state: TurnState::Received,
            trail: vec![TurnState::Received],
            intent: None,
            context: None,
            route: None,
            function_call: None,
            reply: None,
            fallback: None,
            error: None,
        }
    }

    pub fn with_token_budget(mut self, budget: usize) -> Self {
        self.token_budget = Some(budget);
        self
    }

    /// Move to `next` if the transition is legal. Returns whether it moved.
    pub fn advance(&mut self, next: TurnState) -> bool {
        if !self.state.can_advance_to(next) {
            tracing::debug!(turn = %self.id, from = %self.state, to = %next, "ignored state transition");
            return false;
        }
        self.state = next;
        self.trail.push(next);
        true
    }

    /// Record `error` and pick the reply the user sees.
    pub fn fail(&mut self, node: &'static str, error: &FlowError) {
        self.error = Some(TurnError {
            node,
            error_type: error.error_type(),
            detail: error.to_string(),
        });
        self.reply = Some(match self.fallback.clone() {
            Some(text) => text,
            None => error.user_message().to_string(),
        });
        self.advance(TurnState::Error);
    }

    /// The new message as a user-role context entry.
    pub fn user_message(&self) -> Message {
        Message::user(self.inbound.content.clone(), self.inbound.timestamp)
            .with_message_id(self.inbound.message_id.clone())
    }

    /// True when routing picked `target` but the window was built for another mode.
    pub fn needs_context_for(&self, target: ConversationMode) -> bool {
        match (&self.route, &self.context) {
            (Some(route), Some(ctx)) => route.mode == target && ctx.mode != target,
            _ => false,
        }
    }
}
