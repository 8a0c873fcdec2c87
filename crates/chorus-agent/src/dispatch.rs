//! Entry point for inbound messages: picks a composition, holds the
//! per-user active-flow guard for the duration of the run, and reports the
//! reply.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use chorus_core::config::RouterConfig;
use chorus_core::time::lookback;
use chorus_core::types::{ConversationMode, InboundMessage};
use chorus_flow::BuildError;
use chorus_store::{ActiveFlow, ConversationStore, StoreError};

use crate::flows::{blended_flow, command_flow, individual_flow, ChorusFlow, FlowDeps};
use crate::nodes::intent::is_command;
use crate::nodes::persist::inbound_channel_line;
use crate::turn::{Turn, TurnState};

/// Reply for a user whose previous message is still being processed.
pub const BUSY_REPLY: &str = "I'm still working on your last message. Give me a moment.";

#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    /// The flow ran; `turn.reply` holds what to send (also on failure).
    Completed(Box<Turn>),
    /// Rejected by the active-flow guard.
    Busy {
        reply: String,
        running: ConversationMode,
    },
}

impl DispatchOutcome {
    /// Text to send back, if any.
    pub fn reply(&self) -> Option<&str> {
        match self {
            DispatchOutcome::Completed(turn) => turn.reply.as_deref(),
            DispatchOutcome::Busy { reply, .. } => Some(reply),
        }
    }
}

/// Releases a user's active-flow entry when dropped, including when the
/// dispatch future is cancelled mid-run.
struct FlowClaim<'a> {
    store: &'a ConversationStore,
    user: &'a str,
    run_id: &'a str,
}

impl Drop for FlowClaim<'_> {
    fn drop(&mut self) {
        if self.store.clear_active_flow_run(self.user, self.run_id) {
            debug!(user = %self.user, run = %self.run_id, "active flow released");
        }
    }
}

pub struct FlowDispatcher {
    store: Arc<ConversationStore>,
    router: RouterConfig,
    individual: ChorusFlow,
    blended: ChorusFlow,
    command: ChorusFlow,
}

impl FlowDispatcher {
    pub fn new(deps: &FlowDeps) -> Result<Self, BuildError> {
        Ok(Self {
            store: Arc::clone(&deps.store),
            router: deps.config.router.clone(),
            individual: individual_flow(deps)?,
            blended: blended_flow(deps)?,
            command: command_flow(deps)?,
        })
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    /// Composition for `message`: prefixed commands, then direct messages,
    /// then channels with recent activity.
    pub fn select_mode(&self, message: &InboundMessage) -> ConversationMode {
        if is_command(&message.content, &self.router.command_prefixes) {
            return ConversationMode::Command;
        }
        if message.is_direct() {
            return ConversationMode::Individual;
        }
        let since = lookback(message.timestamp, self.router.inactivity_window_secs);
        let active = self
            .store
            .peek_channel_context(&message.channel_id)
            .is_some_and(|ch| ch.has_activity_since(since));
        if active {
            ConversationMode::Blended
        } else {
            ConversationMode::Individual
        }
    }

    fn flow_for(&self, mode: ConversationMode) -> &ChorusFlow {
        match mode {
            ConversationMode::Individual => &self.individual,
            ConversationMode::Blended => &self.blended,
            ConversationMode::Command => &self.command,
        }
    }

    /// Run one inbound message to completion. Never fails: every failure is
    /// folded into the returned turn's reply.
    pub async fn dispatch(&self, message: InboundMessage) -> DispatchOutcome {
        self.dispatch_turn(Turn::new, message).await
    }

    /// Like [`dispatch`](Self::dispatch) with a token budget override.
    pub async fn dispatch_with_budget(
        &self,
        message: InboundMessage,
        token_budget: usize,
    ) -> DispatchOutcome {
        self.dispatch_turn(
            |msg, mode| Turn::new(msg, mode).with_token_budget(token_budget),
            message,
        )
        .await
    }

    async fn dispatch_turn(
        &self,
        make_turn: impl FnOnce(InboundMessage, ConversationMode) -> Turn,
        message: InboundMessage,
    ) -> DispatchOutcome {
        let mode = self.select_mode(&message);
        let author = message.author_id.clone();
        let guard = ActiveFlow::new(mode, message.channel_id.clone());
        let run_id = guard.run_id.clone();

        if let Err(e) = self.store.set_active_flow(&author, guard) {
            let running = match e {
                StoreError::FlowActive { flow_type, .. } => flow_type,
                _ => mode,
            };
            warn!(user = %author, running = %running, "message rejected, flow already active");
            return DispatchOutcome::Busy {
                reply: BUSY_REPLY.to_string(),
                running,
            };
        }
        let claim = FlowClaim {
            store: &self.store,
            user: &author,
            run_id: &run_id,
        };

        let started = Instant::now();
        let flow = self.flow_for(mode);
        let report = flow.run(make_turn(message, mode)).await;
        let mut turn = report.data;

        // Persist records the inbound line itself; failed turns still count as activity.
        if turn.state != TurnState::Stored {
            self.store
                .record_channel_message(&turn.inbound.channel_id, inbound_channel_line(&turn));
        }
        drop(claim);

        if let Some(failure) = &report.failure {
            if !failure.handled {
                turn.fail(failure.node, &failure.error);
            }
        } else {
            turn.advance(TurnState::Done);
        }

        info!(
            turn = %turn.id,
            user = %author,
            flow = flow.name(),
            path = ?report.path,
            state = %turn.state,
            error_type = turn.error.as_ref().map(|e| e.error_type).unwrap_or("none"),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "turn finished"
        );
        DispatchOutcome::Completed(Box::new(turn))
    }
}
