//! The Chorus message pipeline: intent detection, token-budgeted
//! context assembly, mode routing and function execution, wired into flows
//! over the shared [`chorus_store::ConversationStore`].

pub mod capability;
pub mod dispatch;
pub mod error;
pub mod flows;
pub mod nodes;
pub mod openai;
pub mod provider;
pub mod stats;
pub mod turn;

pub use capability::{
    Capability, CapabilityCall, CapabilityError, CapabilityKind, CapabilityOutcome,
    CapabilityRegistry,
};
pub use dispatch::{DispatchOutcome, FlowDispatcher};
pub use error::FlowError;
pub use flows::{ChorusFlow, ChorusPipeline, FlowDeps};
pub use provider::{Completion, CompletionRequest, LlmClient, ProviderError, ToolDefinition};
pub use turn::{Turn, TurnState};
