//! The pipeline stages. Each one is a [`chorus_flow::Node`] over
//! [`crate::flows::ChorusPipeline`].

pub mod context;
pub mod executor;
pub mod intent;
pub mod persist;
pub mod router;

pub use context::ContextManagerNode;
pub use executor::FunctionExecutorNode;
pub use intent::IntentDetectionNode;
pub use persist::PersistTurnNode;
pub use router::ResponseRouterNode;

pub const INTENT: &str = "intent_detection";
pub const CONTEXT: &str = "context_manager";
/// Context rebuilt after routing picked the individual mode.
pub const CONTEXT_INDIVIDUAL: &str = "context_rebuild_individual";
/// Context rebuilt after routing picked the blended mode.
pub const CONTEXT_BLENDED: &str = "context_rebuild_blended";
pub const ROUTER: &str = "response_router";
pub const EXECUTOR: &str = "function_executor";
pub const PERSIST: &str = "persist_turn";
