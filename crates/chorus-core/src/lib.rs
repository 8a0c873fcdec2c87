//! Shared configuration, error and message types for the Chorus pipeline.

pub mod config;
pub mod error;
pub mod time;
pub mod types;

pub use config::ChorusConfig;
pub use error::{ChorusError, Result};
pub use types::{
    ChannelKind, ContextStrategy, ConversationMode, FunctionCallRecord, InboundMessage, Intent,
    Message, Role, RouteReason,
};
