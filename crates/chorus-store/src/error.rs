use thiserror::Error;

use chorus_core::types::ConversationMode;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The user already has a flow running; the caller must reject or defer.
    #[error("flow already active for user {user_id} ({flow_type})")]
    FlowActive {
        user_id: String,
        flow_type: ConversationMode,
    },

    /// A SQLite operation failed.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A snapshot could not be encoded or decoded.
    #[error("snapshot serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The blocking persistence task panicked or was cancelled.
    #[error("persistence task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
