//! `chorus-store`: in-memory conversation state with bounded maps,
//! an active-flow guard, inactivity cleanup and snapshot persistence.

mod bounded;
pub mod db;
pub mod error;
pub mod snapshot;
pub mod store;
pub mod types;

pub use error::{Result, StoreError};
pub use snapshot::{
    restore_latest, run_maintenance, SnapshotPersistence, SqliteSnapshots, StoreSnapshot,
};
pub use store::ConversationStore;
pub use types::{
    ActiveFlow, ChannelContext, ChannelMessage, CleanupReport, ContextMeta, Conversation,
    RoutingRecord, StoreStats, UserContext,
};
