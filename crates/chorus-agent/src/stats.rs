use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::json;

use chorus_store::ConversationStore;

use crate::capability::{Capability, CapabilityCall, CapabilityKind, CapabilityOutcome};

/// `lookup_server_stats` answered from the bot's own store counts.
pub struct StoreStatsCapability {
    store: Arc<ConversationStore>,
    started: Instant,
}

impl StoreStatsCapability {
    pub fn new(store: Arc<ConversationStore>) -> Self {
        Self {
            store,
            started: Instant::now(),
        }
    }
}

#[async_trait]
impl Capability for StoreStatsCapability {
    fn kind(&self) -> CapabilityKind {
        CapabilityKind::ServerStats
    }

    async fn invoke(&self, call: &CapabilityCall) -> CapabilityOutcome {
        if !matches!(call, CapabilityCall::ServerStats) {
            return CapabilityOutcome::failure("not a server stats call");
        }
        let stats = self.store.stats();
        CapabilityOutcome::success(json!({
            "conversations": stats.conversations,
            "channels": stats.channels,
            "users": stats.users,
            "active_flows": stats.active_flows,
            "uptime_secs": self.started.elapsed().as_secs(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_core::config::StoreConfig;
    use chorus_core::types::Message;
    use chrono::Utc;

    #[tokio::test]
    async fn reports_store_counts() {
        let store = Arc::new(ConversationStore::new(StoreConfig::default(), "persona"));
        store.append_message("a", Message::user("hi", Utc::now()));
        store.append_message("b", Message::user("yo", Utc::now()));

        let cap = StoreStatsCapability::new(Arc::clone(&store));
        let outcome = cap.invoke(&CapabilityCall::ServerStats).await;
        assert!(outcome.ok);
        assert_eq!(outcome.data.unwrap()["conversations"], 2);
    }
}
