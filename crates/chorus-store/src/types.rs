use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use chorus_core::types::{ContextStrategy, ConversationMode, Intent, Message, RouteReason};

/// Token accounting written back after each context assembly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextMeta {
    pub token_count: usize,
    pub strategy: ContextStrategy,
}

/// A user's private message history.
///
/// `messages[0]` is always the system persona message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub messages: Vec<Message>,
    pub last_activity: DateTime<Utc>,
    /// Total non-system messages ever appended, unaffected by eviction.
    pub message_count: u64,
    #[serde(default)]
    pub context: ContextMeta,
}

impl Conversation {
    pub fn new(system_prompt: &str, now: DateTime<Utc>) -> Self {
        Self {
            messages: vec![Message::system(system_prompt, now)],
            last_activity: now,
            message_count: 0,
            context: ContextMeta::default(),
        }
    }

    /// Stored history without the persona message.
    pub fn history(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter().filter(|m| !m.is_system())
    }
}

/// One line of shared channel activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub author_id: String,
    pub author_name: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub message_id: Option<String>,
    /// True for the bot's own replies.
    #[serde(default)]
    pub from_bot: bool,
}

/// One routing decision, kept for diagnostics and activity heuristics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingRecord {
    pub mode: ConversationMode,
    pub reason: RouteReason,
    pub confidence: f32,
    pub intent: Intent,
    pub timestamp: DateTime<Utc>,
}

/// Shared per-channel state used for blended context and activity routing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelContext {
    pub recent_messages: VecDeque<ChannelMessage>,
    /// author id → last time that author spoke here.
    pub active_users: HashMap<String, DateTime<Utc>>,
    pub last_activity: DateTime<Utc>,
    pub routing_history: VecDeque<RoutingRecord>,
    #[serde(default)]
    pub context: ContextMeta,
}

impl ChannelContext {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            recent_messages: VecDeque::new(),
            active_users: HashMap::new(),
            last_activity: now,
            routing_history: VecDeque::new(),
            context: ContextMeta::default(),
        }
    }

    /// Distinct human authors seen at or after `since`.
    pub fn active_user_count(&self, since: DateTime<Utc>) -> usize {
        self.active_users.values().filter(|t| **t >= since).count()
    }

    /// Whether any message landed at or after `since`.
    pub fn has_activity_since(&self, since: DateTime<Utc>) -> bool {
        self.recent_messages.iter().any(|m| m.timestamp >= since)
    }
}

/// Per-user state that survives across conversations and channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserContext {
    pub routing_history: VecDeque<RoutingRecord>,
    pub message_history: VecDeque<Message>,
    pub last_seen: DateTime<Utc>,
    /// Intent of the previous message, used for follow-up detection.
    #[serde(default)]
    pub last_intent: Option<Intent>,
}

impl UserContext {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            routing_history: VecDeque::new(),
            message_history: VecDeque::new(),
            last_seen: now,
            last_intent: None,
        }
    }
}

/// Marker for a flow currently running on behalf of a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveFlow {
    pub flow_type: ConversationMode,
    /// Channel the flow reads and writes; protected from cleanup while set.
    pub channel_id: String,
    pub run_id: String,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub flow_data: serde_json::Value,
}

impl ActiveFlow {
    pub fn new(flow_type: ConversationMode, channel_id: impl Into<String>) -> Self {
        Self {
            flow_type,
            channel_id: channel_id.into(),
            run_id: uuid::Uuid::now_v7().to_string(),
            start_time: Utc::now(),
            flow_data: serde_json::Value::Null,
        }
    }
}

/// Counts returned by a cleanup sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub conversations_removed: usize,
    pub channels_removed: usize,
    pub users_removed: usize,
    /// Expired entries kept because an active flow references them.
    pub skipped_active: usize,
}

impl CleanupReport {
    pub fn total_removed(&self) -> usize {
        self.conversations_removed + self.channels_removed + self.users_removed
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub conversations: usize,
    pub channels: usize,
    pub users: usize,
    pub active_flows: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn new_conversation_starts_with_persona() {
        let conv = Conversation::new("be nice", Utc::now());
        assert_eq!(conv.messages.len(), 1);
        assert!(conv.messages[0].is_system());
        assert_eq!(conv.history().count(), 0);
    }

    #[test]
    fn active_user_count_respects_window() {
        let now = Utc::now();
        let mut ch = ChannelContext::new(now);
        ch.active_users.insert("a".into(), now - Duration::minutes(10));
        ch.active_users.insert("b".into(), now - Duration::minutes(2));
        ch.active_users.insert("c".into(), now);
        assert_eq!(ch.active_user_count(now - Duration::minutes(5)), 2);
    }
}
