use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Author role of a single context message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Function,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Function => "function",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Name and result of a capability call folded into the history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCallRecord {
    pub name: String,
    pub result: serde_json::Value,
}

/// One entry of a conversation or an assembled context window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// Priority weight used by context pruning. Higher survives longer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relevance_score: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCallRecord>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp,
            message_id: None,
            relevance_score: None,
            function_call: None,
        }
    }

    pub fn system(content: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self::new(Role::System, content, timestamp)
    }

    pub fn user(content: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self::new(Role::User, content, timestamp)
    }

    pub fn assistant(content: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self::new(Role::Assistant, content, timestamp)
    }

    /// A function-role message carrying a capability result.
    pub fn function(
        name: impl Into<String>,
        result: serde_json::Value,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let name = name.into();
        let content = match &result {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        Self {
            role: Role::Function,
            content,
            timestamp,
            message_id: None,
            relevance_score: None,
            function_call: Some(FunctionCallRecord { name, result }),
        }
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn with_relevance(mut self, score: f32) -> Self {
        self.relevance_score = Some(score);
        self
    }

    pub fn is_system(&self) -> bool {
        self.role == Role::System
    }
}

/// Where an inbound message was posted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Direct,
    Guild,
}

/// A message handed over by the gateway collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub author_id: String,
    /// Display name used as the speaker prefix in blended context.
    #[serde(default)]
    pub author_name: Option<String>,
    pub channel_id: String,
    pub channel_kind: ChannelKind,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub message_id: String,
    #[serde(default)]
    pub reply_reference: Option<String>,
}

impl InboundMessage {
    pub fn is_direct(&self) -> bool {
        self.channel_kind == ChannelKind::Direct
    }

    /// Name shown in front of this author's lines in a shared channel transcript.
    pub fn speaker(&self) -> &str {
        self.author_name.as_deref().unwrap_or(&self.author_id)
    }
}

/// Conversational mode a message is answered in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationMode {
    /// The author's private history forms the context.
    Individual,
    /// Recent multi-user channel activity forms the context.
    Blended,
    /// Prefixed command handling with a minimal context.
    Command,
}

impl ConversationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationMode::Individual => "individual",
            ConversationMode::Blended => "blended",
            ConversationMode::Command => "command",
        }
    }
}

impl fmt::Display for ConversationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Intent tag produced by heuristic classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Command,
    ImageRequest,
    WeatherQuery,
    TimeQuery,
    KnowledgeQuery,
    ServerStats,
    SmallTalk,
    General,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Command => "command",
            Intent::ImageRequest => "image_request",
            Intent::WeatherQuery => "weather_query",
            Intent::TimeQuery => "time_query",
            Intent::KnowledgeQuery => "knowledge_query",
            Intent::ServerStats => "server_stats",
            Intent::SmallTalk => "small_talk",
            Intent::General => "general",
        }
    }

    /// Intents answered by an external capability rather than plain chat.
    pub fn wants_capability(&self) -> bool {
        matches!(
            self,
            Intent::ImageRequest
                | Intent::WeatherQuery
                | Intent::TimeQuery
                | Intent::KnowledgeQuery
                | Intent::ServerStats
        )
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the router picked a mode. Serialized as the reason code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteReason {
    DirectMessage,
    HighConfidence,
    CommandPattern,
    HighChannelActivity,
    RecentChannelActivity,
    MediumConfidence,
    DefaultMode,
}

impl RouteReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteReason::DirectMessage => "direct_message",
            RouteReason::HighConfidence => "high_confidence",
            RouteReason::CommandPattern => "command_pattern",
            RouteReason::HighChannelActivity => "high_channel_activity",
            RouteReason::RecentChannelActivity => "recent_channel_activity",
            RouteReason::MediumConfidence => "medium_confidence",
            RouteReason::DefaultMode => "default_mode",
        }
    }
}

impl fmt::Display for RouteReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a context window was reduced to fit its budget.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextStrategy {
    #[default]
    None,
    Pruning,
    EmergencyPruning,
}

impl ContextStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextStrategy::None => "none",
            ContextStrategy::Pruning => "pruning",
            ContextStrategy::EmergencyPruning => "emergency_pruning",
        }
    }
}

impl fmt::Display for ContextStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
