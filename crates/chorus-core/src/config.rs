use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::types::ConversationMode;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are Chorus, a friendly assistant living in a chat \
server. Keep replies short and conversational. When several people are talking, address them \
by name.";

/// Top-level config (chorus.toml + CHORUS_* env overrides).
///
/// Every section has defaults, so an empty or missing file is valid.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChorusConfig {
    #[serde(default)]
    pub persona: PersonaConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaConfig {
    /// Seeded as the first message of every conversation.
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

impl Default for PersonaConfig {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(),
        }
    }
}

/// Bounds and sweep timings for the in-memory conversation store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Max messages kept per conversation, system message included.
    #[serde(default = "default_max_conversation_length")]
    pub max_conversation_length: usize,
    #[serde(default = "default_max_channel_messages")]
    pub max_channel_messages: usize,
    #[serde(default = "default_max_user_messages")]
    pub max_user_messages: usize,
    #[serde(default = "default_max_routing_history")]
    pub max_routing_history: usize,
    /// Max tracked entries per map before the least recently active one is evicted.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    /// Channel and user contexts idle longer than this are swept.
    #[serde(default = "default_inactivity_threshold_secs")]
    pub inactivity_threshold_secs: u64,
    /// Conversations idle longer than this are swept.
    #[serde(default = "default_conversation_ttl_secs")]
    pub conversation_ttl_secs: u64,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_conversation_length: default_max_conversation_length(),
            max_channel_messages: default_max_channel_messages(),
            max_user_messages: default_max_user_messages(),
            max_routing_history: default_max_routing_history(),
            max_entries: default_max_entries(),
            inactivity_threshold_secs: default_inactivity_threshold_secs(),
            conversation_ttl_secs: default_conversation_ttl_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

/// History size and token budgets for one conversation mode.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Number of stored messages pulled into the candidate list.
    pub history: usize,
    pub token_budget: usize,
    /// Hard ceiling; above it the window collapses to the minimal set.
    pub emergency_budget: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    #[serde(default = "default_chars_per_token")]
    pub chars_per_token: usize,
    /// Most recent non-system messages that are never pruned.
    #[serde(default = "default_keep_recent")]
    pub keep_recent: usize,
    #[serde(default = "default_individual_budget")]
    pub individual: BudgetConfig,
    #[serde(default = "default_blended_budget")]
    pub blended: BudgetConfig,
    #[serde(default = "default_command_budget")]
    pub command: BudgetConfig,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            chars_per_token: default_chars_per_token(),
            keep_recent: default_keep_recent(),
            individual: default_individual_budget(),
            blended: default_blended_budget(),
            command: default_command_budget(),
        }
    }
}

impl ContextConfig {
    pub fn budget_for(&self, mode: ConversationMode) -> BudgetConfig {
        match mode {
            ConversationMode::Individual => self.individual,
            ConversationMode::Blended => self.blended,
            ConversationMode::Command => self.command,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default = "default_high_confidence")]
    pub high_confidence: f32,
    #[serde(default = "default_medium_confidence")]
    pub medium_confidence: f32,
    /// Distinct speakers within `activity_window_secs` that switch a channel to blended.
    #[serde(default = "default_active_user_threshold")]
    pub active_user_threshold: usize,
    #[serde(default = "default_window_secs")]
    pub activity_window_secs: u64,
    #[serde(default = "default_window_secs")]
    pub inactivity_window_secs: u64,
    #[serde(default = "default_mode")]
    pub default_mode: ConversationMode,
    #[serde(default = "default_command_prefixes")]
    pub command_prefixes: Vec<String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            high_confidence: default_high_confidence(),
            medium_confidence: default_medium_confidence(),
            active_user_threshold: default_active_user_threshold(),
            activity_window_secs: default_window_secs(),
            inactivity_window_secs: default_window_secs(),
            default_mode: default_mode(),
            command_prefixes: default_command_prefixes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_completion_timeout_ms")]
    pub completion_timeout_ms: u64,
    /// Wall-clock limit on the call that explains a capability result.
    #[serde(default = "default_explanation_timeout_ms")]
    pub explanation_timeout_ms: u64,
    #[serde(default = "default_capability_timeout_ms")]
    pub capability_timeout_ms: u64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            completion_timeout_ms: default_completion_timeout_ms(),
            explanation_timeout_ms: default_explanation_timeout_ms(),
            capability_timeout_ms: default_capability_timeout_ms(),
            max_tokens: default_max_tokens(),
        }
    }
}

/// OpenAI-compatible chat completions endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    pub api_key: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            model: default_model(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file holding store snapshots.
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}
fn default_max_conversation_length() -> usize {
    20
}
fn default_max_channel_messages() -> usize {
    50
}
fn default_max_user_messages() -> usize {
    20
}
fn default_max_routing_history() -> usize {
    20
}
fn default_max_entries() -> usize {
    10_000
}
fn default_inactivity_threshold_secs() -> u64 {
    30 * 60
}
fn default_conversation_ttl_secs() -> u64 {
    24 * 60 * 60
}
fn default_cleanup_interval_secs() -> u64 {
    5 * 60
}
fn default_chars_per_token() -> usize {
    4
}
fn default_keep_recent() -> usize {
    3
}
fn default_individual_budget() -> BudgetConfig {
    BudgetConfig {
        history: 20,
        token_budget: 2000,
        emergency_budget: 4000,
    }
}
fn default_blended_budget() -> BudgetConfig {
    BudgetConfig {
        history: 15,
        token_budget: 1500,
        emergency_budget: 3000,
    }
}
fn default_command_budget() -> BudgetConfig {
    BudgetConfig {
        history: 6,
        token_budget: 1000,
        emergency_budget: 2000,
    }
}
fn default_high_confidence() -> f32 {
    0.8
}
fn default_medium_confidence() -> f32 {
    0.5
}
fn default_active_user_threshold() -> usize {
    5
}
fn default_window_secs() -> u64 {
    5 * 60
}
fn default_mode() -> ConversationMode {
    ConversationMode::Individual
}
fn default_command_prefixes() -> Vec<String> {
    vec!["!".to_string(), "/".to_string()]
}
fn default_completion_timeout_ms() -> u64 {
    30_000
}
fn default_explanation_timeout_ms() -> u64 {
    15_000
}
fn default_capability_timeout_ms() -> u64 {
    10_000
}
fn default_max_tokens() -> u32 {
    1024
}
fn default_base_url() -> String {
    "https://api.openai.com".to_string()
}
fn default_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.chorus/chorus.db", home)
}

impl ChorusConfig {
    /// Load config from a TOML file with CHORUS_* env var overrides.
    ///
    /// Nested keys use a double underscore: `CHORUS_STORE__MAX_ENTRIES=500`.
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.chorus/chorus.toml
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: ChorusConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CHORUS_").split("__"))
            .extract()
            .map_err(|e| crate::error::ChorusError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.chorus/chorus.toml", home)
}
