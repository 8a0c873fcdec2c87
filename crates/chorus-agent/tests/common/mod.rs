#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use chorus_agent::{
    Capability, CapabilityCall, CapabilityKind, CapabilityOutcome, CapabilityRegistry, Completion,
    CompletionRequest, FlowDeps, FlowDispatcher, LlmClient, ProviderError,
};
use chorus_core::config::ChorusConfig;
use chorus_core::types::{ChannelKind, InboundMessage};
use chorus_store::ConversationStore;

/// One scripted model answer.
pub enum Step {
    Say(&'static str),
    Call(&'static str, Value),
    Fail,
    /// Answer after a delay.
    Slow(Duration, &'static str),
    /// Never answers in time.
    Hang,
}

/// Replays `Step`s in order, then says "ok" forever.
pub struct ScriptedLlm {
    steps: Mutex<VecDeque<Step>>,
    pub requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedLlm {
    pub fn new(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, req: &CompletionRequest) -> Result<Completion, ProviderError> {
        self.requests.lock().unwrap().push(req.clone());
        let step = self.steps.lock().unwrap().pop_front();
        match step {
            None => Ok(Completion::Message {
                content: "ok".into(),
            }),
            Some(Step::Say(text)) => Ok(Completion::Message {
                content: text.into(),
            }),
            Some(Step::Call(name, arguments)) => Ok(Completion::FunctionCall {
                id: "call_1".into(),
                name: name.into(),
                arguments,
            }),
            Some(Step::Fail) => Err(ProviderError::Unavailable("scripted failure".into())),
            Some(Step::Slow(delay, text)) => {
                tokio::time::sleep(delay).await;
                Ok(Completion::Message {
                    content: text.into(),
                })
            }
            Some(Step::Hang) => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(Completion::Message {
                    content: "too late".into(),
                })
            }
        }
    }
}

/// Weather service stub that always reports sleet in the asked location.
pub struct FixedWeather;

#[async_trait]
impl Capability for FixedWeather {
    fn kind(&self) -> CapabilityKind {
        CapabilityKind::Weather
    }

    async fn invoke(&self, call: &CapabilityCall) -> CapabilityOutcome {
        match call {
            CapabilityCall::Weather { location } => CapabilityOutcome::success(json!({
                "location": location,
                "conditions": "sleet",
                "temp_c": 2,
            })),
            _ => CapabilityOutcome::failure("wrong call"),
        }
    }
}

pub fn test_config() -> ChorusConfig {
    let mut config = ChorusConfig::default();
    config.persona.system_prompt = "You are a test bot.".into();
    config.executor.explanation_timeout_ms = 100;
    config.executor.completion_timeout_ms = 1_000;
    config
}

pub struct Harness {
    pub store: Arc<ConversationStore>,
    pub llm: Arc<ScriptedLlm>,
    pub dispatcher: FlowDispatcher,
}

pub fn harness(config: ChorusConfig, steps: Vec<Step>) -> Harness {
    let store = Arc::new(ConversationStore::new(
        config.store.clone(),
        config.persona.system_prompt.clone(),
    ));
    let llm = ScriptedLlm::new(steps);
    let capabilities = CapabilityRegistry::new(Duration::from_millis(
        config.executor.capability_timeout_ms,
    ))
    .with(Arc::new(FixedWeather));
    let deps = FlowDeps {
        store: Arc::clone(&store),
        llm: llm.clone(),
        capabilities: Arc::new(capabilities),
        config: Arc::new(config),
    };
    let dispatcher = FlowDispatcher::new(&deps).expect("flows build");
    Harness {
        store,
        llm,
        dispatcher,
    }
}

pub fn dm(author: &str, content: &str) -> InboundMessage {
    message(author, &format!("dm-{author}"), ChannelKind::Direct, content, Utc::now())
}

pub fn guild(author: &str, channel: &str, content: &str, at: DateTime<Utc>) -> InboundMessage {
    message(author, channel, ChannelKind::Guild, content, at)
}

fn message(
    author: &str,
    channel: &str,
    kind: ChannelKind,
    content: &str,
    at: DateTime<Utc>,
) -> InboundMessage {
    InboundMessage {
        author_id: author.to_string(),
        author_name: Some(format!("{author}-name")),
        channel_id: channel.to_string(),
        channel_kind: kind,
        content: content.to_string(),
        timestamp: at,
        message_id: uuid::Uuid::new_v4().to_string(),
        reply_reference: None,
    }
}
