//! External capabilities the model (or a prefixed command) can invoke.
//!
//! Function names coming back from the model are parsed into a typed
//! [`CapabilityCall`] and dispatched through a [`CapabilityRegistry`] keyed
//! by [`CapabilityKind`]. Every invocation is time-bounded; a capability that
//! times out yields a failed [`CapabilityOutcome`], not an error.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::provider::ToolDefinition;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    Weather,
    Time,
    Knowledge,
    ServerStats,
    Image,
}

impl CapabilityKind {
    pub const ALL: [CapabilityKind; 5] = [
        CapabilityKind::Weather,
        CapabilityKind::Time,
        CapabilityKind::Knowledge,
        CapabilityKind::ServerStats,
        CapabilityKind::Image,
    ];

    /// Function name exposed to the model.
    pub fn function_name(&self) -> &'static str {
        match self {
            CapabilityKind::Weather => "lookup_weather",
            CapabilityKind::Time => "lookup_time",
            CapabilityKind::Knowledge => "lookup_knowledge_answer",
            CapabilityKind::ServerStats => "lookup_server_stats",
            CapabilityKind::Image => "generate_image",
        }
    }

    pub fn from_function_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.function_name() == name)
    }

    fn description(&self) -> &'static str {
        match self {
            CapabilityKind::Weather => "Current weather conditions for a location.",
            CapabilityKind::Time => "Current local time for a location or timezone.",
            CapabilityKind::Knowledge => "Short factual answer to a general-knowledge question.",
            CapabilityKind::ServerStats => "Statistics about this chat server and the bot.",
            CapabilityKind::Image => "Generate an image from a text prompt.",
        }
    }

    fn input_schema(&self) -> Value {
        match self {
            CapabilityKind::Weather | CapabilityKind::Time => json!({
                "type": "object",
                "properties": {
                    "location": {"type": "string", "description": "City or place name"}
                },
                "required": ["location"]
            }),
            CapabilityKind::Knowledge => json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "The question to answer"}
                },
                "required": ["query"]
            }),
            CapabilityKind::ServerStats => json!({"type": "object", "properties": {}}),
            CapabilityKind::Image => json!({
                "type": "object",
                "properties": {
                    "prompt": {"type": "string", "description": "What the image should show"},
                    "size": {"type": "string", "description": "e.g. 1024x1024"},
                    "style": {"type": "string"}
                },
                "required": ["prompt"]
            }),
        }
    }

    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.function_name().to_string(),
            description: self.description().to_string(),
            input_schema: self.input_schema(),
        }
    }
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.function_name())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
}

/// A fully parsed capability invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum CapabilityCall {
    Weather { location: String },
    Time { location: String },
    Knowledge { query: String },
    ServerStats,
    Image { prompt: String, options: ImageOptions },
}

impl CapabilityCall {
    pub fn kind(&self) -> CapabilityKind {
        match self {
            CapabilityCall::Weather { .. } => CapabilityKind::Weather,
            CapabilityCall::Time { .. } => CapabilityKind::Time,
            CapabilityCall::Knowledge { .. } => CapabilityKind::Knowledge,
            CapabilityCall::ServerStats => CapabilityKind::ServerStats,
            CapabilityCall::Image { .. } => CapabilityKind::Image,
        }
    }

    /// Parse a model function call.
    pub fn parse(name: &str, arguments: &Value) -> Result<Self, CapabilityError> {
        let kind = CapabilityKind::from_function_name(name)
            .ok_or_else(|| CapabilityError::UnknownFunction(name.to_string()))?;
        let arg = |key: &str| required_str(kind, arguments, key);

        Ok(match kind {
            CapabilityKind::Weather => CapabilityCall::Weather {
                location: arg("location")?,
            },
            CapabilityKind::Time => CapabilityCall::Time {
                location: arg("location")?,
            },
            CapabilityKind::Knowledge => CapabilityCall::Knowledge {
                query: arg("query")?,
            },
            CapabilityKind::ServerStats => CapabilityCall::ServerStats,
            CapabilityKind::Image => CapabilityCall::Image {
                prompt: arg("prompt")?,
                options: ImageOptions {
                    size: optional_str(arguments, "size"),
                    style: optional_str(arguments, "style"),
                },
            },
        })
    }

    /// Parse a prefixed chat command such as `!weather Oslo`.
    ///
    /// Returns `Ok(None)` for commands that are not capability commands.
    pub fn from_command(content: &str, prefixes: &[String]) -> Result<Option<Self>, CapabilityError> {
        let trimmed = content.trim();
        let Some(body) = prefixes
            .iter()
            .find_map(|p| trimmed.strip_prefix(p.as_str()))
        else {
            return Ok(None);
        };
        let (command, rest) = match body.split_once(char::is_whitespace) {
            Some((c, r)) => (c, r.trim()),
            None => (body, ""),
        };
        let need = |kind: CapabilityKind| {
            if rest.is_empty() {
                Err(CapabilityError::InvalidArguments {
                    kind,
                    reason: format!("`{command}` needs an argument"),
                })
            } else {
                Ok(rest.to_string())
            }
        };

        let call = match command.to_lowercase().as_str() {
            "weather" => CapabilityCall::Weather {
                location: need(CapabilityKind::Weather)?,
            },
            "time" => CapabilityCall::Time {
                location: need(CapabilityKind::Time)?,
            },
            "ask" => CapabilityCall::Knowledge {
                query: need(CapabilityKind::Knowledge)?,
            },
            "stats" => CapabilityCall::ServerStats,
            "imagine" => CapabilityCall::Image {
                prompt: need(CapabilityKind::Image)?,
                options: ImageOptions::default(),
            },
            _ => return Ok(None),
        };
        Ok(Some(call))
    }

    /// Arguments in the shape the model would have sent them.
    pub fn arguments(&self) -> Value {
        match self {
            CapabilityCall::Weather { location } | CapabilityCall::Time { location } => {
                json!({ "location": location })
            }
            CapabilityCall::Knowledge { query } => json!({ "query": query }),
            CapabilityCall::ServerStats => json!({}),
            CapabilityCall::Image { prompt, options } => {
                let mut args = json!({ "prompt": prompt });
                if let Some(size) = &options.size {
                    args["size"] = json!(size);
                }
                if let Some(style) = &options.style {
                    args["style"] = json!(style);
                }
                args
            }
        }
    }
}

fn required_str(kind: CapabilityKind, args: &Value, key: &str) -> Result<String, CapabilityError> {
    match args.get(key).and_then(Value::as_str).map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(CapabilityError::InvalidArguments {
            kind,
            reason: format!("missing string argument `{key}`"),
        }),
    }
}

fn optional_str(args: &Value, key: &str) -> Option<String> {
    args.get(key).and_then(Value::as_str).map(str::to_string)
}

/// `{ok, data | error}` as returned by every capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityOutcome {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CapabilityOutcome {
    pub fn success(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Plain rendering used when the result cannot be explained by the model.
    pub fn fallback_text(&self, kind: CapabilityKind) -> String {
        match (&self.data, self.ok) {
            (Some(Value::String(s)), true) => s.clone(),
            (Some(data), true) => match data {
                Value::Object(map) => {
                    let lines: Vec<String> =
                        map.iter().map(|(k, v)| format!("{k}: {}", plain(v))).collect();
                    lines.join("\n")
                }
                other => plain(other),
            },
            _ => format!("The {} lookup didn't work out this time.", kind_label(kind)),
        }
    }
}

fn plain(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn kind_label(kind: CapabilityKind) -> &'static str {
    match kind {
        CapabilityKind::Weather => "weather",
        CapabilityKind::Time => "time",
        CapabilityKind::Knowledge => "knowledge",
        CapabilityKind::ServerStats => "server stats",
        CapabilityKind::Image => "image",
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("unknown function: {0}")]
    UnknownFunction(String),

    #[error("invalid arguments for {kind}: {reason}")]
    InvalidArguments { kind: CapabilityKind, reason: String },

    #[error("no capability registered for {0}")]
    Unregistered(CapabilityKind),
}

/// An external service behind one [`CapabilityKind`].
#[async_trait]
pub trait Capability: Send + Sync {
    fn kind(&self) -> CapabilityKind;

    /// Called only with calls of this capability's kind.
    async fn invoke(&self, call: &CapabilityCall) -> CapabilityOutcome;
}

/// Tag → handler table with a shared per-call timeout.
pub struct CapabilityRegistry {
    handlers: BTreeMap<CapabilityKind, Arc<dyn Capability>>,
    timeout: Duration,
}

impl CapabilityRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            handlers: BTreeMap::new(),
            timeout,
        }
    }

    /// Register a handler, replacing any previous one of the same kind.
    pub fn register(&mut self, capability: Arc<dyn Capability>) {
        self.handlers.insert(capability.kind(), capability);
    }

    pub fn with(mut self, capability: Arc<dyn Capability>) -> Self {
        self.register(capability);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn contains(&self, kind: CapabilityKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Tool definitions for the registered kinds only.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.handlers.keys().map(CapabilityKind::definition).collect()
    }

    pub async fn invoke(&self, call: &CapabilityCall) -> Result<CapabilityOutcome, CapabilityError> {
        let kind = call.kind();
        let handler = self
            .handlers
            .get(&kind)
            .ok_or(CapabilityError::Unregistered(kind))?;

        debug!(capability = %kind, "invoking capability");
        match tokio::time::timeout(self.timeout, handler.invoke(call)).await {
            Ok(outcome) => Ok(outcome),
            Err(_) => {
                warn!(capability = %kind, timeout_ms = self.timeout.as_millis() as u64, "capability timed out");
                Ok(CapabilityOutcome::failure(format!(
                    "{kind} timed out after {}ms",
                    self.timeout.as_millis()
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo(CapabilityKind);

    #[async_trait]
    impl Capability for Echo {
        fn kind(&self) -> CapabilityKind {
            self.0
        }

        async fn invoke(&self, call: &CapabilityCall) -> CapabilityOutcome {
            CapabilityOutcome::success(call.arguments())
        }
    }

    struct Stuck;

    #[async_trait]
    impl Capability for Stuck {
        fn kind(&self) -> CapabilityKind {
            CapabilityKind::Image
        }

        async fn invoke(&self, _call: &CapabilityCall) -> CapabilityOutcome {
            tokio::time::sleep(Duration::from_secs(5)).await;
            CapabilityOutcome::success(json!("late"))
        }
    }

    fn prefixes() -> Vec<String> {
        vec!["!".to_string(), "/".to_string()]
    }

    #[test]
    fn parses_model_function_calls() {
        let call = CapabilityCall::parse("lookup_weather", &json!({"location": " Oslo "})).unwrap();
        assert_eq!(
            call,
            CapabilityCall::Weather {
                location: "Oslo".into()
            }
        );
        assert_eq!(
            CapabilityCall::parse("lookup_server_stats", &json!({})).unwrap(),
            CapabilityCall::ServerStats
        );
        assert!(matches!(
            CapabilityCall::parse("launch_rockets", &json!({})),
            Err(CapabilityError::UnknownFunction(_))
        ));
        assert!(matches!(
            CapabilityCall::parse("lookup_time", &json!({"location": 3})),
            Err(CapabilityError::InvalidArguments { .. })
        ));
    }

    #[test]
    fn parses_prefixed_commands() {
        let call = CapabilityCall::from_command("!imagine a red fox", &prefixes()).unwrap();
        assert_eq!(
            call,
            Some(CapabilityCall::Image {
                prompt: "a red fox".into(),
                options: ImageOptions::default()
            })
        );
        assert_eq!(
            CapabilityCall::from_command("/stats", &prefixes()).unwrap(),
            Some(CapabilityCall::ServerStats)
        );
        assert_eq!(CapabilityCall::from_command("!help", &prefixes()).unwrap(), None);
        assert_eq!(CapabilityCall::from_command("weather?", &prefixes()).unwrap(), None);
        assert!(CapabilityCall::from_command("!weather", &prefixes()).is_err());
    }

    #[test]
    fn fallback_text_renders_objects_line_by_line() {
        let outcome = CapabilityOutcome::success(json!({"location": "Oslo", "temp_c": 4}));
        assert_eq!(
            outcome.fallback_text(CapabilityKind::Weather),
            "location: Oslo\ntemp_c: 4"
        );
        let failed = CapabilityOutcome::failure("upstream 500");
        assert!(!failed
            .fallback_text(CapabilityKind::Weather)
            .contains("upstream"));
    }

    #[tokio::test]
    async fn registry_offers_only_registered_tools() {
        let registry = CapabilityRegistry::new(Duration::from_secs(1))
            .with(Arc::new(Echo(CapabilityKind::Time)));
        let defs = registry.definitions();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "lookup_time");

        let err = registry
            .invoke(&CapabilityCall::Knowledge { query: "x".into() })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CapabilityError::Unregistered(CapabilityKind::Knowledge)
        ));
    }

    #[tokio::test]
    async fn capability_timeout_becomes_failed_outcome() {
        let registry =
            CapabilityRegistry::new(Duration::from_millis(20)).with(Arc::new(Stuck));
        let outcome = registry
            .invoke(&CapabilityCall::Image {
                prompt: "cat".into(),
                options: ImageOptions::default(),
            })
            .await
            .unwrap();
        assert!(!outcome.ok);
        assert!(outcome.error.unwrap().contains("timed out"));
    }
}
