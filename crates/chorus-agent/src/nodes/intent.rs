//! Heuristic intent classification.
//!
//! Confidence is a fixed function of how specific the match was, from an
//! explicit command prefix (1.0) down to the catch-all `general` (0.2).

use async_trait::async_trait;
use tracing::debug;

use chorus_core::types::Intent;
use chorus_flow::Node;
use chorus_store::ConversationStore;

use crate::error::FlowError;
use crate::flows::ChorusPipeline;
use crate::turn::{IntentResult, Turn, TurnState};

/// Longest message accepted for classification, in characters.
pub const MAX_MESSAGE_CHARS: usize = 4000;

pub const COMMAND_CONFIDENCE: f32 = 1.0;
pub const SMALL_TALK_CONFIDENCE: f32 = 0.9;
pub const PHRASE_CONFIDENCE: f32 = 0.8;
pub const STRONG_KEYWORD_CONFIDENCE: f32 = 0.6;
pub const WEAK_KEYWORD_CONFIDENCE: f32 = 0.4;
pub const FOLLOW_UP_CONFIDENCE: f32 = 0.35;
pub const GENERAL_CONFIDENCE: f32 = 0.2;

/// Messages up to this many words may inherit the previous capability intent.
const FOLLOW_UP_MAX_WORDS: usize = 6;

const SMALL_TALK: &[&str] = &[
    "hi",
    "hello",
    "hey",
    "yo",
    "sup",
    "hiya",
    "good morning",
    "good afternoon",
    "good evening",
    "good night",
    "how are you",
    "hows it going",
    "whats up",
    "thanks",
    "thank you",
    "thx",
    "ty",
    "bye",
    "goodbye",
    "see you",
    "lol",
    "nice",
    "cool",
    "ok",
    "okay",
];

struct Category {
    intent: Intent,
    phrases: &'static [&'static str],
    strong: &'static [&'static str],
    weak: &'static [&'static str],
}

// Checked in this order within each tier.
const CATEGORIES: &[Category] = &[
    Category {
        intent: Intent::ImageRequest,
        phrases: &[
            "draw me",
            "draw a",
            "generate an image",
            "generate a picture",
            "make an image",
            "make a picture",
            "create an image",
            "picture of",
            "image of",
        ],
        strong: &["draw", "imagine", "paint", "sketch", "illustrate"],
        weak: &["picture", "image", "photo", "art"],
    },
    Category {
        intent: Intent::WeatherQuery,
        phrases: &[
            "whats the weather",
            "weather in",
            "weather like",
            "is it raining",
            "is it snowing",
            "temperature in",
        ],
        strong: &["weather", "forecast", "temperature"],
        weak: &["rain", "raining", "sunny", "snow", "cold", "hot", "umbrella"],
    },
    Category {
        intent: Intent::TimeQuery,
        phrases: &[
            "what time is it",
            "whats the time",
            "time in",
            "current time",
            "time zone",
        ],
        strong: &["timezone"],
        weak: &["time", "clock", "hour"],
    },
    Category {
        intent: Intent::ServerStats,
        phrases: &[
            "server stats",
            "server info",
            "how many members",
            "how many users",
            "whos online",
        ],
        strong: &["stats", "statistics", "uptime"],
        weak: &["members", "online", "server"],
    },
    Category {
        intent: Intent::KnowledgeQuery,
        phrases: &[
            "what is",
            "what are",
            "who is",
            "who was",
            "tell me about",
            "how does",
            "how do",
            "explain",
        ],
        strong: &["define", "definition", "wikipedia", "meaning"],
        weak: &["who", "why", "how", "what"],
    },
];

/// Lowercased words with punctuation and apostrophes stripped.
pub(crate) fn words(text: &str) -> Vec<String> {
    text.to_lowercase()
        .replace(['\'', '’'], "")
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

fn has_phrase(padded: &str, phrase: &str) -> bool {
    padded.contains(&format!(" {phrase} "))
}

/// Classify `content`. Only malformed input fails.
///
/// `last_intent` is the author's previous intent, used to treat short
/// unmatched messages ("and in Paris?") as follow-ups.
pub fn classify(
    content: &str,
    command_prefixes: &[String],
    last_intent: Option<Intent>,
) -> Result<IntentResult, FlowError> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(FlowError::Validation("empty message".to_string()));
    }
    let chars = trimmed.chars().count();
    if chars > MAX_MESSAGE_CHARS {
        return Err(FlowError::Validation(format!(
            "message is {chars} characters, limit is {MAX_MESSAGE_CHARS}"
        )));
    }

    let result = |intent, confidence| Ok(IntentResult { intent, confidence });

    if is_command(trimmed, command_prefixes) {
        return result(Intent::Command, COMMAND_CONFIDENCE);
    }

    let words = words(trimmed);
    let normalized = words.join(" ");
    if SMALL_TALK.contains(&normalized.as_str()) {
        return result(Intent::SmallTalk, SMALL_TALK_CONFIDENCE);
    }

    let padded = format!(" {normalized} ");
    if let Some(c) = CATEGORIES
        .iter()
        .find(|c| c.phrases.iter().any(|p| has_phrase(&padded, p)))
    {
        return result(c.intent, PHRASE_CONFIDENCE);
    }

    let has_word = |list: &[&str]| words.iter().any(|w| list.contains(&w.as_str()));
    if let Some(c) = CATEGORIES.iter().find(|c| has_word(c.strong)) {
        return result(c.intent, STRONG_KEYWORD_CONFIDENCE);
    }
    if let Some(c) = CATEGORIES.iter().find(|c| has_word(c.weak)) {
        return result(c.intent, WEAK_KEYWORD_CONFIDENCE);
    }

    match last_intent {
        Some(prev) if prev.wants_capability() && words.len() <= FOLLOW_UP_MAX_WORDS => {
            result(prev, FOLLOW_UP_CONFIDENCE)
        }
        _ => result(Intent::General, GENERAL_CONFIDENCE),
    }
}

/// A configured prefix directly followed by a letter, e.g. `!weather`.
pub fn is_command(content: &str, prefixes: &[String]) -> bool {
    let trimmed = content.trim_start();
    prefixes.iter().any(|p| {
        trimmed
            .strip_prefix(p.as_str())
            .and_then(|rest| rest.chars().next())
            .is_some_and(char::is_alphabetic)
    })
}

/// Classifies the inbound message and records it as the author's last intent.
pub struct IntentDetectionNode {
    command_prefixes: Vec<String>,
}

impl IntentDetectionNode {
    pub fn new(command_prefixes: Vec<String>) -> Self {
        Self { command_prefixes }
    }
}

#[async_trait]
impl Node<ChorusPipeline> for IntentDetectionNode {
    fn name(&self) -> &'static str {
        super::INTENT
    }

    async fn run(&self, store: &ConversationStore, turn: &mut Turn) -> Result<(), FlowError> {
        let author = turn.inbound.author_id.as_str();
        let last_intent = store.peek_user_context(author).and_then(|u| u.last_intent);

        let detected = classify(&turn.inbound.content, &self.command_prefixes, last_intent)?;
        store.set_last_intent(author, detected.intent);

        debug!(
            turn = %turn.id,
            intent = %detected.intent,
            confidence = detected.confidence,
            "intent classified"
        );
        turn.intent = Some(detected);
        turn.advance(TurnState::IntentClassified);
        Ok(())
    }
}
