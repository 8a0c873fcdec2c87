//! Token-budgeted context assembly.
//!
//! The candidate list (persona, history, new message) is returned unchanged
//! when it fits the budget. Otherwise older messages are ranked by relevance
//! then recency and greedily re-admitted around the always-kept system and
//! recent messages. If even that exceeds the emergency budget the window
//! collapses to the persona plus the newest half of the recent messages.

use std::collections::HashSet;

use async_trait::async_trait;
use tracing::debug;

use chorus_core::config::{BudgetConfig, ContextConfig};
use chorus_core::types::{ContextStrategy, ConversationMode, Message};
use chorus_flow::Node;
use chorus_store::{ChannelMessage, ContextMeta, ConversationStore};

use crate::error::FlowError;
use crate::flows::ChorusPipeline;
use crate::nodes::intent::words;
use crate::turn::{ContextWindow, Turn, TurnState};

/// Knobs of one optimization pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Budget {
    pub token_budget: usize,
    pub emergency_budget: usize,
    /// Newest non-system messages that are never pruned.
    pub keep_recent: usize,
    pub chars_per_token: usize,
}

/// Output of [`optimize`].
#[derive(Debug, Clone, PartialEq)]
pub struct Optimized {
    pub messages: Vec<Message>,
    pub original_tokens: usize,
    pub optimized_tokens: usize,
    pub messages_removed: usize,
    pub strategy: ContextStrategy,
}

pub fn estimate_tokens(text: &str, chars_per_token: usize) -> usize {
    text.chars().count().div_ceil(chars_per_token.max(1))
}

fn total_tokens<'a>(messages: impl IntoIterator<Item = &'a Message>, cpt: usize) -> usize {
    messages
        .into_iter()
        .map(|m| estimate_tokens(&m.content, cpt))
        .sum()
}

/// Share of `query`'s distinct words (3+ letters) that also occur in `text`,
/// rounded to two decimals.
pub fn lexical_relevance(query: &HashSet<String>, text: &str) -> f32 {
    if query.is_empty() {
        return 0.0;
    }
    let present: HashSet<String> = words(text).into_iter().collect();
    let shared = query.iter().filter(|w| present.contains(*w)).count();
    let share = shared as f32 / query.len() as f32;
    (share * 100.0).round() / 100.0
}

fn query_terms(query: &str) -> HashSet<String> {
    words(query)
        .into_iter()
        .filter(|w| w.chars().count() >= 3)
        .collect()
}

/// Fit `candidates` into `budget`. `query` is the new message's text, used to
/// score older messages that carry no relevance score of their own.
///
/// Deterministic: equal inputs always produce equal output.
pub fn optimize(candidates: Vec<Message>, query: &str, budget: Budget) -> Optimized {
    let cpt = budget.chars_per_token.max(1);
    let original_tokens = total_tokens(&candidates, cpt);
    let original_len = candidates.len();

    if original_tokens <= budget.token_budget {
        return Optimized {
            messages: candidates,
            original_tokens,
            optimized_tokens: original_tokens,
            messages_removed: 0,
            strategy: ContextStrategy::None,
        };
    }

    let system: Vec<usize> = (0..original_len)
        .filter(|&i| candidates[i].is_system())
        .collect();
    let rest: Vec<usize> = (0..original_len)
        .filter(|&i| !candidates[i].is_system())
        .collect();
    let split = rest.len().saturating_sub(budget.keep_recent);
    let (older, recent) = rest.split_at(split);

    let terms = query_terms(query);
    let mut ranked: Vec<(usize, f32)> = older
        .iter()
        .map(|&i| {
            let m = &candidates[i];
            let score = m
                .relevance_score
                .unwrap_or_else(|| lexical_relevance(&terms, &m.content));
            // NaN or infinite scores rank as unscored
            (i, if score.is_finite() { score } else { 0.0 })
        })
        .collect();
    ranked.sort_by(|(ia, sa), (ib, sb)| {
        sb.total_cmp(sa)
            .then_with(|| candidates[*ib].timestamp.cmp(&candidates[*ia].timestamp))
            .then_with(|| ib.cmp(ia))
    });

    let tokens_of = |i: usize| estimate_tokens(&candidates[i].content, cpt);
    let mut running: usize = system.iter().chain(recent).map(|&i| tokens_of(i)).sum();
    let mut kept: Vec<usize> = recent.to_vec();
    for (i, _) in ranked {
        let t = tokens_of(i);
        if running + t <= budget.token_budget {
            running += t;
            kept.push(i);
        }
    }
    kept.sort_by(|a, b| {
        candidates[*a]
            .timestamp
            .cmp(&candidates[*b].timestamp)
            .then(a.cmp(b))
    });

    let (selected, strategy) = if running > budget.emergency_budget {
        let half = budget.keep_recent.div_ceil(2);
        let minimal = recent[recent.len().saturating_sub(half)..].to_vec();
        (minimal, ContextStrategy::EmergencyPruning)
    } else {
        (kept, ContextStrategy::Pruning)
    };

    let mut slots: Vec<Option<Message>> = candidates.into_iter().map(Some).collect();
    let messages: Vec<Message> = system
        .iter()
        .chain(selected.iter())
        .filter_map(|&i| slots[i].take())
        .collect();
    let optimized_tokens = total_tokens(&messages, cpt);

    Optimized {
        messages_removed: original_len - messages.len(),
        messages,
        original_tokens,
        optimized_tokens,
        strategy,
    }
}

fn channel_line(m: &ChannelMessage) -> Message {
    let message = if m.from_bot {
        Message::assistant(m.content.clone(), m.timestamp)
    } else {
        Message::user(format!("{}: {}", m.author_name, m.content), m.timestamp)
    };
    match &m.message_id {
        Some(id) => message.with_message_id(id.clone()),
        None => message,
    }
}

/// Builds the context window for one mode and writes its token accounting
/// back onto the conversation (individual, command) or channel (blended).
pub struct ContextManagerNode {
    name: &'static str,
    mode: ConversationMode,
    config: ContextConfig,
}

impl ContextManagerNode {
    pub fn new(mode: ConversationMode, config: ContextConfig) -> Self {
        Self::named(super::CONTEXT, mode, config)
    }

    /// A second context node in the same flow, for rebuilding after routing.
    pub fn named(name: &'static str, mode: ConversationMode, config: ContextConfig) -> Self {
        Self { name, mode, config }
    }

    fn budget(&self, turn: &Turn) -> Budget {
        let BudgetConfig {
            token_budget,
            emergency_budget,
            ..
        } = self.config.budget_for(self.mode);
        let token_budget = turn.token_budget.unwrap_or(token_budget);
        Budget {
            token_budget,
            emergency_budget: emergency_budget.max(token_budget),
            keep_recent: self.config.keep_recent,
            chars_per_token: self.config.chars_per_token,
        }
    }

    fn candidates(&self, store: &ConversationStore, turn: &Turn) -> Vec<Message> {
        let history = self.config.budget_for(self.mode).history;
        let inbound = &turn.inbound;
        let mut out: Vec<Message> = match self.mode {
            ConversationMode::Individual | ConversationMode::Command => {
                let conv = store.get_conversation(&inbound.author_id);
                let (system, rest): (Vec<Message>, Vec<Message>) =
                    conv.messages.into_iter().partition(Message::is_system);
                let skip = rest.len().saturating_sub(history);
                system.into_iter().chain(rest.into_iter().skip(skip)).collect()
            }
            ConversationMode::Blended => {
                let persona = Message::system(store.system_prompt(), inbound.timestamp);
                let channel = store.peek_channel_context(&inbound.channel_id);
                let lines: Vec<Message> = channel
                    .map(|ch| {
                        let recent: Vec<&ChannelMessage> = ch
                            .recent_messages
                            .iter()
                            .filter(|m| m.message_id.as_deref() != Some(inbound.message_id.as_str()))
                            .collect();
                        let skip = recent.len().saturating_sub(history);
                        recent.into_iter().skip(skip).map(channel_line).collect()
                    })
                    .unwrap_or_default();
                std::iter::once(persona).chain(lines).collect()
            }
        };

        let new_message = match self.mode {
            ConversationMode::Blended => Message::user(
                format!("{}: {}", inbound.speaker(), inbound.content),
                inbound.timestamp,
            )
            .with_message_id(inbound.message_id.clone()),
            _ => turn.user_message(),
        };
        out.push(new_message);
        out
    }
}

#[async_trait]
impl Node<ChorusPipeline> for ContextManagerNode {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn run(&self, store: &ConversationStore, turn: &mut Turn) -> Result<(), FlowError> {
        if self.config.chars_per_token == 0 {
            return Err(FlowError::Context(
                "chars_per_token must be positive".to_string(),
            ));
        }
        let budget = self.budget(turn);
        if budget.token_budget == 0 {
            return Err(FlowError::Context("token budget must be positive".to_string()));
        }

        let candidates = self.candidates(store, turn);
        let result = optimize(candidates, &turn.inbound.content, budget);

        let meta = ContextMeta {
            token_count: result.optimized_tokens,
            strategy: result.strategy,
        };
        match self.mode {
            ConversationMode::Blended => {
                store.update_channel_context(&turn.inbound.channel_id, |ch| ch.context = meta)
            }
            _ => store.update_conversation(&turn.inbound.author_id, |c| c.context = meta),
        }

        debug!(
            turn = %turn.id,
            mode = %self.mode,
            before = result.original_tokens,
            after = result.optimized_tokens,
            removed = result.messages_removed,
            strategy = %result.strategy,
            "context built"
        );

        turn.context = Some(ContextWindow {
            mode: self.mode,
            messages: result.messages,
            original_tokens: result.original_tokens,
            optimized_tokens: result.optimized_tokens,
            messages_removed: result.messages_removed,
            strategy: result.strategy,
        });
        // A rebuild after routing keeps the turn in `Routed`.
        if turn.state == TurnState::IntentClassified {
            turn.advance(TurnState::ContextBuilt);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use proptest::prelude::*;

    fn at(secs: i64) -> chrono::DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn budget(token_budget: usize, emergency_budget: usize) -> Budget {
        Budget {
            token_budget,
            emergency_budget,
            keep_recent: 3,
            chars_per_token: 4,
        }
    }

    /// persona + `n` user messages of `chars` characters each.
    fn history(n: usize, chars: usize) -> Vec<Message> {
        let mut out = vec![Message::system("sys!", at(0))];
        for i in 0..n {
            out.push(Message::user("x".repeat(chars), at(i as i64 + 1)));
        }
        out
    }

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens("", 4), 0);
        assert_eq!(estimate_tokens("abcd", 4), 1);
        assert_eq!(estimate_tokens("abcde", 4), 2);
    }

    #[test]
    fn within_budget_is_unchanged() {
        let msgs = history(3, 8);
        let out = optimize(msgs.clone(), "hi", budget(100, 200));
        assert_eq!(out.strategy, ContextStrategy::None);
        assert_eq!(out.messages, msgs);
        assert_eq!(out.messages_removed, 0);
    }

    #[test]
    fn pruning_keeps_system_and_recent_in_order() {
        // 1 + 10 * 10 tokens; budget fits system + 5 messages
        let msgs = history(10, 40);
        let out = optimize(msgs, "", budget(51, 100));
        assert_eq!(out.strategy, ContextStrategy::Pruning);
        assert!(out.optimized_tokens <= 51);
        assert!(out.messages[0].is_system());
        assert_eq!(out.messages.len(), 6);
        // the three newest always survive
        let tail: Vec<_> = out.messages.iter().rev().take(3).map(|m| m.timestamp).collect();
        assert_eq!(tail, vec![at(10), at(9), at(8)]);
        // output is chronological
        assert!(out.messages.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        assert_eq!(out.messages_removed, 5);
    }

    #[test]
    fn relevance_outranks_recency() {
        let mut msgs = history(6, 40);
        msgs[1] = msgs[1].clone().with_relevance(0.9);
        let out = optimize(msgs.clone(), "", budget(1 + 10 * 4, 100));
        // the scored oldest message wins over the newer unscored ones
        assert!(out.messages.iter().any(|m| m.timestamp == at(1)));
        assert!(!out.messages.iter().any(|m| m.timestamp == at(3)));
    }

    #[test]
    fn lexical_overlap_scores_unscored_messages() {
        let mut msgs = vec![Message::system("s", at(0))];
        msgs.push(Message::user("we talked about lighthouses and ships", at(1)));
        msgs.push(Message::user("completely unrelated chatter here...", at(2)));
        for i in 0..3 {
            msgs.push(Message::user("recent message text", at(10 + i)));
        }
        // budget leaves room for exactly one of the two older messages
        let out = optimize(msgs, "tell me about lighthouses", budget(1 + 15 + 10, 100));
        assert!(out
            .messages
            .iter()
            .any(|m| m.content.contains("lighthouses")));
        assert!(!out.messages.iter().any(|m| m.content.contains("unrelated")));

        let terms = query_terms("tell me about lighthouses");
        assert_eq!(lexical_relevance(&terms, "lighthouses are tall"), 0.33);
    }

    #[test]
    fn emergency_collapses_to_persona_and_half_recent() {
        // 5000 tokens: two small older messages, three huge recent ones
        let mut msgs = vec![Message::system("persona", at(0))];
        msgs.push(Message::user("a".repeat(1000), at(1)));
        msgs.push(Message::user("b".repeat(992), at(2)));
        for i in 0..3 {
            msgs.push(Message::user("c".repeat(6000), at(10 + i)));
        }
        let out = optimize(msgs, "", budget(2000, 4000));
        assert_eq!(out.original_tokens, 5000);
        assert_eq!(out.strategy, ContextStrategy::EmergencyPruning);
        assert!(out.optimized_tokens <= 4000);
        assert_eq!(out.messages.len(), 3);
        assert!(out.messages[0].is_system());
        assert_eq!(out.messages[2].timestamp, at(12));
    }

    #[test]
    fn nan_relevance_scores_rank_as_unscored() {
        let mut msgs = history(40, 40);
        for (i, m) in msgs.iter_mut().enumerate().skip(1) {
            if i % 3 == 0 {
                *m = m.clone().with_relevance(f32::NAN);
            } else if i == 2 {
                *m = m.clone().with_relevance(0.9);
            }
        }
        let out = optimize(msgs, "", budget(100, 200));
        assert_eq!(out.strategy, ContextStrategy::Pruning);
        assert!(out.optimized_tokens <= 100);
        // the one real score still wins a slot
        assert!(out.messages.iter().any(|m| m.timestamp == at(2)));
    }

    #[test]
    fn keep_recent_zero_still_keeps_system() {
        let msgs = history(4, 400);
        let out = optimize(
            msgs,
            "",
            Budget {
                token_budget: 1,
                emergency_budget: 1,
                keep_recent: 0,
                chars_per_token: 4,
            },
        );
        assert_eq!(out.messages.len(), 1);
        assert!(out.messages[0].is_system());
    }

    #[test]
    fn optimize_is_deterministic() {
        let base = at(0);
        let msgs: Vec<Message> = (0..12)
            .map(|i| {
                Message::user(
                    format!("message number {i} about things"),
                    base + Duration::seconds(i % 3),
                )
            })
            .collect();
        let a = optimize(msgs.clone(), "things about nothing", budget(30, 60));
        let b = optimize(msgs, "things about nothing", budget(30, 60));
        assert_eq!(a, b);
    }

    fn arb_messages() -> impl Strategy<Value = Vec<Message>> {
        let body = prop::collection::vec((1usize..400, prop::option::of(0.0f32..1.0)), 0..25);
        (1usize..40, body).prop_map(|(sys_len, body)| {
            let mut out = vec![Message::system("s".repeat(sys_len), at(0))];
            for (i, (len, score)) in body.into_iter().enumerate() {
                let m = Message::user("w".repeat(len), at(i as i64 + 1));
                out.push(match score {
                    Some(s) => m.with_relevance(s),
                    None => m,
                });
            }
            out
        })
    }

    proptest! {
        #[test]
        fn output_fits_budget_unless_mandatory_set_is_larger(
            msgs in arb_messages(),
            token_budget in 10usize..600,
            extra in 0usize..600,
            keep_recent in 0usize..5,
        ) {
            let b = Budget { token_budget, emergency_budget: token_budget + extra, keep_recent, chars_per_token: 4 };
            let out = optimize(msgs.clone(), "", b);
            prop_assert!(out.messages[0].is_system());
            match out.strategy {
                ContextStrategy::None => prop_assert!(out.optimized_tokens <= token_budget),
                ContextStrategy::Pruning => {
                    prop_assert!(out.optimized_tokens <= b.emergency_budget);
                    if out.optimized_tokens > token_budget {
                        // only the always-kept messages remain
                        let non_system = msgs.iter().filter(|m| !m.is_system()).count();
                        prop_assert_eq!(out.messages.len(), 1 + non_system.min(keep_recent));
                    }
                }
                ContextStrategy::EmergencyPruning => {
                    let non_system = msgs.iter().filter(|m| !m.is_system()).count();
                    let half = keep_recent.div_ceil(2).min(non_system);
                    prop_assert_eq!(out.messages.len(), 1 + half);
                    let expected: Vec<_> = msgs.iter().rev().take(half).rev().cloned().collect();
                    prop_assert_eq!(&out.messages[1..], &expected[..]);
                }
            }
        }

        #[test]
        fn rerun_on_fitting_output_is_a_no_op(
            msgs in arb_messages(),
            token_budget in 10usize..600,
        ) {
            let b = budget(token_budget, token_budget * 2);
            let first = optimize(msgs, "", b);
            prop_assume!(first.optimized_tokens <= token_budget);
            let second = optimize(first.messages.clone(), "", b);
            prop_assert_eq!(second.strategy, ContextStrategy::None);
            prop_assert_eq!(second.messages, first.messages);
        }
    }
}
