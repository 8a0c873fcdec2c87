//! Conversation-mode routing.

use async_trait::async_trait;
use tracing::debug;

use chorus_core::config::RouterConfig;
use chorus_core::time::lookback;
use chorus_core::types::{ConversationMode, InboundMessage, RouteReason};
use chorus_flow::Node;
use chorus_store::{ChannelContext, ConversationStore, RoutingRecord};

use crate::error::FlowError;
use crate::flows::ChorusPipeline;
use crate::nodes::intent::is_command;
use crate::turn::{IntentResult, RouteDecision, Turn, TurnState};

/// Pick a mode for `message`. First matching rule wins.
///
/// Windows are measured back from the message's own timestamp, so the result
/// depends only on the arguments.
pub fn decide(
    message: &InboundMessage,
    intent: &IntentResult,
    channel: Option<&ChannelContext>,
    config: &RouterConfig,
) -> RouteDecision {
    let decision = |mode, reason| RouteDecision {
        mode,
        reason,
        confidence: intent.confidence,
    };
    let since = |secs: u64| lookback(message.timestamp, secs);

    if message.is_direct() {
        return decision(ConversationMode::Individual, RouteReason::DirectMessage);
    }
    if intent.confidence >= config.high_confidence {
        return decision(ConversationMode::Individual, RouteReason::HighConfidence);
    }
    if is_command(&message.content, &config.command_prefixes) {
        return decision(ConversationMode::Individual, RouteReason::CommandPattern);
    }
    if let Some(ch) = channel {
        if ch.active_user_count(since(config.activity_window_secs)) >= config.active_user_threshold {
            return decision(ConversationMode::Blended, RouteReason::HighChannelActivity);
        }
        if ch.has_activity_since(since(config.inactivity_window_secs)) {
            return decision(ConversationMode::Blended, RouteReason::RecentChannelActivity);
        }
    }
    if intent.confidence >= config.medium_confidence {
        return decision(ConversationMode::Individual, RouteReason::MediumConfidence);
    }
    decision(config.default_mode, RouteReason::DefaultMode)
}

/// Routes the turn and appends the decision to channel and user history.
///
/// Reads channel state as it was before this message is recorded.
pub struct ResponseRouterNode {
    config: RouterConfig,
}

impl ResponseRouterNode {
    pub fn new(config: RouterConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Node<ChorusPipeline> for ResponseRouterNode {
    fn name(&self) -> &'static str {
        super::ROUTER
    }

    async fn run(&self, store: &ConversationStore, turn: &mut Turn) -> Result<(), FlowError> {
        let intent = turn
            .intent
            .ok_or_else(|| FlowError::Routing("turn has no intent".to_string()))?;
        let inbound = &turn.inbound;

        let channel = store.peek_channel_context(&inbound.channel_id);
        let route = decide(inbound, &intent, channel.as_ref(), &self.config);

        store.push_routing_decision(
            &inbound.channel_id,
            &inbound.author_id,
            RoutingRecord {
                mode: route.mode,
                reason: route.reason,
                confidence: route.confidence,
                intent: intent.intent,
                timestamp: inbound.timestamp,
            },
        );

        debug!(
            turn = %turn.id,
            mode = %route.mode,
            reason = %route.reason,
            confidence = route.confidence,
            "turn routed"
        );
        turn.route = Some(route);
        turn.advance(TurnState::Routed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_core::types::{ChannelKind, Intent};
    use chorus_store::ChannelMessage;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use proptest::prelude::*;

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn message(kind: ChannelKind, content: &str) -> InboundMessage {
        InboundMessage {
            author_id: "u0".into(),
            author_name: None,
            channel_id: "c1".into(),
            channel_kind: kind,
            content: content.into(),
            timestamp: now(),
            message_id: "m0".into(),
            reply_reference: None,
        }
    }

    fn intent(confidence: f32) -> IntentResult {
        IntentResult {
            intent: Intent::General,
            confidence,
        }
    }

    /// `users` distinct authors, each speaking `ago_secs` before `now()`.
    fn channel(users: usize, ago_secs: i64) -> ChannelContext {
        let mut ch = ChannelContext::new(now() - Duration::hours(1));
        for i in 0..users {
            let ts = now() - Duration::seconds(ago_secs);
            ch.active_users.insert(format!("u{}", i + 1), ts);
            ch.recent_messages.push_back(ChannelMessage {
                author_id: format!("u{}", i + 1),
                author_name: format!("user{}", i + 1),
                content: "chatter".into(),
                timestamp: ts,
                message_id: None,
                from_bot: false,
            });
        }
        ch
    }

    #[test]
    fn direct_message_wins_even_at_low_confidence() {
        let route = decide(
            &message(ChannelKind::Direct, "hm"),
            &intent(0.1),
            Some(&channel(8, 10)),
            &RouterConfig::default(),
        );
        assert_eq!(route.mode, ConversationMode::Individual);
        assert_eq!(route.reason, RouteReason::DirectMessage);
        assert_eq!(route.confidence, 0.1);
    }

    #[test]
    fn busy_channel_goes_blended() {
        let route = decide(
            &message(ChannelKind::Guild, "anyone?"),
            &intent(0.4),
            Some(&channel(6, 60)),
            &RouterConfig::default(),
        );
        assert_eq!(route.mode, ConversationMode::Blended);
        assert_eq!(route.reason, RouteReason::HighChannelActivity);
    }

    #[test]
    fn rules_apply_in_order() {
        let cfg = RouterConfig::default();
        let guild = |c: &str| message(ChannelKind::Guild, c);

        let high = decide(&guild("x"), &intent(0.9), Some(&channel(6, 0)), &cfg);
        assert_eq!(high.reason, RouteReason::HighConfidence);

        let cmd = decide(&guild("/stats"), &intent(0.3), Some(&channel(6, 0)), &cfg);
        assert_eq!(cmd.reason, RouteReason::CommandPattern);

        let recent = decide(&guild("x"), &intent(0.6), Some(&channel(2, 30)), &cfg);
        assert_eq!(recent.reason, RouteReason::RecentChannelActivity);
        assert_eq!(recent.mode, ConversationMode::Blended);

        // activity older than both windows no longer counts
        let stale = decide(&guild("x"), &intent(0.6), Some(&channel(6, 600)), &cfg);
        assert_eq!(stale.reason, RouteReason::MediumConfidence);
        assert_eq!(stale.mode, ConversationMode::Individual);

        let fallback = decide(&guild("x"), &intent(0.2), None, &cfg);
        assert_eq!(fallback.reason, RouteReason::DefaultMode);
        assert_eq!(fallback.mode, cfg.default_mode);
    }

    #[test]
    fn oversized_windows_reach_back_not_forward() {
        let cfg = RouterConfig {
            activity_window_secs: u64::MAX,
            inactivity_window_secs: u64::MAX,
            ..RouterConfig::default()
        };
        let route = decide(
            &message(ChannelKind::Guild, "x"),
            &intent(0.2),
            Some(&channel(6, 86_400)),
            &cfg,
        );
        assert_eq!(route.reason, RouteReason::HighChannelActivity);
    }

    proptest! {
        #[test]
        fn decision_is_a_pure_function_of_inputs(
            confidence in 0.0f32..=1.0,
            users in 0usize..10,
            ago in 0i64..900,
            direct in any::<bool>(),
        ) {
            let kind = if direct { ChannelKind::Direct } else { ChannelKind::Guild };
            let msg = message(kind, "what now");
            let ch = channel(users, ago);
            let cfg = RouterConfig::default();
            let first = decide(&msg, &intent(confidence), Some(&ch), &cfg);
            let second = decide(&msg, &intent(confidence), Some(&ch.clone()), &cfg);
            prop_assert_eq!(first, second);
            if direct {
                prop_assert_eq!(first.reason, RouteReason::DirectMessage);
            }
        }
    }
}
