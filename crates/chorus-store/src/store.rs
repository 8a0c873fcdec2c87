use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info, instrument};

use chorus_core::config::StoreConfig;
use chorus_core::time;
use chorus_core::types::{Intent, Message};

use crate::bounded::make_room;
use crate::error::{Result, StoreError};
use crate::snapshot::StoreSnapshot;
use crate::types::{
    ActiveFlow, ChannelContext, ChannelMessage, CleanupReport, Conversation, RoutingRecord,
    StoreStats, UserContext,
};

/// Authoritative in-memory state shared by every flow.
///
/// Each mutation runs inside a single map-entry borrow and never spans an
/// `.await`, so interleaved flows from different users in one channel can only
/// append-then-trim, never overwrite each other's reads.
pub struct ConversationStore {
    config: StoreConfig,
    system_prompt: String,
    conversations: DashMap<String, Conversation>,
    channels: DashMap<String, ChannelContext>,
    users: DashMap<String, UserContext>,
    active_flows: DashMap<String, ActiveFlow>,
}

impl ConversationStore {
    pub fn new(config: StoreConfig, system_prompt: impl Into<String>) -> Self {
        Self {
            config,
            system_prompt: system_prompt.into(),
            conversations: DashMap::new(),
            channels: DashMap::new(),
            users: DashMap::new(),
            active_flows: DashMap::new(),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    // --- conversations -----------------------------------------------------

    /// Return the user's conversation, creating it with the persona message if absent.
    #[instrument(skip(self))]
    pub fn get_conversation(&self, user_id: &str) -> Conversation {
        self.update_conversation(user_id, |c| c.clone())
    }

    /// Existing conversation, without creating one.
    pub fn peek_conversation(&self, user_id: &str) -> Option<Conversation> {
        self.conversations.get(user_id).map(|c| c.clone())
    }

    /// Mutate a conversation in place. The persona-first and max-length
    /// invariants are re-established after `f` returns.
    pub fn update_conversation<R>(&self, user_id: &str, f: impl FnOnce(&mut Conversation) -> R) -> R {
        if let Some(evicted) = make_room(
            &self.conversations,
            user_id,
            self.config.max_entries,
            |k| self.active_flows.contains_key(k),
        ) {
            debug!(user = %evicted, "conversation evicted at capacity");
        }

        let mut entry = self
            .conversations
            .entry(user_id.to_string())
            .or_insert_with(|| Conversation::new(&self.system_prompt, Utc::now()));
        let out = f(entry.value_mut());
        enforce_invariants(
            entry.value_mut(),
            self.config.max_conversation_length,
            &self.system_prompt,
        );
        out
    }

    /// Append one message, evicting the oldest non-system messages on overflow.
    ///
    /// Returns the conversation length after the append.
    #[instrument(skip(self, message), fields(role = %message.role))]
    pub fn append_message(&self, user_id: &str, message: Message) -> usize {
        self.update_conversation(user_id, |c| {
            if !message.is_system() {
                c.message_count += 1;
            }
            c.messages.push(message);
            c.last_activity = Utc::now();
        });
        self.conversations
            .get(user_id)
            .map(|c| c.messages.len())
            .unwrap_or_default()
    }

    /// Drop a user's conversation. Returns whether one existed.
    #[instrument(skip(self))]
    pub fn clear_conversation(&self, user_id: &str) -> bool {
        self.conversations.remove(user_id).is_some()
    }

    // --- channels ----------------------------------------------------------

    /// Return the channel context, creating an empty one if absent.
    pub fn get_channel_context(&self, channel_id: &str) -> ChannelContext {
        self.update_channel_context(channel_id, |c| c.clone())
    }

    /// Existing channel context, without creating one.
    pub fn peek_channel_context(&self, channel_id: &str) -> Option<ChannelContext> {
        self.channels.get(channel_id).map(|c| c.clone())
    }

    pub fn update_channel_context<R>(
        &self,
        channel_id: &str,
        f: impl FnOnce(&mut ChannelContext) -> R,
    ) -> R {
        if let Some(evicted) = make_room(
            &self.channels,
            channel_id,
            self.config.max_entries,
            |k| self.channel_in_use(k),
        ) {
            debug!(channel = %evicted, "channel context evicted at capacity");
        }

        let mut entry = self
            .channels
            .entry(channel_id.to_string())
            .or_insert_with(|| ChannelContext::new(Utc::now()));
        let out = f(entry.value_mut());
        trim_front(&mut entry.recent_messages, self.config.max_channel_messages);
        trim_front(&mut entry.routing_history, self.config.max_routing_history);
        out
    }

    /// Append a line of channel activity, then trim to the configured bound.
    #[instrument(skip(self, message), fields(author = %message.author_id))]
    pub fn record_channel_message(&self, channel_id: &str, message: ChannelMessage) {
        let window = time::seconds(self.config.inactivity_threshold_secs);
        self.update_channel_context(channel_id, |ch| {
            let ts = message.timestamp;
            if !message.from_bot {
                let seen = ch.active_users.entry(message.author_id.clone()).or_insert(ts);
                if ts > *seen {
                    *seen = ts;
                }
                ch.active_users.retain(|_, t| ts - *t <= window);
            }
            if ts > ch.last_activity {
                ch.last_activity = ts;
            }
            ch.recent_messages.push_back(message);
        });
    }

    // --- users -------------------------------------------------------------

    pub fn get_user_context(&self, user_id: &str) -> UserContext {
        self.update_user_context(user_id, |u| u.clone())
    }

    pub fn peek_user_context(&self, user_id: &str) -> Option<UserContext> {
        self.users.get(user_id).map(|u| u.clone())
    }

    pub fn update_user_context<R>(&self, user_id: &str, f: impl FnOnce(&mut UserContext) -> R) -> R {
        if let Some(evicted) = make_room(
            &self.users,
            user_id,
            self.config.max_entries,
            |k| self.active_flows.contains_key(k),
        ) {
            debug!(user = %evicted, "user context evicted at capacity");
        }

        let mut entry = self
            .users
            .entry(user_id.to_string())
            .or_insert_with(|| UserContext::new(Utc::now()));
        let out = f(entry.value_mut());
        trim_front(&mut entry.message_history, self.config.max_user_messages);
        trim_front(&mut entry.routing_history, self.config.max_routing_history);
        out
    }

    pub fn record_user_message(&self, user_id: &str, message: Message) {
        self.update_user_context(user_id, |u| {
            u.message_history.push_back(message);
            u.last_seen = Utc::now();
        });
    }

    pub fn set_last_intent(&self, user_id: &str, intent: Intent) {
        self.update_user_context(user_id, |u| {
            u.last_intent = Some(intent);
            u.last_seen = Utc::now();
        });
    }

    /// Append a routing decision to both the channel and the user history.
    pub fn push_routing_decision(&self, channel_id: &str, user_id: &str, record: RoutingRecord) {
        self.update_channel_context(channel_id, |ch| {
            ch.routing_history.push_back(record.clone());
        });
        self.update_user_context(user_id, |u| {
            u.routing_history.push_back(record);
        });
    }

    // --- active-flow registry ----------------------------------------------

    /// Claim the per-user flow slot. Fails if a flow is already running.
    #[instrument(skip(self, flow), fields(flow_type = %flow.flow_type, run_id = %flow.run_id))]
    pub fn set_active_flow(&self, user_id: &str, flow: ActiveFlow) -> Result<()> {
        match self.active_flows.entry(user_id.to_string()) {
            Entry::Occupied(existing) => Err(StoreError::FlowActive {
                user_id: user_id.to_string(),
                flow_type: existing.get().flow_type,
            }),
            Entry::Vacant(slot) => {
                slot.insert(flow);
                Ok(())
            }
        }
    }

    /// Release the user's flow slot unconditionally.
    pub fn clear_active_flow(&self, user_id: &str) -> Option<ActiveFlow> {
        self.active_flows.remove(user_id).map(|(_, f)| f)
    }

    /// Release the slot only if it still belongs to `run_id`.
    pub fn clear_active_flow_run(&self, user_id: &str, run_id: &str) -> bool {
        self.active_flows
            .remove_if(user_id, |_, f| f.run_id == run_id)
            .is_some()
    }

    pub fn active_flow(&self, user_id: &str) -> Option<ActiveFlow> {
        self.active_flows.get(user_id).map(|f| f.clone())
    }

    pub fn has_active_flow(&self, user_id: &str) -> bool {
        self.active_flows.contains_key(user_id)
    }

    fn channel_in_use(&self, channel_id: &str) -> bool {
        self.active_flows.iter().any(|f| f.channel_id == channel_id)
    }

    // --- maintenance -------------------------------------------------------

    /// Sweep inactive entries using the current time.
    pub fn cleanup(&self) -> CleanupReport {
        self.cleanup_at(Utc::now())
    }

    /// Sweep entries idle relative to `now`.
    ///
    /// Channel and user contexts expire after the inactivity threshold,
    /// conversations after the conversation TTL. Entries referenced by the
    /// active-flow registry are always kept.
    #[instrument(skip(self))]
    pub fn cleanup_at(&self, now: DateTime<Utc>) -> CleanupReport {
        let inactivity = time::seconds(self.config.inactivity_threshold_secs);
        let ttl = time::seconds(self.config.conversation_ttl_secs);
        let mut report = CleanupReport::default();

        self.channels.retain(|id, ch| {
            if now - ch.last_activity <= inactivity {
                return true;
            }
            if self.channel_in_use(id) {
                report.skipped_active += 1;
                return true;
            }
            report.channels_removed += 1;
            false
        });

        self.users.retain(|id, u| {
            if now - u.last_seen <= inactivity {
                return true;
            }
            if self.active_flows.contains_key(id) {
                report.skipped_active += 1;
                return true;
            }
            report.users_removed += 1;
            false
        });

        self.conversations.retain(|id, c| {
            if now - c.last_activity <= ttl {
                return true;
            }
            if self.active_flows.contains_key(id) {
                report.skipped_active += 1;
                return true;
            }
            report.conversations_removed += 1;
            false
        });

        if report.total_removed() > 0 {
            info!(
                conversations = report.conversations_removed,
                channels = report.channels_removed,
                users = report.users_removed,
                skipped_active = report.skipped_active,
                "store cleanup removed inactive entries"
            );
        }
        report
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            conversations: self.conversations.len(),
            channels: self.channels.len(),
            users: self.users.len(),
            active_flows: self.active_flows.len(),
        }
    }

    /// Copy of all persistent state. The active-flow registry is ephemeral and excluded.
    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            version: StoreSnapshot::VERSION,
            taken_at: Utc::now(),
            conversations: self
                .conversations
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
            channels: self
                .channels
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
            users: self
                .users
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
        }
    }

    /// Load a snapshot, overwriting entries with the same keys.
    #[instrument(skip(self, snapshot), fields(version = snapshot.version))]
    pub fn restore(&self, snapshot: StoreSnapshot) {
        let counts = (
            snapshot.conversations.len(),
            snapshot.channels.len(),
            snapshot.users.len(),
        );
        for (id, mut conv) in snapshot.conversations {
            enforce_invariants(
                &mut conv,
                self.config.max_conversation_length,
                &self.system_prompt,
            );
            self.conversations.insert(id, conv);
        }
        for (id, ch) in snapshot.channels {
            self.channels.insert(id, ch);
        }
        for (id, u) in snapshot.users {
            self.users.insert(id, u);
        }
        info!(
            conversations = counts.0,
            channels = counts.1,
            users = counts.2,
            "store restored from snapshot"
        );
    }
}

/// Put the system message first and cut the oldest non-system messages
/// until the conversation fits `max_len`.
fn enforce_invariants(conv: &mut Conversation, max_len: usize, system_prompt: &str) {
    match conv.messages.iter().position(Message::is_system) {
        Some(0) => {}
        Some(idx) => {
            let system = conv.messages.remove(idx);
            conv.messages.insert(0, system);
        }
        None => {
            let ts = conv
                .messages
                .first()
                .map(|m| m.timestamp)
                .unwrap_or(conv.last_activity);
            conv.messages.insert(0, Message::system(system_prompt, ts));
        }
    }

    let max_len = max_len.max(1);
    while conv.messages.len() > max_len {
        match conv.messages.iter().position(|m| !m.is_system()) {
            Some(idx) => {
                conv.messages.remove(idx);
            }
            None => {
                conv.messages.truncate(max_len);
                break;
            }
        }
    }
}

fn trim_front<T>(queue: &mut std::collections::VecDeque<T>, max: usize) {
    while queue.len() > max {
        queue.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_core::types::{ConversationMode, Role, RouteReason};
    use chrono::Duration;
    use proptest::prelude::*;

    fn store_with(max_len: usize) -> ConversationStore {
        let config = StoreConfig {
            max_conversation_length: max_len,
            ..StoreConfig::default()
        };
        ConversationStore::new(config, "persona")
    }

    fn channel_line(author: &str, ts: DateTime<Utc>) -> ChannelMessage {
        ChannelMessage {
            author_id: author.to_string(),
            author_name: author.to_string(),
            content: format!("hello from {author}"),
            timestamp: ts,
            message_id: None,
            from_bot: false,
        }
    }

    #[test]
    fn get_conversation_seeds_persona() {
        let store = store_with(8);
        let conv = store.get_conversation("alice");
        assert_eq!(conv.messages.len(), 1);
        assert_eq!(conv.messages[0].role, Role::System);
        assert_eq!(conv.messages[0].content, "persona");
    }

    #[test]
    fn nine_messages_with_max_eight_keeps_system_first() {
        let store = store_with(8);
        let now = Utc::now();
        for i in 0..9 {
            store.append_message("alice", Message::user(format!("msg {i}"), now));
        }
        let conv = store.get_conversation("alice");
        assert_eq!(conv.messages.len(), 8);
        assert!(conv.messages[0].is_system());
        // Oldest user messages went first.
        assert_eq!(conv.messages[1].content, "msg 2");
        assert_eq!(conv.messages[7].content, "msg 8");
        assert_eq!(conv.message_count, 9);
    }

    #[test]
    fn misplaced_system_message_is_moved_to_front() {
        let store = store_with(8);
        let now = Utc::now();
        store.update_conversation("bob", |c| {
            c.messages.clear();
            c.messages.push(Message::user("first", now));
            c.messages.push(Message::system("late persona", now));
        });
        let conv = store.get_conversation("bob");
        assert_eq!(conv.messages[0].content, "late persona");
        assert_eq!(conv.messages[1].content, "first");
    }

    #[test]
    fn second_active_flow_is_rejected() {
        let store = store_with(8);
        store
            .set_active_flow("alice", ActiveFlow::new(ConversationMode::Individual, "dm-1"))
            .expect("first claim succeeds");
        let err = store
            .set_active_flow("alice", ActiveFlow::new(ConversationMode::Blended, "c-1"))
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::FlowActive { flow_type: ConversationMode::Individual, .. }
        ));
        assert!(store.clear_active_flow("alice").is_some());
        assert!(!store.has_active_flow("alice"));
    }

    #[test]
    fn clear_active_flow_run_ignores_other_runs() {
        let store = store_with(8);
        let flow = ActiveFlow::new(ConversationMode::Individual, "dm-1");
        let run_id = flow.run_id.clone();
        store.set_active_flow("alice", flow).unwrap();
        assert!(!store.clear_active_flow_run("alice", "someone-else"));
        assert!(store.clear_active_flow_run("alice", &run_id));
    }

    #[test]
    fn cleanup_removes_idle_entries_but_not_active_ones() {
        let store = store_with(8);
        let t0 = Utc::now();
        store.record_channel_message("idle-channel", channel_line("a", t0));
        store.record_channel_message("busy-channel", channel_line("b", t0));
        store.get_user_context("idle-user");
        store.get_user_context("busy-user");
        store
            .set_active_flow("busy-user", ActiveFlow::new(ConversationMode::Blended, "busy-channel"))
            .unwrap();

        let report = store.cleanup_at(t0 + Duration::minutes(31));
        assert_eq!(report.channels_removed, 1);
        assert_eq!(report.users_removed, 1);
        assert_eq!(report.skipped_active, 2);
        assert!(store.peek_channel_context("busy-channel").is_some());
        assert!(store.peek_user_context("busy-user").is_some());
        assert!(store.peek_channel_context("idle-channel").is_none());
        assert!(store.peek_user_context("idle-user").is_none());
    }

    #[test]
    fn cleanup_keeps_recent_entries() {
        let store = store_with(8);
        let t0 = Utc::now();
        store.record_channel_message("c", channel_line("a", t0));
        let report = store.cleanup_at(t0 + Duration::minutes(10));
        assert_eq!(report, CleanupReport::default());
    }

    #[test]
    fn conversations_expire_after_ttl() {
        let store = store_with(8);
        store.append_message("alice", Message::user("hi", Utc::now()));
        let report = store.cleanup_at(Utc::now() + Duration::hours(25));
        assert_eq!(report.conversations_removed, 1);
        assert!(store.peek_conversation("alice").is_none());
    }

    #[test]
    fn channel_history_is_bounded() {
        let config = StoreConfig {
            max_channel_messages: 3,
            max_routing_history: 2,
            ..StoreConfig::default()
        };
        let store = ConversationStore::new(config, "persona");
        let t0 = Utc::now();
        for i in 0..5 {
            store.record_channel_message("c", channel_line(&format!("u{i}"), t0 + Duration::seconds(i)));
        }
        for _ in 0..4 {
            store.push_routing_decision(
                "c",
                "u0",
                RoutingRecord {
                    mode: ConversationMode::Blended,
                    reason: RouteReason::RecentChannelActivity,
                    confidence: 0.3,
                    intent: Intent::General,
                    timestamp: t0,
                },
            );
        }
        let ch = store.get_channel_context("c");
        assert_eq!(ch.recent_messages.len(), 3);
        assert_eq!(ch.recent_messages[0].author_id, "u2");
        assert_eq!(ch.routing_history.len(), 2);
        assert_eq!(ch.active_users.len(), 5);
        assert_eq!(store.get_user_context("u0").routing_history.len(), 2);
    }

    #[test]
    fn capacity_evicts_least_recent_but_spares_active_flow() {
        let config = StoreConfig {
            max_entries: 2,
            ..StoreConfig::default()
        };
        let store = ConversationStore::new(config, "persona");
        store.get_conversation("first");
        store.get_conversation("second");
        store
            .set_active_flow("first", ActiveFlow::new(ConversationMode::Individual, "dm"))
            .unwrap();
        store.get_conversation("third");
        assert!(store.peek_conversation("first").is_some());
        assert!(store.peek_conversation("second").is_none());
        assert!(store.peek_conversation("third").is_some());
    }

    #[test]
    fn snapshot_restore_round_trip_skips_active_flows() {
        let store = store_with(8);
        store.append_message("alice", Message::user("remember me", Utc::now()));
        store
            .set_active_flow("alice", ActiveFlow::new(ConversationMode::Individual, "dm"))
            .unwrap();
        let snap = store.snapshot();

        let fresh = store_with(8);
        fresh.restore(snap);
        let conv = fresh.get_conversation("alice");
        assert_eq!(conv.messages.last().unwrap().content, "remember me");
        assert!(!fresh.has_active_flow("alice"));
    }

    proptest! {
        #[test]
        fn conversation_stays_bounded_with_system_first(
            max_len in 1usize..12,
            contents in proptest::collection::vec("[a-z ]{0,20}", 0..40),
        ) {
            let store = store_with(max_len);
            let now = Utc::now();
            for (i, c) in contents.iter().enumerate() {
                let msg = if i % 2 == 0 {
                    Message::user(c.clone(), now)
                } else {
                    Message::assistant(c.clone(), now)
                };
                store.append_message("p", msg);
                let conv = store.get_conversation("p");
                prop_assert!(conv.messages.len() <= max_len);
                prop_assert!(conv.messages[0].is_system());
            }
        }
    }
}
