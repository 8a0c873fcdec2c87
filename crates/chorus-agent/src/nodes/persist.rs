use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use chorus_core::types::Message;
use chorus_flow::Node;
use chorus_store::{ChannelMessage, ConversationStore};

use crate::error::FlowError;
use crate::flows::ChorusPipeline;
use crate::turn::{Turn, TurnState};

/// Author id the bot's own channel lines are recorded under.
pub const BOT_AUTHOR_ID: &str = "chorus";
pub const BOT_NAME: &str = "Chorus";

/// Inbound message as a line of channel activity.
pub fn inbound_channel_line(turn: &Turn) -> ChannelMessage {
    let inbound = &turn.inbound;
    ChannelMessage {
        author_id: inbound.author_id.clone(),
        author_name: inbound.speaker().to_string(),
        content: inbound.content.clone(),
        timestamp: inbound.timestamp,
        message_id: Some(inbound.message_id.clone()),
        from_bot: false,
    }
}

/// Writes the finished exchange back to the store: the author's conversation
/// and message history, plus both lines of channel activity.
pub struct PersistTurnNode {
    bot_name: String,
}

impl PersistTurnNode {
    pub fn new(bot_name: impl Into<String>) -> Self {
        Self {
            bot_name: bot_name.into(),
        }
    }
}

#[async_trait]
impl Node<ChorusPipeline> for PersistTurnNode {
    fn name(&self) -> &'static str {
        super::PERSIST
    }

    async fn run(&self, store: &ConversationStore, turn: &mut Turn) -> Result<(), FlowError> {
        let reply = turn
            .reply
            .clone()
            .ok_or_else(|| FlowError::Store("turn finished without a reply".to_string()))?;
        let author = turn.inbound.author_id.as_str();
        let channel = turn.inbound.channel_id.as_str();
        let replied_at = Utc::now().max(turn.inbound.timestamp);

        let user = turn.user_message();
        store.append_message(author, user.clone());
        if let Some(call) = &turn.function_call {
            store.append_message(
                author,
                Message::function(call.name.clone(), call.result.clone(), replied_at),
            );
        }
        let len = store.append_message(author, Message::assistant(reply.clone(), replied_at));
        store.record_user_message(author, user);

        store.record_channel_message(channel, inbound_channel_line(turn));
        store.record_channel_message(
            channel,
            ChannelMessage {
                author_id: BOT_AUTHOR_ID.to_string(),
                author_name: self.bot_name.clone(),
                content: reply,
                timestamp: replied_at,
                message_id: None,
                from_bot: true,
            },
        );

        debug!(turn = %turn.id, conversation_len = len, "turn persisted");
        turn.advance(TurnState::Stored);
        Ok(())
    }
}
