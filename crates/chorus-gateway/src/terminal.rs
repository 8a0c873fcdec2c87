//! Line-oriented front-end: every stdin line becomes one inbound message.
//!
//! A plain line is sent by the default author, as a direct message unless a
//! channel was given on the command line. `name@channel: text` speaks as
//! `name` in a shared channel, which is enough to exercise blended routing
//! by hand.

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::debug;

use chorus_agent::{DispatchOutcome, FlowDispatcher};
use chorus_core::types::{ChannelKind, InboundMessage};

/// Who a plain line is from and where it goes.
#[derive(Debug, Clone)]
pub struct Speaker {
    pub user: String,
    pub channel: Option<String>,
}

impl Speaker {
    /// Turn one input line into a message. Blank lines yield `None`.
    pub fn message(&self, line: &str) -> Option<InboundMessage> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        let (author, channel, content) = match split_addressed(line) {
            Some((author, channel, content)) => {
                (author.to_string(), Some(channel.to_string()), content)
            }
            None => (self.user.clone(), self.channel.clone(), line),
        };
        let (channel_id, channel_kind) = match channel {
            Some(c) => (c, ChannelKind::Guild),
            None => (format!("dm-{author}"), ChannelKind::Direct),
        };

        Some(InboundMessage {
            author_name: Some(author.clone()),
            author_id: author,
            channel_id,
            channel_kind,
            content: content.to_string(),
            timestamp: Utc::now(),
            message_id: uuid::Uuid::now_v7().to_string(),
            reply_reference: None,
        })
    }
}

/// `name@channel: text`, with both names free of whitespace.
fn split_addressed(line: &str) -> Option<(&str, &str, &str)> {
    let (head, content) = line.split_once(':')?;
    let (author, channel) = head.split_once('@')?;
    let valid = |s: &str| !s.is_empty() && !s.contains(char::is_whitespace);
    if !valid(author) || !valid(channel) {
        return None;
    }
    let content = content.trim();
    (!content.is_empty()).then_some((author, channel, content))
}

/// Read stdin until EOF, dispatching each line and printing the reply.
pub async fn run(dispatcher: &FlowDispatcher, speaker: &Speaker) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        let Some(message) = speaker.message(&line) else {
            continue;
        };
        let outcome = dispatcher.dispatch(message).await;
        if let DispatchOutcome::Completed(turn) = &outcome {
            debug!(state = %turn.state, trail = ?turn.trail, "turn printed");
        }
        let reply = outcome.reply().unwrap_or("(no reply)");
        stdout.write_all(format!("{reply}\n").as_bytes()).await?;
        stdout.flush().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn speaker(channel: Option<&str>) -> Speaker {
        Speaker {
            user: "me".into(),
            channel: channel.map(str::to_string),
        }
    }

    #[test]
    fn plain_line_is_a_direct_message() {
        let msg = speaker(None).message("  hello there ").unwrap();
        assert_eq!(msg.author_id, "me");
        assert_eq!(msg.channel_id, "dm-me");
        assert!(msg.is_direct());
        assert_eq!(msg.content, "hello there");
    }

    #[test]
    fn default_channel_makes_guild_messages() {
        let msg = speaker(Some("general")).message("hi").unwrap();
        assert_eq!(msg.channel_id, "general");
        assert_eq!(msg.channel_kind, ChannelKind::Guild);
    }

    #[test]
    fn addressed_line_overrides_author_and_channel() {
        let msg = speaker(None).message("ana@lounge: what's the weather?").unwrap();
        assert_eq!(msg.author_id, "ana");
        assert_eq!(msg.channel_id, "lounge");
        assert_eq!(msg.content, "what's the weather?");
        assert!(!msg.is_direct());
    }

    #[test]
    fn colon_in_ordinary_text_is_not_an_address() {
        let msg = speaker(None).message("note to self: buy milk").unwrap();
        assert_eq!(msg.author_id, "me");
        assert_eq!(msg.content, "note to self: buy milk");
    }

    #[test]
    fn blank_lines_are_skipped() {
        assert!(speaker(None).message("   ").is_none());
    }
}
