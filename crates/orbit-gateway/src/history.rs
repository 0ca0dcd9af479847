//! History payload mining.
//!
//! A history sync carries whole conversations. Two things are taken from it:
//! identity sightings for the contact directory, and a capped, newest-first
//! slice of each conversation's text for the orchestrator.

use orbit_gateway_protocol::HistoryEntry;
use tracing::debug;

use crate::adapter::{HistoryConversation, MessageContent};
use crate::address::Address;
use crate::contacts::ContactSighting;

/// Text of a message, or a placeholder for media without a caption.
///
/// `None` for content the gateway does not understand.
pub fn message_text(content: &MessageContent) -> Option<String> {
    if let Some(text) = plain_text(content) {
        return Some(text);
    }
    let placeholder = match content {
        MessageContent::Image { .. } => "[Sent an image]",
        MessageContent::Video { .. } => "[Sent a video]",
        MessageContent::Audio { .. } => "[Sent an audio]",
        MessageContent::Sticker { .. } => "[Sticker]",
        MessageContent::Document { .. } => "[Sent a document]",
        MessageContent::Text { .. } | MessageContent::Unsupported => return None,
    };
    Some(placeholder.to_string())
}

/// Body or caption text only, trimmed. Never a placeholder.
pub fn plain_text(content: &MessageContent) -> Option<String> {
    let text = match content {
        MessageContent::Text { text } => Some(text.as_str()),
        MessageContent::Image { caption, .. }
        | MessageContent::Video { caption, .. }
        | MessageContent::Document { caption, .. } => caption.as_deref(),
        MessageContent::Audio { .. } | MessageContent::Sticker { .. } | MessageContent::Unsupported => None,
    };
    text.map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

/// Every identity a history payload reveals.
///
/// The conversation itself is always sighted, even without a name: the
/// recent-activity push only covers a few dozen chats, so history is how
/// older contacts get into the directory at all.
pub fn history_sightings(conversations: &[HistoryConversation]) -> Vec<ContactSighting> {
    let mut sightings = Vec::new();

    for conversation in conversations {
        let Ok(chat) = Address::parse(&conversation.id) else {
            debug!(chat = %conversation.id, "Skipping history for unparseable address");
            continue;
        };
        if chat.is_pseudo() {
            continue;
        }

        sightings.push(ContactSighting::new(chat.clone()).with_name(conversation.name.as_deref()));

        for message in conversation.messages.iter().filter(|m| !m.from_me) {
            let sender = if chat.is_group() {
                match message.participant.as_deref().map(Address::parse) {
                    Some(Ok(participant)) => participant,
                    _ => continue,
                }
            } else {
                chat.clone()
            };
            if message.push_name.is_some() {
                sightings.push(
                    ContactSighting::new(sender).with_alternate_name(message.push_name.as_deref()),
                );
            }
        }
    }

    sightings
}

/// Text entries for the orchestrator, at most `cap` per conversation,
/// newest first. Messages without body or caption text are skipped.
pub fn collect_history(conversations: &[HistoryConversation], cap: usize) -> Vec<HistoryEntry> {
    let mut entries = Vec::new();

    for conversation in conversations {
        let Ok(chat) = Address::parse(&conversation.id) else {
            continue;
        };
        if chat.is_pseudo() {
            continue;
        }

        let mut messages: Vec<HistoryEntry> = conversation
            .messages
            .iter()
            .filter_map(|m| {
                let text = plain_text(&m.content)?;
                Some(HistoryEntry {
                    id: m.id.clone(),
                    from: chat.to_string(),
                    sender_label: if m.from_me {
                        None
                    } else {
                        m.push_name.clone()
                    },
                    text,
                    from_me: m.from_me,
                    timestamp: m.timestamp,
                })
            })
            .collect();

        messages.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        messages.truncate(cap);
        entries.extend(messages);
    }

    entries
}
