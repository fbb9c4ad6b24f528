use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Message, MessageId, MessageStatus, PeerAddress, Timestamp};

/// Message as delivered by the messaging network, before it is folded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMessage {
    pub id: MessageId,
    pub sender_address: PeerAddress,
    pub content: String,
    pub sent_at: DateTime<Utc>,
    pub conversation_peer_address: PeerAddress,
}

impl RawMessage {
    pub fn timestamp(&self) -> Timestamp {
        self.sent_at.timestamp_millis()
    }

    /// Channel this message belongs to from `local`'s point of view.
    pub fn channel_for(&self, local: &PeerAddress) -> PeerAddress {
        if &self.sender_address == local {
            self.conversation_peer_address.clone()
        } else {
            self.sender_address.clone()
        }
    }

    pub fn into_message(self) -> Message {
        let timestamp = self.timestamp();
        Message::new(self.id, self.sender_address, self.content, timestamp)
    }
}

/// Partial update merged into an existing message; `None` fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MessageStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub add_reaction: Option<(String, PeerAddress)>,
}

impl MessagePatch {
    pub fn status(status: MessageStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn edit(content: impl Into<String>) -> Self {
        Self {
            edited_content: Some(content.into()),
            ..Self::default()
        }
    }

    pub fn delete() -> Self {
        Self {
            deleted: Some(true),
            ..Self::default()
        }
    }

    pub fn reaction(emoji: impl Into<String>, user: PeerAddress) -> Self {
        Self {
            add_reaction: Some((emoji.into(), user)),
            ..Self::default()
        }
    }

    /// Applies the patch. Status only moves forward along the lifecycle.
    pub fn apply_to(&self, message: &mut Message) {
        if let Some(content) = &self.content {
            message.content = content.clone();
        }
        if let Some(next) = self.status {
            let allowed = match message.status {
                Some(current) => current.can_transition_to(next),
                None => true,
            };
            if allowed {
                message.status = Some(next);
            }
        }
        if let Some(edited) = &self.edited_content {
            message.edited_content = Some(edited.clone());
        }
        if let Some(deleted) = self.deleted {
            message.deleted = deleted;
        }
        if let Some(nickname) = &self.nickname {
            message.nickname = Some(nickname.clone());
        }
        if let Some(signature) = &self.signature {
            message.signature = Some(signature.clone());
        }
        if let Some((emoji, user)) = &self.add_reaction {
            let users = message.reactions.entry(emoji.clone()).or_default();
            if !users.contains(user) {
                users.push(user.clone());
            }
        }
    }
}
