use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Milliseconds since the Unix epoch.
pub type Timestamp = i64;

const ADDRESS_HEX_LEN: usize = 40;

macro_rules! string_id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id_newtype!(MessageId);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("address must start with 0x: {0}")]
    MissingPrefix(String),
    #[error("address must have {expected} hex digits, got {actual}: {raw}")]
    InvalidLength {
        raw: String,
        expected: usize,
        actual: usize,
    },
    #[error("address contains non-hex characters: {0}")]
    NonHex(String),
}

/// Counterparty address, normalized to lowercase `0x`-prefixed hex.
///
/// Two spellings of the same account (checksummed or not) compare equal once
/// parsed, which keeps channel ids unique per peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerAddress(String);

impl PeerAddress {
    pub fn parse(raw: &str) -> Result<Self, AddressError> {
        let trimmed = raw.trim();
        let Some(hex) = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
        else {
            return Err(AddressError::MissingPrefix(trimmed.to_string()));
        };
        if hex.len() != ADDRESS_HEX_LEN {
            return Err(AddressError::InvalidLength {
                raw: trimmed.to_string(),
                expected: ADDRESS_HEX_LEN,
                actual: hex.len(),
            });
        }
        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(AddressError::NonHex(trimmed.to_string()));
        }
        Ok(Self(format!("0x{}", hex.to_ascii_lowercase())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `0x1234…abcd` style label used as the default channel name.
    pub fn short_label(&self) -> String {
        format!("{}…{}", &self.0[..6], &self.0[self.0.len() - 4..])
    }
}

impl FromStr for PeerAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PeerAddress {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PeerAddress> for String {
    fn from(value: PeerAddress) -> Self {
        value.0
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Delivery lifecycle of a message.
///
/// `Sending -> Sent -> Delivered -> Read`, with `Failed` reachable only from
/// `Sending`. Terminal states never move again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    fn rank(self) -> u8 {
        match self {
            MessageStatus::Sending => 0,
            MessageStatus::Sent => 1,
            MessageStatus::Delivered => 2,
            MessageStatus::Read => 3,
            MessageStatus::Failed => 0,
        }
    }

    pub fn can_transition_to(self, next: MessageStatus) -> bool {
        match (self, next) {
            (MessageStatus::Failed, _) => false,
            (MessageStatus::Sending, MessageStatus::Failed) => true,
            (_, MessageStatus::Failed) => false,
            (current, next) => next.rank() > current.rank(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: PeerAddress,
    pub name: String,
    pub description: String,
    pub is_private: bool,
    pub created_by: PeerAddress,
    pub participants: Vec<PeerAddress>,
    pub last_message_at: Timestamp,
}

impl Channel {
    /// One-to-one conversation between `local` and `peer`.
    pub fn direct(local: &PeerAddress, peer: &PeerAddress, last_message_at: Timestamp) -> Self {
        Self {
            id: peer.clone(),
            name: peer.to_string(),
            description: "Direct Chat".to_string(),
            is_private: true,
            created_by: local.clone(),
            participants: vec![local.clone(), peer.clone()],
            last_message_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender: PeerAddress,
    pub content: String,
    pub timestamp: Timestamp,
    pub encrypted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MessageStatus>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub reactions: BTreeMap<String, Vec<PeerAddress>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_content: Option<String>,
    #[serde(default)]
    pub deleted: bool,
}

impl Message {
    pub fn new(
        id: MessageId,
        sender: PeerAddress,
        content: impl Into<String>,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            id,
            sender,
            content: content.into(),
            timestamp,
            encrypted: true,
            signature: None,
            nickname: None,
            status: None,
            reactions: BTreeMap::new(),
            edited_content: None,
            deleted: false,
        }
    }

    pub fn with_status(mut self, status: MessageStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Text to present: the edit if there is one, nothing once deleted.
    pub fn display_content(&self) -> Option<&str> {
        if self.deleted {
            return None;
        }
        Some(self.edited_content.as_deref().unwrap_or(&self.content))
    }
}

#[cfg(test)]
#[path = "tests/domain_tests.rs"]
mod tests;
