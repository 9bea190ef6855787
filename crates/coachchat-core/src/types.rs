//! Domain types shared by the session, transport and sync crates.

use std::{collections::BTreeSet, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap a raw identifier.
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrow the raw identifier.
            #[must_use]
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
            fn from(id: &str) -> Self {
                Self(id.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Identity of a chat participant, human or bot.
    UserId
);
string_id!(
    /// Channel identifier, always in its unqualified form.
    ChannelId
);
string_id!(
    /// Message identifier, unique within its channel.
    MessageId
);

impl ChannelId {
    /// Normalize a backend cid such as `messaging:abc` to `abc`.
    ///
    /// Ids without a type prefix are returned unchanged.
    #[must_use]
    pub fn from_cid(cid: &str) -> Self {
        match cid.split(':').nth(1) {
            Some(id) if !id.is_empty() => Self::new(id),
            _ => Self::new(cid),
        }
    }

    /// Qualified cid for the given channel type.
    #[must_use]
    pub fn to_cid(&self, channel_type: &str) -> String {
        format!("{channel_type}:{}", self.0)
    }
}

/// Authenticated identity plus bearer token.
///
/// Persisted only as a pair: a token without a user id, or the other way
/// round, is treated as no session at all.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Bearer token issued by the auth backend.
    pub token: String,
    /// User the token was issued for.
    pub user_id: UserId,
}

impl Session {
    /// Create a session.
    #[must_use]
    pub fn new(token: impl Into<String>, user_id: impl Into<UserId>) -> Self {
        Self {
            token: token.into(),
            user_id: user_id.into(),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("token", &"<redacted>")
            .field("user_id", &self.user_id)
            .finish()
    }
}

/// A conversation scoped to a fixed set of members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: ChannelId,
    pub display_name: String,
    pub member_ids: BTreeSet<UserId>,
    /// Drives ordering in the channel list.
    pub last_activity_at: DateTime<Utc>,
}

/// A text record within a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub author_id: UserId,
    pub text: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Progress of the AI responder on one of its messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AiState {
    /// Request received, no tokens yet.
    Thinking,
    /// Tokens are streaming into the message.
    Generating,
    /// Generation failed; the message may be incomplete.
    Error,
}

impl AiState {
    /// Parse the backend's `AI_STATE_*` wire names.
    #[must_use]
    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "AI_STATE_THINKING" => Some(Self::Thinking),
            "AI_STATE_GENERATING" => Some(Self::Generating),
            "AI_STATE_ERROR" => Some(Self::Error),
            _ => None,
        }
    }

    /// Backend wire name.
    #[must_use]
    pub const fn as_wire(self) -> &'static str {
        match self {
            Self::Thinking => "AI_STATE_THINKING",
            Self::Generating => "AI_STATE_GENERATING",
            Self::Error => "AI_STATE_ERROR",
        }
    }
}

/// Parameters for creating a channel on the messaging backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewChannel {
    pub id: ChannelId,
    pub display_name: String,
    pub member_ids: BTreeSet<UserId>,
    pub created_by: UserId,
}

/// Sort order requested from the messaging backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelSort {
    /// Most recent message first.
    #[default]
    LastMessageDesc,
}

/// Channel listing request: filter, sort and options in one value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelQuery {
    /// Backend channel type, `messaging` for user conversations.
    pub channel_type: String,
    /// Only channels this user is a member of.
    pub member: UserId,
    pub sort: ChannelSort,
    /// Start watching the returned channels for push events.
    pub watch: bool,
    /// Include channel state (members, recent messages).
    pub state: bool,
    pub limit: Option<usize>,
}

impl ChannelQuery {
    /// Channels of type `messaging` that include `member`, watched, with state.
    #[must_use]
    pub fn for_member(member: UserId) -> Self {
        Self {
            channel_type: crate::MESSAGING_CHANNEL_TYPE.to_owned(),
            member,
            sort: ChannelSort::LastMessageDesc,
            watch: true,
            state: true,
            limit: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cid_normalization() {
        assert_eq!(ChannelId::from_cid("messaging:abc").as_str(), "abc");
        assert_eq!(ChannelId::from_cid("abc").as_str(), "abc");
        assert_eq!(ChannelId::from_cid("messaging:abc:extra").as_str(), "abc");
        assert_eq!(ChannelId::from_cid("messaging:").as_str(), "messaging:");
        assert_eq!(ChannelId::new("abc").to_cid("messaging"), "messaging:abc");
    }

    #[test]
    fn test_session_debug_redacts_token() {
        let session = Session::new("secret-token", "alice");
        let debug = format!("{session:?}");
        assert!(!debug.contains("secret-token"));
        assert!(debug.contains("alice"));
    }

    #[test]
    fn test_ai_state_wire_names() {
        for state in [AiState::Thinking, AiState::Generating, AiState::Error] {
            assert_eq!(AiState::from_wire(state.as_wire()), Some(state));
        }
        assert_eq!(AiState::from_wire("AI_STATE_IDLE"), None);
    }
}
