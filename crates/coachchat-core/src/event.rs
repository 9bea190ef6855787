//! Push events from the messaging backend.

use serde_json::Value;

use crate::{
    error::PayloadError,
    payload::{channel_id_of, parse_message},
    types::{AiState, ChannelId, Message, MessageId},
};

/// Event type names used on the wire.
pub mod kind {
    pub const MESSAGE_NEW: &str = "message.new";
    pub const MESSAGE_UPDATED: &str = "message.updated";
    pub const AI_INDICATOR_UPDATE: &str = "ai_indicator.update";
    pub const AI_INDICATOR_CLEAR: &str = "ai_indicator.clear";
    pub const CONNECTION_CHANGED: &str = "connection.changed";
    pub const CONNECTION_CLOSED: &str = "connection.closed";
}

/// Unvalidated event as delivered by the backend.
pub type RawEvent = Value;

/// Validated backend event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    /// A message was appended to a channel.
    MessageNew(Message),
    /// An existing message changed, e.g. a streamed AI reply grew.
    MessageUpdated(Message),
    /// AI responder progress for a message; `None` clears it.
    AiIndicator {
        channel_id: ChannelId,
        message_id: MessageId,
        state: Option<AiState>,
    },
    /// The backend closed the connection.
    ConnectionClosed,
    /// An event type this client does not act on.
    Ignored(String),
}

impl ChatEvent {
    /// Validate a raw event envelope.
    ///
    /// # Errors
    /// Returns [`PayloadError`] if the envelope or its message is malformed.
    pub fn parse(raw: &RawEvent) -> Result<Self, PayloadError> {
        let obj = raw.as_object().ok_or(PayloadError::NotAnObject)?;
        let event_type = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or(PayloadError::MissingField("type"))?;
        let channel_id = channel_id_of(obj);

        let message = || {
            let payload = obj.get("message").ok_or(PayloadError::MissingField("message"))?;
            parse_message(payload, channel_id.as_ref())
        };

        match event_type {
            kind::MESSAGE_NEW => Ok(Self::MessageNew(message()?)),
            kind::MESSAGE_UPDATED => Ok(Self::MessageUpdated(message()?)),
            kind::AI_INDICATOR_UPDATE | kind::AI_INDICATOR_CLEAR => {
                let channel_id = channel_id.ok_or(PayloadError::MissingField("cid"))?;
                let message_id = obj
                    .get("message_id")
                    .and_then(Value::as_str)
                    .filter(|id| !id.is_empty())
                    .map(MessageId::new)
                    .ok_or(PayloadError::MissingField("message_id"))?;
                let state = if event_type == kind::AI_INDICATOR_CLEAR {
                    None
                } else {
                    let wire = obj
                        .get("ai_state")
                        .and_then(Value::as_str)
                        .ok_or(PayloadError::MissingField("ai_state"))?;
                    Some(AiState::from_wire(wire).ok_or_else(|| PayloadError::InvalidField {
                        field: "ai_state",
                        reason: format!("unknown state {wire}"),
                    })?)
                };
                Ok(Self::AiIndicator {
                    channel_id,
                    message_id,
                    state,
                })
            }
            kind::CONNECTION_CLOSED => Ok(Self::ConnectionClosed),
            kind::CONNECTION_CHANGED
                if obj.get("online").and_then(Value::as_bool) == Some(false) =>
            {
                Ok(Self::ConnectionClosed)
            }
            other => Ok(Self::Ignored(other.to_owned())),
        }
    }

    /// Channel the event belongs to, if any.
    #[must_use]
    pub const fn channel_id(&self) -> Option<&ChannelId> {
        match self {
            Self::MessageNew(msg) | Self::MessageUpdated(msg) => Some(&msg.channel_id),
            Self::AiIndicator { channel_id, .. } => Some(channel_id),
            Self::ConnectionClosed | Self::Ignored(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn message_json() -> Value {
        json!({
            "id": "m1",
            "text": "hello",
            "user": { "id": "alice" },
            "created_at": "2024-05-01T10:00:00Z",
        })
    }

    #[test]
    fn test_message_new_takes_channel_from_envelope() {
        let raw = json!({ "type": "message.new", "cid": "messaging:c2", "message": message_json() });
        let ChatEvent::MessageNew(msg) = ChatEvent::parse(&raw).unwrap() else {
            panic!("Wrong event type");
        };
        assert_eq!(msg.channel_id.as_str(), "c2");
    }

    #[test]
    fn test_message_updated_requires_message() {
        let raw = json!({ "type": "message.updated", "cid": "messaging:c2" });
        assert_eq!(ChatEvent::parse(&raw), Err(PayloadError::MissingField("message")));
    }

    #[test]
    fn test_ai_indicator_events() {
        let update = json!({
            "type": "ai_indicator.update",
            "cid": "messaging:c1",
            "message_id": "m9",
            "ai_state": "AI_STATE_GENERATING",
        });
        assert_eq!(
            ChatEvent::parse(&update).unwrap(),
            ChatEvent::AiIndicator {
                channel_id: ChannelId::new("c1"),
                message_id: MessageId::new("m9"),
                state: Some(AiState::Generating),
            }
        );

        let clear = json!({ "type": "ai_indicator.clear", "channel_id": "c1", "message_id": "m9" });
        assert!(matches!(
            ChatEvent::parse(&clear).unwrap(),
            ChatEvent::AiIndicator { state: None, .. }
        ));

        let bogus = json!({ "type": "ai_indicator.update", "cid": "c1", "message_id": "m9", "ai_state": "NOPE" });
        assert!(ChatEvent::parse(&bogus).is_err());
    }

    #[test]
    fn test_connection_and_unknown_events() {
        assert_eq!(
            ChatEvent::parse(&json!({ "type": "connection.changed", "online": false })).unwrap(),
            ChatEvent::ConnectionClosed
        );
        assert_eq!(
            ChatEvent::parse(&json!({ "type": "connection.changed", "online": true })).unwrap(),
            ChatEvent::Ignored("connection.changed".to_owned())
        );
        assert_eq!(
            ChatEvent::parse(&json!({ "type": "typing.start" })).unwrap(),
            ChatEvent::Ignored("typing.start".to_owned())
        );
        assert_eq!(ChatEvent::parse(&json!({})), Err(PayloadError::MissingField("type")));
    }
}
