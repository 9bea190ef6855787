//! Wire protocol for the auth and inference HTTP API.

use coachchat_core::{MESSAGING_CHANNEL_TYPE, Message, event::kind};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `POST /auth/login` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// User record some backends return next to the token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// `POST /auth/login` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub user: Option<UserInfo>,
}

/// Error body: `{"detail": ...}` where detail is a string or a list of
/// validation issues.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    #[serde(default)]
    pub detail: Value,
}

impl ErrorResponse {
    /// Human-readable summary of the detail.
    #[must_use]
    pub fn message(&self) -> String {
        match &self.detail {
            Value::String(s) => s.clone(),
            Value::Null => "no detail".to_owned(),
            other => other.to_string(),
        }
    }
}

/// Author reference inside a relayed message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayUser {
    pub id: String,
}

/// Message as relayed to the inference backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayMessage {
    pub id: String,
    pub text: String,
    pub user: RelayUser,
    pub cid: String,
    pub created_at: String,
}

/// `POST /ai/new-message` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessageRequest {
    #[serde(rename = "type")]
    pub event_type: String,
    pub cid: String,
    pub channel_id: String,
    pub message: RelayMessage,
    pub user: RelayUser,
}

impl NewMessageRequest {
    /// Relay body for a freshly appended message.
    #[must_use]
    pub fn from_message(message: &Message) -> Self {
        let cid = message.channel_id.to_cid(MESSAGING_CHANNEL_TYPE);
        let user = RelayUser {
            id: message.author_id.to_string(),
        };
        Self {
            event_type: kind::MESSAGE_NEW.to_owned(),
            cid: cid.clone(),
            channel_id: message.channel_id.to_string(),
            message: RelayMessage {
                id: message.id.to_string(),
                text: message.text.clone(),
                user: user.clone(),
                cid,
                created_at: message.created_at.to_rfc3339(),
            },
            user,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use coachchat_core::{ChannelId, MessageId, UserId};
    use serde_json::json;

    use super::*;

    #[test]
    fn test_new_message_request_shape() {
        let message = Message {
            id: MessageId::new("m1"),
            channel_id: ChannelId::new("coach-1"),
            author_id: UserId::new("alice"),
            text: "hello".to_owned(),
            created_at: Utc::now(),
            updated_at: None,
        };
        let json = serde_json::to_value(NewMessageRequest::from_message(&message)).unwrap();

        assert_eq!(json["type"], "message.new");
        assert_eq!(json["cid"], "messaging:coach-1");
        assert_eq!(json["channel_id"], "coach-1");
        assert_eq!(json["user"]["id"], "alice");
        assert_eq!(json["message"]["text"], "hello");
        assert_eq!(json["message"]["user"]["id"], "alice");
    }

    #[test]
    fn test_token_response_with_and_without_user() {
        let bare: TokenResponse =
            serde_json::from_value(json!({ "access_token": "t", "token_type": "bearer" })).unwrap();
        assert!(bare.user.is_none());

        let full: TokenResponse = serde_json::from_value(json!({
            "access_token": "t",
            "user": { "id": "alice", "username": "Alice" },
        }))
        .unwrap();
        assert_eq!(full.user.unwrap().id, "alice");
    }

    #[test]
    fn test_error_detail_message() {
        let text: ErrorResponse = serde_json::from_value(json!({ "detail": "Bad login" })).unwrap();
        assert_eq!(text.message(), "Bad login");

        let list: ErrorResponse =
            serde_json::from_value(json!({ "detail": [{ "loc": ["body"], "msg": "missing" }] })).unwrap();
        assert!(list.message().contains("missing"));

        let empty: ErrorResponse = serde_json::from_value(json!({})).unwrap();
        assert_eq!(empty.message(), "no detail");
    }
}
