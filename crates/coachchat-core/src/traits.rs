//! Traits at the seams to external collaborators.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::{
    error::{AuthError, BackendError, RelayError, StoreError},
    event::RawEvent,
    types::{ChannelId, ChannelQuery, Message, NewChannel, Session, UserId},
};

/// Token returned by a successful login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    /// User id reported alongside the token, when the backend sends one.
    pub user_id: Option<UserId>,
}

/// Account registration form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub username: String,
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub full_name: String,
}

/// Credentials as found in local storage, possibly incomplete.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCredentials {
    pub token: Option<String>,
    pub user_id: Option<UserId>,
}

impl StoredCredentials {
    /// A complete pair, or `None` if either half is missing or empty.
    #[must_use]
    pub fn into_session(self) -> Option<Session> {
        match (self.token, self.user_id) {
            (Some(token), Some(user_id)) if !token.is_empty() && !user_id.as_str().is_empty() => {
                Some(Session { token, user_id })
            }
            _ => None,
        }
    }

    /// Whether anything at all is stored.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.token.is_none() && self.user_id.is_none()
    }
}

impl From<&Session> for StoredCredentials {
    fn from(session: &Session) -> Self {
        Self {
            token: Some(session.token.clone()),
            user_id: Some(session.user_id.clone()),
        }
    }
}

/// Auth backend: login and registration.
#[async_trait]
pub trait AuthBackend: Send + Sync {
    /// Exchange username and password for a bearer token.
    async fn login(&self, username: &str, password: &str) -> Result<TokenGrant, AuthError>;

    /// Create an account. Does not log in.
    async fn register(&self, registration: &Registration) -> Result<(), AuthError>;
}

/// Local persistence for the session credentials.
///
/// Implementations must write token and user id atomically: a reader never
/// observes one half of a new pair next to the other half of an old one.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Read whatever is stored.
    async fn load(&self) -> Result<StoredCredentials, StoreError>;

    /// Replace the stored pair.
    async fn save(&self, session: &Session) -> Result<(), StoreError>;

    /// Remove stored credentials. Clearing an empty store is not an error.
    async fn clear(&self) -> Result<(), StoreError>;
}

/// Hosted messaging service.
#[async_trait]
pub trait MessagingBackend: Send + Sync {
    /// Open a connection for `user_id` authenticated by `token`.
    async fn connect(
        &self,
        user_id: &UserId,
        token: &str,
    ) -> Result<Arc<dyn BackendConnection>, BackendError>;
}

/// A live, authenticated link to the messaging service.
///
/// Payloads are returned as raw JSON and validated by the caller.
#[async_trait]
pub trait BackendConnection: Send + Sync {
    /// User this connection is authenticated as.
    fn user_id(&self) -> &UserId;

    /// List channels matching `query`.
    async fn query_channels(&self, query: &ChannelQuery) -> Result<Vec<Value>, BackendError>;

    /// Create a channel and return its payload.
    async fn create_channel(&self, channel: &NewChannel) -> Result<Value, BackendError>;

    /// Start receiving push events for a channel.
    async fn watch_channel(&self, channel_id: &ChannelId) -> Result<(), BackendError>;

    /// Most recent `limit` messages of a channel, oldest first.
    async fn query_messages(
        &self,
        channel_id: &ChannelId,
        limit: usize,
    ) -> Result<Vec<Value>, BackendError>;

    /// Post a message as the connected user and return the stored payload.
    async fn send_message(&self, channel_id: &ChannelId, text: &str) -> Result<Value, BackendError>;

    /// Push events for every watched channel.
    fn events(&self) -> broadcast::Receiver<RawEvent>;

    /// Release the connection. Must be safe to call more than once.
    async fn disconnect(&self) -> Result<(), BackendError>;
}

/// External AI inference endpoint.
#[async_trait]
pub trait InferenceClient: Send + Sync {
    /// Notify the inference backend of a new human message.
    async fn notify_new_message(&self, token: &str, message: &Message) -> Result<(), RelayError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_credentials_are_not_a_session() {
        let token_only = StoredCredentials {
            token: Some("t".to_owned()),
            user_id: None,
        };
        assert!(token_only.into_session().is_none());

        let user_only = StoredCredentials {
            token: None,
            user_id: Some(UserId::new("alice")),
        };
        assert!(user_only.into_session().is_none());

        let empty_token = StoredCredentials {
            token: Some(String::new()),
            user_id: Some(UserId::new("alice")),
        };
        assert!(empty_token.into_session().is_none());
    }

    #[test]
    fn test_full_credentials_round_trip_session() {
        let session = Session::new("t", "alice");
        let stored = StoredCredentials::from(&session);
        assert!(!stored.is_empty());
        assert_eq!(stored.into_session(), Some(session));
    }
}
