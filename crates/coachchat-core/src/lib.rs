//! Core abstractions for the coachchat sync engine.
//!
//! This crate provides the fundamental building blocks:
//! - Domain types (`Session`, `Channel`, `Message`) and their id newtypes
//! - Validation of raw backend payloads and push events
//! - `EventHub` - per-channel fan-out of validated events
//! - Traits for the messaging, auth, inference and storage collaborators
//! - `ClientConfig` and the shared error taxonomy

pub mod config;
pub mod error;
pub mod event;
pub mod hub;
pub mod payload;
pub mod traits;
pub mod types;

pub use config::ClientConfig;
pub use error::{
    AuthError, BackendError, ConfigError, ConnectionError, FetchError, PayloadError, RelayError,
    SendError, StoreError,
};
pub use event::{ChatEvent, RawEvent};
pub use hub::{ChannelListener, EventHub};
pub use traits::{
    AuthBackend, BackendConnection, CredentialStore, InferenceClient, MessagingBackend,
    Registration, StoredCredentials, TokenGrant,
};
pub use types::{
    AiState, Channel, ChannelId, ChannelQuery, ChannelSort, Message, MessageId, NewChannel,
    Session, UserId,
};

/// Channel type used for user conversations.
pub const MESSAGING_CHANNEL_TYPE: &str = "messaging";
