//! Client-side synchronization engine for coachchat.
//!
//! Provides:
//! - `ConnectionManager` - one guarded connection per session
//! - `ChannelListStore` - channels ordered by activity, with selection tickets
//! - `MessageLog` - deduplicated, update-reconcilable per-channel logs
//! - `AiRelayBridge` - fire-and-forget relay of human messages to the AI backend
//! - `ChatClient` - facade routing backend events between the above

pub mod channels;
pub mod client;
pub mod connection;
pub mod log;
pub mod ordered;
pub mod relay;
pub mod subscription;

pub use channels::{ChannelListStore, SelectionTicket};
pub use client::{ChatClient, ClientError, Draft};
pub use connection::{ConnectionManager, ConnectionState};
pub use log::{LoadOutcome, MessageLog};
pub use relay::AiRelayBridge;
pub use subscription::ChannelSubscription;
