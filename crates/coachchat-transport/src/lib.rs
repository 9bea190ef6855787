//! Transport layer for the coachchat sync engine.
//!
//! Provides:
//! - Wire protocol for the auth and inference HTTP API
//! - `ApiClient` - login, registration and AI relay over HTTP (feature: http)
//! - `MemoryMessagingBackend` - in-process messaging service (feature: memory)

pub mod protocol;

#[cfg(feature = "http")]
pub mod http;

#[cfg(feature = "memory")]
pub mod memory;

pub use protocol::{NewMessageRequest, TokenResponse};

#[cfg(feature = "http")]
pub use http::{ApiClient, TransportError};

#[cfg(feature = "memory")]
pub use memory::MemoryMessagingBackend;
