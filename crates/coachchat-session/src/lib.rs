//! Session lifecycle and credential storage for coachchat.
//!
//! Provides:
//! - `SessionManager` - login, restore, registration and logout
//! - Storage implementations (memory, JSON file)
//! - Bearer token claim inspection

pub mod claims;
pub mod manager;
pub mod storage;

pub use manager::{SessionError, SessionManager};
