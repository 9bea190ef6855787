//! In-memory credential storage.

use std::sync::RwLock;

use async_trait::async_trait;
use coachchat_core::{CredentialStore, Session, StoreError, StoredCredentials};

/// In-memory storage implementation.
///
/// Useful for tests and for clients that must not touch disk.
/// Credentials are lost on restart.
#[derive(Default)]
pub struct MemoryCredentialStore {
    credentials: RwLock<StoredCredentials>,
}

impl MemoryCredentialStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-filled with (possibly partial) credentials.
    #[must_use]
    pub const fn with_stored(credentials: StoredCredentials) -> Self {
        Self {
            credentials: RwLock::new(credentials),
        }
    }

    /// Copy of what is currently stored.
    ///
    /// # Errors
    /// Returns error if the lock is poisoned.
    pub fn snapshot(&self) -> Result<StoredCredentials, StoreError> {
        Ok(self
            .credentials
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?
            .clone())
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load(&self) -> Result<StoredCredentials, StoreError> {
        self.snapshot()
    }

    async fn save(&self, session: &Session) -> Result<(), StoreError> {
        // Both halves are replaced under one write lock.
        *self
            .credentials
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))? = StoredCredentials::from(session);
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        *self
            .credentials
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))? = StoredCredentials::default();
        Ok(())
    }
}
