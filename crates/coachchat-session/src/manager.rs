//! Session manager: login, restore and logout.

use coachchat_core::{
    AuthBackend, AuthError, CredentialStore, Registration, Session, StoreError, UserId,
};
use tokio::sync::{Mutex, watch};

use crate::claims::user_id_from_token;

/// Session manager error.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
}

/// Owns credential acquisition and the persisted session.
///
/// The current session is published on a `watch` channel; the sync engine
/// follows it and tears its connection down when it becomes `None`.
pub struct SessionManager<S, A>
where
    S: CredentialStore,
    A: AuthBackend,
{
    store: S,
    auth: A,
    current: watch::Sender<Option<Session>>,
    // Serializes authenticate/restore/terminate so store writes never interleave.
    op: Mutex<()>,
}

impl<S, A> SessionManager<S, A>
where
    S: CredentialStore,
    A: AuthBackend,
{
    /// Create a new session manager with no active session.
    #[must_use]
    pub fn new(store: S, auth: A) -> Self {
        let (current, _) = watch::channel(None);
        Self {
            store,
            auth,
            current,
            op: Mutex::new(()),
        }
    }

    /// Receiver that observes every session change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<Session>> {
        self.current.subscribe()
    }

    /// The active session, if any.
    #[must_use]
    pub fn current(&self) -> Option<Session> {
        self.current.borrow().clone()
    }

    /// Restore a previously persisted session.
    ///
    /// A partial pair (token without user id or the reverse) and an
    /// unreadable credentials file both count as no session and are cleared.
    ///
    /// # Errors
    /// Returns error if the store cannot be read or cleared.
    pub async fn restore(&self) -> Result<Option<Session>, SessionError> {
        let _guard = self.op.lock().await;

        let stored = match self.store.load().await {
            Ok(stored) => stored,
            Err(StoreError::Corrupt(reason)) => {
                tracing::warn!(%reason, "Discarding unreadable credentials");
                self.store.clear().await?;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let was_empty = stored.is_empty();
        match stored.into_session() {
            Some(session) => {
                tracing::info!(user_id = %session.user_id, "Session restored");
                self.current.send_replace(Some(session.clone()));
                Ok(Some(session))
            }
            None => {
                if !was_empty {
                    tracing::warn!("Discarding partial credentials");
                    self.store.clear().await?;
                }
                Ok(None)
            }
        }
    }

    /// Log in and persist the resulting session.
    ///
    /// The user id comes from the login response when present, then from the
    /// token's claims, and finally falls back to `username`. Token and user
    /// id are persisted together before the session is published.
    ///
    /// # Errors
    /// Returns error if login fails or the session cannot be persisted.
    #[tracing::instrument(skip(self, password))]
    pub async fn authenticate(&self, username: &str, password: &str) -> Result<Session, SessionError> {
        let _guard = self.op.lock().await;

        let grant = self
            .auth
            .login(username, password)
            .await
            .inspect_err(|e| tracing::warn!(error = %e, "Login failed"))?;

        let user_id = grant
            .user_id
            .or_else(|| user_id_from_token(&grant.access_token))
            .unwrap_or_else(|| UserId::new(username));
        let session = Session::new(grant.access_token, user_id);

        self.store.save(&session).await?;
        self.current.send_replace(Some(session.clone()));

        tracing::info!(user_id = %session.user_id, "Login successful");
        Ok(session)
    }

    /// Register a new account. Does not start a session.
    ///
    /// # Errors
    /// Returns error if the auth backend rejects the registration.
    #[tracing::instrument(skip(self, registration), fields(username = %registration.username))]
    pub async fn register(&self, registration: &Registration) -> Result<(), SessionError> {
        self.auth.register(registration).await?;
        tracing::info!("Registration successful");
        Ok(())
    }

    /// End the session: clear persisted credentials and signal disconnect.
    ///
    /// Idempotent. Subscribers see `None` even if clearing the store fails.
    ///
    /// # Errors
    /// Returns error if the store cannot be cleared.
    pub async fn terminate(&self) -> Result<(), SessionError> {
        let _guard = self.op.lock().await;

        let cleared = self.store.clear().await;
        let previous = self.current.send_replace(None);
        if let Some(session) = previous {
            tracing::info!(user_id = %session.user_id, "Session terminated");
        }
        cleared.map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use coachchat_core::{StoredCredentials, TokenGrant};
    use tokio_test::{assert_err, assert_ok};

    use super::*;
    use crate::storage::MemoryCredentialStore;

    struct FakeAuth {
        grant: Result<TokenGrant, AuthError>,
        registrations: AtomicUsize,
    }

    impl FakeAuth {
        fn granting(token: &str, user_id: Option<&str>) -> Self {
            Self {
                grant: Ok(TokenGrant {
                    access_token: token.to_owned(),
                    user_id: user_id.map(UserId::new),
                }),
                registrations: AtomicUsize::new(0),
            }
        }

        fn failing(err: AuthError) -> Self {
            Self {
                grant: Err(err),
                registrations: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl AuthBackend for FakeAuth {
        async fn login(&self, _username: &str, _password: &str) -> Result<TokenGrant, AuthError> {
            self.grant.clone()
        }

        async fn register(&self, _registration: &Registration) -> Result<(), AuthError> {
            self.registrations.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_authenticate_persists_pair_and_publishes() {
        let manager = SessionManager::new(MemoryCredentialStore::new(), FakeAuth::granting("tok", Some("alice")));
        let rx = manager.subscribe();

        let session = assert_ok!(manager.authenticate("alice", "pw").await);
        assert_eq!(session.user_id.as_str(), "alice");
        assert_eq!(rx.borrow().as_ref(), Some(&session));
        assert_eq!(manager.store.snapshot().unwrap().into_session(), Some(session));
    }

    #[tokio::test]
    async fn test_authenticate_falls_back_to_username() {
        let manager = SessionManager::new(MemoryCredentialStore::new(), FakeAuth::granting("opaque", None));
        let session = assert_ok!(manager.authenticate("carol", "pw").await);
        assert_eq!(session.user_id.as_str(), "carol");
    }

    #[tokio::test]
    async fn test_failed_login_persists_nothing() {
        let manager = SessionManager::new(
            MemoryCredentialStore::new(),
            FakeAuth::failing(AuthError::InvalidCredentials),
        );
        let err = assert_err!(manager.authenticate("alice", "bad").await);
        assert!(matches!(err, SessionError::Auth(AuthError::InvalidCredentials)));
        assert!(manager.store.snapshot().unwrap().is_empty());
        assert!(manager.current().is_none());
    }

    #[tokio::test]
    async fn test_restore_full_and_partial() {
        let full = MemoryCredentialStore::with_stored(StoredCredentials::from(&Session::new("t", "alice")));
        let manager = SessionManager::new(full, FakeAuth::granting("x", None));
        let restored = assert_ok!(manager.restore().await);
        assert_eq!(restored.map(|s| s.user_id), Some(UserId::new("alice")));

        let partial = MemoryCredentialStore::with_stored(StoredCredentials {
            token: Some("t".to_owned()),
            user_id: None,
        });
        let manager = SessionManager::new(partial, FakeAuth::granting("x", None));
        assert_eq!(assert_ok!(manager.restore().await), None);
        assert!(manager.store.snapshot().unwrap().is_empty());
        assert!(manager.current().is_none());
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let manager = SessionManager::new(MemoryCredentialStore::new(), FakeAuth::granting("tok", Some("alice")));
        let mut rx = manager.subscribe();
        assert_ok!(manager.authenticate("alice", "pw").await);
        rx.borrow_and_update();

        assert_ok!(manager.terminate().await);
        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update().is_none());
        assert!(manager.store.snapshot().unwrap().is_empty());

        assert_ok!(manager.terminate().await);
        assert!(manager.current().is_none());
    }

    #[tokio::test]
    async fn test_register_does_not_create_session() {
        let manager = SessionManager::new(MemoryCredentialStore::new(), FakeAuth::granting("tok", None));
        let registration = Registration {
            username: "dave".to_owned(),
            email: "dave@example.com".to_owned(),
            password: "pw".to_owned(),
            full_name: "Dave".to_owned(),
        };
        assert_ok!(manager.register(&registration).await);
        assert_eq!(manager.auth.registrations.load(Ordering::SeqCst), 1);
        assert!(manager.current().is_none());
    }
}
