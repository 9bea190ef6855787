//! Single live connection to the messaging backend.
//!
//! State machine:
//! `Idle -> Connecting -> Connected -> Disconnecting -> Idle`,
//! `Connecting -> Error -> (reset) -> Idle`, and `Connected -> Idle` when the
//! service closes the connection. There is no automatic retry; calling
//! `connect` again from `Error` is the retry.

use std::sync::{Arc, Mutex, PoisonError, Weak};

use coachchat_core::{
    BackendConnection, ChatEvent, ConnectionError, MessagingBackend, Session, UserId,
};
use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use tokio::{
    sync::{broadcast::error::RecvError, watch},
    task::JoinHandle,
};

/// Observable connection state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting(UserId),
    Connected(UserId),
    Disconnecting,
    Error(ConnectionError),
}

impl ConnectionState {
    /// User the connection belongs to, while one is being made or is live.
    #[must_use]
    pub const fn owner(&self) -> Option<&UserId> {
        match self {
            Self::Connecting(user) | Self::Connected(user) => Some(user),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_connected(&self) -> bool {
        matches!(self, Self::Connected(_))
    }
}

type ConnectAttempt = Shared<BoxFuture<'static, Result<(), ConnectionError>>>;

struct InFlight {
    user_id: UserId,
    attempt: ConnectAttempt,
}

#[derive(Default)]
struct Slot {
    handle: Option<Arc<dyn BackendConnection>>,
    close_watcher: Option<JoinHandle<()>>,
    generation: u64,
}

/// Owns the one backend connection of the process.
///
/// Connect and disconnect are serialized by an async guard. Overlapping
/// `connect` calls for the same user share a single in-flight attempt, so
/// they all observe the same result and at most one handle is ever opened.
pub struct ConnectionManager {
    backend: Arc<dyn MessagingBackend>,
    state: watch::Sender<ConnectionState>,
    slot: tokio::sync::Mutex<Slot>,
    in_flight: Mutex<Option<InFlight>>,
}

impl ConnectionManager {
    #[must_use]
    pub fn new(backend: Arc<dyn MessagingBackend>) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Arc::new(Self {
            backend,
            state,
            slot: tokio::sync::Mutex::new(Slot::default()),
            in_flight: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Receiver that observes every state transition.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// The live backend connection, if connected.
    pub async fn handle(&self) -> Option<Arc<dyn BackendConnection>> {
        self.slot.lock().await.handle.clone()
    }

    /// Connect for `session`.
    ///
    /// A no-op when already connected as the same user; a connection owned
    /// by another user is released first. The attempt runs on its own task,
    /// so dropping the returned future does not abandon it half-way.
    ///
    /// # Errors
    /// Returns [`ConnectionError`] if the backend refuses or cannot be
    /// reached. The state is then `Error`.
    pub async fn connect(self: &Arc<Self>, session: &Session) -> Result<(), ConnectionError> {
        let attempt = self.join_or_start(session);
        let result = attempt.clone().await;

        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if in_flight
            .as_ref()
            .is_some_and(|current| current.attempt.ptr_eq(&attempt))
        {
            *in_flight = None;
        }
        result
    }

    fn join_or_start(self: &Arc<Self>, session: &Session) -> ConnectAttempt {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = in_flight.as_ref() {
            if current.user_id == session.user_id {
                tracing::debug!(user_id = %session.user_id, "Joining in-flight connect");
                return current.attempt.clone();
            }
        }

        let this = Arc::clone(self);
        let owned = session.clone();
        let task = tokio::spawn(async move { this.connect_serialized(&owned).await });
        let attempt = async move {
            task.await
                .unwrap_or_else(|e| Err(ConnectionError::Fatal(format!("Connect task failed: {e}"))))
        }
        .boxed()
        .shared();

        *in_flight = Some(InFlight {
            user_id: session.user_id.clone(),
            attempt: attempt.clone(),
        });
        attempt
    }

    #[tracing::instrument(skip(self, session), fields(user_id = %session.user_id))]
    async fn connect_serialized(self: &Arc<Self>, session: &Session) -> Result<(), ConnectionError> {
        let mut slot = self.slot.lock().await;

        if let Some(handle) = &slot.handle {
            if handle.user_id() == &session.user_id {
                tracing::debug!("Already connected");
                return Ok(());
            }
            tracing::info!(previous = %handle.user_id(), "Switching user, releasing connection");
            self.release(&mut slot).await;
        }

        self.state
            .send_replace(ConnectionState::Connecting(session.user_id.clone()));
        match self.backend.connect(&session.user_id, &session.token).await {
            Ok(handle) => {
                slot.generation += 1;
                slot.close_watcher = Some(self.spawn_close_watcher(&handle, slot.generation));
                slot.handle = Some(handle);
                self.state
                    .send_replace(ConnectionState::Connected(session.user_id.clone()));
                tracing::info!("Connected");
                Ok(())
            }
            Err(e) => {
                let err = ConnectionError::from(e);
                tracing::warn!(error = %err, "Connect failed");
                self.state.send_replace(ConnectionState::Error(err.clone()));
                Err(err)
            }
        }
    }

    fn spawn_close_watcher(
        self: &Arc<Self>,
        handle: &Arc<dyn BackendConnection>,
        generation: u64,
    ) -> JoinHandle<()> {
        let manager: Weak<Self> = Arc::downgrade(self);
        let mut events = handle.events();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(raw) => {
                        if matches!(ChatEvent::parse(&raw), Ok(ChatEvent::ConnectionClosed)) {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }
            }
            if let Some(manager) = manager.upgrade() {
                manager.on_remote_close(generation).await;
            }
        })
    }

    async fn on_remote_close(&self, generation: u64) {
        let mut slot = self.slot.lock().await;
        if slot.generation != generation || slot.handle.is_none() {
            return;
        }
        // Running on the watcher task itself; detach rather than abort.
        slot.close_watcher.take();
        if let Some(handle) = slot.handle.take() {
            if let Err(e) = handle.disconnect().await {
                tracing::warn!(error = %e, "Backend disconnect after remote close failed");
            }
        }
        self.state.send_replace(ConnectionState::Idle);
        tracing::warn!("Connection closed by service");
    }

    /// Release the connection. Idempotent and safe from any state.
    ///
    /// Waits for an in-flight connect to finish, so a handle it opens is
    /// released too.
    pub async fn disconnect(&self) {
        let mut slot = self.slot.lock().await;
        self.release(&mut slot).await;
    }

    async fn release(&self, slot: &mut Slot) {
        if let Some(watcher) = slot.close_watcher.take() {
            watcher.abort();
        }
        match slot.handle.take() {
            Some(handle) => {
                self.state.send_replace(ConnectionState::Disconnecting);
                if let Err(e) = handle.disconnect().await {
                    tracing::warn!(error = %e, "Backend disconnect failed; handle dropped anyway");
                }
                self.state.send_replace(ConnectionState::Idle);
                tracing::info!(user_id = %handle.user_id(), "Disconnected");
            }
            None => {
                self.state.send_if_modified(|state| {
                    let changed = *state != ConnectionState::Idle;
                    *state = ConnectionState::Idle;
                    changed
                });
            }
        }
    }

    /// Leave the `Error` state. Other states are unaffected.
    pub fn reset(&self) {
        self.state.send_if_modified(|state| {
            if matches!(state, ConnectionState::Error(_)) {
                *state = ConnectionState::Idle;
                true
            } else {
                false
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use coachchat_core::BackendError;
    use coachchat_transport::MemoryMessagingBackend;
    use tokio_test::{assert_err, assert_ok};

    use super::*;

    fn manager(backend: &MemoryMessagingBackend) -> Arc<ConnectionManager> {
        ConnectionManager::new(Arc::new(backend.clone()))
    }

    async fn wait_for_state(manager: &ConnectionManager, expected: &ConnectionState) {
        let mut rx = manager.watch_state();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| s == expected))
            .await
            .expect("state not reached")
            .unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_connects_open_one_handle() {
        let backend = MemoryMessagingBackend::new();
        backend.set_connect_delay(Duration::from_millis(50));
        let manager = manager(&backend);
        let session = Session::new("tok", "alice");

        let attempts = (0..8).map(|_| {
            let manager = Arc::clone(&manager);
            let session = session.clone();
            tokio::spawn(async move { manager.connect(&session).await })
        });
        for result in futures::future::join_all(attempts).await {
            assert_ok!(result.unwrap());
        }

        assert_eq!(backend.connect_count(), 1);
        assert_eq!(backend.live_connections(), 1);
        assert_eq!(manager.state(), ConnectionState::Connected(UserId::new("alice")));
        assert_ok!(manager.connect(&session).await);
        assert_eq!(backend.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_overlapping_callers_share_failure() {
        let backend = MemoryMessagingBackend::new();
        backend.set_connect_delay(Duration::from_millis(50));
        backend.fail_next_connect(BackendError::Unavailable("down".to_owned()));
        let manager = manager(&backend);
        let session = Session::new("tok", "alice");

        let (a, b) = tokio::join!(manager.connect(&session), manager.connect(&session));
        assert!(matches!(a, Err(ConnectionError::Transient(_))));
        assert_eq!(a, b);
        assert_eq!(backend.connect_count(), 1);
        assert!(matches!(manager.state(), ConnectionState::Error(_)));

        assert_ok!(manager.connect(&session).await);
        assert!(manager.state().is_connected());
    }

    #[tokio::test]
    async fn test_reset_and_fatal_errors() {
        let backend = MemoryMessagingBackend::new();
        let manager = manager(&backend);

        let err = assert_err!(manager.connect(&Session::new("", "alice")).await);
        assert!(matches!(err, ConnectionError::Fatal(_)));

        manager.reset();
        assert_eq!(manager.state(), ConnectionState::Idle);
        manager.reset();
        assert_eq!(manager.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_switching_user_replaces_connection() {
        let backend = MemoryMessagingBackend::new();
        let manager = manager(&backend);

        assert_ok!(manager.connect(&Session::new("tok", "alice")).await);
        assert_ok!(manager.connect(&Session::new("tok", "bob")).await);

        assert_eq!(backend.connect_count(), 2);
        assert_eq!(backend.live_connections(), 1);
        let handle = manager.handle().await.unwrap();
        assert_eq!(handle.user_id(), &UserId::new("bob"));
        assert_eq!(manager.state().owner(), Some(&UserId::new("bob")));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let backend = MemoryMessagingBackend::new();
        let manager = manager(&backend);

        manager.disconnect().await;
        assert_eq!(manager.state(), ConnectionState::Idle);

        assert_ok!(manager.connect(&Session::new("tok", "alice")).await);
        manager.disconnect().await;
        manager.disconnect().await;

        assert_eq!(manager.state(), ConnectionState::Idle);
        assert!(manager.handle().await.is_none());
        assert_eq!(backend.live_connections(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_waits_for_pending_connect() {
        let backend = MemoryMessagingBackend::new();
        backend.set_connect_delay(Duration::from_millis(50));
        let manager = manager(&backend);

        let connecting = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.connect(&Session::new("tok", "alice")).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        manager.disconnect().await;

        assert_ok!(connecting.await.unwrap());
        assert_eq!(manager.state(), ConnectionState::Idle);
        assert_eq!(backend.live_connections(), 0);
    }

    #[tokio::test]
    async fn test_remote_close_returns_to_idle_without_retry() {
        let backend = MemoryMessagingBackend::new();
        let manager = manager(&backend);
        assert_ok!(manager.connect(&Session::new("tok", "alice")).await);

        backend.close_connections();
        wait_for_state(&manager, &ConnectionState::Idle).await;

        assert!(manager.handle().await.is_none());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(backend.connect_count(), 1);
        assert_eq!(manager.state(), ConnectionState::Idle);
    }
}
