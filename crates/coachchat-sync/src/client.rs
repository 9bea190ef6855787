//! Chat client facade: wires session, connection, channel list, message log
//! and relay together and routes backend events between them.

use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex, PoisonError, Weak},
};

use chrono::{DateTime, Utc};
use coachchat_core::{
    BackendConnection, BackendError, Channel, ChannelId, ChatEvent, ClientConfig, ConnectionError,
    EventHub, FetchError, InferenceClient, Message, MessagingBackend, NewChannel, PayloadError,
    RawEvent, SendError, Session, payload::parse_channel,
};
use tokio::{
    sync::{broadcast::error::RecvError, broadcast, watch},
    task::JoinHandle,
};

use crate::{
    channels::ChannelListStore,
    connection::ConnectionManager,
    log::{LoadOutcome, MessageLog},
    relay::AiRelayBridge,
    subscription::ChannelSubscription,
};

/// Client-level failure.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("No active session")]
    NoSession,
    #[error("Not connected")]
    NotConnected,
    #[error("Channel name is empty")]
    EmptyChannelName,
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("Invalid payload: {0}")]
    Payload(#[from] PayloadError),
}

/// Composer text owned by the caller.
///
/// [`ChatClient::send`] clears it only once the backend accepted the
/// message, so a send that never reached the backend leaves it ready to
/// retry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Draft {
    text: String,
}

impl Draft {
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn set(&mut self, text: impl Into<String>) {
        self.text = text.into();
    }

    pub fn clear(&mut self) {
        self.text.clear();
    }

    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// Channel id for a locally created channel: slug of the name plus a
/// millisecond timestamp.
#[must_use]
pub fn channel_id_for(name: &str, now: DateTime<Utc>) -> ChannelId {
    let mut slug = String::with_capacity(name.len());
    for c in name.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_alphanumeric() || c == '_' {
            slug.push(c);
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_end_matches('-');
    let slug = if slug.is_empty() { "channel" } else { slug };
    ChannelId::new(format!("{slug}-{}", now.timestamp_millis()))
}

#[derive(Default)]
struct Tasks {
    dispatcher: Option<JoinHandle<()>>,
    session_watch: Option<JoinHandle<()>>,
}

/// Synchronization engine for one user session.
pub struct ChatClient {
    config: ClientConfig,
    session: watch::Receiver<Option<Session>>,
    connection: Arc<ConnectionManager>,
    channels: Arc<ChannelListStore>,
    log: Arc<MessageLog>,
    hub: Arc<EventHub>,
    subscription: tokio::sync::Mutex<Option<ChannelSubscription>>,
    tasks: Mutex<Tasks>,
}

impl ChatClient {
    /// Build a client that follows `session`.
    #[must_use]
    pub fn new(
        config: ClientConfig,
        backend: Arc<dyn MessagingBackend>,
        inference: Arc<dyn InferenceClient>,
        session: watch::Receiver<Option<Session>>,
    ) -> Arc<Self> {
        let relay = AiRelayBridge::new(inference, session.clone(), config.clone());
        Arc::new(Self {
            config,
            session,
            connection: ConnectionManager::new(backend),
            channels: Arc::new(ChannelListStore::new()),
            log: Arc::new(MessageLog::new(Some(Arc::new(relay)))),
            hub: Arc::new(EventHub::new()),
            subscription: tokio::sync::Mutex::new(None),
            tasks: Mutex::new(Tasks::default()),
        })
    }

    #[must_use]
    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    #[must_use]
    pub fn channels(&self) -> &ChannelListStore {
        &self.channels
    }

    #[must_use]
    pub fn log(&self) -> &MessageLog {
        &self.log
    }

    #[must_use]
    pub fn hub(&self) -> &EventHub {
        &self.hub
    }

    #[must_use]
    pub const fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn current_session(&self) -> Result<Session, ClientError> {
        self.session.borrow().clone().ok_or(ClientError::NoSession)
    }

    async fn live_handle(&self) -> Result<Arc<dyn BackendConnection>, ClientError> {
        self.connection.handle().await.ok_or(ClientError::NotConnected)
    }

    /// Connect for the current session, start event dispatch, list the
    /// user's channels and select the first one if nothing is selected.
    ///
    /// Calling it again after a dropped connection reconnects and reloads
    /// the selected channel.
    ///
    /// # Errors
    /// Returns error if there is no session, the connection fails, or the
    /// channel listing fails.
    #[tracing::instrument(skip(self))]
    pub async fn start(self: &Arc<Self>) -> Result<(), ClientError> {
        let session = self.current_session()?;
        self.connection.connect(&session).await?;
        let handle = self.live_handle().await?;
        self.spawn_background(handle.as_ref());

        self.channels.query(handle.as_ref(), &session.user_id).await?;
        let mut target = self.channels.selected().await;
        if let Some(current) = &target {
            if self.channels.get(current).await.is_none() {
                target = None;
            }
        }
        if target.is_none() {
            target = self.channels.ids().await.into_iter().next();
        }
        if let Some(channel_id) = target {
            // Reloads history missed while disconnected.
            self.select(&channel_id).await?;
        }
        let count = self.channels.len().await;
        tracing::info!(user_id = %session.user_id, channels = count, "Client started");
        Ok(())
    }

    fn spawn_background(self: &Arc<Self>, handle: &dyn BackendConnection) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(old) = tasks.dispatcher.take() {
            old.abort();
        }
        tasks.dispatcher = Some(tokio::spawn(dispatch(
            handle.events(),
            Arc::clone(&self.channels),
            Arc::clone(&self.hub),
        )));

        if tasks.session_watch.is_none() {
            tasks.session_watch = Some(tokio::spawn(watch_session(
                self.session.clone(),
                Arc::downgrade(self),
            )));
        }
    }

    /// Make `channel_id` the active channel and load its history.
    ///
    /// The selection only moves once the channel is being watched, so a
    /// failure leaves the previous channel active. The previous channel's
    /// subscription is detached before the new one is attached. History that arrives after another selection is
    /// discarded and reported as [`LoadOutcome::Stale`].
    ///
    /// # Errors
    /// Returns error if the channel is unknown, the client is not
    /// connected, or the history fetch fails.
    #[tracing::instrument(skip(self))]
    pub async fn select(&self, channel_id: &ChannelId) -> Result<LoadOutcome, ClientError> {
        if self.channels.get(channel_id).await.is_none() {
            return Err(FetchError::UnknownChannel(channel_id.to_string()).into());
        }
        let handle = self.live_handle().await?;
        handle.watch_channel(channel_id).await?;
        let ticket = self.channels.select(channel_id).await?;

        {
            let mut subscription = self.subscription.lock().await;
            if !self.channels.is_current(&ticket).await {
                return Ok(LoadOutcome::Stale);
            }
            if let Some(old) = subscription.take() {
                old.detach().await;
            }
            *subscription = Some(ChannelSubscription::attach(
                &self.hub,
                channel_id.clone(),
                Arc::clone(&self.log),
            ));
        }

        let outcome = self
            .log
            .load(handle.as_ref(), &self.channels, &ticket, self.config.history_limit)
            .await?;
        Ok(outcome)
    }

    /// Clear the selection and detach its subscription.
    pub async fn deselect(&self) {
        self.channels.deselect().await;
        if let Some(old) = self.subscription.lock().await.take() {
            old.detach().await;
        }
    }

    /// Send the draft to the active channel.
    ///
    /// The draft is cleared once the backend has accepted the message,
    /// including when its reply fails validation
    /// ([`SendError::Payload`]). Every other error leaves it intact.
    ///
    /// # Errors
    /// Returns [`SendError`] for a blank draft, a missing selection or
    /// connection, or a backend failure.
    pub async fn send(&self, draft: &mut Draft) -> Result<Message, SendError> {
        if draft.is_blank() {
            return Err(SendError::Empty);
        }
        let channel_id = self
            .channels
            .selected()
            .await
            .ok_or(SendError::NoActiveChannel)?;
        let handle = self.connection.handle().await.ok_or(SendError::NotConnected)?;

        match self.log.send(handle.as_ref(), &channel_id, draft.text()).await {
            Ok(message) => {
                self.channels.on_activity(&channel_id, message.created_at).await;
                draft.clear();
                Ok(message)
            }
            // Delivered, but the stored copy was unreadable. Resending would duplicate it.
            Err(e @ SendError::Payload(_)) => {
                self.channels.on_activity(&channel_id, Utc::now()).await;
                draft.clear();
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Create a channel with the session user and the AI bot as members,
    /// put it at the head of the list and select it.
    ///
    /// # Errors
    /// Returns error for a blank name, without a session or connection, or
    /// if the backend rejects the channel.
    #[tracing::instrument(skip(self))]
    pub async fn create_channel(&self, name: &str) -> Result<Channel, ClientError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ClientError::EmptyChannelName);
        }
        let session = self.current_session()?;
        let handle = self.live_handle().await?;

        let new_channel = NewChannel {
            id: channel_id_for(name, Utc::now()),
            display_name: name.to_owned(),
            member_ids: BTreeSet::from([session.user_id.clone(), self.config.ai_bot_id.clone()]),
            created_by: session.user_id,
        };
        let payload = handle.create_channel(&new_channel).await?;
        let channel = parse_channel(&payload)?;
        handle.watch_channel(&channel.id).await?;

        self.channels.insert_new(channel.clone()).await;
        self.select(&channel.id).await?;
        tracing::info!(channel = %channel.id, "Channel created");
        Ok(channel)
    }

    /// Stop event dispatch, drop the selection and release the connection.
    pub async fn shutdown(&self) {
        let dispatcher = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .dispatcher
            .take();
        if let Some(dispatcher) = dispatcher {
            dispatcher.abort();
        }
        self.deselect().await;
        self.connection.disconnect().await;
        tracing::info!("Client shut down");
    }
}

impl Drop for ChatClient {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner);
        for task in [tasks.dispatcher.take(), tasks.session_watch.take()].into_iter().flatten() {
            task.abort();
        }
    }
}

/// Route validated backend events: activity reorders the channel list,
/// everything channel-scoped goes to the hub.
async fn dispatch(
    mut events: broadcast::Receiver<RawEvent>,
    channels: Arc<ChannelListStore>,
    hub: Arc<EventHub>,
) {
    loop {
        let raw = match events.recv().await {
            Ok(raw) => raw,
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Event dispatcher lagged");
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        match ChatEvent::parse(&raw) {
            Ok(ChatEvent::MessageNew(message)) => {
                channels
                    .on_activity(&message.channel_id, message.created_at)
                    .await;
                hub.publish(ChatEvent::MessageNew(message));
            }
            Ok(ChatEvent::ConnectionClosed) => {
                tracing::info!("Event stream closed by service");
                break;
            }
            Ok(ChatEvent::Ignored(kind)) => tracing::trace!(%kind, "Ignoring event"),
            Ok(event) => {
                hub.publish(event);
            }
            Err(e) => tracing::warn!(error = %e, "Dropping invalid event"),
        }
    }
}

/// Tear the client down once the session ends.
async fn watch_session(mut session: watch::Receiver<Option<Session>>, client: Weak<ChatClient>) {
    session.borrow_and_update();
    while session.changed().await.is_ok() {
        if session.borrow_and_update().is_some() {
            continue;
        }
        let Some(client) = client.upgrade() else {
            break;
        };
        tracing::info!("Session ended, tearing down client");
        client.shutdown().await;
    }
}
