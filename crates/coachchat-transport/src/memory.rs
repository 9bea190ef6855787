//! In-process messaging backend.
//!
//! Behaves like the hosted service as far as the sync engine can tell:
//! channel membership queries, per-connection push events for watched
//! channels, and an echo of every posted message to all watchers. Used by
//! the demo binary and by tests, which drive it through the hooks below to
//! simulate other participants, the AI responder and connection trouble.

use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::{
        Arc, Mutex, PoisonError, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use coachchat_core::{
    AiState, BackendConnection, BackendError, ChannelId, ChannelQuery, MESSAGING_CHANNEL_TYPE,
    MessagingBackend, NewChannel, RawEvent, UserId, event::kind,
};
use serde_json::{Value, json};
use tokio::sync::{broadcast, oneshot};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 256;

struct StoredChannel {
    name: String,
    members: Vec<UserId>,
    created_at: DateTime<Utc>,
    last_message_at: Option<DateTime<Utc>>,
    messages: Vec<Value>,
}

impl StoredChannel {
    fn payload(&self, id: &ChannelId) -> Value {
        let mut payload = json!({
            "id": id.as_str(),
            "cid": id.to_cid(MESSAGING_CHANNEL_TYPE),
            "type": MESSAGING_CHANNEL_TYPE,
            "name": self.name,
            "members": self.members.iter().map(|m| json!({ "user_id": m.as_str() })).collect::<Vec<_>>(),
            "created_at": self.created_at.to_rfc3339(),
        });
        if let Some(at) = self.last_message_at {
            payload["last_message_at"] = json!(at.to_rfc3339());
        }
        payload
    }
}

#[derive(Default)]
struct Inner {
    channels: BTreeMap<ChannelId, StoredChannel>,
    connections: Vec<Weak<MemoryConnection>>,
    connect_failures: VecDeque<BackendError>,
    send_failures: VecDeque<BackendError>,
    garbled_replies: usize,
    connect_delay: Option<Duration>,
    connect_count: usize,
    history_gates: HashMap<ChannelId, oneshot::Receiver<()>>,
    last_timestamp: Option<DateTime<Utc>>,
}

impl Inner {
    /// Strictly increasing wall-clock timestamps.
    fn tick(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let next = match self.last_timestamp {
            Some(last) if now <= last => last + TimeDelta::milliseconds(1),
            _ => now,
        };
        self.last_timestamp = Some(next);
        next
    }

    fn append(&mut self, channel_id: &ChannelId, author: &UserId, text: &str) -> Result<Value, BackendError> {
        let created_at = self.tick();
        let channel = self
            .channels
            .get_mut(channel_id)
            .ok_or_else(|| BackendError::NotFound(channel_id.to_string()))?;
        let message = json!({
            "id": Uuid::new_v4().to_string(),
            "cid": channel_id.to_cid(MESSAGING_CHANNEL_TYPE),
            "text": text,
            "type": "regular",
            "user": { "id": author.as_str() },
            "created_at": created_at.to_rfc3339(),
        });
        channel.messages.push(message.clone());
        channel.last_message_at = Some(created_at);
        Ok(message)
    }

    fn watchers(&mut self, channel_id: &ChannelId) -> Vec<broadcast::Sender<RawEvent>> {
        self.connections.retain(|weak| weak.strong_count() > 0);
        self.connections
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|conn| !conn.is_closed() && conn.is_watching(channel_id))
            .map(|conn| conn.events.clone())
            .collect()
    }
}

fn envelope(event_type: &str, channel_id: &ChannelId) -> Value {
    json!({
        "type": event_type,
        "cid": channel_id.to_cid(MESSAGING_CHANNEL_TYPE),
        "channel_id": channel_id.as_str(),
        "channel_type": MESSAGING_CHANNEL_TYPE,
    })
}

/// In-process messaging service shared by every connection it hands out.
#[derive(Clone, Default)]
pub struct MemoryMessagingBackend {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryMessagingBackend {
    /// Create an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn deliver(&self, channel_id: &ChannelId, event: &RawEvent) {
        let watchers = self.lock().watchers(channel_id);
        for sender in watchers {
            // A connection without live receivers simply misses the event.
            let _ = sender.send(event.clone());
        }
    }

    /// Create or replace a channel.
    pub fn insert_channel(
        &self,
        id: &str,
        name: &str,
        members: &[&str],
        last_message_at: Option<DateTime<Utc>>,
    ) {
        let mut inner = self.lock();
        let created_at = inner.tick();
        inner.channels.insert(
            ChannelId::new(id),
            StoredChannel {
                name: name.to_owned(),
                members: members.iter().copied().map(UserId::new).collect(),
                created_at: last_message_at.map_or(created_at, |at| at.min(created_at)),
                last_message_at,
                messages: Vec::new(),
            },
        );
    }

    /// Post a message as `author` and push `message.new` to watchers.
    ///
    /// Returns the stored payload, or `None` if the channel does not exist.
    pub fn post_message(&self, channel: &str, author: &str, text: &str) -> Option<Value> {
        let channel_id = ChannelId::new(channel);
        let message = self
            .lock()
            .append(&channel_id, &UserId::new(author), text)
            .ok()?;

        let mut event = envelope(kind::MESSAGE_NEW, &channel_id);
        event["message"] = message.clone();
        self.deliver(&channel_id, &event);
        Some(message)
    }

    /// Replace a message's text and push `message.updated` to watchers.
    ///
    /// Returns `false` if the channel or message does not exist.
    pub fn update_message(&self, channel: &str, message_id: &str, text: &str) -> bool {
        let channel_id = ChannelId::new(channel);
        let updated = {
            let mut inner = self.lock();
            let updated_at = inner.tick();
            let Some(stored) = inner.channels.get_mut(&channel_id) else {
                return false;
            };
            let Some(message) = stored.messages.iter_mut().find(|m| m["id"] == message_id) else {
                return false;
            };
            message["text"] = json!(text);
            message["updated_at"] = json!(updated_at.to_rfc3339());
            message.clone()
        };

        let mut event = envelope(kind::MESSAGE_UPDATED, &channel_id);
        event["message"] = updated;
        self.deliver(&channel_id, &event);
        true
    }

    /// Push an AI indicator update, or a clear when `state` is `None`.
    pub fn emit_ai_indicator(&self, channel: &str, message_id: &str, state: Option<AiState>) {
        let channel_id = ChannelId::new(channel);
        let mut event = match state {
            Some(state) => {
                let mut event = envelope(kind::AI_INDICATOR_UPDATE, &channel_id);
                event["ai_state"] = json!(state.as_wire());
                event
            }
            None => envelope(kind::AI_INDICATOR_CLEAR, &channel_id),
        };
        event["message_id"] = json!(message_id);
        self.deliver(&channel_id, &event);
    }

    /// Deliver an arbitrary event to the watchers of a channel.
    pub fn inject_raw(&self, channel: &str, event: RawEvent) {
        self.deliver(&ChannelId::new(channel), &event);
    }

    /// Close every open connection from the service side.
    pub fn close_connections(&self) {
        let live: Vec<_> = {
            let mut inner = self.lock();
            inner.connections.retain(|weak| weak.strong_count() > 0);
            inner.connections.iter().filter_map(Weak::upgrade).collect()
        };
        for conn in live {
            if !conn.closed.swap(true, Ordering::SeqCst) {
                let _ = conn.events.send(json!({ "type": kind::CONNECTION_CLOSED }));
            }
        }
    }

    /// Make the next `connect` fail with `err`.
    pub fn fail_next_connect(&self, err: BackendError) {
        self.lock().connect_failures.push_back(err);
    }

    /// Make the next `send_message` fail with `err`.
    pub fn fail_next_send(&self, err: BackendError) {
        self.lock().send_failures.push_back(err);
    }

    /// Store and deliver the next `send_message`, but answer it with a
    /// payload that fails validation.
    pub fn garble_next_send_reply(&self) {
        self.lock().garbled_replies += 1;
    }

    /// Delay every `connect` by `delay`.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.lock().connect_delay = Some(delay);
    }

    /// Number of `connect` calls that reached the service.
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.lock().connect_count
    }

    /// Number of connections not yet closed or dropped.
    #[must_use]
    pub fn live_connections(&self) -> usize {
        let mut inner = self.lock();
        inner.connections.retain(|weak| weak.strong_count() > 0);
        inner
            .connections
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|conn| !conn.is_closed())
            .count()
    }

    /// Hold the next history query for `channel` until the returned sender
    /// fires or is dropped.
    #[must_use]
    pub fn hold_history(&self, channel: &str) -> oneshot::Sender<()> {
        let (release, gate) = oneshot::channel();
        self.lock().history_gates.insert(ChannelId::new(channel), gate);
        release
    }

    /// Stored messages of a channel, oldest first.
    #[must_use]
    pub fn messages(&self, channel: &str) -> Vec<Value> {
        self.lock()
            .channels
            .get(&ChannelId::new(channel))
            .map(|c| c.messages.clone())
            .unwrap_or_default()
    }

    /// Channel payload as the service would return it.
    #[must_use]
    pub fn channel(&self, channel: &str) -> Option<Value> {
        let id = ChannelId::new(channel);
        self.lock().channels.get(&id).map(|c| c.payload(&id))
    }
}

#[async_trait]
impl MessagingBackend for MemoryMessagingBackend {
    async fn connect(
        &self,
        user_id: &UserId,
        token: &str,
    ) -> Result<Arc<dyn BackendConnection>, BackendError> {
        let delay = {
            let mut inner = self.lock();
            inner.connect_count += 1;
            inner.connect_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(err) = self.lock().connect_failures.pop_front() {
            tracing::debug!(user_id = %user_id, error = %err, "Injected connect failure");
            return Err(err);
        }
        if token.is_empty() {
            return Err(BackendError::Unauthorized("empty token".to_owned()));
        }

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let conn = Arc::new(MemoryConnection {
            user_id: user_id.clone(),
            backend: self.clone(),
            events,
            watched: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
        });
        self.lock().connections.push(Arc::downgrade(&conn));
        tracing::debug!(user_id = %user_id, "Memory connection opened");
        Ok(conn)
    }
}

/// Connection handed out by [`MemoryMessagingBackend`].
pub struct MemoryConnection {
    user_id: UserId,
    backend: MemoryMessagingBackend,
    events: broadcast::Sender<RawEvent>,
    watched: Mutex<HashSet<ChannelId>>,
    closed: AtomicBool,
}

impl MemoryConnection {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn is_watching(&self, channel_id: &ChannelId) -> bool {
        self.watched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(channel_id)
    }

    fn watch(&self, ids: impl IntoIterator<Item = ChannelId>) {
        self.watched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(ids);
    }

    fn ensure_open(&self) -> Result<(), BackendError> {
        if self.is_closed() {
            Err(BackendError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BackendConnection for MemoryConnection {
    fn user_id(&self) -> &UserId {
        &self.user_id
    }

    async fn query_channels(&self, query: &ChannelQuery) -> Result<Vec<Value>, BackendError> {
        self.ensure_open()?;
        if query.channel_type != MESSAGING_CHANNEL_TYPE {
            return Ok(Vec::new());
        }

        let mut matching: Vec<(ChannelId, Option<DateTime<Utc>>, Value)> = {
            let inner = self.backend.lock();
            inner
                .channels
                .iter()
                .filter(|(_, c)| c.members.contains(&query.member))
                .map(|(id, c)| (id.clone(), c.last_message_at.or(Some(c.created_at)), c.payload(id)))
                .collect()
        };
        matching.sort_by(|a, b| b.1.cmp(&a.1));
        if let Some(limit) = query.limit {
            matching.truncate(limit);
        }

        if query.watch {
            self.watch(matching.iter().map(|(id, _, _)| id.clone()));
        }
        Ok(matching.into_iter().map(|(_, _, payload)| payload).collect())
    }

    async fn create_channel(&self, channel: &NewChannel) -> Result<Value, BackendError> {
        self.ensure_open()?;
        let mut inner = self.backend.lock();
        if let Some(existing) = inner.channels.get(&channel.id) {
            return Ok(existing.payload(&channel.id));
        }
        let created_at = inner.tick();
        let stored = StoredChannel {
            name: channel.display_name.clone(),
            members: channel.member_ids.iter().cloned().collect(),
            created_at,
            last_message_at: None,
            messages: Vec::new(),
        };
        let payload = stored.payload(&channel.id);
        inner.channels.insert(channel.id.clone(), stored);
        Ok(payload)
    }

    async fn watch_channel(&self, channel_id: &ChannelId) -> Result<(), BackendError> {
        self.ensure_open()?;
        if !self.backend.lock().channels.contains_key(channel_id) {
            return Err(BackendError::NotFound(channel_id.to_string()));
        }
        self.watch([channel_id.clone()]);
        Ok(())
    }

    async fn query_messages(
        &self,
        channel_id: &ChannelId,
        limit: usize,
    ) -> Result<Vec<Value>, BackendError> {
        self.ensure_open()?;
        let gate = self.backend.lock().history_gates.remove(channel_id);
        if let Some(gate) = gate {
            let _ = gate.await;
        }

        let inner = self.backend.lock();
        let channel = inner
            .channels
            .get(channel_id)
            .ok_or_else(|| BackendError::NotFound(channel_id.to_string()))?;
        let skip = channel.messages.len().saturating_sub(limit);
        Ok(channel.messages[skip..].to_vec())
    }

    async fn send_message(&self, channel_id: &ChannelId, text: &str) -> Result<Value, BackendError> {
        self.ensure_open()?;
        let (message, garbled) = {
            let mut inner = self.backend.lock();
            if let Some(err) = inner.send_failures.pop_front() {
                return Err(err);
            }
            let is_member = inner
                .channels
                .get(channel_id)
                .ok_or_else(|| BackendError::NotFound(channel_id.to_string()))?
                .members
                .contains(&self.user_id);
            if !is_member {
                return Err(BackendError::Unauthorized(format!(
                    "{} is not a member of {channel_id}",
                    self.user_id
                )));
            }
            let message = inner.append(channel_id, &self.user_id, text)?;
            let garbled = inner.garbled_replies > 0;
            if garbled {
                inner.garbled_replies -= 1;
            }
            (message, garbled)
        };

        let mut event = envelope(kind::MESSAGE_NEW, channel_id);
        event["message"] = message.clone();
        self.backend.deliver(channel_id, &event);
        if garbled {
            return Ok(json!({ "text": text }));
        }
        Ok(message)
    }

    fn events(&self) -> broadcast::Receiver<RawEvent> {
        self.events.subscribe()
    }

    async fn disconnect(&self) -> Result<(), BackendError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.watched
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
            tracing::debug!(user_id = %self.user_id, "Memory connection closed");
        }
        Ok(())
    }
}
