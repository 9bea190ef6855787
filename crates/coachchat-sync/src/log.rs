//! Per-channel message log with id-based reconciliation.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use coachchat_core::{
    AiState, BackendConnection, ChannelId, FetchError, Message, MessageId, SendError,
    payload::parse_message,
};
use tokio::sync::RwLock;

use crate::{
    channels::{ChannelListStore, SelectionTicket},
    relay::AiRelayBridge,
};

/// Result of a ticketed history load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// History replaced the log; carries the resulting log length.
    Applied(usize),
    /// The selection moved on before the fetch finished.
    Stale,
}

#[derive(Default)]
struct ChannelLog {
    messages: Vec<Message>,
    index: HashMap<MessageId, usize>,
    ai_states: HashMap<MessageId, AiState>,
}

impl ChannelLog {
    fn push(&mut self, message: Message) -> bool {
        if self.index.contains_key(&message.id) {
            return false;
        }
        self.index.insert(message.id.clone(), self.messages.len());
        self.messages.push(message);
        true
    }

    fn replace_with_history(&mut self, history: Vec<Message>) {
        let newest = history.last().map(|m| m.created_at);
        let ids: HashSet<&MessageId> = history.iter().map(|m| &m.id).collect();
        // Live appends that landed while the history request was in flight.
        let live_tail: Vec<Message> = self
            .messages
            .iter()
            .filter(|m| !ids.contains(&m.id) && newest.is_none_or(|at| m.created_at >= at))
            .cloned()
            .collect();

        self.messages.clear();
        self.index.clear();
        for message in history.into_iter().chain(live_tail) {
            self.push(message);
        }
    }
}

/// Ordered, deduplicated message sequences keyed by channel.
///
/// Messages are unique by id within a channel. Updates replace content in
/// place; nothing is ever removed except by a history reload.
pub struct MessageLog {
    channels: RwLock<HashMap<ChannelId, ChannelLog>>,
    relay: Option<Arc<AiRelayBridge>>,
}

impl Default for MessageLog {
    fn default() -> Self {
        Self::new(None)
    }
}

impl MessageLog {
    /// Create a log; live human appends are handed to `relay` when set.
    #[must_use]
    pub fn new(relay: Option<Arc<AiRelayBridge>>) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            relay,
        }
    }

    /// Load the most recent `limit` messages of the ticket's channel,
    /// oldest first, and replace that channel's log with them.
    ///
    /// The result is applied only while `ticket` is still the current
    /// selection. History never reaches the AI relay.
    ///
    /// # Errors
    /// Returns [`FetchError`] if the backend call fails; the prior log is
    /// left intact.
    #[tracing::instrument(skip(self, connection, channels, ticket), fields(channel = %ticket.channel_id()))]
    pub async fn load(
        &self,
        connection: &dyn BackendConnection,
        channels: &ChannelListStore,
        ticket: &SelectionTicket,
        limit: usize,
    ) -> Result<LoadOutcome, FetchError> {
        let channel_id = ticket.channel_id();
        let raw = connection
            .query_messages(channel_id, limit)
            .await
            .inspect_err(|e| tracing::warn!(error = %e, "History fetch failed"))?;

        let mut history: Vec<Message> = raw
            .iter()
            .filter_map(|value| {
                parse_message(value, Some(channel_id))
                    .inspect_err(|e| tracing::warn!(error = %e, "Skipping invalid message payload"))
                    .ok()
            })
            .collect();
        history.sort_by_key(|m| m.created_at);
        let skip = history.len().saturating_sub(limit);
        history.drain(..skip);

        let Some(_selection) = channels.hold_if_current(ticket).await else {
            tracing::debug!("Discarding stale history");
            return Ok(LoadOutcome::Stale);
        };
        let mut logs = self.channels.write().await;
        let log = logs.entry(channel_id.clone()).or_default();
        log.replace_with_history(history);
        tracing::debug!(count = log.messages.len(), "History loaded");
        Ok(LoadOutcome::Applied(log.messages.len()))
    }

    /// Append a pushed or echoed message unless its id is already present.
    ///
    /// A successful append of a message authored by the session user is
    /// relayed to the AI backend. Returns whether the message was appended.
    pub async fn on_new_message(&self, message: Message) -> bool {
        let appended = {
            let mut logs = self.channels.write().await;
            logs.entry(message.channel_id.clone())
                .or_default()
                .push(message.clone())
        };
        if appended {
            if let Some(relay) = &self.relay {
                relay.on_live_append(&message);
            }
        } else {
            tracing::trace!(message_id = %message.id, "Duplicate message ignored");
        }
        appended
    }

    /// Replace a message in place, keeping its position. Unknown ids are a
    /// no-op. Returns whether a message was replaced.
    pub async fn on_message_updated(&self, message: Message) -> bool {
        let mut logs = self.channels.write().await;
        let Some(log) = logs.get_mut(&message.channel_id) else {
            return false;
        };
        let Some(&position) = log.index.get(&message.id) else {
            tracing::trace!(message_id = %message.id, "Update for unknown message ignored");
            return false;
        };
        log.messages[position] = message;
        true
    }

    /// Record AI responder progress for a message, or clear it on `None`.
    pub async fn on_ai_indicator(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
        state: Option<AiState>,
    ) {
        let mut logs = self.channels.write().await;
        let log = logs.entry(channel_id.clone()).or_default();
        match state {
            Some(state) => {
                log.ai_states.insert(message_id.clone(), state);
            }
            None => {
                log.ai_states.remove(message_id);
            }
        }
    }

    /// Submit `text` to a channel and append the stored message.
    ///
    /// The returned message goes through the same dedup path as push
    /// events, so a server echo arriving first or later is harmless.
    ///
    /// # Errors
    /// Returns [`SendError::Empty`] for blank text without contacting the
    /// backend, or the backend failure otherwise.
    #[tracing::instrument(skip(self, connection, text))]
    pub async fn send(
        &self,
        connection: &dyn BackendConnection,
        channel_id: &ChannelId,
        text: &str,
    ) -> Result<Message, SendError> {
        if text.trim().is_empty() {
            return Err(SendError::Empty);
        }
        let stored = connection
            .send_message(channel_id, text)
            .await
            .inspect_err(|e| tracing::warn!(error = %e, "Send failed"))?;
        let message = parse_message(&stored, Some(channel_id))?;
        self.on_new_message(message.clone()).await;
        Ok(message)
    }

    /// Messages of a channel, oldest first.
    pub async fn messages(&self, channel_id: &ChannelId) -> Vec<Message> {
        self.channels
            .read()
            .await
            .get(channel_id)
            .map(|log| log.messages.clone())
            .unwrap_or_default()
    }

    pub async fn ai_state(&self, channel_id: &ChannelId, message_id: &MessageId) -> Option<AiState> {
        self.channels
            .read()
            .await
            .get(channel_id)
            .and_then(|log| log.ai_states.get(message_id).copied())
    }
}
