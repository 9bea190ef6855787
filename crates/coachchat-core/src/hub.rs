//! Per-channel fan-out of validated events.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use futures::{StreamExt, stream::BoxStream};
use tokio::sync::broadcast;
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};

use crate::{event::ChatEvent, types::ChannelId};

/// Broadcast buffer size. Slow listeners skip what they missed.
const CAPACITY: usize = 1024;

type Registry = Arc<Mutex<HashMap<ChannelId, usize>>>;

/// Event hub with per-channel listeners.
///
/// Every listener is registered under its channel for as long as the
/// [`ChannelListener`] lives; dropping it unregisters, so repeated channel
/// switches never accumulate stale registrations.
pub struct EventHub {
    sender: broadcast::Sender<ChatEvent>,
    registry: Registry,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CAPACITY);
        Self {
            sender,
            registry: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Publish an event to the listeners of its channel.
    ///
    /// Returns the number of live receivers across all channels.
    pub fn publish(&self, event: ChatEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    /// Listen to events for one channel.
    #[must_use]
    pub fn subscribe(&self, channel_id: ChannelId) -> ChannelListener {
        *self
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(channel_id.clone())
            .or_insert(0) += 1;

        let filter_id = channel_id.clone();
        let stream = BroadcastStream::new(self.sender.subscribe())
            .filter_map(move |res| {
                let keep = match res {
                    Ok(event) if event.channel_id() == Some(&filter_id) => Some(event),
                    Ok(_) => None,
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        tracing::warn!(channel = %filter_id, skipped, "Channel listener lagged");
                        None
                    }
                };
                futures::future::ready(keep)
            })
            .boxed();

        ChannelListener {
            channel_id,
            stream,
            registry: Arc::clone(&self.registry),
        }
    }

    /// Number of live listeners for a channel.
    #[must_use]
    pub fn listener_count(&self, channel_id: &ChannelId) -> usize {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel_id)
            .copied()
            .unwrap_or(0)
    }
}

/// Registered listener for one channel. Unregisters on drop.
pub struct ChannelListener {
    channel_id: ChannelId,
    stream: BoxStream<'static, ChatEvent>,
    registry: Registry,
}

impl ChannelListener {
    /// Channel this listener is bound to.
    #[must_use]
    pub const fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    /// Next event for the channel; `None` once the hub is gone.
    pub async fn next(&mut self) -> Option<ChatEvent> {
        self.stream.next().await
    }
}

impl Drop for ChannelListener {
    fn drop(&mut self) {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = registry.get_mut(&self.channel_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                registry.remove(&self.channel_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::types::{Message, MessageId, UserId};

    fn new_message(channel: &str, id: &str) -> ChatEvent {
        ChatEvent::MessageNew(Message {
            id: MessageId::new(id),
            channel_id: ChannelId::new(channel),
            author_id: UserId::new("alice"),
            text: "hi".to_owned(),
            created_at: Utc::now(),
            updated_at: None,
        })
    }

    #[tokio::test]
    async fn test_listener_only_sees_its_channel() {
        let hub = EventHub::new();
        let mut listener = hub.subscribe(ChannelId::new("c1"));

        hub.publish(new_message("c2", "m1"));
        hub.publish(new_message("c1", "m2"));

        let event = listener.next().await.unwrap();
        let ChatEvent::MessageNew(msg) = event else {
            panic!("Wrong event type");
        };
        assert_eq!(msg.id.as_str(), "m2");
    }

    #[test]
    fn test_registration_follows_listener_lifetime() {
        let hub = EventHub::new();
        let c1 = ChannelId::new("c1");

        for _ in 0..5 {
            let listener = hub.subscribe(c1.clone());
            assert_eq!(hub.listener_count(&c1), 1);
            drop(listener);
        }
        assert_eq!(hub.listener_count(&c1), 0);

        let a = hub.subscribe(c1.clone());
        let b = hub.subscribe(c1.clone());
        assert_eq!(hub.listener_count(&c1), 2);
        drop(a);
        assert_eq!(hub.listener_count(&c1), 1);
        drop(b);
    }

    #[test]
    fn test_publish_without_listeners() {
        let hub = EventHub::new();
        assert_eq!(hub.publish(new_message("c1", "m1")), 0);
    }
}
