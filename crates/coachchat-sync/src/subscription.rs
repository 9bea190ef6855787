//! Event subscription bound to the selected channel.

use std::sync::Arc;

use coachchat_core::{ChannelId, ChannelListener, ChatEvent, EventHub};
use tokio::task::JoinHandle;

use crate::log::MessageLog;

/// Feeds one channel's events from the hub into the message log.
///
/// Owned by whoever holds the selection. [`detach`](Self::detach) waits
/// until the listener is unregistered; dropping without detaching aborts
/// the pump in the background.
pub struct ChannelSubscription {
    channel_id: ChannelId,
    pump: JoinHandle<()>,
}

impl ChannelSubscription {
    /// Register on the hub and start applying events to `log`.
    #[must_use]
    pub fn attach(hub: &EventHub, channel_id: ChannelId, log: Arc<MessageLog>) -> Self {
        let listener = hub.subscribe(channel_id.clone());
        tracing::debug!(channel = %channel_id, "Channel subscription attached");
        Self {
            channel_id,
            pump: tokio::spawn(pump(listener, log)),
        }
    }

    #[must_use]
    pub const fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    /// Stop the pump and wait until its listener is gone.
    pub async fn detach(mut self) {
        self.pump.abort();
        let _ = (&mut self.pump).await;
        tracing::debug!(channel = %self.channel_id, "Channel subscription detached");
    }
}

impl Drop for ChannelSubscription {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

async fn pump(mut listener: ChannelListener, log: Arc<MessageLog>) {
    while let Some(event) = listener.next().await {
        match event {
            ChatEvent::MessageNew(message) => {
                log.on_new_message(message).await;
            }
            ChatEvent::MessageUpdated(message) => {
                log.on_message_updated(message).await;
            }
            ChatEvent::AiIndicator {
                channel_id,
                message_id,
                state,
            } => log.on_ai_indicator(&channel_id, &message_id, state).await,
            ChatEvent::ConnectionClosed | ChatEvent::Ignored(_) => {}
        }
    }
}
