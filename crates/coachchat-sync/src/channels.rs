//! Channel list ordered by activity, plus the active-channel pointer.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use coachchat_core::{
    BackendConnection, Channel, ChannelId, ChannelQuery, FetchError, UserId, payload::parse_channel,
};
use tokio::sync::{RwLock, RwLockReadGuard};

use crate::ordered::OrderedMap;

/// Proof of a `select` call, used to discard loads that finish after the
/// selection moved on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionTicket {
    channel_id: ChannelId,
    epoch: u64,
}

impl SelectionTicket {
    /// Channel that was selected.
    #[must_use]
    pub const fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }
}

#[derive(Default)]
struct Inner {
    order: OrderedMap<ChannelId, Channel>,
    selected: Option<ChannelId>,
    epoch: u64,
}

impl Inner {
    fn is_current(&self, ticket: &SelectionTicket) -> bool {
        self.epoch == ticket.epoch && self.selected.as_ref() == Some(&ticket.channel_id)
    }
}

/// Holds the selection still while a ticketed result is applied.
pub struct SelectionGuard<'a> {
    _inner: RwLockReadGuard<'a, Inner>,
}

/// Ordered channel collection.
///
/// Order is most recently active first. Activity moves a channel to the head
/// whether or not it is the selected one.
#[derive(Default)]
pub struct ChannelListStore {
    inner: RwLock<Inner>,
}

impl ChannelListStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the user's channels and replace the store's contents.
    ///
    /// Channels are sorted by last activity, newest first; entries that fail
    /// validation are skipped.
    ///
    /// # Errors
    /// Returns [`FetchError`] if the backend call fails. Prior contents are
    /// kept in that case.
    #[tracing::instrument(skip(self, connection))]
    pub async fn query(
        &self,
        connection: &dyn BackendConnection,
        user_id: &UserId,
    ) -> Result<Vec<Channel>, FetchError> {
        let raw = connection
            .query_channels(&ChannelQuery::for_member(user_id.clone()))
            .await
            .inspect_err(|e| tracing::warn!(error = %e, "Channel query failed"))?;

        let mut seen = HashSet::new();
        let mut channels: Vec<Channel> = raw
            .iter()
            .filter_map(|value| {
                parse_channel(value)
                    .inspect_err(|e| tracing::warn!(error = %e, "Skipping invalid channel payload"))
                    .ok()
            })
            .filter(|channel| seen.insert(channel.id.clone()))
            .collect();
        channels.sort_by(|a, b| b.last_activity_at.cmp(&a.last_activity_at));

        let mut inner = self.inner.write().await;
        inner.order.clear();
        for channel in &channels {
            inner.order.push_back(channel.id.clone(), channel.clone());
        }
        tracing::debug!(count = channels.len(), "Channel list replaced");
        Ok(channels)
    }

    /// Insert a locally created channel at the head. A second insert with
    /// the same id replaces the entry instead of duplicating it.
    pub async fn insert_new(&self, channel: Channel) {
        self.inner
            .write()
            .await
            .order
            .push_front(channel.id.clone(), channel);
    }

    /// Record activity: move the channel to the head, leaving the relative
    /// order of the others unchanged. Unknown ids are ignored.
    ///
    /// Returns whether the channel was known.
    pub async fn on_activity(&self, channel_id: &ChannelId, at: DateTime<Utc>) -> bool {
        let mut inner = self.inner.write().await;
        let Some(channel) = inner.order.get_mut(channel_id) else {
            tracing::trace!(channel = %channel_id, "Activity for unknown channel");
            return false;
        };
        if at > channel.last_activity_at {
            channel.last_activity_at = at;
        }
        inner.order.move_to_front(channel_id)
    }

    /// Point the active-channel pointer at `channel_id`.
    ///
    /// # Errors
    /// Returns [`FetchError::UnknownChannel`] if the channel is not listed.
    pub async fn select(&self, channel_id: &ChannelId) -> Result<SelectionTicket, FetchError> {
        let mut inner = self.inner.write().await;
        if !inner.order.contains(channel_id) {
            return Err(FetchError::UnknownChannel(channel_id.to_string()));
        }
        inner.epoch += 1;
        inner.selected = Some(channel_id.clone());
        Ok(SelectionTicket {
            channel_id: channel_id.clone(),
            epoch: inner.epoch,
        })
    }

    /// Clear the active-channel pointer. Outstanding tickets go stale.
    pub async fn deselect(&self) {
        let mut inner = self.inner.write().await;
        inner.epoch += 1;
        inner.selected = None;
    }

    /// Whether `ticket` is still the latest selection.
    pub async fn is_current(&self, ticket: &SelectionTicket) -> bool {
        self.inner.read().await.is_current(ticket)
    }

    /// Hold the selection fixed if `ticket` is current.
    ///
    /// While the guard lives, `select` and `deselect` wait.
    pub async fn hold_if_current(&self, ticket: &SelectionTicket) -> Option<SelectionGuard<'_>> {
        let inner = self.inner.read().await;
        inner
            .is_current(ticket)
            .then_some(SelectionGuard { _inner: inner })
    }

    pub async fn selected(&self) -> Option<ChannelId> {
        self.inner.read().await.selected.clone()
    }

    pub async fn get(&self, channel_id: &ChannelId) -> Option<Channel> {
        self.inner.read().await.order.get(channel_id).cloned()
    }

    /// Channels in display order.
    pub async fn snapshot(&self) -> Vec<Channel> {
        self.inner.read().await.order.values().cloned().collect()
    }

    /// Channel ids in display order.
    pub async fn ids(&self) -> Vec<ChannelId> {
        self.inner
            .read()
            .await
            .order
            .values()
            .map(|c| c.id.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.order.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.order.is_empty()
    }
}
