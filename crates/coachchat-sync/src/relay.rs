//! Relay of human-authored messages to the AI inference backend.

use std::sync::Arc;

use coachchat_core::{ClientConfig, InferenceClient, Message, Session};
use tokio::{sync::watch, task::JoinHandle};
use tracing::Instrument;

/// Forwards qualifying live appends to the inference backend.
///
/// Only messages authored by the session user qualify; bot and system
/// authors never do, which keeps AI replies from feeding back into the
/// relay. Delivery is fire-and-forget on a spawned task.
pub struct AiRelayBridge {
    client: Arc<dyn InferenceClient>,
    session: watch::Receiver<Option<Session>>,
    config: ClientConfig,
}

impl AiRelayBridge {
    #[must_use]
    pub fn new(
        client: Arc<dyn InferenceClient>,
        session: watch::Receiver<Option<Session>>,
        config: ClientConfig,
    ) -> Self {
        Self {
            client,
            session,
            config,
        }
    }

    /// Whether `message` would be relayed under the current session.
    #[must_use]
    pub fn qualifies(&self, message: &Message) -> bool {
        self.session.borrow().as_ref().is_some_and(|session| {
            message.author_id == session.user_id && !self.config.is_bot(&message.author_id)
        })
    }

    /// Relay a freshly appended message if it qualifies.
    ///
    /// Returns the relay task, or `None` when nothing was sent. Failures
    /// are logged by the task and never reach the caller.
    pub fn on_live_append(&self, message: &Message) -> Option<JoinHandle<()>> {
        if !self.qualifies(message) {
            return None;
        }
        let session = self.session.borrow().clone()?;

        let client = Arc::clone(&self.client);
        let message = message.clone();
        let span = tracing::info_span!(
            "ai_relay",
            channel = %message.channel_id,
            message_id = %message.id
        );
        Some(tokio::spawn(
            async move {
                match client.notify_new_message(&session.token, &message).await {
                    Ok(()) => tracing::debug!("Message relayed"),
                    Err(e) => tracing::warn!(error = %e, "AI relay failed"),
                }
            }
            .instrument(span),
        ))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::Utc;
    use coachchat_core::{ChannelId, MessageId, RelayError, UserId};

    use super::*;

    /// Records every relay call; optionally fails them.
    #[derive(Default)]
    pub(crate) struct RecordingInference {
        pub(crate) calls: Mutex<Vec<(String, Message)>>,
        pub(crate) fail: bool,
    }

    impl RecordingInference {
        pub(crate) fn count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl InferenceClient for RecordingInference {
        async fn notify_new_message(&self, token: &str, message: &Message) -> Result<(), RelayError> {
            self.calls
                .lock()
                .unwrap()
                .push((token.to_owned(), message.clone()));
            if self.fail {
                Err(RelayError::Status(500))
            } else {
                Ok(())
            }
        }
    }

    fn message(author: &str) -> Message {
        Message {
            id: MessageId::new("m1"),
            channel_id: ChannelId::new("c1"),
            author_id: UserId::new(author),
            text: "hi".to_owned(),
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    fn bridge(
        inference: &Arc<RecordingInference>,
        session: Option<Session>,
    ) -> (AiRelayBridge, watch::Sender<Option<Session>>) {
        let (tx, rx) = watch::channel(session);
        let client: Arc<dyn InferenceClient> = Arc::clone(inference) as Arc<dyn InferenceClient>;
        (AiRelayBridge::new(client, rx, ClientConfig::new("http://localhost", "key")), tx)
    }

    #[tokio::test]
    async fn test_relays_session_user_with_bearer_token() {
        let inference = Arc::new(RecordingInference::default());
        let (bridge, _tx) = bridge(&inference, Some(Session::new("tok", "alice")));

        let task = bridge.on_live_append(&message("alice")).unwrap();
        task.await.unwrap();

        let calls = inference.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "tok");
        assert_eq!(calls[0].1.text, "hi");
    }

    #[tokio::test]
    async fn test_skips_bots_other_users_and_no_session() {
        let inference = Arc::new(RecordingInference::default());
        let (bridge, tx) = bridge(&inference, Some(Session::new("tok", "alice")));

        assert!(bridge.on_live_append(&message("ai-bot")).is_none());
        assert!(bridge.on_live_append(&message("ai-bot-coach")).is_none());
        assert!(bridge.on_live_append(&message("bob")).is_none());

        tx.send_replace(None);
        assert!(bridge.on_live_append(&message("alice")).is_none());
        assert_eq!(inference.count(), 0);
    }

    #[tokio::test]
    async fn test_bot_named_session_user_is_never_relayed() {
        let inference = Arc::new(RecordingInference::default());
        let (bridge, _tx) = bridge(&inference, Some(Session::new("tok", "ai-bot")));
        assert!(!bridge.qualifies(&message("ai-bot")));
        assert!(bridge.on_live_append(&message("ai-bot")).is_none());
    }

    #[tokio::test]
    async fn test_failure_is_contained() {
        let inference = Arc::new(RecordingInference {
            fail: true,
            ..RecordingInference::default()
        });
        let (bridge, _tx) = bridge(&inference, Some(Session::new("tok", "alice")));

        let task = bridge.on_live_append(&message("alice")).unwrap();
        assert!(task.await.is_ok());
        assert_eq!(inference.count(), 1);
    }
}
