//! Signaling relay client
//!
//! Publishes messages by appending them to the store, and turns the store's
//! change feed into two subscriptions scoped to the local user: one per call
//! (signaling messages) and one per user (incoming ringing calls). Messages are
//! validated here; anything malformed is logged and dropped.

use crate::domain::call::{
    CallRecord, CallStore, ChangeFeed, NewSignal, RecordStatus, SignalEnvelope, SignalPayload,
    SignalingMessage,
};
use crate::domain::shared::{CallError, CallId, UserId};
use crate::infrastructure::metrics;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const SUBSCRIPTION_BUFFER: usize = 256;

/// Owned subscription; dropping it unsubscribes
pub struct Subscription<T> {
    rx: mpsc::Receiver<T>,
    task: JoinHandle<()>,
}

impl<T> Subscription<T> {
    /// Next delivery, or `None` once the feed is gone
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[derive(Clone)]
pub struct SignalingClient {
    store: Arc<dyn CallStore>,
    feed: Arc<dyn ChangeFeed>,
    local_user: UserId,
}

impl SignalingClient {
    pub fn new(store: Arc<dyn CallStore>, feed: Arc<dyn ChangeFeed>, local_user: UserId) -> Self {
        Self {
            store,
            feed,
            local_user,
        }
    }

    pub fn local_user(&self) -> UserId {
        self.local_user
    }

    /// Publish a message from the local user to `to_user`
    pub async fn publish(
        &self,
        call_id: CallId,
        to_user: UserId,
        payload: SignalPayload,
    ) -> Result<SignalEnvelope, CallError> {
        let kind = payload.kind();
        let signal = NewSignal {
            call_id,
            from_user_id: self.local_user,
            to_user_id: to_user,
            payload,
        };

        match self.store.append_signaling_message(signal).await {
            Ok(envelope) => {
                metrics::record_signal_published(kind);
                debug!("Published {} for call {}", kind, call_id);
                Ok(envelope)
            }
            Err(e) => {
                metrics::record_signal_publish_failure(kind);
                Err(CallError::SignalingPublishFailed(format!("{}: {}", kind, e)))
            }
        }
    }

    /// Messages of `call_id` addressed to the local user. Live on return.
    pub async fn subscribe_call(&self, call_id: CallId) -> Result<Subscription<SignalingMessage>, CallError> {
        let mut source = self.feed.watch_signals(self.local_user).await?;
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let local_user = self.local_user;

        let task = tokio::spawn(async move {
            while let Some(envelope) = source.recv().await {
                if envelope.call_id != call_id || envelope.to_user_id != local_user {
                    continue;
                }
                let Some(message) = validate(envelope) else { continue };
                if tx.send(message).await.is_err() {
                    break;
                }
            }
        });

        debug!("Subscribed to signaling for call {}", call_id);
        Ok(Subscription { rx, task })
    }

    /// Ringing calls placed to the local user
    pub async fn subscribe_incoming(&self) -> Result<Subscription<CallRecord>, CallError> {
        let mut source = self.feed.watch_call_inserts(self.local_user).await?;
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let local_user = self.local_user;

        let task = tokio::spawn(async move {
            while let Some(record) = source.recv().await {
                if record.callee_id != local_user || record.status != RecordStatus::Ringing {
                    continue;
                }
                if tx.send(record).await.is_err() {
                    break;
                }
            }
        });

        debug!("Subscribed to incoming calls for {}", local_user);
        Ok(Subscription { rx, task })
    }

    /// Persisted messages of `call_id` addressed to the local user, oldest first
    pub async fn backlog(&self, call_id: CallId) -> Result<Vec<SignalingMessage>, CallError> {
        let envelopes = self.store.signals_for(call_id, self.local_user).await?;
        Ok(envelopes.into_iter().filter_map(validate).collect())
    }
}

fn validate(envelope: SignalEnvelope) -> Option<SignalingMessage> {
    let id = envelope.id;
    let signal_type = envelope.signal_type.clone();
    match SignalingMessage::try_from(envelope) {
        Ok(message) => Some(message),
        Err(e) => {
            warn!("Dropping invalid {} message {}: {}", signal_type, id, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::call::repository::MockCallStore;
    use crate::domain::call::{CallerType, NewCallRecord, SignalKind};
    use crate::domain::shared::{DomainError, ErrorKind, MessageId};
    use crate::infrastructure::persistence::MemoryCallStore;
    use chrono::Utc;
    use serde_json::json;
    use std::time::Duration;

    async fn ringing_call(store: &MemoryCallStore, caller: UserId, callee: UserId) -> CallRecord {
        store
            .create_call_record(NewCallRecord {
                caller_id: caller,
                callee_id: callee,
                caller_type: CallerType::Coach,
                appointment_id: None,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_call_subscription_filters_by_call() {
        let store = Arc::new(MemoryCallStore::new());
        let (alice, bob) = (UserId::new(), UserId::new());
        let alice_client = SignalingClient::new(store.clone(), store.clone(), alice);
        let bob_client = SignalingClient::new(store.clone(), store.clone(), bob);

        let call = ringing_call(&store, alice, bob).await;
        let mut sub = bob_client.subscribe_call(call.id).await.unwrap();

        alice_client
            .publish(CallId::new(), bob, SignalPayload::Hangup)
            .await
            .unwrap();
        alice_client
            .publish(call.id, bob, SignalPayload::Reject { reason: None })
            .await
            .unwrap();

        let message = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.call_id, call.id);
        assert_eq!(message.payload.kind(), SignalKind::Reject);
        assert_eq!(message.from_user_id, alice);
    }

    #[tokio::test]
    async fn test_invalid_messages_are_dropped_from_backlog() {
        let mut store = MockCallStore::new();
        let call_id = CallId::new();
        let me = UserId::new();
        let peer = UserId::new();

        store.expect_signals_for().returning(move |call_id, to_user| {
            let envelope = |signal_type: &str, signal_data| SignalEnvelope {
                id: MessageId::new(),
                call_id,
                from_user_id: peer,
                to_user_id: to_user,
                signal_type: signal_type.to_string(),
                signal_data,
                created_at: Utc::now(),
            };
            Ok(vec![
                envelope("offer", json!({ "type": "offer" })),
                envelope("renegotiate", json!({})),
                envelope("hangup", json!({})),
            ])
        });

        let feed = Arc::new(MemoryCallStore::new());
        let client = SignalingClient::new(Arc::new(store), feed, me);
        let backlog = client.backlog(call_id).await.unwrap();

        assert_eq!(backlog.len(), 1);
        assert_eq!(backlog[0].payload, SignalPayload::Hangup);
    }

    #[tokio::test]
    async fn test_publish_failure_is_reported() {
        let mut store = MockCallStore::new();
        store
            .expect_append_signaling_message()
            .returning(|_| Err(DomainError::Storage("relay offline".to_string())));

        let feed = Arc::new(MemoryCallStore::new());
        let client = SignalingClient::new(Arc::new(store), feed, UserId::new());
        let err = client
            .publish(CallId::new(), UserId::new(), SignalPayload::Hangup)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SignalingPublishFailed);
    }

    #[tokio::test]
    async fn test_incoming_subscription_only_sees_own_calls() {
        let store = Arc::new(MemoryCallStore::new());
        let (alice, bob, carol) = (UserId::new(), UserId::new(), UserId::new());
        let bob_client = SignalingClient::new(store.clone(), store.clone(), bob);
        let mut incoming = bob_client.subscribe_incoming().await.unwrap();

        ringing_call(&store, alice, carol).await;
        let for_bob = ringing_call(&store, alice, bob).await;

        let record = tokio::time::timeout(Duration::from_secs(1), incoming.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.id, for_bob.id);
        assert!(incoming.try_recv().is_none());
    }
}
