//! PostgreSQL change feed over LISTEN/NOTIFY
//!
//! Insert triggers publish `{id, <recipient>}` on a channel; each subscription
//! holds its own listener connection, filters by recipient and loads the row.

use crate::domain::call::{CallRecord, ChangeFeed, FeedStream, RecordStatus, SignalEnvelope};
use crate::domain::shared::{DomainError, Result, UserId};
use crate::infrastructure::persistence::call_store::PgCallStore;
use async_trait::async_trait;
use serde::Deserialize;
use sqlx::postgres::PgListener;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

pub const SIGNAL_CHANNEL: &str = "coach_call_signals";
pub const CALL_INSERT_CHANNEL: &str = "coach_calls_inserted";

const SUBSCRIBER_BUFFER: usize = 256;

#[derive(Debug, Deserialize)]
struct SignalNotification {
    id: Uuid,
    to_user_id: Uuid,
}

#[derive(Debug, Deserialize)]
struct CallInsertNotification {
    id: Uuid,
    callee_id: Uuid,
}

pub struct PgChangeFeed {
    store: PgCallStore,
}

impl PgChangeFeed {
    pub fn new(store: PgCallStore) -> Self {
        Self { store }
    }

    async fn listen(&self, channel: &str) -> Result<PgListener> {
        let mut listener = PgListener::connect_with(self.store.pool())
            .await
            .map_err(|e| DomainError::Storage(format!("Failed to open listener: {}", e)))?;
        listener
            .listen(channel)
            .await
            .map_err(|e| DomainError::Storage(format!("Failed to LISTEN {}: {}", channel, e)))?;
        debug!("Listening on {}", channel);
        Ok(listener)
    }
}

/// Pump notifications into a bounded stream until the subscriber goes away.
/// `resolve` turns a payload into the item to deliver, or `None` to skip it.
fn pump<T, N, F, Fut>(mut listener: PgListener, resolve: F) -> FeedStream<T>
where
    T: Send + 'static,
    N: for<'de> Deserialize<'de> + Send + 'static,
    F: Fn(N) -> Fut + Send + 'static,
    Fut: Future<Output = Option<T>> + Send,
{
    let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
    tokio::spawn(async move {
        loop {
            let notification = tokio::select! {
                _ = tx.closed() => break,
                n = listener.recv() => n,
            };

            let notification = match notification {
                Ok(n) => n,
                Err(e) => {
                    warn!("Change feed listener error: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            let payload: N = match serde_json::from_str(notification.payload()) {
                Ok(p) => p,
                Err(e) => {
                    warn!("Malformed notification on {}: {}", notification.channel(), e);
                    continue;
                }
            };

            if let Some(item) = resolve(payload).await {
                if tx.send(item).await.is_err() {
                    break;
                }
            }
        }
        debug!("Change feed subscription closed");
    });
    rx
}

#[async_trait]
impl ChangeFeed for PgChangeFeed {
    async fn watch_signals(&self, to_user: UserId) -> Result<FeedStream<SignalEnvelope>> {
        let listener = self.listen(SIGNAL_CHANNEL).await?;
        let store = self.store.clone();
        Ok(pump(listener, move |n: SignalNotification| {
            let store = store.clone();
            async move {
                if n.to_user_id != to_user.as_uuid() {
                    return None;
                }
                match store.fetch_signal(n.id).await {
                    Ok(signal) => signal,
                    Err(e) => {
                        warn!("Failed to load signaling message {}: {}", n.id, e);
                        None
                    }
                }
            }
        }))
    }

    async fn watch_call_inserts(&self, callee: UserId) -> Result<FeedStream<CallRecord>> {
        let listener = self.listen(CALL_INSERT_CHANNEL).await?;
        let store = self.store.clone();
        Ok(pump(listener, move |n: CallInsertNotification| {
            let store = store.clone();
            async move {
                if n.callee_id != callee.as_uuid() {
                    return None;
                }
                match store.fetch_record(n.id).await {
                    Ok(Some(record)) if record.status == RecordStatus::Ringing => Some(record),
                    Ok(_) => None,
                    Err(e) => {
                        warn!("Failed to load call record {}: {}", n.id, e);
                        None
                    }
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_payloads() {
        let signal: SignalNotification = serde_json::from_str(
            r#"{"id":"6c3f8a4e-2b1d-4c5e-9f7a-1b2c3d4e5f60","to_user_id":"0f9e8d7c-6b5a-4c3d-2e1f-0a9b8c7d6e5f"}"#,
        )
        .unwrap();
        assert_eq!(signal.to_user_id.to_string(), "0f9e8d7c-6b5a-4c3d-2e1f-0a9b8c7d6e5f");

        let insert: std::result::Result<CallInsertNotification, _> =
            serde_json::from_str(r#"{"id":"6c3f8a4e-2b1d-4c5e-9f7a-1b2c3d4e5f60"}"#);
        assert!(insert.is_err());
    }
}
