//! In-memory call store and change feed
//!
//! Backs the `memory` storage backend and the test suite. Inserts are fanned out through
//! broadcast channels; each subscriber gets a filtered mpsc stream that closes
//! when the subscriber drops it.

use crate::application::ports::{Profile, ProfileResolver};
use crate::domain::call::{
    CallRecord, CallStore, ChangeFeed, FeedStream, NewCallRecord, NewSignal, RecordPatch,
    RecordStatus, SignalEnvelope,
};
use crate::domain::shared::{CallId, DomainError, MessageId, Result, UserId};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, warn};

const FEED_CAPACITY: usize = 1024;
const SUBSCRIBER_BUFFER: usize = 256;

pub struct MemoryCallStore {
    records: Arc<RwLock<HashMap<CallId, CallRecord>>>,
    signals: Arc<RwLock<Vec<SignalEnvelope>>>,
    profiles: Arc<RwLock<HashMap<UserId, Profile>>>,
    signal_tx: broadcast::Sender<SignalEnvelope>,
    insert_tx: broadcast::Sender<CallRecord>,
    /// Ringing rows older than this no longer block a new call for the pair
    ringing_window: chrono::Duration,
    fail_record_writes: AtomicBool,
    fail_signal_writes: AtomicBool,
}

impl MemoryCallStore {
    pub fn new() -> Self {
        let (signal_tx, _) = broadcast::channel(FEED_CAPACITY);
        let (insert_tx, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            signals: Arc::new(RwLock::new(Vec::new())),
            profiles: Arc::new(RwLock::new(HashMap::new())),
            signal_tx,
            insert_tx,
            ringing_window: chrono::Duration::seconds(50),
            fail_record_writes: AtomicBool::new(false),
            fail_signal_writes: AtomicBool::new(false),
        }
    }

    pub fn with_ringing_window(mut self, window: std::time::Duration) -> Self {
        self.ringing_window =
            chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::seconds(50));
        self
    }

    pub async fn put_profile(&self, user_id: UserId, profile: Profile) {
        self.profiles.write().await.insert(user_id, profile);
    }

    /// Make record creation and updates fail, to exercise error paths
    pub fn fail_record_writes(&self, fail: bool) {
        self.fail_record_writes.store(fail, Ordering::SeqCst);
    }

    /// Make signaling appends fail
    pub fn fail_signal_writes(&self, fail: bool) {
        self.fail_signal_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn records(&self) -> Vec<CallRecord> {
        let mut records: Vec<CallRecord> = self.records.read().await.values().cloned().collect();
        records.sort_by_key(|r| r.created_at);
        records
    }

    pub async fn signals(&self) -> Vec<SignalEnvelope> {
        self.signals.read().await.clone()
    }

    fn blocks_new_call(&self, record: &CallRecord, now: chrono::DateTime<Utc>) -> bool {
        if !record.is_open() {
            return false;
        }
        match record.status {
            RecordStatus::Ringing => now - record.started_at < self.ringing_window,
            _ => true,
        }
    }

    fn storage_failure(&self, flag: &AtomicBool, what: &str) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(DomainError::Storage(format!("{} unavailable", what)));
        }
        Ok(())
    }
}

impl Default for MemoryCallStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CallStore for MemoryCallStore {
    async fn create_call_record(&self, fields: NewCallRecord) -> Result<CallRecord> {
        self.storage_failure(&self.fail_record_writes, "call records")?;

        let now = Utc::now();
        let record = {
            let mut records = self.records.write().await;
            if records.values().any(|r| {
                r.involves_pair(fields.caller_id, fields.callee_id) && self.blocks_new_call(r, now)
            }) {
                return Err(DomainError::Conflict(format!(
                    "users {} and {} already have an open call",
                    fields.caller_id, fields.callee_id
                )));
            }

            let record = CallRecord::ringing(CallId::new(), fields, now);
            records.insert(record.id, record.clone());
            record
        };

        debug!("Call record {} created", record.id);
        let _ = self.insert_tx.send(record.clone());
        Ok(record)
    }

    async fn update_call_record(&self, id: CallId, patch: RecordPatch) -> Result<CallRecord> {
        self.storage_failure(&self.fail_record_writes, "call records")?;

        let mut records = self.records.write().await;
        let record = records
            .get_mut(&id)
            .ok_or_else(|| DomainError::NotFound(format!("call record {}", id)))?;

        if !record.apply(&patch, Utc::now())? {
            debug!("Patch {:?} on call record {} was a no-op", patch, id);
        }
        Ok(record.clone())
    }

    async fn append_signaling_message(&self, signal: NewSignal) -> Result<SignalEnvelope> {
        self.storage_failure(&self.fail_signal_writes, "signaling")?;

        let envelope = signal.into_envelope(MessageId::new(), Utc::now());
        self.signals.write().await.push(envelope.clone());
        let _ = self.signal_tx.send(envelope.clone());
        Ok(envelope)
    }

    async fn query_call_record(&self, id: CallId) -> Result<Option<CallRecord>> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn signals_for(&self, call_id: CallId, to_user: UserId) -> Result<Vec<SignalEnvelope>> {
        Ok(self
            .signals
            .read()
            .await
            .iter()
            .filter(|s| s.call_id == call_id && s.to_user_id == to_user)
            .cloned()
            .collect())
    }
}

/// Forward broadcast items matching `keep` into a bounded per-subscriber stream
fn forward<T, F>(mut source: broadcast::Receiver<T>, keep: F) -> FeedStream<T>
where
    T: Clone + Send + 'static,
    F: Fn(&T) -> bool + Send + 'static,
{
    let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tx.closed() => break,
                item = source.recv() => match item {
                    Ok(item) => {
                        if keep(&item) && tx.send(item).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Change feed subscriber lagged, {} notifications dropped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    });
    rx
}

#[async_trait]
impl ChangeFeed for MemoryCallStore {
    async fn watch_signals(&self, to_user: UserId) -> Result<FeedStream<SignalEnvelope>> {
        Ok(forward(self.signal_tx.subscribe(), move |s: &SignalEnvelope| {
            s.to_user_id == to_user
        }))
    }

    async fn watch_call_inserts(&self, callee: UserId) -> Result<FeedStream<CallRecord>> {
        Ok(forward(self.insert_tx.subscribe(), move |r: &CallRecord| {
            r.callee_id == callee
        }))
    }
}

#[async_trait]
impl ProfileResolver for MemoryCallStore {
    async fn resolve(&self, user_id: UserId) -> Result<Profile> {
        self.profiles
            .read()
            .await
            .get(&user_id)
            .cloned()
            .ok_or_else(|| DomainError::NotFound(format!("profile {}", user_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::call::{CallerType, EndReason, SignalPayload};
    use tokio_test::assert_ok;

    fn new_call(caller: UserId, callee: UserId) -> NewCallRecord {
        NewCallRecord {
            caller_id: caller,
            callee_id: callee,
            caller_type: CallerType::User,
            appointment_id: None,
        }
    }

    #[tokio::test]
    async fn test_second_open_call_for_pair_conflicts() {
        let store = MemoryCallStore::new();
        let (a, b) = (UserId::new(), UserId::new());

        let first = assert_ok!(store.create_call_record(new_call(a, b)).await);
        let err = store.create_call_record(new_call(b, a)).await.unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));

        store
            .update_call_record(
                first.id,
                RecordPatch::Ended {
                    reason: EndReason::UserHangup,
                    duration_seconds: 3,
                },
            )
            .await
            .unwrap();
        assert_ok!(store.create_call_record(new_call(b, a)).await);
    }

    #[tokio::test]
    async fn test_stale_ringing_record_does_not_block() {
        let store = MemoryCallStore::new().with_ringing_window(std::time::Duration::ZERO);
        let (a, b) = (UserId::new(), UserId::new());

        assert_ok!(store.create_call_record(new_call(a, b)).await);
        assert_ok!(store.create_call_record(new_call(a, b)).await);
    }

    #[tokio::test]
    async fn test_feeds_filter_by_recipient() {
        let store = MemoryCallStore::new();
        let (a, b) = (UserId::new(), UserId::new());

        let mut inserts_for_b = store.watch_call_inserts(b).await.unwrap();
        let mut signals_for_b = store.watch_signals(b).await.unwrap();
        let mut signals_for_a = store.watch_signals(a).await.unwrap();

        let record = store.create_call_record(new_call(a, b)).await.unwrap();
        assert_eq!(inserts_for_b.recv().await.unwrap().id, record.id);

        store
            .append_signaling_message(NewSignal {
                call_id: record.id,
                from_user_id: a,
                to_user_id: b,
                payload: SignalPayload::Hangup,
            })
            .await
            .unwrap();

        let delivered = signals_for_b.recv().await.unwrap();
        assert_eq!(delivered.signal_type, "hangup");
        assert!(signals_for_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_backlog_is_ordered() {
        let store = MemoryCallStore::new();
        let (a, b) = (UserId::new(), UserId::new());
        let record = store.create_call_record(new_call(a, b)).await.unwrap();

        for payload in [
            SignalPayload::Reject { reason: None },
            SignalPayload::Hangup,
        ] {
            store
                .append_signaling_message(NewSignal {
                    call_id: record.id,
                    from_user_id: a,
                    to_user_id: b,
                    payload,
                })
                .await
                .unwrap();
        }

        let backlog = store.signals_for(record.id, b).await.unwrap();
        assert_eq!(backlog.len(), 2);
        assert_eq!(backlog[0].signal_type, "reject");
        assert!(store.signals_for(record.id, a).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_write_failures() {
        let store = MemoryCallStore::new();
        store.fail_record_writes(true);
        let err = store
            .create_call_record(new_call(UserId::new(), UserId::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::Storage(_)));
    }

    #[tokio::test]
    async fn test_unknown_profile() {
        let store = MemoryCallStore::new();
        assert!(store.resolve(UserId::new()).await.is_err());
    }
}
