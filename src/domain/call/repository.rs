//! Persistence ports for calls and signaling
//!
//! These are defined in the domain layer as traits (ports) and implemented in
//! the infrastructure layer (adapters).

use crate::domain::call::record::{CallRecord, NewCallRecord, RecordPatch};
use crate::domain::call::signaling::{NewSignal, SignalEnvelope};
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::{CallId, UserId};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Stream of change notifications; dropping it unsubscribes
pub type FeedStream<T> = mpsc::Receiver<T>;

/// Durable store for call records and signaling messages
///
/// Implementations must give the writer read-after-write consistency on its
/// own writes.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CallStore: Send + Sync {
    /// Insert a ringing record. Fails with `DomainError::Conflict` when the
    /// same pair of users already has an open call.
    async fn create_call_record(&self, fields: NewCallRecord) -> Result<CallRecord>;

    /// Apply a patch and return the resulting record
    async fn update_call_record(&self, id: CallId, patch: RecordPatch) -> Result<CallRecord>;

    /// Append an immutable signaling message
    async fn append_signaling_message(&self, signal: NewSignal) -> Result<SignalEnvelope>;

    /// Find a call record by its ID
    async fn query_call_record(&self, id: CallId) -> Result<Option<CallRecord>>;

    /// Messages of one call addressed to one user, oldest first
    async fn signals_for(&self, call_id: CallId, to_user: UserId) -> Result<Vec<SignalEnvelope>>;
}

/// Change notifications emitted by the store
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Every signaling message inserted for `to_user`. The subscription is
    /// live when this returns.
    async fn watch_signals(&self, to_user: UserId) -> Result<FeedStream<SignalEnvelope>>;

    /// Every call record inserted with `callee` as callee
    async fn watch_call_inserts(&self, callee: UserId) -> Result<FeedStream<CallRecord>>;
}
