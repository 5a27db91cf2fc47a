//! PostgreSQL implementation of the call store

use crate::application::ports::{Profile, ProfileResolver};
use crate::domain::call::{
    CallRecord, CallStore, NewCallRecord, NewSignal, RecordPatch, SignalEnvelope,
};
use crate::domain::shared::{CallId, DomainError, MessageId, Result, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use std::time::Duration;
use tracing::{debug, error};
use uuid::Uuid;

const RECORD_COLUMNS: &str = "id, caller_id, callee_id, caller_type, status, appointment_id, \
     started_at, connected_at, ended_at, duration_seconds, end_reason, quality_rating, created_at";

const SIGNAL_COLUMNS: &str =
    "id, call_id, from_user_id, to_user_id, signal_type, signal_data, created_at";

#[derive(FromRow)]
struct CallRecordRow {
    id: Uuid,
    caller_id: Uuid,
    callee_id: Uuid,
    caller_type: String,
    status: String,
    appointment_id: Option<Uuid>,
    started_at: DateTime<Utc>,
    connected_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    duration_seconds: Option<i32>,
    end_reason: Option<String>,
    quality_rating: Option<i16>,
    created_at: DateTime<Utc>,
}

impl TryFrom<CallRecordRow> for CallRecord {
    type Error = DomainError;

    fn try_from(r: CallRecordRow) -> Result<Self> {
        Ok(CallRecord {
            id: CallId::from_uuid(r.id),
            caller_id: UserId::from_uuid(r.caller_id),
            callee_id: UserId::from_uuid(r.callee_id),
            caller_type: r.caller_type.parse()?,
            status: r.status.parse()?,
            appointment_id: r.appointment_id,
            started_at: r.started_at,
            connected_at: r.connected_at,
            ended_at: r.ended_at,
            duration_seconds: r.duration_seconds,
            end_reason: r.end_reason.as_deref().map(str::parse).transpose()?,
            quality_rating: r.quality_rating,
            created_at: r.created_at,
        })
    }
}

#[derive(FromRow)]
pub(crate) struct SignalRow {
    id: Uuid,
    call_id: Uuid,
    from_user_id: Uuid,
    to_user_id: Uuid,
    signal_type: String,
    signal_data: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl From<SignalRow> for SignalEnvelope {
    fn from(r: SignalRow) -> Self {
        SignalEnvelope {
            id: MessageId::from_uuid(r.id),
            call_id: CallId::from_uuid(r.call_id),
            from_user_id: UserId::from_uuid(r.from_user_id),
            to_user_id: UserId::from_uuid(r.to_user_id),
            signal_type: r.signal_type,
            signal_data: r.signal_data,
            created_at: r.created_at,
        }
    }
}

fn storage_error(context: &str, e: sqlx::Error) -> DomainError {
    error!("{}: {}", context, e);
    DomainError::Storage(format!("{}: {}", context, e))
}

/// Advisory lock key for an unordered user pair
fn pair_lock_key(a: UserId, b: UserId) -> String {
    let (low, high) = if a.as_uuid() <= b.as_uuid() { (a, b) } else { (b, a) };
    format!("coach_call:{}:{}", low, high)
}

#[derive(Clone)]
pub struct PgCallStore {
    pool: PgPool,
    ringing_window: Duration,
}

impl PgCallStore {
    pub fn new(pool: PgPool, ringing_window: Duration) -> Self {
        Self {
            pool,
            ringing_window,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub(crate) async fn fetch_record(&self, id: Uuid) -> Result<Option<CallRecord>> {
        let row = sqlx::query_as::<_, CallRecordRow>(&format!(
            "SELECT {} FROM coach_calls WHERE id = $1",
            RECORD_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| storage_error("Failed to load call record", e))?;

        row.map(CallRecord::try_from).transpose()
    }

    pub(crate) async fn fetch_signal(&self, id: Uuid) -> Result<Option<SignalEnvelope>> {
        let row = sqlx::query_as::<_, SignalRow>(&format!(
            "SELECT {} FROM coach_call_signals WHERE id = $1",
            SIGNAL_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| storage_error("Failed to load signaling message", e))?;

        Ok(row.map(SignalEnvelope::from))
    }
}

#[async_trait]
impl CallStore for PgCallStore {
    async fn create_call_record(&self, fields: NewCallRecord) -> Result<CallRecord> {
        debug!(
            "Creating call record {} -> {}",
            fields.caller_id, fields.callee_id
        );

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| storage_error("Failed to begin transaction", e))?;

        // Serialize concurrent attempts for the same pair
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(pair_lock_key(fields.caller_id, fields.callee_id))
            .execute(&mut *tx)
            .await
            .map_err(|e| storage_error("Failed to lock user pair", e))?;

        let row = sqlx::query_as::<_, CallRecordRow>(&format!(
            r#"
            INSERT INTO coach_calls (id, caller_id, callee_id, caller_type, status, appointment_id)
            SELECT $1, $2, $3, $4, 'ringing', $5
            WHERE NOT EXISTS (
                SELECT 1 FROM coach_calls
                WHERE ended_at IS NULL
                  AND ((caller_id = $2 AND callee_id = $3) OR (caller_id = $3 AND callee_id = $2))
                  AND (status = 'connected'
                       OR (status = 'ringing' AND started_at > NOW() - make_interval(secs => $6)))
            )
            RETURNING {}
            "#,
            RECORD_COLUMNS
        ))
        .bind(CallId::new().as_uuid())
        .bind(fields.caller_id.as_uuid())
        .bind(fields.callee_id.as_uuid())
        .bind(fields.caller_type.as_str())
        .bind(fields.appointment_id)
        .bind(self.ringing_window.as_secs_f64())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| storage_error("Failed to create call record", e))?;

        let row = match row {
            Some(row) => row,
            None => {
                return Err(DomainError::Conflict(format!(
                    "users {} and {} already have an open call",
                    fields.caller_id, fields.callee_id
                )))
            }
        };

        tx.commit()
            .await
            .map_err(|e| storage_error("Failed to commit call record", e))?;

        let record = CallRecord::try_from(row)?;
        debug!("Call record created: {}", record.id);
        Ok(record)
    }

    async fn update_call_record(&self, id: CallId, patch: RecordPatch) -> Result<CallRecord> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| storage_error("Failed to begin transaction", e))?;

        let row = sqlx::query_as::<_, CallRecordRow>(&format!(
            "SELECT {} FROM coach_calls WHERE id = $1 FOR UPDATE",
            RECORD_COLUMNS
        ))
        .bind(id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| storage_error("Failed to load call record", e))?
        .ok_or_else(|| DomainError::NotFound(format!("call record {}", id)))?;

        let mut record = CallRecord::try_from(row)?;
        if !record.apply(&patch, Utc::now())? {
            debug!("Patch {:?} on call record {} was a no-op", patch, id);
            return Ok(record);
        }

        sqlx::query(
            r#"
            UPDATE coach_calls
            SET status = $2, connected_at = $3, ended_at = $4,
                duration_seconds = $5, end_reason = $6, quality_rating = $7
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(record.status.as_str())
        .bind(record.connected_at)
        .bind(record.ended_at)
        .bind(record.duration_seconds)
        .bind(record.end_reason.map(|r| r.as_str()))
        .bind(record.quality_rating)
        .execute(&mut *tx)
        .await
        .map_err(|e| storage_error("Failed to update call record", e))?;

        tx.commit()
            .await
            .map_err(|e| storage_error("Failed to commit call record update", e))?;

        debug!("Call record {} updated: {}", id, record.status.as_str());
        Ok(record)
    }

    async fn append_signaling_message(&self, signal: NewSignal) -> Result<SignalEnvelope> {
        let kind = signal.payload.kind();
        let row = sqlx::query_as::<_, SignalRow>(&format!(
            r#"
            INSERT INTO coach_call_signals (id, call_id, from_user_id, to_user_id, signal_type, signal_data)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {}
            "#,
            SIGNAL_COLUMNS
        ))
        .bind(MessageId::new().as_uuid())
        .bind(signal.call_id.as_uuid())
        .bind(signal.from_user_id.as_uuid())
        .bind(signal.to_user_id.as_uuid())
        .bind(kind.as_str())
        .bind(signal.payload.to_data())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| storage_error("Failed to append signaling message", e))?;

        Ok(SignalEnvelope::from(row))
    }

    async fn query_call_record(&self, id: CallId) -> Result<Option<CallRecord>> {
        self.fetch_record(id.as_uuid()).await
    }

    async fn signals_for(&self, call_id: CallId, to_user: UserId) -> Result<Vec<SignalEnvelope>> {
        let rows = sqlx::query_as::<_, SignalRow>(&format!(
            r#"
            SELECT {} FROM coach_call_signals
            WHERE call_id = $1 AND to_user_id = $2
            ORDER BY created_at, id
            "#,
            SIGNAL_COLUMNS
        ))
        .bind(call_id.as_uuid())
        .bind(to_user.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| storage_error("Failed to load signaling backlog", e))?;

        Ok(rows.into_iter().map(SignalEnvelope::from).collect())
    }
}

#[derive(FromRow)]
struct ProfileRow {
    display_name: String,
    avatar_url: Option<String>,
}

#[async_trait]
impl ProfileResolver for PgCallStore {
    async fn resolve(&self, user_id: UserId) -> Result<Profile> {
        let row = sqlx::query_as::<_, ProfileRow>(
            "SELECT display_name, avatar_url FROM profiles WHERE id = $1",
        )
        .bind(user_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| storage_error("Failed to load profile", e))?
        .ok_or_else(|| DomainError::NotFound(format!("profile {}", user_id)))?;

        Ok(Profile {
            display_name: row.display_name,
            avatar_url: row.avatar_url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_lock_key_is_unordered() {
        let (a, b) = (UserId::new(), UserId::new());
        assert_eq!(pair_lock_key(a, b), pair_lock_key(b, a));
    }

    #[test]
    fn test_row_conversion_rejects_unknown_status() {
        let now = Utc::now();
        let row = CallRecordRow {
            id: Uuid::new_v4(),
            caller_id: Uuid::new_v4(),
            callee_id: Uuid::new_v4(),
            caller_type: "coach".to_string(),
            status: "on_hold".to_string(),
            appointment_id: None,
            started_at: now,
            connected_at: None,
            ended_at: None,
            duration_seconds: None,
            end_reason: None,
            quality_rating: None,
            created_at: now,
        };
        assert!(CallRecord::try_from(row).is_err());
    }
}
