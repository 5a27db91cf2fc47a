//! Persisted call record
//!
//! Records are an audit log: they are never deleted, only created and patched.

use crate::domain::call::value_object::{CallerType, EndReason, RecordStatus};
use crate::domain::shared::error::DomainError;
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::{CallId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Durable representation of one call's lifecycle and outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRecord {
    pub id: CallId,
    pub caller_id: UserId,
    pub callee_id: UserId,
    pub caller_type: CallerType,
    pub status: RecordStatus,
    pub appointment_id: Option<Uuid>,
    pub started_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i32>,
    pub end_reason: Option<EndReason>,
    pub quality_rating: Option<i16>,
    pub created_at: DateTime<Utc>,
}

/// Fields supplied by the caller when a record is created
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewCallRecord {
    pub caller_id: UserId,
    pub callee_id: UserId,
    pub caller_type: CallerType,
    pub appointment_id: Option<Uuid>,
}

/// Update applied to an existing record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordPatch {
    /// Callee accepted
    Connected,
    /// Call finished; first writer wins
    Ended {
        reason: EndReason,
        duration_seconds: u32,
    },
    /// Post-call quality rating, 1 to 5
    Rated { rating: i16 },
}

impl CallRecord {
    /// Build a fresh ringing record as the store would on insert
    pub fn ringing(id: CallId, fields: NewCallRecord, now: DateTime<Utc>) -> Self {
        Self {
            id,
            caller_id: fields.caller_id,
            callee_id: fields.callee_id,
            caller_type: fields.caller_type,
            status: RecordStatus::Ringing,
            appointment_id: fields.appointment_id,
            started_at: now,
            connected_at: None,
            ended_at: None,
            duration_seconds: None,
            end_reason: None,
            quality_rating: None,
            created_at: now,
        }
    }

    /// Apply a patch at `now`, clamping timestamps so that
    /// `started_at <= connected_at <= ended_at` always holds.
    ///
    /// Returns `Ok(false)` when the patch is a no-op (already connected, already
    /// ended).
    pub fn apply(&mut self, patch: &RecordPatch, now: DateTime<Utc>) -> Result<bool> {
        match patch {
            RecordPatch::Connected => {
                if self.status != RecordStatus::Ringing {
                    return Ok(false);
                }
                self.status = RecordStatus::Connected;
                self.connected_at = Some(now.max(self.started_at));
                Ok(true)
            }
            RecordPatch::Ended {
                reason,
                duration_seconds,
            } => {
                if self.ended_at.is_some() {
                    return Ok(false);
                }
                let floor = self.connected_at.unwrap_or(self.started_at);
                self.status = reason.record_status();
                self.ended_at = Some(now.max(floor));
                self.duration_seconds = Some((*duration_seconds).min(i32::MAX as u32) as i32);
                self.end_reason = Some(*reason);
                Ok(true)
            }
            RecordPatch::Rated { rating } => {
                if !(1..=5).contains(rating) {
                    return Err(DomainError::ValidationError(format!(
                        "rating must be between 1 and 5, got {}",
                        rating
                    )));
                }
                if self.ended_at.is_none() {
                    return Err(DomainError::InvalidOperation(
                        "only finished calls can be rated".to_string(),
                    ));
                }
                self.quality_rating = Some(*rating);
                Ok(true)
            }
        }
    }

    /// `started_at <= connected_at <= ended_at` for the timestamps present
    pub fn timestamps_ordered(&self) -> bool {
        let connected_ok = self.connected_at.map_or(true, |c| self.started_at <= c);
        let ended_ok = self
            .ended_at
            .map_or(true, |e| self.connected_at.unwrap_or(self.started_at) <= e);
        connected_ok && ended_ok
    }

    /// Whether the record still describes a live call
    pub fn is_open(&self) -> bool {
        self.status.is_open() && self.ended_at.is_none()
    }

    /// Whether both users take part in this call, in either direction
    pub fn involves_pair(&self, a: UserId, b: UserId) -> bool {
        (self.caller_id == a && self.callee_id == b) || (self.caller_id == b && self.callee_id == a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn ringing_record(now: DateTime<Utc>) -> CallRecord {
        CallRecord::ringing(
            CallId::new(),
            NewCallRecord {
                caller_id: UserId::new(),
                callee_id: UserId::new(),
                caller_type: CallerType::User,
                appointment_id: None,
            },
            now,
        )
    }

    #[test]
    fn test_connected_then_ended() {
        let start = Utc::now();
        let mut record = ringing_record(start);

        assert!(record.apply(&RecordPatch::Connected, start + Duration::seconds(3)).unwrap());
        assert_eq!(record.status, RecordStatus::Connected);

        let ended = RecordPatch::Ended {
            reason: EndReason::UserHangup,
            duration_seconds: 60,
        };
        assert!(record.apply(&ended, start + Duration::seconds(63)).unwrap());
        assert_eq!(record.status, RecordStatus::Ended);
        assert_eq!(record.duration_seconds, Some(60));
        assert_eq!(record.end_reason, Some(EndReason::UserHangup));
        assert!(record.timestamps_ordered());
    }

    #[test]
    fn test_skewed_clocks_are_clamped() {
        let start = Utc::now();
        let mut record = ringing_record(start);

        // The remote side's clock runs behind
        record
            .apply(&RecordPatch::Connected, start - Duration::seconds(10))
            .unwrap();
        record
            .apply(
                &RecordPatch::Ended {
                    reason: EndReason::ConnectionFailed,
                    duration_seconds: 0,
                },
                start - Duration::seconds(20),
            )
            .unwrap();

        assert_eq!(record.connected_at, Some(start));
        assert_eq!(record.ended_at, Some(start));
        assert!(record.timestamps_ordered());
    }

    #[test]
    fn test_first_end_wins() {
        let start = Utc::now();
        let mut record = ringing_record(start);

        let first = RecordPatch::Ended {
            reason: EndReason::UserHangup,
            duration_seconds: 12,
        };
        let second = RecordPatch::Ended {
            reason: EndReason::RemoteHangup,
            duration_seconds: 13,
        };
        assert!(record.apply(&first, start).unwrap());
        assert!(!record.apply(&second, start).unwrap());
        assert_eq!(record.end_reason, Some(EndReason::UserHangup));
        assert_eq!(record.duration_seconds, Some(12));
    }

    #[test]
    fn test_connect_after_end_is_ignored() {
        let start = Utc::now();
        let mut record = ringing_record(start);
        record
            .apply(
                &RecordPatch::Ended {
                    reason: EndReason::Rejected,
                    duration_seconds: 0,
                },
                start,
            )
            .unwrap();
        assert_eq!(record.status, RecordStatus::Rejected);
        assert!(!record.apply(&RecordPatch::Connected, start).unwrap());
        assert!(record.connected_at.is_none());
    }

    #[test]
    fn test_rating_rules() {
        let start = Utc::now();
        let mut record = ringing_record(start);
        assert!(record.apply(&RecordPatch::Rated { rating: 5 }, start).is_err());

        record
            .apply(
                &RecordPatch::Ended {
                    reason: EndReason::UserHangup,
                    duration_seconds: 1,
                },
                start,
            )
            .unwrap();
        assert!(record.apply(&RecordPatch::Rated { rating: 0 }, start).is_err());
        assert!(record.apply(&RecordPatch::Rated { rating: 4 }, start).unwrap());
        assert_eq!(record.quality_rating, Some(4));
    }
}
