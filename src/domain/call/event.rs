//! Call notifications and the presentation snapshot

use crate::domain::call::session::CallSession;
use crate::domain::call::value_object::{CallStatus, EndReason, MediaState};
use crate::domain::shared::value_objects::{CallId, UserId};
use serde::{Deserialize, Serialize};

/// Discrete things that happened to the local call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallEvent {
    /// A remote party is calling us
    Incoming {
        call_id: CallId,
        caller_id: UserId,
        caller_name: String,
    },
    /// Session status moved
    StatusChanged {
        call_id: Option<CallId>,
        status: CallStatus,
    },
    /// Offer/answer negotiation completed
    Connected { call_id: CallId },
    /// Transport reports media flowing
    MediaFlowing { call_id: CallId },
    /// Transport reported disconnected; grace period running
    MediaInterrupted { call_id: CallId },
    /// Remote audio track arrived
    RemoteStream { call_id: CallId, stream_id: String },
    /// Call ended; the session is idle again
    Ended {
        call_id: Option<CallId>,
        reason: EndReason,
    },
}

impl CallEvent {
    pub fn call_id(&self) -> Option<CallId> {
        match self {
            CallEvent::Incoming { call_id, .. }
            | CallEvent::Connected { call_id }
            | CallEvent::MediaFlowing { call_id }
            | CallEvent::MediaInterrupted { call_id }
            | CallEvent::RemoteStream { call_id, .. } => Some(*call_id),
            CallEvent::StatusChanged { call_id, .. } | CallEvent::Ended { call_id, .. } => *call_id,
        }
    }
}

/// Snapshot consumed by the presentation layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallView {
    pub call_id: Option<CallId>,
    pub status: CallStatus,
    pub duration: u64,
    pub is_incoming: bool,
    pub is_muted: bool,
    pub is_speaker_on: bool,
    pub remote_user_id: Option<UserId>,
    pub remote_name: Option<String>,
    pub remote_avatar: Option<String>,
    pub media: Option<MediaState>,
}

impl CallView {
    pub fn idle() -> Self {
        Self {
            call_id: None,
            status: CallStatus::Idle,
            duration: 0,
            is_incoming: false,
            is_muted: false,
            is_speaker_on: true,
            remote_user_id: None,
            remote_name: None,
            remote_avatar: None,
            media: None,
        }
    }

    pub fn from_session(
        session: &CallSession,
        remote_name: Option<&str>,
        remote_avatar: Option<&str>,
    ) -> Self {
        Self {
            call_id: session.id(),
            status: session.status(),
            duration: session.duration_seconds(),
            is_incoming: session.is_incoming(),
            is_muted: session.is_muted(),
            is_speaker_on: session.is_speaker_on(),
            remote_user_id: Some(session.remote_user_id()),
            remote_name: remote_name.map(str::to_string),
            remote_avatar: remote_avatar.map(str::to_string),
            media: Some(session.media()),
        }
    }
}

impl Default for CallView {
    fn default() -> Self {
        Self::idle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_view_from_incoming_session() {
        let session = CallSession::incoming(CallId::new(), UserId::new());
        let view = CallView::from_session(&session, Some("Coach Lin"), None);
        assert_eq!(view.status, CallStatus::Ringing);
        assert!(view.is_incoming);
        assert!(view.is_speaker_on);
        assert_eq!(view.remote_name.as_deref(), Some("Coach Lin"));
    }

    #[test]
    fn test_event_wire_format() {
        let event = CallEvent::Ended {
            call_id: None,
            reason: EndReason::NoAnswer,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "ended");
        assert_eq!(json["reason"], "no_answer");
    }
}
