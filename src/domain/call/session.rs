//! In-memory call session, one per client

use crate::domain::call::value_object::{CallRole, CallStatus, MediaState};
use crate::domain::shared::error::DomainError;
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::{CallId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The local view of the single active call
///
/// Status changes go through [`CallSession::transition_to`], which enforces the
/// forward-only paths of the lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSession {
    /// Call id, unknown until the record is persisted
    id: Option<CallId>,
    status: CallStatus,
    local_role: CallRole,
    remote_user_id: UserId,
    /// When the call became connected
    start_time: Option<DateTime<Utc>>,
    duration_seconds: u64,
    muted: bool,
    speaker_on: bool,
    media: MediaState,
}

impl CallSession {
    /// Outgoing call: starts in Calling with no id yet
    pub fn outgoing(remote_user_id: UserId) -> Self {
        Self::new(None, CallStatus::Calling, CallRole::Caller, remote_user_id)
    }

    /// Incoming call: starts in Ringing with the record's id
    pub fn incoming(id: CallId, remote_user_id: UserId) -> Self {
        Self::new(Some(id), CallStatus::Ringing, CallRole::Callee, remote_user_id)
    }

    fn new(id: Option<CallId>, status: CallStatus, local_role: CallRole, remote_user_id: UserId) -> Self {
        Self {
            id,
            status,
            local_role,
            remote_user_id,
            start_time: None,
            duration_seconds: 0,
            muted: false,
            speaker_on: true,
            media: MediaState::Negotiating,
        }
    }

    /// Assign the persisted id; allowed once
    pub fn assign_id(&mut self, id: CallId) -> Result<()> {
        match self.id {
            None => {
                self.id = Some(id);
                Ok(())
            }
            Some(existing) if existing == id => Ok(()),
            Some(existing) => Err(DomainError::InvalidOperation(format!(
                "session already bound to call {}",
                existing
            ))),
        }
    }

    /// Transition to a new status
    pub fn transition_to(&mut self, next: CallStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::InvalidStateTransition(format!(
                "Cannot transition from {} to {}",
                self.status, next
            )));
        }

        if next == CallStatus::Connected {
            self.start_time = Some(Utc::now());
            self.duration_seconds = 0;
        }

        self.status = next;
        Ok(())
    }

    pub fn set_duration(&mut self, seconds: u64) {
        self.duration_seconds = seconds;
    }

    pub fn set_media(&mut self, media: MediaState) {
        self.media = media;
    }

    pub fn toggle_muted(&mut self) -> bool {
        self.muted = !self.muted;
        self.muted
    }

    pub fn toggle_speaker(&mut self) -> bool {
        self.speaker_on = !self.speaker_on;
        self.speaker_on
    }

    // Getters
    pub fn id(&self) -> Option<CallId> {
        self.id
    }

    pub fn status(&self) -> CallStatus {
        self.status
    }

    pub fn local_role(&self) -> CallRole {
        self.local_role
    }

    pub fn remote_user_id(&self) -> UserId {
        self.remote_user_id
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.start_time
    }

    pub fn duration_seconds(&self) -> u64 {
        self.duration_seconds
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn is_speaker_on(&self) -> bool {
        self.speaker_on
    }

    pub fn media(&self) -> MediaState {
        self.media
    }

    pub fn is_incoming(&self) -> bool {
        self.local_role == CallRole::Callee
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outgoing_lifecycle() {
        let mut session = CallSession::outgoing(UserId::new());
        assert_eq!(session.status(), CallStatus::Calling);
        assert!(session.id().is_none());
        assert!(!session.is_incoming());

        let id = CallId::new();
        session.assign_id(id).unwrap();
        assert_eq!(session.id(), Some(id));
        assert!(session.assign_id(CallId::new()).is_err());

        session.transition_to(CallStatus::Connected).unwrap();
        assert!(session.start_time().is_some());

        session.transition_to(CallStatus::Ended).unwrap();
        session.transition_to(CallStatus::Idle).unwrap();
    }

    #[test]
    fn test_incoming_cannot_skip_back_to_calling() {
        let mut session = CallSession::incoming(CallId::new(), UserId::new());
        assert!(session.is_incoming());

        let result = session.transition_to(CallStatus::Calling);
        assert!(matches!(result, Err(DomainError::InvalidStateTransition(_))));
        assert_eq!(session.status(), CallStatus::Ringing);
    }

    #[test]
    fn test_toggles() {
        let mut session = CallSession::outgoing(UserId::new());
        assert!(session.toggle_muted());
        assert!(!session.toggle_muted());
        assert!(!session.toggle_speaker());
        assert!(session.toggle_speaker());
    }
}
