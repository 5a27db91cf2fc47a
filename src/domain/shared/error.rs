//! Domain and call errors

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Flat classification of [`CallError`], used by callers that branch on the
/// failure category rather than on the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    PermissionDenied,
    RecordCreationFailed,
    SignalingPublishFailed,
    RemoteRejected,
    RemoteHangup,
    ConnectionFailed,
    AlreadyInCall,
    ClosedOperation,
    Cancelled,
    InvalidState,
    Domain,
}

/// Errors surfaced by the call controller and its collaborators
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("Microphone permission denied: {0}")]
    PermissionDenied(String),

    #[error("Failed to create call record: {0}")]
    RecordCreationFailed(String),

    #[error("Failed to publish signaling message: {0}")]
    SignalingPublishFailed(String),

    #[error("Call rejected by remote party")]
    RemoteRejected,

    #[error("Remote party hung up")]
    RemoteHangup,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Another call is already in progress")]
    AlreadyInCall,

    #[error("Peer connection is closed")]
    ClosedOperation,

    #[error("Call setup was cancelled")]
    Cancelled,

    #[error("Invalid call state: {0}")]
    InvalidState(String),

    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl CallError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CallError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            CallError::RecordCreationFailed(_) => ErrorKind::RecordCreationFailed,
            CallError::SignalingPublishFailed(_) => ErrorKind::SignalingPublishFailed,
            CallError::RemoteRejected => ErrorKind::RemoteRejected,
            CallError::RemoteHangup => ErrorKind::RemoteHangup,
            CallError::ConnectionFailed(_) => ErrorKind::ConnectionFailed,
            CallError::AlreadyInCall => ErrorKind::AlreadyInCall,
            CallError::ClosedOperation => ErrorKind::ClosedOperation,
            CallError::Cancelled => ErrorKind::Cancelled,
            CallError::InvalidState(_) => ErrorKind::InvalidState,
            CallError::Domain(_) => ErrorKind::Domain,
        }
    }

    /// Setup failures are reported to the user with an actionable message;
    /// everything else ends an established call.
    pub fn is_setup_failure(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::PermissionDenied | ErrorKind::RecordCreationFailed | ErrorKind::AlreadyInCall
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_mapping() {
        assert_eq!(
            CallError::PermissionDenied("denied".into()).kind(),
            ErrorKind::PermissionDenied
        );
        assert_eq!(CallError::ClosedOperation.kind(), ErrorKind::ClosedOperation);
        assert_eq!(
            CallError::from(DomainError::NotFound("call".into())).kind(),
            ErrorKind::Domain
        );
    }

    #[test]
    fn test_setup_failures() {
        assert!(CallError::AlreadyInCall.is_setup_failure());
        assert!(CallError::RecordCreationFailed("db".into()).is_setup_failure());
        assert!(!CallError::RemoteHangup.is_setup_failure());
    }
}
