//! Call value objects

use crate::domain::shared::error::DomainError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Local call session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    /// No call in progress
    Idle,
    /// Local party is the caller, waiting for the remote answer
    Calling,
    /// Local party is the callee, waiting for local accept/reject
    Ringing,
    /// Offer/answer negotiation completed
    Connected,
    /// Terminal, collapses to Idle immediately
    Ended,
}

impl CallStatus {
    /// Check if state transition is valid
    pub fn can_transition_to(&self, next: CallStatus) -> bool {
        use CallStatus::*;

        match (self, next) {
            (Idle, Calling) => true,
            (Idle, Ringing) => true,

            (Calling, Connected) => true,
            (Calling, Ended) => true,

            (Ringing, Connected) => true,
            (Ringing, Ended) => true,

            (Connected, Ended) => true,

            (Ended, Idle) => true,

            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Idle => "idle",
            CallStatus::Calling => "calling",
            CallStatus::Ringing => "ringing",
            CallStatus::Connected => "connected",
            CallStatus::Ended => "ended",
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, CallStatus::Idle)
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of the call the local party is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallRole {
    Caller,
    Callee,
}

/// Media plane state, tracked separately from negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaState {
    /// Descriptions exchanged (or in progress), transport not yet ready
    Negotiating,
    /// Transport reports connected
    Flowing,
    /// Transport reported disconnected; waiting for recovery
    Interrupted,
}

/// Persisted record status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Ringing,
    Connected,
    Ended,
    Rejected,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Ringing => "ringing",
            RecordStatus::Connected => "connected",
            RecordStatus::Ended => "ended",
            RecordStatus::Rejected => "rejected",
        }
    }

    /// Ringing or connected records still represent a live call
    pub fn is_open(&self) -> bool {
        matches!(self, RecordStatus::Ringing | RecordStatus::Connected)
    }
}

impl FromStr for RecordStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ringing" => Ok(RecordStatus::Ringing),
            "connected" => Ok(RecordStatus::Connected),
            "ended" => Ok(RecordStatus::Ended),
            "rejected" => Ok(RecordStatus::Rejected),
            other => Err(DomainError::ValidationError(format!(
                "unknown call status: {}",
                other
            ))),
        }
    }
}

/// Kind of party placing the call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallerType {
    User,
    Coach,
}

impl CallerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallerType::User => "user",
            CallerType::Coach => "coach",
        }
    }
}

impl Default for CallerType {
    fn default() -> Self {
        CallerType::User
    }
}

impl FromStr for CallerType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(CallerType::User),
            "coach" => Ok(CallerType::Coach),
            other => Err(DomainError::ValidationError(format!(
                "unknown caller type: {}",
                other
            ))),
        }
    }
}

/// Reason for call ending
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Local user hung up
    UserHangup,
    /// Remote party hung up (or cancelled while ringing)
    RemoteHangup,
    /// Callee declined
    Rejected,
    /// Callee was already in another call
    Busy,
    /// Ringing timed out
    NoAnswer,
    /// Transport failed or stayed disconnected past the grace period
    ConnectionFailed,
    /// Setup abandoned before the call was established
    Cancelled,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::UserHangup => "user_hangup",
            EndReason::RemoteHangup => "remote_hangup",
            EndReason::Rejected => "rejected",
            EndReason::Busy => "busy",
            EndReason::NoAnswer => "no_answer",
            EndReason::ConnectionFailed => "connection_failed",
            EndReason::Cancelled => "cancelled",
        }
    }

    /// Record status a call ending with this reason is persisted with
    pub fn record_status(&self) -> RecordStatus {
        match self {
            EndReason::Rejected | EndReason::Busy => RecordStatus::Rejected,
            _ => RecordStatus::Ended,
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EndReason {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user_hangup" => Ok(EndReason::UserHangup),
            "remote_hangup" => Ok(EndReason::RemoteHangup),
            "rejected" => Ok(EndReason::Rejected),
            "busy" => Ok(EndReason::Busy),
            "no_answer" => Ok(EndReason::NoAnswer),
            "connection_failed" => Ok(EndReason::ConnectionFailed),
            "cancelled" => Ok(EndReason::Cancelled),
            other => Err(DomainError::ValidationError(format!(
                "unknown end reason: {}",
                other
            ))),
        }
    }
}
