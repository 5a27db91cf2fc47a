//! Signaling messages
//!
//! On the wire (and in storage) a message is a `signal_type` string plus an
//! untyped JSON `signal_data`. [`SignalingMessage`] is the validated form the
//! controller works with; conversion happens once, at the relay boundary.

use crate::domain::shared::error::DomainError;
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::{CallId, MessageId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;

/// Signaling message type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalKind {
    #[serde(rename = "offer")]
    Offer,
    #[serde(rename = "answer")]
    Answer,
    #[serde(rename = "ice-candidate")]
    IceCandidate,
    #[serde(rename = "hangup")]
    Hangup,
    #[serde(rename = "reject")]
    Reject,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::IceCandidate => "ice-candidate",
            SignalKind::Hangup => "hangup",
            SignalKind::Reject => "reject",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignalKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "offer" => Ok(SignalKind::Offer),
            "answer" => Ok(SignalKind::Answer),
            "ice-candidate" => Ok(SignalKind::IceCandidate),
            "hangup" => Ok(SignalKind::Hangup),
            "reject" => Ok(SignalKind::Reject),
            other => Err(DomainError::ValidationError(format!(
                "unknown signal type: {}",
                other
            ))),
        }
    }
}

/// SDP description type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Session description as exchanged by browsers: `{"type": "offer", "sdp": "..."}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Trickled ICE candidate, in the browser's `RTCIceCandidateInit` shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidateInit {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidateInit {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }
}

/// Validated signaling payload, keyed by message type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalPayload {
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(IceCandidateInit),
    Hangup,
    Reject { reason: Option<String> },
}

impl SignalPayload {
    pub fn kind(&self) -> SignalKind {
        match self {
            SignalPayload::Offer(_) => SignalKind::Offer,
            SignalPayload::Answer(_) => SignalKind::Answer,
            SignalPayload::IceCandidate(_) => SignalKind::IceCandidate,
            SignalPayload::Hangup => SignalKind::Hangup,
            SignalPayload::Reject { .. } => SignalKind::Reject,
        }
    }

    /// JSON body stored alongside the type
    pub fn to_data(&self) -> Value {
        match self {
            SignalPayload::Offer(desc) | SignalPayload::Answer(desc) => {
                json!({ "type": desc.kind, "sdp": desc.sdp })
            }
            SignalPayload::IceCandidate(candidate) => {
                serde_json::to_value(candidate).unwrap_or_else(|_| json!({}))
            }
            SignalPayload::Hangup => json!({}),
            SignalPayload::Reject { reason } => match reason {
                Some(reason) => json!({ "reason": reason }),
                None => json!({}),
            },
        }
    }

    /// Parse and validate a stored `(type, data)` pair
    pub fn from_parts(kind: SignalKind, data: &Value) -> Result<Self> {
        match kind {
            SignalKind::Offer => {
                let desc = parse_description(data, SdpKind::Offer)?;
                Ok(SignalPayload::Offer(desc))
            }
            SignalKind::Answer => {
                let desc = parse_description(data, SdpKind::Answer)?;
                Ok(SignalPayload::Answer(desc))
            }
            SignalKind::IceCandidate => {
                let candidate: IceCandidateInit = serde_json::from_value(data.clone())
                    .map_err(|e| DomainError::ValidationError(format!("bad ice candidate: {}", e)))?;
                if candidate.candidate.trim().is_empty() {
                    return Err(DomainError::ValidationError(
                        "empty ice candidate".to_string(),
                    ));
                }
                Ok(SignalPayload::IceCandidate(candidate))
            }
            SignalKind::Hangup => Ok(SignalPayload::Hangup),
            SignalKind::Reject => {
                let reason = data
                    .get("reason")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                Ok(SignalPayload::Reject { reason })
            }
        }
    }
}

fn parse_description(data: &Value, expected: SdpKind) -> Result<SessionDescription> {
    let desc: SessionDescription = serde_json::from_value(data.clone())
        .map_err(|e| DomainError::ValidationError(format!("bad session description: {}", e)))?;
    if desc.kind != expected {
        return Err(DomainError::ValidationError(format!(
            "expected {:?} description, got {:?}",
            expected, desc.kind
        )));
    }
    if desc.sdp.trim().is_empty() {
        return Err(DomainError::ValidationError("empty sdp".to_string()));
    }
    Ok(desc)
}

/// Stored signaling row, as persisted and as delivered by change feeds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub id: MessageId,
    pub call_id: CallId,
    pub from_user_id: UserId,
    pub to_user_id: UserId,
    pub signal_type: String,
    pub signal_data: Value,
    pub created_at: DateTime<Utc>,
}

/// Message to append; the store assigns id and timestamp
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSignal {
    pub call_id: CallId,
    pub from_user_id: UserId,
    pub to_user_id: UserId,
    pub payload: SignalPayload,
}

impl NewSignal {
    pub fn into_envelope(self, id: MessageId, created_at: DateTime<Utc>) -> SignalEnvelope {
        SignalEnvelope {
            id,
            call_id: self.call_id,
            from_user_id: self.from_user_id,
            to_user_id: self.to_user_id,
            signal_type: self.payload.kind().as_str().to_string(),
            signal_data: self.payload.to_data(),
            created_at,
        }
    }
}

/// Validated signaling message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingMessage {
    pub id: MessageId,
    pub call_id: CallId,
    pub from_user_id: UserId,
    pub to_user_id: UserId,
    pub payload: SignalPayload,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<SignalEnvelope> for SignalingMessage {
    type Error = DomainError;

    fn try_from(envelope: SignalEnvelope) -> Result<Self> {
        let kind: SignalKind = envelope.signal_type.parse()?;
        let payload = SignalPayload::from_parts(kind, &envelope.signal_data)?;
        Ok(Self {
            id: envelope.id,
            call_id: envelope.call_id,
            from_user_id: envelope.from_user_id,
            to_user_id: envelope.to_user_id,
            payload,
            created_at: envelope.created_at,
        })
    }
}
