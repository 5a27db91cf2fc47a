//! Wire types for the presentation bridge

use crate::domain::call::{CallEvent, CallView, CallerType, EndReason};
use crate::domain::shared::{CallError, CallId, UserId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Generic API response
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub user_id: UserId,
    pub call_status: String,
}

/// Intent sent by the presentation layer over the call socket
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum CallIntent {
    StartCall {
        remote_user_id: UserId,
        #[serde(default)]
        appointment_id: Option<Uuid>,
        #[serde(default)]
        caller_type: Option<CallerType>,
    },
    AnswerCall {
        call_id: CallId,
    },
    RejectCall {
        call_id: CallId,
    },
    EndCall {
        #[serde(default)]
        reason: Option<EndReason>,
    },
    ToggleMute,
    ToggleSpeaker,
    RateCall {
        call_id: CallId,
        rating: i16,
    },
}

impl CallIntent {
    pub fn name(&self) -> &'static str {
        match self {
            CallIntent::StartCall { .. } => "start_call",
            CallIntent::AnswerCall { .. } => "answer_call",
            CallIntent::RejectCall { .. } => "reject_call",
            CallIntent::EndCall { .. } => "end_call",
            CallIntent::ToggleMute => "toggle_mute",
            CallIntent::ToggleSpeaker => "toggle_speaker",
            CallIntent::RateCall { .. } => "rate_call",
        }
    }
}

/// Frame pushed to the presentation layer
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerFrame {
    View(CallView),
    Event(CallEvent),
    Ack {
        action: &'static str,
        #[serde(skip_serializing_if = "Option::is_none")]
        call_id: Option<CallId>,
        #[serde(skip_serializing_if = "Option::is_none")]
        value: Option<bool>,
    },
    Error {
        action: &'static str,
        kind: String,
        message: String,
    },
}

impl ServerFrame {
    pub fn ack(action: &'static str) -> Self {
        ServerFrame::Ack {
            action,
            call_id: None,
            value: None,
        }
    }

    pub fn error(action: &'static str, err: &CallError) -> Self {
        ServerFrame::Error {
            action,
            kind: format!("{:?}", err.kind()),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_start_call_intent() {
        let remote = UserId::new();
        let intent: CallIntent = serde_json::from_value(json!({
            "action": "start_call",
            "remote_user_id": remote,
            "caller_type": "coach"
        }))
        .unwrap();

        assert_eq!(
            intent,
            CallIntent::StartCall {
                remote_user_id: remote,
                appointment_id: None,
                caller_type: Some(CallerType::Coach),
            }
        );
    }

    #[test]
    fn test_parse_unit_intents() {
        let intent: CallIntent = serde_json::from_str(r#"{"action":"toggle_mute"}"#).unwrap();
        assert_eq!(intent, CallIntent::ToggleMute);

        let intent: CallIntent = serde_json::from_str(r#"{"action":"end_call"}"#).unwrap();
        assert_eq!(intent, CallIntent::EndCall { reason: None });
    }

    #[test]
    fn test_error_frame_shape() {
        let frame = ServerFrame::error("start_call", &CallError::AlreadyInCall);
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["data"]["kind"], "AlreadyInCall");
        assert_eq!(value["data"]["action"], "start_call");
    }
}
