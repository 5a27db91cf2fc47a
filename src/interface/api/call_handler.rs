//! HTTP handlers and intent dispatch for the call controller

use super::dto::{ApiResponse, CallIntent, HealthStatus, ServerFrame};
use crate::application::{CallContext, CallController};
use crate::domain::call::{CallView, EndReason};
use axum::{extract::State, Json};
use tracing::{debug, info};

#[derive(Clone)]
pub struct ApiState {
    pub controller: CallController,
}

/// Health check endpoint
pub async fn health_check(State(state): State<ApiState>) -> Json<ApiResponse<HealthStatus>> {
    Json(ApiResponse::success(HealthStatus {
        status: "healthy",
        user_id: state.controller.local_user(),
        call_status: state.controller.view().status.to_string(),
    }))
}

/// Current call snapshot
pub async fn get_call_state(State(state): State<ApiState>) -> Json<ApiResponse<CallView>> {
    Json(ApiResponse::success(state.controller.view()))
}

/// Run one intent against the controller and describe the outcome
pub async fn apply_intent(controller: &CallController, intent: CallIntent) -> ServerFrame {
    let action = intent.name();
    debug!("Call intent: {}", action);

    match intent {
        CallIntent::StartCall {
            remote_user_id,
            appointment_id,
            caller_type,
        } => {
            let context = CallContext {
                appointment_id,
                caller_type,
            };
            match controller.start_call(remote_user_id, context).await {
                Ok(call_id) => {
                    info!("API: call {} placed to {}", call_id, remote_user_id);
                    ServerFrame::Ack {
                        action,
                        call_id: Some(call_id),
                        value: None,
                    }
                }
                Err(e) => ServerFrame::error(action, &e),
            }
        }
        CallIntent::AnswerCall { call_id } => match controller.answer_call(call_id).await {
            Ok(()) => ServerFrame::Ack {
                action,
                call_id: Some(call_id),
                value: None,
            },
            Err(e) => ServerFrame::error(action, &e),
        },
        CallIntent::RejectCall { call_id } => match controller.reject_call(call_id).await {
            Ok(()) => ServerFrame::ack(action),
            Err(e) => ServerFrame::error(action, &e),
        },
        CallIntent::EndCall { reason } => {
            controller
                .end_call(reason.unwrap_or(EndReason::UserHangup))
                .await;
            ServerFrame::ack(action)
        }
        CallIntent::ToggleMute => ServerFrame::Ack {
            action,
            call_id: None,
            value: controller.toggle_mute().await,
        },
        CallIntent::ToggleSpeaker => ServerFrame::Ack {
            action,
            call_id: None,
            value: controller.toggle_speaker().await,
        },
        CallIntent::RateCall { call_id, rating } => {
            match controller.rate_call(call_id, rating).await {
                Ok(_) => ServerFrame::Ack {
                    action,
                    call_id: Some(call_id),
                    value: None,
                },
                Err(e) => ServerFrame::error(action, &e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::{CallDependencies, CallSettings};
    use crate::config::CallConfig;
    use crate::domain::call::CallerType;
    use crate::domain::shared::{CallId, UserId};
    use crate::infrastructure::media::VirtualAudioDevice;
    use crate::infrastructure::persistence::MemoryCallStore;
    use crate::infrastructure::protocols::webrtc::{PeerConfig, SimulatedNetwork};
    use std::sync::Arc;

    fn controller(devices: Arc<VirtualAudioDevice>) -> CallController {
        let store = Arc::new(MemoryCallStore::new());
        let network = SimulatedNetwork::new();
        CallController::new(
            UserId::new(),
            CallSettings {
                caller_type: CallerType::Coach,
                timing: CallConfig::default(),
                peer: PeerConfig::default(),
            },
            CallDependencies {
                store: store.clone(),
                feed: store.clone(),
                devices,
                profiles: store,
                transports: Arc::new(network.endpoint("ui")),
            },
        )
    }

    #[tokio::test]
    async fn test_denied_start_reports_error_frame() {
        let devices = Arc::new(VirtualAudioDevice::new());
        devices.set_denied(true);
        let controller = controller(devices);

        let frame = apply_intent(
            &controller,
            CallIntent::StartCall {
                remote_user_id: UserId::new(),
                appointment_id: None,
                caller_type: None,
            },
        )
        .await;

        match frame {
            ServerFrame::Error { action, kind, .. } => {
                assert_eq!(action, "start_call");
                assert_eq!(kind, "PermissionDenied");
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_idle_intents_ack() {
        let controller = controller(Arc::new(VirtualAudioDevice::new()));

        let frame = apply_intent(&controller, CallIntent::ToggleMute).await;
        assert_eq!(
            frame,
            ServerFrame::Ack {
                action: "toggle_mute",
                call_id: None,
                value: None,
            }
        );

        let frame = apply_intent(&controller, CallIntent::EndCall { reason: None }).await;
        assert_eq!(frame, ServerFrame::ack("end_call"));

        let frame = apply_intent(&controller, CallIntent::RejectCall { call_id: CallId::new() }).await;
        assert_eq!(frame, ServerFrame::ack("reject_call"));
    }
}
