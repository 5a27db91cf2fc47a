//! API Router configuration

use super::call_handler::{get_call_state, health_check, ApiState};
use super::metrics_handler::{metrics_disabled, metrics_handler};
use super::ws_handler::call_ws_handler;
use axum::{routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Build the API router
pub fn build_router(
    state: ApiState,
    prometheus_handle: Option<PrometheusHandle>,
    enable_cors: bool,
) -> Router {
    let call_routes = Router::new()
        .route("/health", get(health_check))
        .route("/call/state", get(get_call_state))
        .route("/call/ws", get(call_ws_handler))
        .with_state(state);

    // Metrics route (separate state)
    let metrics_routes = match prometheus_handle {
        Some(handle) => Router::new()
            .route("/metrics", get(metrics_handler))
            .with_state(handle),
        None => Router::new().route("/metrics", get(metrics_disabled)),
    };

    let router = Router::new().merge(call_routes).merge(metrics_routes);

    let router = if enable_cors {
        router.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
    } else {
        router
    };

    router.layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::{CallController, CallDependencies, CallSettings};
    use crate::config::CallConfig;
    use crate::domain::call::CallerType;
    use crate::domain::shared::UserId;
    use crate::infrastructure::media::VirtualAudioDevice;
    use crate::infrastructure::persistence::MemoryCallStore;
    use crate::infrastructure::protocols::webrtc::{PeerConfig, SimulatedNetwork};
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn state() -> ApiState {
        let store = Arc::new(MemoryCallStore::new());
        let network = SimulatedNetwork::new();
        let controller = CallController::new(
            UserId::new(),
            CallSettings {
                caller_type: CallerType::User,
                timing: CallConfig::default(),
                peer: PeerConfig::default(),
            },
            CallDependencies {
                store: store.clone(),
                feed: store.clone(),
                devices: Arc::new(VirtualAudioDevice::new()),
                profiles: store,
                transports: Arc::new(network.endpoint("api")),
            },
        );
        ApiState { controller }
    }

    #[tokio::test]
    async fn test_call_state_starts_idle() {
        let app = build_router(state(), None, true);
        let response = app
            .oneshot(Request::builder().uri("/call/state").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["data"]["status"], "idle");
        assert_eq!(json["data"]["isSpeakerOn"], true);
    }

    #[tokio::test]
    async fn test_health_reports_user() {
        let state = state();
        let user = state.controller.local_user();
        let app = build_router(state, None, false);
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["data"]["user_id"], user.to_string());
        assert_eq!(json["data"]["call_status"], "idle");
    }

    #[tokio::test]
    async fn test_metrics_disabled() {
        let app = build_router(state(), None, true);
        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
