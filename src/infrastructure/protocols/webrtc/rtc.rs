//! Transport backed by the `webrtc` crate

use crate::domain::call::{IceCandidateInit, SdpKind, SessionDescription};
use crate::domain::shared::CallError;
use crate::infrastructure::protocols::webrtc::transport::{
    PeerConfig, PeerEvent, PeerEventSender, PeerTransport, TransportFactory, TransportState,
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

fn engine_error(e: webrtc::Error) -> CallError {
    CallError::ConnectionFailed(e.to_string())
}

fn map_state(state: RTCPeerConnectionState) -> Option<TransportState> {
    match state {
        RTCPeerConnectionState::New => Some(TransportState::New),
        RTCPeerConnectionState::Connecting => Some(TransportState::Connecting),
        RTCPeerConnectionState::Connected => Some(TransportState::Connected),
        RTCPeerConnectionState::Disconnected => Some(TransportState::Disconnected),
        RTCPeerConnectionState::Failed => Some(TransportState::Failed),
        RTCPeerConnectionState::Closed => Some(TransportState::Closed),
        _ => None,
    }
}

/// Creates `webrtc` peer connections with Opus audio
pub struct RtcTransportFactory {
    api: API,
}

impl RtcTransportFactory {
    pub fn new() -> Result<Self, CallError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(engine_error)?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(engine_error)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self { api })
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn create(
        &self,
        config: &PeerConfig,
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerTransport>, CallError> {
        let rtc_config = RTCConfiguration {
            ice_servers: config
                .ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ice_candidate_pool_size: config.ice_candidate_pool_size,
            bundle_policy: RTCBundlePolicy::MaxBundle,
            rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
            ..Default::default()
        };

        let pc = Arc::new(
            self.api
                .new_peer_connection(rtc_config)
                .await
                .map_err(engine_error)?,
        );

        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                // None marks the end of gathering
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(PeerEvent::LocalCandidate(IceCandidateInit {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(e) => warn!("Failed to serialize local ICE candidate: {}", e),
                }
            })
        }));

        let tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = tx.clone();
            Box::pin(async move {
                debug!("Peer connection state changed: {}", state);
                if let Some(state) = map_state(state) {
                    let _ = tx.send(PeerEvent::ConnectionStateChanged(state));
                }
            })
        }));

        let tx = events;
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
            let tx = tx.clone();
            Box::pin(async move {
                let stream_id = track.stream_id();
                info!("Remote {} track arrived on stream {}", track.kind(), stream_id);
                let _ = tx.send(PeerEvent::RemoteStream { stream_id });
            })
        }));

        Ok(Arc::new(RtcTransport {
            pc,
            local_track: Mutex::new(None),
        }))
    }
}

pub struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
    local_track: Mutex<Option<Arc<TrackLocalStaticSample>>>,
}

impl RtcTransport {
    /// Track that captured audio samples should be written to
    pub async fn local_track(&self) -> Option<Arc<TrackLocalStaticSample>> {
        self.local_track.lock().await.clone()
    }
}

#[async_trait]
impl PeerTransport for RtcTransport {
    async fn add_local_track(&self, track_id: &str, stream_id: &str) -> Result<(), CallError> {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            track_id.to_owned(),
            stream_id.to_owned(),
        ));

        self.pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(engine_error)?;

        *self.local_track.lock().await = Some(track);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, CallError> {
        let offer = self.pc.create_offer(None).await.map_err(engine_error)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(engine_error)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, CallError> {
        let answer = self.pc.create_answer(None).await.map_err(engine_error)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(engine_error)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_remote_description(&self, description: &SessionDescription) -> Result<(), CallError> {
        let remote = match description.kind {
            SdpKind::Offer => RTCSessionDescription::offer(description.sdp.clone()),
            SdpKind::Answer => RTCSessionDescription::answer(description.sdp.clone()),
        }
        .map_err(engine_error)?;

        self.pc
            .set_remote_description(remote)
            .await
            .map_err(engine_error)
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidateInit) -> Result<(), CallError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate.clone(),
                sdp_mid: candidate.sdp_mid.clone(),
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment.clone(),
            })
            .await
            .map_err(engine_error)
    }

    async fn close(&self) -> Result<(), CallError> {
        self.pc.close().await.map_err(engine_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_mapping() {
        assert_eq!(
            map_state(RTCPeerConnectionState::Disconnected),
            Some(TransportState::Disconnected)
        );
        assert_eq!(
            map_state(RTCPeerConnectionState::Failed),
            Some(TransportState::Failed)
        );
        assert_eq!(map_state(RTCPeerConnectionState::Unspecified), None);
    }

    #[tokio::test]
    async fn test_offer_has_audio_section() {
        let factory = RtcTransportFactory::new().unwrap();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let config = PeerConfig {
            ice_servers: Vec::new(),
            ice_candidate_pool_size: 0,
        };
        let transport = factory.create(&config, tx).await.unwrap();

        transport.add_local_track("mic", "local").await.unwrap();
        let offer = transport.create_offer().await.unwrap();
        assert!(offer.sdp.contains("m=audio"));

        transport.close().await.unwrap();
    }
}
