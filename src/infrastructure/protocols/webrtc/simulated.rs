//! In-process transport
//!
//! Negotiates real SDP text without touching the network: a transport reports
//! `connected` once it has a local description, a remote description and at
//! least one remote candidate. Used by the headless demo and the test suite,
//! which can also inject connection states to simulate network trouble.

use crate::domain::call::{IceCandidateInit, SdpKind, SessionDescription};
use crate::domain::shared::{CallError, DomainError};
use crate::infrastructure::protocols::ice::{Candidate, CandidateType};
use crate::infrastructure::protocols::webrtc::sdp::{AudioSdp, IceCredentials};
use crate::infrastructure::protocols::webrtc::transport::{
    PeerConfig, PeerEvent, PeerEventSender, PeerTransport, TransportFactory, TransportState,
};
use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Counters exposed for assertions
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub local_tracks: usize,
    pub local_description: Option<SdpKind>,
    pub remote_description: Option<SdpKind>,
    pub remote_candidates: usize,
    pub state: Option<TransportState>,
    pub closed: bool,
}

/// Registry of simulated transports keyed by endpoint label
#[derive(Clone, Default)]
pub struct SimulatedNetwork {
    transports: Arc<Mutex<HashMap<String, Arc<SimulatedTransport>>>>,
}

impl SimulatedNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory whose transports are registered under `label`
    pub fn endpoint(&self, label: impl Into<String>) -> SimulatedEndpoint {
        SimulatedEndpoint {
            network: self.clone(),
            label: label.into(),
        }
    }

    /// Stats of the most recent transport created for `label`
    pub async fn stats(&self, label: &str) -> Option<TransportStats> {
        let transport = self.transports.lock().await.get(label).cloned()?;
        Some(transport.stats().await)
    }

    /// Force a connection state on the most recent transport for `label`.
    /// Returns false when there is no open transport.
    pub async fn inject(&self, label: &str, state: TransportState) -> bool {
        let transport = match self.transports.lock().await.get(label).cloned() {
            Some(t) => t,
            None => return false,
        };
        transport.force_state(state).await
    }
}

/// [`TransportFactory`] bound to one label of a [`SimulatedNetwork`]
#[derive(Clone)]
pub struct SimulatedEndpoint {
    network: SimulatedNetwork,
    label: String,
}

#[async_trait]
impl TransportFactory for SimulatedEndpoint {
    async fn create(
        &self,
        _config: &PeerConfig,
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerTransport>, CallError> {
        let transport = Arc::new(SimulatedTransport {
            label: self.label.clone(),
            events,
            inner: Mutex::new(TransportInner::default()),
        });
        self.network
            .transports
            .lock()
            .await
            .insert(self.label.clone(), Arc::clone(&transport));
        debug!("Simulated transport created for {}", self.label);
        Ok(transport)
    }
}

#[derive(Default)]
struct TransportInner {
    tracks: Vec<String>,
    local: Option<AudioSdp>,
    remote: Option<AudioSdp>,
    remote_candidates: usize,
    state: Option<TransportState>,
    stream_announced: bool,
    closed: bool,
}

pub struct SimulatedTransport {
    label: String,
    events: PeerEventSender,
    inner: Mutex<TransportInner>,
}

impl SimulatedTransport {
    async fn stats(&self) -> TransportStats {
        let inner = self.inner.lock().await;
        TransportStats {
            local_tracks: inner.tracks.len(),
            local_description: inner.local.as_ref().map(|d| d.kind),
            remote_description: inner.remote.as_ref().map(|d| d.kind),
            remote_candidates: inner.remote_candidates,
            state: inner.state,
            closed: inner.closed,
        }
    }

    async fn force_state(&self, state: TransportState) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return false;
        }
        inner.state = Some(state);
        self.emit(PeerEvent::ConnectionStateChanged(state));
        true
    }

    fn emit(&self, event: PeerEvent) {
        // The receiver is gone once the call is torn down
        let _ = self.events.send(event);
    }

    fn gather_host_candidate(&self) {
        let port = rand::thread_rng().gen_range(10_000..60_000);
        let address = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        let candidate = Candidate::new(CandidateType::Host, address, 1);
        self.emit(PeerEvent::LocalCandidate(IceCandidateInit::new(
            candidate.to_string(),
        )));
    }

    fn advance(&self, inner: &mut TransportInner) {
        let ready = inner.local.is_some() && inner.remote.is_some() && inner.remote_candidates > 0;
        if ready && negotiating(inner.state) {
            inner.state = Some(TransportState::Connected);
            self.emit(PeerEvent::ConnectionStateChanged(TransportState::Connected));
            if !inner.stream_announced {
                inner.stream_announced = true;
                self.emit(PeerEvent::RemoteStream {
                    stream_id: format!("{}-remote-audio", self.label),
                });
            }
        }
    }
}

fn negotiating(state: Option<TransportState>) -> bool {
    matches!(
        state,
        None | Some(TransportState::New) | Some(TransportState::Connecting)
    )
}

fn invalid(message: impl Into<String>) -> CallError {
    CallError::Domain(DomainError::ValidationError(message.into()))
}

#[async_trait]
impl PeerTransport for SimulatedTransport {
    async fn add_local_track(&self, track_id: &str, _stream_id: &str) -> Result<(), CallError> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(CallError::ClosedOperation);
        }
        inner.tracks.push(track_id.to_string());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, CallError> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(CallError::ClosedOperation);
        }
        let offer = AudioSdp::offer(IceCredentials::generate());
        let description = SessionDescription::offer(offer.to_sdp_string());
        inner.local = Some(offer);
        inner.state = Some(TransportState::New);
        self.gather_host_candidate();
        self.advance(&mut inner);
        Ok(description)
    }

    async fn create_answer(&self) -> Result<SessionDescription, CallError> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(CallError::ClosedOperation);
        }
        let remote = match inner.remote.as_ref() {
            Some(remote) if remote.kind == SdpKind::Offer => remote,
            _ => {
                return Err(CallError::InvalidState(
                    "cannot answer without a remote offer".to_string(),
                ))
            }
        };
        let answer = AudioSdp::answer(remote, IceCredentials::generate()).map_err(invalid)?;
        let description = SessionDescription::answer(answer.to_sdp_string());
        inner.local = Some(answer);
        self.gather_host_candidate();
        self.advance(&mut inner);
        Ok(description)
    }

    async fn set_remote_description(&self, description: &SessionDescription) -> Result<(), CallError> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(CallError::ClosedOperation);
        }

        let expected = match inner.local.as_ref().map(|d| d.kind) {
            Some(SdpKind::Offer) => SdpKind::Answer,
            _ => SdpKind::Offer,
        };
        if description.kind != expected {
            return Err(invalid(format!(
                "expected remote {:?}, got {:?}",
                expected, description.kind
            )));
        }

        let parsed = AudioSdp::parse(&description.sdp, description.kind).map_err(invalid)?;
        inner.remote = Some(parsed);
        if negotiating(inner.state) {
            inner.state = Some(TransportState::Connecting);
            self.emit(PeerEvent::ConnectionStateChanged(TransportState::Connecting));
        }
        self.advance(&mut inner);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidateInit) -> Result<(), CallError> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(CallError::ClosedOperation);
        }
        if inner.remote.is_none() {
            return Err(CallError::InvalidState(
                "remote description not set".to_string(),
            ));
        }
        candidate
            .candidate
            .parse::<Candidate>()
            .map_err(|e| invalid(e.to_string()))?;
        inner.remote_candidates += 1;
        self.advance(&mut inner);
        Ok(())
    }

    async fn close(&self) -> Result<(), CallError> {
        let mut inner = self.inner.lock().await;
        inner.closed = true;
        inner.state = Some(TransportState::Closed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_offer_gathers_candidate() {
        let network = SimulatedNetwork::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = network
            .endpoint("alice")
            .create(&PeerConfig::default(), tx)
            .await
            .unwrap();

        let offer = transport.create_offer().await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.contains("m=audio"));

        match rx.recv().await {
            Some(PeerEvent::LocalCandidate(c)) => assert!(c.candidate.contains("typ host")),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_answer_requires_offer() {
        let network = SimulatedNetwork::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = network
            .endpoint("bob")
            .create(&PeerConfig::default(), tx)
            .await
            .unwrap();

        assert!(transport.create_answer().await.is_err());
    }

    #[tokio::test]
    async fn test_inject_after_close_is_refused() {
        let network = SimulatedNetwork::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = network
            .endpoint("carol")
            .create(&PeerConfig::default(), tx)
            .await
            .unwrap();

        assert!(network.inject("carol", TransportState::Disconnected).await);
        transport.close().await.unwrap();
        assert!(!network.inject("carol", TransportState::Failed).await);
        assert!(!network.inject("nobody", TransportState::Failed).await);
    }
}
