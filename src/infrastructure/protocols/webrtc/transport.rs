//! Peer transport seam
//!
//! [`PeerTransport`] is one negotiated media session. The manager in
//! `peer_connection` owns its lifecycle; implementations only translate calls
//! into their engine and report what happens through [`PeerEvent`]s.

use crate::domain::call::{IceCandidateInit, SessionDescription};
use crate::domain::shared::CallError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Aggregate connection state as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportState::New => "new",
            TransportState::Connecting => "connecting",
            TransportState::Connected => "connected",
            TransportState::Disconnected => "disconnected",
            TransportState::Failed => "failed",
            TransportState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Notifications raised by a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// A local candidate was gathered and should be trickled to the remote
    LocalCandidate(IceCandidateInit),
    /// The remote audio track arrived
    RemoteStream { stream_id: String },
    ConnectionStateChanged(TransportState),
}

pub type PeerEventSender = mpsc::UnboundedSender<PeerEvent>;
pub type PeerEventReceiver = mpsc::UnboundedReceiver<PeerEvent>;

/// NAT traversal helper server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl IceServerConfig {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Settings a transport is created with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub ice_servers: Vec<IceServerConfig>,
    pub ice_candidate_pool_size: u8,
}

/// Public STUN servers used when nothing else is configured
pub const DEFAULT_STUN_SERVERS: [&str; 7] = [
    "stun:stun.cloudflare.com:3478",
    "stun:global.stun.twilio.com:3478",
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
    "stun:stun.services.mozilla.com:3478",
    "stun:stun.nextcloud.com:443",
];

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_STUN_SERVERS
                .iter()
                .map(|url| IceServerConfig::stun(*url))
                .collect(),
            ice_candidate_pool_size: 10,
        }
    }
}

/// One peer-to-peer media session
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Attach the captured microphone track
    async fn add_local_track(&self, track_id: &str, stream_id: &str) -> Result<(), CallError>;

    /// Create an offer and set it as the local description
    async fn create_offer(&self) -> Result<SessionDescription, CallError>;

    /// Create an answer to the applied remote offer and set it as the local description
    async fn create_answer(&self) -> Result<SessionDescription, CallError>;

    async fn set_remote_description(&self, description: &SessionDescription) -> Result<(), CallError>;

    async fn add_ice_candidate(&self, candidate: &IceCandidateInit) -> Result<(), CallError>;

    async fn close(&self) -> Result<(), CallError>;
}

/// Creates transports; events of the new transport go to `events`
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        config: &PeerConfig,
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerTransport>, CallError>;
}
