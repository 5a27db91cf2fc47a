//! WebRTC peer connection support
pub mod peer_connection;
pub mod rtc;
pub mod sdp;
pub mod simulated;
pub mod transport;

pub use peer_connection::{CandidateDisposition, PeerConnectionManager};
pub use rtc::RtcTransportFactory;
pub use sdp::{AudioCodec, AudioSdp, IceCredentials};
pub use simulated::{SimulatedEndpoint, SimulatedNetwork, TransportStats};
pub use transport::{
    IceServerConfig, PeerConfig, PeerEvent, PeerEventReceiver, PeerEventSender, PeerTransport,
    TransportFactory, TransportState, DEFAULT_STUN_SERVERS,
};
