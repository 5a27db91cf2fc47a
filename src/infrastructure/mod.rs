//! Infrastructure layer - Technical implementations
//!
//! This layer contains:
//! - Call store and change feed implementations (in-memory, PostgreSQL)
//! - The signaling relay client
//! - Peer transports (WebRTC, simulated) and ICE/SDP handling
//! - The virtual audio device and call metrics

pub mod media;
pub mod metrics;
pub mod persistence;
pub mod protocols;
pub mod signaling;
