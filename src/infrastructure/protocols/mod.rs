//! Real-time media protocol support

pub mod ice;
pub mod webrtc;
