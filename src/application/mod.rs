//! Application layer - Use cases and application services
//!
//! This layer orchestrates the call domain and the infrastructure adapters:
//! - `controller`: the call lifecycle state machine
//! - `incoming`: the listener that surfaces calls placed to the local user
//! - `ports`: collaborator traits (media devices, profile lookups)

pub mod controller;
pub mod incoming;
pub mod ports;

pub use controller::{CallContext, CallController, CallDependencies, CallSettings};
pub use incoming::{IncomingCall, IncomingCallHandler, IncomingCallListener};
pub use ports::{LocalAudioStream, MediaDevices, Profile, ProfileResolver};
