//! coach-call - voice call signaling and session lifecycle
//!
//! Establishes peer-to-peer audio calls between two users through a
//! store-backed signaling relay, following a layered design:
//! domain (call model and ports), application (controller, incoming call
//! listener), infrastructure (storage, relay, transports) and interface
//! (HTTP/WebSocket bridge for the presentation layer).

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod interface;

// Re-export commonly used types
pub use application::{CallContext, CallController};
pub use domain::shared::error::{CallError, DomainError, ErrorKind};
pub use domain::shared::result::Result;
