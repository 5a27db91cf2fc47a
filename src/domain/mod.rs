//! Domain layer - Core call rules
//!
//! This layer contains:
//! - Value Objects: call status, roles, end reasons
//! - Entities: the local call session and the persisted call record
//! - Signaling messages, validated at the relay boundary
//! - Repository Interfaces: ports for persistence and change notification

pub mod call;
pub mod shared;

// Re-export commonly used types
pub use shared::{CallError, DomainError, ErrorKind, Result};
