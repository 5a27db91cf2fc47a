/// ICE (Interactive Connectivity Establishment) candidate handling
/// RFC 8445 / RFC 8839
pub mod candidate;

pub use candidate::{candidate_key, Candidate, CandidateError, CandidateType, TransportProtocol};
