/// ICE candidate parsing and normalization
///
/// Remote candidates are trickled through the relay as browser
/// `candidate:` lines. Parsing them gives a stable identity for deduplication
/// that ignores cosmetic differences (case, extension attributes, generation).
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CandidateError {
    #[error("candidate line has {0} fields, expected at least 8")]
    TooShort(usize),

    #[error("bad {field} in candidate: {value}")]
    BadField { field: &'static str, value: String },

    #[error("candidate has no 'typ' attribute")]
    MissingType,
}

fn bad(field: &'static str, value: &str) -> CandidateError {
    CandidateError::BadField {
        field,
        value: value.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateType {
    /// Local interface address
    Host,
    /// Public address learned from a STUN server
    ServerReflexive,
    PeerReflexive,
    /// Address on a TURN relay
    Relay,
}

impl CandidateType {
    /// RFC 8445 recommended type preference
    fn type_preference(self) -> u32 {
        match self {
            Self::Host => 126,
            Self::PeerReflexive => 110,
            Self::ServerReflexive => 100,
            Self::Relay => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::ServerReflexive => "srflx",
            Self::PeerReflexive => "prflx",
            Self::Relay => "relay",
        }
    }
}

impl FromStr for CandidateType {
    type Err = CandidateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "host" => Ok(Self::Host),
            "srflx" => Ok(Self::ServerReflexive),
            "prflx" => Ok(Self::PeerReflexive),
            "relay" => Ok(Self::Relay),
            other => Err(bad("type", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    Udp,
    Tcp,
}

impl TransportProtocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Udp => "udp",
            Self::Tcp => "tcp",
        }
    }
}

impl FromStr for TransportProtocol {
    type Err = CandidateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("udp") {
            Ok(Self::Udp)
        } else if s.eq_ignore_ascii_case("tcp") {
            Ok(Self::Tcp)
        } else {
            Err(bad("transport", s))
        }
    }
}

/// Parsed `candidate:` attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub foundation: String,
    /// 1 = RTP, 2 = RTCP (always 1 with rtcp-mux)
    pub component: u16,
    pub transport: TransportProtocol,
    pub priority: u32,
    pub address: SocketAddr,
    pub kind: CandidateType,
    /// Base address for reflexive and relay candidates
    pub related: Option<SocketAddr>,
}

impl Candidate {
    /// UDP candidate with a derived foundation and RFC 8445 priority
    pub fn new(kind: CandidateType, address: SocketAddr, component: u16) -> Self {
        let mut hasher = DefaultHasher::new();
        kind.hash(&mut hasher);
        address.ip().hash(&mut hasher);

        Self {
            foundation: (hasher.finish() % 1_000_000_000).to_string(),
            component,
            transport: TransportProtocol::Udp,
            priority: Self::priority_for(kind, component),
            address,
            kind,
            related: None,
        }
    }

    /// (2^24) * type preference + (2^8) * local preference + (256 - component)
    pub fn priority_for(kind: CandidateType, component: u16) -> u32 {
        const LOCAL_PREFERENCE: u32 = 65535;
        (kind.type_preference() << 24) + (LOCAL_PREFERENCE << 8) + (256 - u32::from(component))
    }

    /// Fields that identify the candidate; priority and extensions are left out
    pub fn dedup_key(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            self.foundation,
            self.component,
            self.transport.as_str(),
            self.address,
            self.kind.as_str()
        )
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "candidate:{} {} {} {} {} {} typ {}",
            self.foundation,
            self.component,
            self.transport.as_str().to_uppercase(),
            self.priority,
            self.address.ip(),
            self.address.port(),
            self.kind.as_str()
        )?;
        if let Some(related) = self.related {
            write!(f, " raddr {} rport {}", related.ip(), related.port())?;
        }
        Ok(())
    }
}

/// Accepts the line with or without the `a=` and `candidate:` prefixes
impl FromStr for Candidate {
    type Err = CandidateError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let line = line.strip_prefix("a=").unwrap_or(line);
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 8 {
            return Err(CandidateError::TooShort(fields.len()));
        }

        let foundation = fields[0].strip_prefix("candidate:").unwrap_or(fields[0]);
        let component = fields[1].parse().map_err(|_| bad("component", fields[1]))?;
        let transport = fields[2].parse()?;
        let priority = fields[3].parse().map_err(|_| bad("priority", fields[3]))?;
        let port = fields[5].parse().map_err(|_| bad("port", fields[5]))?;
        let address = socket_addr(fields[4], port).ok_or_else(|| bad("address", fields[4]))?;
        let kind = attribute(&fields, "typ")
            .ok_or(CandidateError::MissingType)?
            .parse()?;

        let related = attribute(&fields, "raddr")
            .zip(attribute(&fields, "rport").and_then(|p| p.parse().ok()))
            .and_then(|(ip, port)| socket_addr(ip, port));

        Ok(Self {
            foundation: foundation.to_string(),
            component,
            transport,
            priority,
            address,
            kind,
            related,
        })
    }
}

fn attribute<'a>(fields: &[&'a str], name: &str) -> Option<&'a str> {
    let idx = fields.iter().position(|&f| f == name)?;
    fields.get(idx + 1).copied()
}

fn socket_addr(ip: &str, port: u16) -> Option<SocketAddr> {
    // IPv6 literals need brackets
    if ip.contains(':') {
        format!("[{}]:{}", ip, port).parse().ok()
    } else {
        format!("{}:{}", ip, port).parse().ok()
    }
}

/// Deduplication key for a raw candidate line.
///
/// Lines that cannot be parsed (mDNS hostnames, future extensions) fall back to
/// the whitespace-normalized text.
pub fn candidate_key(raw: &str) -> String {
    match raw.parse::<Candidate>() {
        Ok(candidate) => candidate.dedup_key(),
        Err(_) => raw.split_whitespace().collect::<Vec<_>>().join(" "),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_outranks_relay() {
        let host = Candidate::priority_for(CandidateType::Host, 1);
        let relay = Candidate::priority_for(CandidateType::Relay, 1);
        assert!(host > relay);
        assert_eq!(host, 2130706431);
    }

    #[test]
    fn test_generated_candidate_parses_back() {
        let address: SocketAddr = "10.0.0.7:50000".parse().unwrap();
        let candidate = Candidate::new(CandidateType::Host, address, 1);

        let parsed: Candidate = candidate.to_string().parse().unwrap();
        assert_eq!(parsed, candidate);
    }

    #[test]
    fn test_reflexive_candidate_keeps_base_address() {
        let line = "candidate:2 1 UDP 1694498815 203.0.113.1 45000 typ srflx raddr 10.0.0.7 rport 5000";
        let candidate: Candidate = line.parse().unwrap();

        assert_eq!(candidate.kind, CandidateType::ServerReflexive);
        assert_eq!(candidate.related, Some("10.0.0.7:5000".parse().unwrap()));
    }

    #[test]
    fn test_browser_extensions_do_not_change_identity() {
        let plain = "candidate:842163049 1 udp 1677729535 203.0.113.7 61523 typ srflx raddr 0.0.0.0 rport 0";
        let decorated = "a=candidate:842163049 1 UDP 1677729535 203.0.113.7 61523 typ srflx raddr 0.0.0.0 rport 0 generation 0 ufrag 3c0V network-cost 999";
        assert_eq!(candidate_key(plain), candidate_key(decorated));
    }

    #[test]
    fn test_ipv6_candidate() {
        let candidate: Candidate = "candidate:1 1 udp 2122262783 2001:db8::1 50000 typ host"
            .parse()
            .unwrap();
        assert!(candidate.address.is_ipv6());
    }

    #[test]
    fn test_malformed_lines_are_rejected() {
        assert_eq!(
            "candidate:1 1 udp".parse::<Candidate>(),
            Err(CandidateError::TooShort(3))
        );
        assert_eq!(
            "candidate:1 1 sctp 1 10.0.0.1 9 typ host".parse::<Candidate>(),
            Err(bad("transport", "sctp"))
        );
        assert_eq!(
            "candidate:1 1 udp 1 10.0.0.1 9 kind host".parse::<Candidate>(),
            Err(CandidateError::MissingType)
        );
    }

    #[test]
    fn test_unparseable_candidate_falls_back_to_text() {
        let mdns = "candidate:1  1 udp 2122262783 3f1c.local 50000 typ host";
        assert_eq!(
            candidate_key(mdns),
            "candidate:1 1 udp 2122262783 3f1c.local 50000 typ host"
        );
    }
}
