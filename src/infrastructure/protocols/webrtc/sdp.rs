/// Audio-only SDP builder and parser
///
/// Produces the single-m-line, BUNDLE'd, rtcp-mux descriptions a browser
/// expects for a voice call, and extracts the ICE credentials and codecs back
/// out of a remote description.
use crate::domain::call::SdpKind;
use crate::infrastructure::protocols::ice::candidate::Candidate;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::fmt::Write as _;

/// Media direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaDirection {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl MediaDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaDirection::SendRecv => "sendrecv",
            MediaDirection::SendOnly => "sendonly",
            MediaDirection::RecvOnly => "recvonly",
            MediaDirection::Inactive => "inactive",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "sendrecv" => Some(MediaDirection::SendRecv),
            "sendonly" => Some(MediaDirection::SendOnly),
            "recvonly" => Some(MediaDirection::RecvOnly),
            "inactive" => Some(MediaDirection::Inactive),
            _ => None,
        }
    }
}

/// DTLS setup role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtlsSetup {
    Active,
    Passive,
    Actpass,
}

impl DtlsSetup {
    pub fn as_str(&self) -> &'static str {
        match self {
            DtlsSetup::Active => "active",
            DtlsSetup::Passive => "passive",
            DtlsSetup::Actpass => "actpass",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(DtlsSetup::Active),
            "passive" => Some(DtlsSetup::Passive),
            "actpass" => Some(DtlsSetup::Actpass),
            _ => None,
        }
    }
}

/// RTP audio codec
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioCodec {
    pub payload_type: u8,
    pub name: String,
    pub clock_rate: u32,
    pub channels: Option<u8>,
    pub fmtp: Option<String>,
}

impl AudioCodec {
    pub fn opus() -> Self {
        Self {
            payload_type: 111,
            name: "opus".to_string(),
            clock_rate: 48000,
            channels: Some(2),
            fmtp: Some("minptime=10;useinbandfec=1".to_string()),
        }
    }

    pub fn pcmu() -> Self {
        Self {
            payload_type: 0,
            name: "PCMU".to_string(),
            clock_rate: 8000,
            channels: None,
            fmtp: None,
        }
    }

    /// rtpmap value: "111 opus/48000/2"
    pub fn to_rtpmap(&self) -> String {
        match self.channels {
            Some(channels) => format!(
                "{} {}/{}/{}",
                self.payload_type, self.name, self.clock_rate, channels
            ),
            None => format!("{} {}/{}", self.payload_type, self.name, self.clock_rate),
        }
    }

    fn from_rtpmap(value: &str) -> Option<Self> {
        let (pt, encoding) = value.split_once(' ')?;
        let mut parts = encoding.split('/');
        let name = parts.next()?.to_string();
        let clock_rate = parts.next()?.parse().ok()?;
        let channels = parts.next().and_then(|c| c.parse().ok());
        Some(Self {
            payload_type: pt.parse().ok()?,
            name,
            clock_rate,
            channels,
            fmtp: None,
        })
    }
}

/// ICE username fragment and password
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCredentials {
    pub ufrag: String,
    pub pwd: String,
}

impl IceCredentials {
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut token = |len: usize| -> String {
            (&mut rng)
                .sample_iter(&Alphanumeric)
                .take(len)
                .map(char::from)
                .collect()
        };
        Self {
            ufrag: token(8),
            pwd: token(24),
        }
    }
}

/// One audio session description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioSdp {
    pub kind: SdpKind,
    pub session_id: u64,
    pub session_name: String,
    pub mid: String,
    pub direction: MediaDirection,
    pub credentials: IceCredentials,
    pub fingerprint: String,
    pub setup: DtlsSetup,
    pub codecs: Vec<AudioCodec>,
    pub candidates: Vec<Candidate>,
}

impl AudioSdp {
    /// Offer advertising Opus with PCMU fallback
    pub fn offer(credentials: IceCredentials) -> Self {
        Self {
            kind: SdpKind::Offer,
            session_id: rand::thread_rng().gen_range(1..i64::MAX as u64),
            session_name: "-".to_string(),
            mid: "0".to_string(),
            direction: MediaDirection::SendRecv,
            credentials,
            fingerprint: random_fingerprint(),
            setup: DtlsSetup::Actpass,
            codecs: vec![AudioCodec::opus(), AudioCodec::pcmu()],
            candidates: Vec::new(),
        }
    }

    /// Answer to `offer`, keeping only the codecs both sides support
    pub fn answer(offer: &AudioSdp, credentials: IceCredentials) -> Result<Self, String> {
        let supported = [AudioCodec::opus(), AudioCodec::pcmu()];
        let codecs: Vec<AudioCodec> = offer
            .codecs
            .iter()
            .filter_map(|offered| {
                supported
                    .iter()
                    .find(|c| c.name.eq_ignore_ascii_case(&offered.name) && c.clock_rate == offered.clock_rate)
                    .map(|c| AudioCodec {
                        payload_type: offered.payload_type,
                        ..c.clone()
                    })
            })
            .collect();

        if codecs.is_empty() {
            return Err("no common audio codec".to_string());
        }

        let direction = match offer.direction {
            MediaDirection::SendOnly => MediaDirection::RecvOnly,
            MediaDirection::RecvOnly => MediaDirection::SendOnly,
            other => other,
        };

        Ok(Self {
            kind: SdpKind::Answer,
            session_id: rand::thread_rng().gen_range(1..i64::MAX as u64),
            session_name: "-".to_string(),
            mid: offer.mid.clone(),
            direction,
            credentials,
            fingerprint: random_fingerprint(),
            setup: DtlsSetup::Active,
            codecs,
            candidates: Vec::new(),
        })
    }

    pub fn to_sdp_string(&self) -> String {
        let mut sdp = String::new();
        let payload_types: Vec<String> = self
            .codecs
            .iter()
            .map(|c| c.payload_type.to_string())
            .collect();

        // Writing into a String cannot fail
        let _ = write!(
            sdp,
            "v=0\r\n\
             o=- {id} 2 IN IP4 127.0.0.1\r\n\
             s={name}\r\n\
             t=0 0\r\n\
             a=group:BUNDLE {mid}\r\n\
             a=msid-semantic: WMS\r\n\
             m=audio 9 UDP/TLS/RTP/SAVPF {pts}\r\n\
             c=IN IP4 0.0.0.0\r\n\
             a=rtcp:9 IN IP4 0.0.0.0\r\n\
             a=ice-ufrag:{ufrag}\r\n\
             a=ice-pwd:{pwd}\r\n\
             a=ice-options:trickle\r\n\
             a=fingerprint:sha-256 {fp}\r\n\
             a=setup:{setup}\r\n\
             a=mid:{mid}\r\n\
             a={dir}\r\n\
             a=rtcp-mux\r\n",
            id = self.session_id,
            name = self.session_name,
            mid = self.mid,
            pts = payload_types.join(" "),
            ufrag = self.credentials.ufrag,
            pwd = self.credentials.pwd,
            fp = self.fingerprint,
            setup = self.setup.as_str(),
            dir = self.direction.as_str(),
        );

        for codec in &self.codecs {
            let _ = write!(sdp, "a=rtpmap:{}\r\n", codec.to_rtpmap());
            if let Some(ref fmtp) = codec.fmtp {
                let _ = write!(sdp, "a=fmtp:{} {}\r\n", codec.payload_type, fmtp);
            }
        }

        for candidate in &self.candidates {
            let _ = write!(sdp, "a={}\r\n", candidate);
        }

        sdp
    }

    /// Parse a remote description. Requires an audio m-line and ICE credentials.
    pub fn parse(sdp: &str, kind: SdpKind) -> Result<Self, String> {
        let mut session_id = 0;
        let mut session_name = "-".to_string();
        let mut mid = None;
        let mut direction = MediaDirection::SendRecv;
        let mut ufrag = None;
        let mut pwd = None;
        let mut fingerprint = None;
        let mut setup = None;
        let mut codecs = Vec::new();
        let mut candidates = Vec::new();
        let mut has_audio = false;

        for line in sdp.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if let Some(origin) = line.strip_prefix("o=") {
                session_id = origin
                    .split_whitespace()
                    .nth(1)
                    .and_then(|id| id.parse().ok())
                    .unwrap_or(0);
            } else if let Some(name) = line.strip_prefix("s=") {
                session_name = name.to_string();
            } else if let Some(media) = line.strip_prefix("m=") {
                has_audio |= media.starts_with("audio ");
            } else if let Some(attr) = line.strip_prefix("a=") {
                let (key, value) = attr.split_once(':').unwrap_or((attr, ""));
                match key {
                    "mid" => mid = Some(value.to_string()),
                    "ice-ufrag" => ufrag = Some(value.to_string()),
                    "ice-pwd" => pwd = Some(value.to_string()),
                    "fingerprint" => {
                        fingerprint = value.split_once(' ').map(|(_, fp)| fp.to_string())
                    }
                    "setup" => setup = DtlsSetup::parse(value),
                    "rtpmap" => codecs.extend(AudioCodec::from_rtpmap(value)),
                    "candidate" => {
                        if let Ok(candidate) = attr.parse::<Candidate>() {
                            candidates.push(candidate);
                        }
                    }
                    other => {
                        if let Some(dir) = MediaDirection::parse(other) {
                            direction = dir;
                        }
                    }
                }
            }
        }

        if !has_audio {
            return Err("description has no audio section".to_string());
        }

        Ok(Self {
            kind,
            session_id,
            session_name,
            mid: mid.unwrap_or_else(|| "0".to_string()),
            direction,
            credentials: IceCredentials {
                ufrag: ufrag.ok_or_else(|| "missing ice-ufrag".to_string())?,
                pwd: pwd.ok_or_else(|| "missing ice-pwd".to_string())?,
            },
            fingerprint: fingerprint.unwrap_or_default(),
            setup: setup.unwrap_or(DtlsSetup::Actpass),
            codecs,
            candidates,
        })
    }
}

fn random_fingerprint() -> String {
    let bytes: [u8; 32] = rand::thread_rng().gen();
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_rtpmap() {
        assert_eq!(AudioCodec::opus().to_rtpmap(), "111 opus/48000/2");
        assert_eq!(AudioCodec::pcmu().to_rtpmap(), "0 PCMU/8000");
    }

    #[test]
    fn test_offer_string() {
        let offer = AudioSdp::offer(IceCredentials {
            ufrag: "ufrag123".to_string(),
            pwd: "pwd456".to_string(),
        });
        let text = offer.to_sdp_string();

        assert!(text.starts_with("v=0\r\n"));
        assert!(text.contains("m=audio 9 UDP/TLS/RTP/SAVPF 111 0"));
        assert!(text.contains("a=ice-ufrag:ufrag123"));
        assert!(text.contains("a=rtcp-mux"));
        assert!(text.contains("a=setup:actpass"));
        assert!(text.contains("a=group:BUNDLE 0"));
    }

    #[test]
    fn test_parse_own_offer() {
        let offer = AudioSdp::offer(IceCredentials::generate());
        let parsed = AudioSdp::parse(&offer.to_sdp_string(), SdpKind::Offer).unwrap();

        assert_eq!(parsed.credentials, offer.credentials);
        assert_eq!(parsed.codecs.len(), 2);
        assert_eq!(parsed.setup, DtlsSetup::Actpass);
    }

    #[test]
    fn test_answer_negotiates_codecs() {
        let mut offer = AudioSdp::offer(IceCredentials::generate());
        offer.codecs.push(AudioCodec {
            payload_type: 9,
            name: "G722".to_string(),
            clock_rate: 8000,
            channels: None,
            fmtp: None,
        });

        let answer = AudioSdp::answer(&offer, IceCredentials::generate()).unwrap();
        assert_eq!(answer.kind, SdpKind::Answer);
        assert_eq!(answer.setup, DtlsSetup::Active);
        assert_eq!(answer.codecs.len(), 2);
    }

    #[test]
    fn test_answer_without_common_codec_fails() {
        let mut offer = AudioSdp::offer(IceCredentials::generate());
        offer.codecs.clear();
        assert!(AudioSdp::answer(&offer, IceCredentials::generate()).is_err());
    }

    #[test]
    fn test_parse_rejects_video_only() {
        let sdp = "v=0\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\na=ice-ufrag:a\r\na=ice-pwd:b\r\n";
        assert!(AudioSdp::parse(sdp, SdpKind::Offer).is_err());
    }
}
