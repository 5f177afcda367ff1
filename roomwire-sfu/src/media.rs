//! Media descriptions exchanged between clients, the SFU and the engine
//!
//! Only the fields the orchestration layer needs to reason about are typed.
//! ICE and DTLS payloads are carried as opaque JSON and passed through as-is.

use crate::types::MediaKind;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A codec a router or receiver supports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub kind: MediaKind,
    pub mime_type: String,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_payload_type: Option<u8>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
}

impl RtpCodecCapability {
    /// Build an audio codec capability
    pub fn audio(mime_type: impl Into<String>, clock_rate: u32, channels: u8) -> Self {
        Self {
            kind: MediaKind::Audio,
            mime_type: mime_type.into(),
            clock_rate,
            channels: Some(channels),
            preferred_payload_type: None,
            parameters: Map::new(),
        }
    }

    /// Build a video codec capability
    pub fn video(mime_type: impl Into<String>, clock_rate: u32) -> Self {
        Self {
            kind: MediaKind::Video,
            mime_type: mime_type.into(),
            clock_rate,
            channels: None,
            preferred_payload_type: None,
            parameters: Map::new(),
        }
    }

    #[must_use]
    pub fn with_parameter(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.to_string(), value.into());
        self
    }

    /// Whether an encoding described by `codec` can be decoded with this capability
    #[must_use]
    pub fn accepts(&self, codec: &RtpCodecParameters) -> bool {
        self.mime_type.eq_ignore_ascii_case(&codec.mime_type)
            && self.clock_rate == codec.clock_rate
            && match (self.channels, codec.channels) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            }
    }
}

/// Declared set of codecs an endpoint supports
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilities {
    #[serde(default)]
    pub codecs: Vec<RtpCodecCapability>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub header_extensions: Vec<Value>,
}

impl RtpCapabilities {
    #[must_use]
    pub fn new(codecs: Vec<RtpCodecCapability>) -> Self {
        Self {
            codecs,
            header_extensions: Vec::new(),
        }
    }

    /// Whether any declared codec accepts the given encoding
    #[must_use]
    pub fn supports(&self, codec: &RtpCodecParameters) -> bool {
        self.codecs.iter().any(|c| c.accepts(codec))
    }
}

/// One negotiated codec inside [`RtpParameters`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecParameters {
    pub mime_type: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
}

impl RtpCodecParameters {
    /// Retransmission entries ride along with a media codec and never decide compatibility
    #[must_use]
    pub fn is_rtx(&self) -> bool {
        self.mime_type
            .rsplit('/')
            .next()
            .is_some_and(|name| name.eq_ignore_ascii_case("rtx"))
    }
}

/// Parameters of a sent or received RTP stream
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    pub codecs: Vec<RtpCodecParameters>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub header_extensions: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub encodings: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtcp: Option<Value>,
}

impl RtpParameters {
    /// The first non-RTX codec, which identifies the stream's media format
    #[must_use]
    pub fn media_codec(&self) -> Option<&RtpCodecParameters> {
        self.codecs.iter().find(|c| !c.is_rtx())
    }
}

/// DTLS parameters supplied by a client when connecting a transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DtlsParameters(pub Value);

/// Connection parameters of a freshly created transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParameters {
    pub ice_parameters: Value,
    pub ice_candidates: Vec<Value>,
    pub dtls_parameters: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sctp_parameters: Option<Value>,
}

/// Codecs a router is created with when nothing else is configured
#[must_use]
pub fn default_media_codecs() -> Vec<RtpCodecCapability> {
    vec![
        RtpCodecCapability::audio("audio/opus", 48000, 2),
        RtpCodecCapability::video("video/VP8", 90000),
        RtpCodecCapability::video("video/H264", 90000)
            .with_parameter("packetization-mode", 1)
            .with_parameter("profile-level-id", "42e01f")
            .with_parameter("level-asymmetry-allowed", 1),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn opus_params() -> RtpCodecParameters {
        RtpCodecParameters {
            mime_type: "audio/opus".to_string(),
            payload_type: 111,
            clock_rate: 48000,
            channels: Some(2),
            parameters: Map::new(),
        }
    }

    #[test]
    fn test_capability_matching_ignores_mime_case() {
        let caps = RtpCapabilities::new(vec![RtpCodecCapability::audio("audio/OPUS", 48000, 2)]);
        assert!(caps.supports(&opus_params()));
    }

    #[test]
    fn test_capability_rejects_other_clock_rate() {
        let caps = RtpCapabilities::new(vec![RtpCodecCapability::audio("audio/opus", 16000, 2)]);
        assert!(!caps.supports(&opus_params()));
    }

    #[test]
    fn test_media_codec_skips_rtx() {
        let params: RtpParameters = serde_json::from_value(json!({
            "codecs": [
                { "mimeType": "video/rtx", "payloadType": 97, "clockRate": 90000 },
                { "mimeType": "video/VP8", "payloadType": 96, "clockRate": 90000 }
            ]
        }))
        .unwrap();

        assert_eq!(params.media_codec().unwrap().mime_type, "video/VP8");
    }

    #[test]
    fn test_default_codecs_cover_both_kinds() {
        let codecs = default_media_codecs();
        assert!(codecs.iter().any(|c| c.kind == MediaKind::Audio));
        assert!(codecs.iter().any(|c| c.kind == MediaKind::Video));
    }
}
