//! RTP parameter and capability documents
//!
//! These mirror the JSON documents exchanged with the SFU, so every type
//! serializes with camelCase keys.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Media kind of a track or m-section
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }

    /// Parse the media field of an SDP m-line
    pub fn from_sdp(media: &str) -> Option<Self> {
        match media {
            "audio" => Some(MediaKind::Audio),
            "video" => Some(MediaKind::Video),
            _ => None,
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// RTCP feedback entry (`a=rtcp-fb`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtcpFeedback {
    #[serde(rename = "type")]
    pub typ: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parameter: String,
}

impl RtcpFeedback {
    pub fn new(typ: impl Into<String>, parameter: impl Into<String>) -> Self {
        Self {
            typ: typ.into(),
            parameter: parameter.into(),
        }
    }
}

/// Negotiated codec
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecParameters {
    pub mime_type: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub rtcp_feedback: Vec<RtcpFeedback>,
}

impl RtpCodecParameters {
    pub fn new(mime_type: impl Into<String>, payload_type: u8, clock_rate: u32) -> Self {
        Self {
            mime_type: mime_type.into(),
            payload_type,
            clock_rate,
            channels: None,
            parameters: Map::new(),
            rtcp_feedback: vec![],
        }
    }

    pub fn with_channels(mut self, channels: u8) -> Self {
        self.channels = Some(channels);
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_feedback(mut self, feedback: RtcpFeedback) -> Self {
        self.rtcp_feedback.push(feedback);
        self
    }

    /// Codec name as it appears in `a=rtpmap` (the part after the slash)
    pub fn codec_name(&self) -> &str {
        mime_subtype(&self.mime_type)
    }

    /// Whether this is a retransmission codec
    pub fn is_rtx(&self) -> bool {
        self.codec_name().eq_ignore_ascii_case("rtx")
    }

    /// Associated payload type of an RTX codec
    pub fn apt(&self) -> Option<u8> {
        self.parameters
            .get("apt")
            .and_then(value_as_u64)
            .and_then(|v| u8::try_from(v).ok())
    }

    /// Whether two codecs describe the same format, ignoring payload types
    pub fn matches(&self, mime_type: &str, clock_rate: u32, channels: Option<u8>) -> bool {
        self.mime_type.eq_ignore_ascii_case(mime_type)
            && self.clock_rate == clock_rate
            && self.channels.unwrap_or(1) == channels.unwrap_or(1)
    }
}

/// Negotiated RTP header extension
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpHeaderExtensionParameters {
    pub uri: String,
    pub id: u16,
    #[serde(default)]
    pub encrypt: bool,
}

/// Retransmission stream of an encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtxParameters {
    pub ssrc: u32,
}

fn default_true() -> bool {
    true
}

/// One RTP encoding (one per simulcast/spatial layer)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpEncodingParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssrc: Option<u32>,
    /// RTP stream id, set when simulcast is announced with `a=rid`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtx: Option<RtxParameters>,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bitrate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_resolution_down_by: Option<f64>,
}

impl RtpEncodingParameters {
    pub fn with_ssrc(ssrc: u32) -> Self {
        Self {
            ssrc: Some(ssrc),
            ..Default::default()
        }
    }
}

impl Default for RtpEncodingParameters {
    fn default() -> Self {
        Self {
            ssrc: None,
            rid: None,
            rtx: None,
            active: true,
            max_bitrate: None,
            scale_resolution_down_by: None,
        }
    }
}

/// RTCP settings of a stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtcpParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cname: Option<String>,
    #[serde(default = "default_true")]
    pub reduced_size: bool,
    #[serde(default = "default_true")]
    pub mux: bool,
}

impl Default for RtcpParameters {
    fn default() -> Self {
        Self {
            cname: None,
            reduced_size: true,
            mux: true,
        }
    }
}

/// Full RTP parameters of a sent or received stream
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    #[serde(default)]
    pub codecs: Vec<RtpCodecParameters>,
    #[serde(default)]
    pub header_extensions: Vec<RtpHeaderExtensionParameters>,
    #[serde(default)]
    pub encodings: Vec<RtpEncodingParameters>,
    #[serde(default)]
    pub rtcp: RtcpParameters,
}

impl RtpParameters {
    /// First media (non-RTX) codec
    pub fn primary_codec(&self) -> Option<&RtpCodecParameters> {
        self.codecs.iter().find(|c| !c.is_rtx())
    }

    /// SSRC of the first encoding
    pub fn ssrc(&self) -> Option<u32> {
        self.encodings.first().and_then(|e| e.ssrc)
    }

    /// RTX SSRC of the first encoding
    pub fn rtx_ssrc(&self) -> Option<u32> {
        self.encodings.first().and_then(|e| e.rtx).map(|r| r.ssrc)
    }
}

/// Codec supported by the local engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub kind: MediaKind,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_payload_type: Option<u8>,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub rtcp_feedback: Vec<RtcpFeedback>,
}

/// Header extension supported by the local engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpHeaderExtension {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<MediaKind>,
    pub uri: String,
    pub preferred_id: u16,
}

/// What the local engine can send and receive
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilities {
    #[serde(default)]
    pub codecs: Vec<RtpCodecCapability>,
    #[serde(default)]
    pub header_extensions: Vec<RtpHeaderExtension>,
}

/// Requested simulcast encoding, ordered low to high resolution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulcastLayer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bitrate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_resolution_down_by: Option<f64>,
}

impl SimulcastLayer {
    pub fn with_max_bitrate(max_bitrate: u32) -> Self {
        Self {
            max_bitrate: Some(max_bitrate),
            scale_resolution_down_by: None,
        }
    }
}

/// `video/VP8` -> `VP8`
pub fn mime_subtype(mime_type: &str) -> &str {
    mime_type
        .split_once('/')
        .map(|(_, name)| name)
        .unwrap_or(mime_type)
}

/// Accept both JSON numbers and numeric strings (fmtp values arrive as either)
pub fn value_as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Render codec parameters as an `a=fmtp` value (`k=v;k=v`, sorted by key)
pub fn format_fmtp(parameters: &Map<String, Value>) -> String {
    let mut keys: Vec<&String> = parameters.keys().collect();
    keys.sort();
    keys.iter()
        .map(|key| match &parameters[key.as_str()] {
            Value::String(s) => format!("{}={}", key, s),
            other => format!("{}={}", key, other),
        })
        .collect::<Vec<_>>()
        .join(";")
}

/// Parse an `a=fmtp` parameter list, keeping numbers as JSON numbers
pub fn parse_fmtp(config: &str) -> Map<String, Value> {
    let mut parameters = Map::new();
    for pair in config.split(';') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let (key, value) = match pair.split_once('=') {
            Some((k, v)) => (k.trim(), v.trim()),
            None => (pair, ""),
        };
        let value = match value.parse::<u64>() {
            Ok(n) => Value::from(n),
            Err(_) => Value::from(value),
        };
        parameters.insert(key.to_string(), value);
    }
    parameters
}
