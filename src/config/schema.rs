use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::rtp_parameters::{
    MediaKind, RtcpFeedback, RtcpParameters, RtpCodecParameters, RtpHeaderExtensionParameters,
    RtpParameters,
};

/// Handler configuration
///
/// Everything a Send/RecvHandler needs to build its engine connection, plus
/// the per-kind RTP templates used when sending.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HandlerConfig {
    /// STUN/TURN servers
    pub ice_servers: Vec<IceServer>,
    /// Which candidates the engine may use
    pub ice_transport_policy: IceTransportPolicy,
    /// Engine specific constraints, passed through untouched
    pub proprietary_constraints: Value,
    /// Sending RTP parameter templates for audio and video
    pub sending_rtp_parameters_by_kind: HashMap<MediaKind, RtpParameters>,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        let mut sending_rtp_parameters_by_kind = HashMap::new();
        sending_rtp_parameters_by_kind.insert(MediaKind::Audio, default_audio_parameters());
        sending_rtp_parameters_by_kind.insert(MediaKind::Video, default_video_parameters());

        Self {
            ice_servers: vec![],
            ice_transport_policy: IceTransportPolicy::All,
            proprietary_constraints: Value::Object(Default::default()),
            sending_rtp_parameters_by_kind,
        }
    }
}

/// STUN/TURN server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// Server URLs (e.g. ["turn:turn.example.com:3478?transport=udp"])
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    pub fn turn(url: impl Into<String>, username: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }
}

/// ICE transport policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IceTransportPolicy {
    #[default]
    All,
    Relay,
}

impl std::fmt::Display for IceTransportPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IceTransportPolicy::All => write!(f, "all"),
            IceTransportPolicy::Relay => write!(f, "relay"),
        }
    }
}

const MID_URI: &str = "urn:ietf:params:rtp-hdrext:sdes:mid";
const RID_URI: &str = "urn:ietf:params:rtp-hdrext:sdes:rtp-stream-id";
const REPAIRED_RID_URI: &str = "urn:ietf:params:rtp-hdrext:sdes:repaired-rtp-stream-id";
const AUDIO_LEVEL_URI: &str = "urn:ietf:params:rtp-hdrext:ssrc-audio-level";
const ABS_SEND_TIME_URI: &str = "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time";
const TRANSPORT_CC_URI: &str =
    "http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01";

fn header_extension(uri: &str, id: u16) -> RtpHeaderExtensionParameters {
    RtpHeaderExtensionParameters {
        uri: uri.to_string(),
        id,
        encrypt: false,
    }
}

fn default_audio_parameters() -> RtpParameters {
    RtpParameters {
        mid: None,
        codecs: vec![RtpCodecParameters::new("audio/opus", 111, 48000)
            .with_channels(2)
            .with_parameter("minptime", 10)
            .with_parameter("useinbandfec", 1)
            .with_feedback(RtcpFeedback::new("transport-cc", ""))],
        header_extensions: vec![
            header_extension(MID_URI, 1),
            header_extension(AUDIO_LEVEL_URI, 10),
        ],
        encodings: vec![],
        rtcp: RtcpParameters::default(),
    }
}

fn default_video_parameters() -> RtpParameters {
    RtpParameters {
        mid: None,
        codecs: vec![
            RtpCodecParameters::new("video/VP8", 96, 90000)
                .with_feedback(RtcpFeedback::new("goog-remb", ""))
                .with_feedback(RtcpFeedback::new("transport-cc", ""))
                .with_feedback(RtcpFeedback::new("ccm", "fir"))
                .with_feedback(RtcpFeedback::new("nack", ""))
                .with_feedback(RtcpFeedback::new("nack", "pli")),
            RtpCodecParameters::new("video/rtx", 97, 90000).with_parameter("apt", 96),
        ],
        header_extensions: vec![
            header_extension(MID_URI, 1),
            header_extension(ABS_SEND_TIME_URI, 3),
            header_extension(TRANSPORT_CC_URI, 5),
            header_extension(RID_URI, 10),
            header_extension(REPAIRED_RID_URI, 11),
        ],
        encodings: vec![],
        rtcp: RtcpParameters::default(),
    }
}
