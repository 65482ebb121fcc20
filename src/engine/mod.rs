//! Media engine seam
//!
//! The handlers never touch ICE, DTLS or SRTP themselves. They drive an
//! engine connection through the [`PeerConnection`] trait and observe its
//! state transitions through an [`EngineEvent`] channel:
//!
//! ```text
//! SendHandler / RecvHandler
//!        |
//!        | add/remove tracks, offer/answer, stats
//!        v
//! PeerConnection (webrtc-rs, or any other engine)
//!        |
//!        | EngineEvent (mpsc, drained by the handler owner)
//!        v
//! HandlerListener::on_connection_state_change
//! ```

mod state;
#[cfg(test)]
pub(crate) mod testing;
pub mod webrtc_rs;

pub use state::{IceConnectionState, IceGatheringState};
pub use webrtc_rs::{WebRtcPeerConnection, WebRtcTrack};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::config::{HandlerConfig, IceServer};
use crate::error::Result;
use crate::rtp_parameters::MediaKind;

/// Notification pushed by the engine connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEvent {
    IceConnectionStateChange(IceConnectionState),
    IceGatheringStateChange(IceGatheringState),
}

/// Sending half of the engine event channel
pub type EngineEventSender = mpsc::UnboundedSender<EngineEvent>;
/// Receiving half of the engine event channel, owned by the handler
pub type EngineEventReceiver = mpsc::UnboundedReceiver<EngineEvent>;

/// Create a new engine event channel
pub fn event_channel() -> (EngineEventSender, EngineEventReceiver) {
    mpsc::unbounded_channel()
}

/// Which description of an offer/answer exchange is being applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpType {
    Offer,
    Answer,
}

impl std::fmt::Display for SdpType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SdpType::Offer => write!(f, "offer"),
            SdpType::Answer => write!(f, "answer"),
        }
    }
}

/// Options for creating a local offer
#[derive(Debug, Clone, Copy, Default)]
pub struct OfferOptions {
    /// Generate fresh ICE credentials
    pub ice_restart: bool,
}

/// Transceiver direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::SendRecv => "sendrecv",
            Direction::SendOnly => "sendonly",
            Direction::RecvOnly => "recvonly",
            Direction::Inactive => "inactive",
        }
    }

    pub fn from_sdp(value: &str) -> Option<Self> {
        match value {
            "sendrecv" => Some(Direction::SendRecv),
            "sendonly" => Some(Direction::SendOnly),
            "recvonly" => Some(Direction::RecvOnly),
            "inactive" => Some(Direction::Inactive),
            _ => None,
        }
    }
}

/// A local media track that can be handed to an engine connection
///
/// Handlers key tracks by [`MediaTrack::id`], so the id is the track identity.
pub trait MediaTrack: Clone + Send + Sync + 'static {
    fn id(&self) -> String;
    fn kind(&self) -> MediaKind;
}

/// Engine connection driven by the handlers
///
/// One connection carries every track of a transport. Offer/answer steps are
/// awaited one at a time; the handler guarantees that no two exchanges on the
/// same connection overlap.
#[async_trait]
pub trait PeerConnection: Sized + Send + Sync + 'static {
    /// Track type accepted for sending
    type LocalTrack: MediaTrack;
    /// Handle to the incoming media of a negotiated receiving transceiver
    type RemoteTrack: Clone + Send + Sync + 'static;

    /// Engine name
    fn name() -> &'static str;

    /// Build a connection; state notifications go to `events`
    async fn connect(config: &HandlerConfig, events: EngineEventSender) -> Result<Self>;

    /// Attach a sending track on a new transceiver
    ///
    /// With more than one `encodings` the engine announces them itself in its
    /// next offer, one `a=rid` and one SSRC (plus RTX) per encoding.
    async fn add_track(&self, track: Self::LocalTrack, encodings: usize) -> Result<()>;

    /// Detach a sending track; its transceiver stops sending
    async fn remove_track(&self, track_id: &str) -> Result<()>;

    /// Swap the media source of a sender without renegotiation
    async fn replace_track(&self, track_id: &str, new_track: Self::LocalTrack) -> Result<()>;

    /// Add a transceiver without a track
    async fn add_transceiver(&self, kind: MediaKind, direction: Direction) -> Result<()>;

    /// Enable or disable individual encodings of a sender
    async fn set_encodings_active(&self, track_id: &str, active: Vec<bool>) -> Result<()>;

    async fn create_offer(&self, options: OfferOptions) -> Result<String>;

    async fn create_answer(&self) -> Result<String>;

    async fn set_local_description(&self, sdp_type: SdpType, sdp: String) -> Result<()>;

    async fn set_remote_description(&self, sdp_type: SdpType, sdp: String) -> Result<()>;

    /// Applied local description, with the candidates gathered so far
    async fn local_description(&self) -> Option<String>;

    /// Receiving side of the transceiver negotiated with `mid`
    ///
    /// Available as soon as the local answer covering `mid` is applied, before
    /// any media flows.
    async fn remote_track(&self, mid: &str) -> Option<Self::RemoteTrack>;

    /// Full stats report
    async fn stats(&self) -> Result<Value>;

    /// Stats of one sender
    async fn sender_stats(&self, track_id: &str) -> Result<Value>;

    /// Stats of the receiver negotiated with `mid`
    async fn receiver_stats(&self, mid: &str) -> Result<Value>;

    async fn set_ice_servers(&self, ice_servers: &[IceServer]) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
