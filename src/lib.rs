//! mediasoup-handler - SDP negotiation handlers for mediasoup transports
//!
//! Bridges the mediasoup model (transports, producers, consumers described by
//! RTP parameters) and a WebRTC engine that only speaks SDP offer/answer.
//! [`SendHandler`] and [`RecvHandler`] keep a synthesized remote description
//! in step with the engine's local one, one m-section per track.

pub mod config;
pub mod engine;
pub mod error;
pub mod handler;
pub mod rtp_parameters;
pub mod sdp;
pub mod transport;

pub use config::HandlerConfig;
pub use engine::{PeerConnection, WebRtcPeerConnection, WebRtcTrack};
pub use error::{HandlerError, Result};
pub use handler::{
    CloseHandle, Handler, HandlerListener, HandlerState, ReceiverInfo, RecvHandler, SendHandler,
    SendTrackEntry, TransportHandler,
};
