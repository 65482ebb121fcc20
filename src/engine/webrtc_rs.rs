//! Engine backend over webrtc-rs

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::ice::mdns::MulticastDnsMode;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpHeaderExtensionCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::sdp::extmap::{SDES_MID_URI, SDES_REPAIR_RTP_STREAM_ID_URI, SDES_RTP_STREAM_ID_URI};
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::TrackLocal;

use super::{
    Direction, EngineEvent, EngineEventSender, IceConnectionState, IceGatheringState, MediaTrack,
    OfferOptions, PeerConnection, SdpType,
};
use crate::config::{HandlerConfig, IceServer, IceTransportPolicy};
use crate::error::{HandlerError, Result};
use crate::rtp_parameters::MediaKind;

/// Sending track of a [`WebRtcPeerConnection`]
///
/// A simulcast track holds one rid-tagged `TrackLocal` per encoding, lowest
/// resolution first. All of them share the track id, stream id and kind, and
/// whatever produces the media writes each layer to its own encoding.
#[derive(Clone)]
pub struct WebRtcTrack {
    /// Never empty
    encodings: Vec<Arc<dyn TrackLocal + Send + Sync>>,
}

impl WebRtcTrack {
    pub fn new(track: Arc<dyn TrackLocal + Send + Sync>) -> Self {
        Self {
            encodings: vec![track],
        }
    }

    pub fn simulcast(encodings: Vec<Arc<dyn TrackLocal + Send + Sync>>) -> Result<Self> {
        let base = encodings.first().ok_or_else(|| {
            HandlerError::InvalidParameters("simulcast track without encodings".to_string())
        })?;
        for encoding in &encodings {
            if encoding.rid().is_none() {
                return Err(HandlerError::InvalidParameters(format!(
                    "simulcast encoding of track {} has no rid",
                    base.id()
                )));
            }
            if encoding.id() != base.id()
                || encoding.stream_id() != base.stream_id()
                || encoding.kind() != base.kind()
            {
                return Err(HandlerError::InvalidParameters(format!(
                    "simulcast encodings of track {} differ in id, stream or kind",
                    base.id()
                )));
            }
        }
        Ok(Self { encodings })
    }

    pub fn encodings(&self) -> &[Arc<dyn TrackLocal + Send + Sync>] {
        &self.encodings
    }

    fn base(&self) -> &Arc<dyn TrackLocal + Send + Sync> {
        &self.encodings[0]
    }
}

impl From<Arc<dyn TrackLocal + Send + Sync>> for WebRtcTrack {
    fn from(track: Arc<dyn TrackLocal + Send + Sync>) -> Self {
        Self::new(track)
    }
}

impl MediaTrack for WebRtcTrack {
    fn id(&self) -> String {
        self.base().id().to_string()
    }

    fn kind(&self) -> MediaKind {
        match self.base().kind() {
            RTPCodecType::Audio => MediaKind::Audio,
            _ => MediaKind::Video,
        }
    }
}

fn codec_type(kind: MediaKind) -> RTPCodecType {
    match kind {
        MediaKind::Audio => RTPCodecType::Audio,
        MediaKind::Video => RTPCodecType::Video,
    }
}

fn transceiver_direction(direction: Direction) -> RTCRtpTransceiverDirection {
    match direction {
        Direction::SendRecv => RTCRtpTransceiverDirection::Sendrecv,
        Direction::SendOnly => RTCRtpTransceiverDirection::Sendonly,
        Direction::RecvOnly => RTCRtpTransceiverDirection::Recvonly,
        Direction::Inactive => RTCRtpTransceiverDirection::Inactive,
    }
}

fn ice_connection_state(state: RTCIceConnectionState) -> Option<IceConnectionState> {
    Some(match state {
        RTCIceConnectionState::New => IceConnectionState::New,
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
        _ => return None,
    })
}

fn ice_gathering_state(state: RTCIceGathererState) -> Option<IceGatheringState> {
    Some(match state {
        RTCIceGathererState::New => IceGatheringState::New,
        RTCIceGathererState::Gathering => IceGatheringState::Gathering,
        RTCIceGathererState::Complete => IceGatheringState::Complete,
        _ => return None,
    })
}

fn rtc_ice_servers(ice_servers: &[IceServer]) -> Vec<RTCIceServer> {
    ice_servers
        .iter()
        .map(|server| RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}

/// mDNS candidate mode from `proprietaryConstraints.mdnsMode`
/// (`disabled`, `query`, `gather`); defaults to disabled
fn mdns_mode(constraints: &Value) -> MulticastDnsMode {
    match constraints.get("mdnsMode").and_then(Value::as_str) {
        Some("query") => MulticastDnsMode::QueryOnly,
        Some("gather") => MulticastDnsMode::QueryAndGather,
        _ => MulticastDnsMode::Disabled,
    }
}

fn session_description(sdp_type: SdpType, sdp: String) -> Result<RTCSessionDescription> {
    let description = match sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(sdp),
        SdpType::Answer => RTCSessionDescription::answer(sdp),
    };
    description.map_err(|e| HandlerError::Sdp(format!("Invalid SDP {}: {}", sdp_type, e)))
}

/// Engine connection backed by a webrtc-rs `RTCPeerConnection`
pub struct WebRtcPeerConnection {
    pc: Arc<RTCPeerConnection>,
    /// Sending transceivers by track id
    senders: Mutex<HashMap<String, Arc<RTCRtpTransceiver>>>,
    /// Encoding activity requested per sending track
    encodings_active: Mutex<HashMap<String, Vec<bool>>>,
}

impl WebRtcPeerConnection {
    /// Encoding activity last requested for a sending track
    ///
    /// webrtc-rs cannot toggle encodings on a sender, so whatever feeds the
    /// track reads this to decide which layers to produce.
    pub fn encodings_active(&self, track_id: &str) -> Option<Vec<bool>> {
        self.encodings_active.lock().get(track_id).cloned()
    }

    /// Underlying webrtc-rs connection
    pub fn inner(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }

    fn sender(&self, track_id: &str) -> Result<Arc<RTCRtpTransceiver>> {
        self.senders
            .lock()
            .get(track_id)
            .cloned()
            .ok_or_else(|| HandlerError::Engine(format!("No sender for track {}", track_id)))
    }

    async fn transceiver_by_mid(&self, mid: &str) -> Option<Arc<RTCRtpTransceiver>> {
        for transceiver in self.pc.get_transceivers().await {
            if transceiver.mid().as_deref() == Some(mid) {
                return Some(transceiver);
            }
        }
        None
    }

    fn setup_event_handlers(&self, events: EngineEventSender) {
        let ice_events = events.clone();
        self.pc
            .on_ice_connection_state_change(Box::new(move |s: RTCIceConnectionState| {
                let events = ice_events.clone();

                Box::pin(async move {
                    if let Some(state) = ice_connection_state(s) {
                        debug!("ICE connection state: {}", state);
                        let _ = events.send(EngineEvent::IceConnectionStateChange(state));
                    }
                })
            }));

        self.pc
            .on_ice_gathering_state_change(Box::new(move |s: RTCIceGathererState| {
                let events = events.clone();

                Box::pin(async move {
                    if let Some(state) = ice_gathering_state(s) {
                        debug!("ICE gathering state: {}", state);
                        let _ = events.send(EngineEvent::IceGatheringStateChange(state));
                    }
                })
            }));
    }
}

#[async_trait]
impl PeerConnection for WebRtcPeerConnection {
    type LocalTrack = WebRtcTrack;
    /// Tracks appear on the receiver once RTP arrives
    type RemoteTrack = Arc<RTCRtpReceiver>;

    fn name() -> &'static str {
        "webrtc-rs"
    }

    async fn connect(config: &HandlerConfig, events: EngineEventSender) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| HandlerError::Engine(format!("Failed to register codecs: {}", e)))?;

        // mid for every section, rid and repaired rid for simulcast video
        let extensions = [
            (SDES_MID_URI, RTPCodecType::Audio),
            (SDES_MID_URI, RTPCodecType::Video),
            (SDES_RTP_STREAM_ID_URI, RTPCodecType::Video),
            (SDES_REPAIR_RTP_STREAM_ID_URI, RTPCodecType::Video),
        ];
        for (uri, kind) in extensions {
            media_engine
                .register_header_extension(
                    RTCRtpHeaderExtensionCapability {
                        uri: uri.to_owned(),
                    },
                    kind,
                    None,
                )
                .map_err(|e| {
                    HandlerError::Engine(format!("Failed to register extension {}: {}", uri, e))
                })?;
        }

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(|e| {
            HandlerError::Engine(format!("Failed to register interceptors: {}", e))
        })?;

        let mut setting_engine = SettingEngine::default();
        setting_engine.set_ice_multicast_dns_mode(mdns_mode(&config.proprietary_constraints));

        let api = APIBuilder::new()
            .with_setting_engine(setting_engine)
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: rtc_ice_servers(&config.ice_servers),
            ice_transport_policy: match config.ice_transport_policy {
                IceTransportPolicy::All => RTCIceTransportPolicy::All,
                IceTransportPolicy::Relay => RTCIceTransportPolicy::Relay,
            },
            bundle_policy: RTCBundlePolicy::MaxBundle,
            rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
            ..Default::default()
        };

        let pc = api.new_peer_connection(rtc_config).await.map_err(|e| {
            HandlerError::Engine(format!("Failed to create peer connection: {}", e))
        })?;

        let connection = Self {
            pc: Arc::new(pc),
            senders: Mutex::new(HashMap::new()),
            encodings_active: Mutex::new(HashMap::new()),
        };
        connection.setup_event_handlers(events);

        info!(
            "webrtc-rs connection created ({} ICE servers, policy {})",
            config.ice_servers.len(),
            config.ice_transport_policy
        );
        Ok(connection)
    }

    async fn add_track(&self, track: Self::LocalTrack, encodings: usize) -> Result<()> {
        let track_id = MediaTrack::id(&track);
        if encodings > track.encodings.len() {
            return Err(HandlerError::InvalidParameters(format!(
                "track {} has {} encodings, {} requested",
                track_id,
                track.encodings.len(),
                encodings
            )));
        }

        // add_transceiver_from_track ignores send_encodings, extra layers go
        // through the sender
        let mut layers = track.encodings.into_iter().take(encodings.max(1));
        let base = layers.next().ok_or_else(|| {
            HandlerError::InvalidParameters(format!("track {} has no encodings", track_id))
        })?;
        let transceiver = self
            .pc
            .add_transceiver_from_track(
                base,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Sendonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(|e| HandlerError::Engine(format!("Failed to add track: {}", e)))?;

        let sender = transceiver.sender().await;
        for layer in layers {
            let rid = layer.rid().unwrap_or_default().to_string();
            if let Err(e) = sender.add_encoding(layer).await {
                if let Err(detach) = self.pc.remove_track(&sender).await {
                    warn!("Failed to detach track {}: {}", track_id, detach);
                }
                return Err(HandlerError::Engine(format!(
                    "Failed to add encoding {} to track {}: {}",
                    rid, track_id, e
                )));
            }
        }

        self.senders.lock().insert(track_id, transceiver);
        Ok(())
    }

    async fn remove_track(&self, track_id: &str) -> Result<()> {
        let transceiver = self.sender(track_id)?;
        let sender = transceiver.sender().await;
        self.pc
            .remove_track(&sender)
            .await
            .map_err(|e| HandlerError::Engine(format!("Failed to remove track: {}", e)))?;

        self.senders.lock().remove(track_id);
        self.encodings_active.lock().remove(track_id);
        Ok(())
    }

    async fn replace_track(&self, track_id: &str, new_track: Self::LocalTrack) -> Result<()> {
        let transceiver = self.sender(track_id)?;
        let new_id = MediaTrack::id(&new_track);
        if new_track.encodings.len() > 1 {
            return Err(HandlerError::InvalidParameters(format!(
                "cannot replace track {} with simulcast track {}",
                track_id, new_id
            )));
        }
        transceiver
            .sender()
            .await
            .replace_track(Some(Arc::clone(new_track.base())))
            .await
            .map_err(|e| HandlerError::Engine(format!("Failed to replace track: {}", e)))?;

        let mut senders = self.senders.lock();
        senders.remove(track_id);
        senders.insert(new_id.clone(), transceiver);
        drop(senders);

        let mut encodings = self.encodings_active.lock();
        if let Some(active) = encodings.remove(track_id) {
            encodings.insert(new_id, active);
        }
        Ok(())
    }

    async fn add_transceiver(&self, kind: MediaKind, direction: Direction) -> Result<()> {
        self.pc
            .add_transceiver_from_kind(
                codec_type(kind),
                Some(RTCRtpTransceiverInit {
                    direction: transceiver_direction(direction),
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(|e| HandlerError::Engine(format!("Failed to add transceiver: {}", e)))?;
        Ok(())
    }

    async fn set_encodings_active(&self, track_id: &str, active: Vec<bool>) -> Result<()> {
        self.sender(track_id)?;
        debug!("Encodings of track {}: {:?}", track_id, active);
        self.encodings_active
            .lock()
            .insert(track_id.to_string(), active);
        Ok(())
    }

    async fn create_offer(&self, options: OfferOptions) -> Result<String> {
        let offer = self
            .pc
            .create_offer(Some(RTCOfferOptions {
                ice_restart: options.ice_restart,
                ..Default::default()
            }))
            .await
            .map_err(|e| HandlerError::NegotiationFailed(format!("Failed to create offer: {}", e)))?;
        Ok(offer.sdp)
    }

    async fn create_answer(&self) -> Result<String> {
        let answer = self.pc.create_answer(None).await.map_err(|e| {
            HandlerError::NegotiationFailed(format!("Failed to create answer: {}", e))
        })?;
        Ok(answer.sdp)
    }

    async fn set_local_description(&self, sdp_type: SdpType, sdp: String) -> Result<()> {
        let description = session_description(sdp_type, sdp)?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(|e| {
                HandlerError::NegotiationFailed(format!("Failed to set local description: {}", e))
            })
    }

    async fn set_remote_description(&self, sdp_type: SdpType, sdp: String) -> Result<()> {
        let description = session_description(sdp_type, sdp)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(|e| {
                HandlerError::NegotiationFailed(format!("Failed to set remote description: {}", e))
            })
    }

    async fn local_description(&self) -> Option<String> {
        self.pc.local_description().await.map(|d| d.sdp)
    }

    async fn remote_track(&self, mid: &str) -> Option<Self::RemoteTrack> {
        let transceiver = self.transceiver_by_mid(mid).await?;
        Some(transceiver.receiver().await)
    }

    async fn stats(&self) -> Result<Value> {
        let report = self.pc.get_stats().await;
        Ok(serde_json::to_value(&report)?)
    }

    async fn sender_stats(&self, track_id: &str) -> Result<Value> {
        let transceiver = self.sender(track_id)?;
        let parameters = transceiver.sender().await.get_parameters().await;
        let ssrcs: Vec<u32> = parameters.encodings.iter().map(|e| e.ssrc).collect();

        let report = self.pc.get_stats().await;
        let mut stats = Map::new();
        for (id, entry) in report.reports.iter() {
            if let StatsReportType::OutboundRTP(outbound) = entry {
                if ssrcs.contains(&outbound.ssrc) {
                    stats.insert(id.clone(), serde_json::to_value(outbound)?);
                }
            }
        }
        Ok(Value::Object(stats))
    }

    async fn receiver_stats(&self, mid: &str) -> Result<Value> {
        let transceiver = self
            .transceiver_by_mid(mid)
            .await
            .ok_or_else(|| HandlerError::Engine(format!("No receiver for mid {}", mid)))?;
        let ssrcs: Vec<u32> = transceiver
            .receiver()
            .await
            .tracks()
            .await
            .iter()
            .map(|t| t.ssrc())
            .collect();

        let report = self.pc.get_stats().await;
        let mut stats = Map::new();
        for (id, entry) in report.reports.iter() {
            if let StatsReportType::InboundRTP(inbound) = entry {
                if ssrcs.contains(&inbound.ssrc) {
                    stats.insert(id.clone(), serde_json::to_value(inbound)?);
                }
            }
        }
        Ok(Value::Object(stats))
    }

    async fn set_ice_servers(&self, ice_servers: &[IceServer]) -> Result<()> {
        let mut configuration = self.pc.get_configuration().await;
        configuration.ice_servers = rtc_ice_servers(ice_servers);
        self.pc
            .set_configuration(configuration)
            .await
            .map_err(|e| HandlerError::Engine(format!("Failed to update ICE servers: {}", e)))
    }

    async fn close(&self) -> Result<()> {
        self.senders.lock().clear();
        self.pc
            .close()
            .await
            .map_err(|e| HandlerError::Engine(format!("Failed to close peer connection: {}", e)))
    }
}
