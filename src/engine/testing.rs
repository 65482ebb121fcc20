//! Scripted in-memory engine for handler tests
//!
//! Renders realistic unified-plan descriptions (Opus 111, VP8 96 + RTX 97),
//! records every call, and can be told to reject the next remote description
//! or to stall description steps so that close/cancel paths can be exercised.
//!
//! Like webrtc-rs it only applies local descriptions it created itself,
//! announces simulcast with `a=rid`, keeps the msid of stopped senders and
//! only reports candidates once a local description has been applied.

use std::collections::HashMap;
use std::fmt::Write;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use super::{
    Direction, EngineEvent, EngineEventSender, IceConnectionState, MediaTrack, OfferOptions,
    PeerConnection, SdpType,
};
use crate::config::{HandlerConfig, IceServer};
use crate::error::{HandlerError, Result};
use crate::handler::HandlerListener;
use crate::rtp_parameters::MediaKind;
use crate::sdp::utils::{media_kind, media_mid, parse_sdp};
use crate::transport::{
    DtlsFingerprint, DtlsParameters, DtlsRole, IceCandidate, IceCandidateType, IceParameters,
    Protocol, TransportLocalParameters, TransportRemoteParameters,
};

pub(crate) const LOCAL_CNAME: &str = "localcname";
pub(crate) const LOCAL_STREAM: &str = "localstream";
const LOCAL_FINGERPRINT: &str =
    "2C:41:3F:7A:90:1E:B5:C3:08:55:DE:61:0F:AA:13:47:9C:2B:6E:D0:88:14:F7:3A:C5:29:BB:06:E1:72:4D:90";

/// Sending track handed to the fake engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FakeTrack {
    pub id: String,
    pub kind: MediaKind,
}

impl FakeTrack {
    pub fn audio(id: &str) -> Self {
        Self {
            id: id.to_string(),
            kind: MediaKind::Audio,
        }
    }

    pub fn video(id: &str) -> Self {
        Self {
            id: id.to_string(),
            kind: MediaKind::Video,
        }
    }
}

impl MediaTrack for FakeTrack {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }
}

/// Receiver of a negotiated receiving transceiver
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FakeRemoteTrack {
    pub mid: String,
    pub kind: MediaKind,
}

/// One m-section as rendered by the fake engine
#[derive(Debug, Clone)]
pub(crate) struct FakeSection {
    pub kind: MediaKind,
    pub mid: String,
    pub direction: Direction,
    pub port: u16,
    pub track_id: Option<String>,
    /// `(ssrc, rtx ssrc)` per encoding; several are announced with rids
    pub ssrcs: Vec<(u32, Option<u32>)>,
}

impl FakeSection {
    pub fn sending(kind: MediaKind, mid: &str, track_id: &str, ssrc: u32, rtx_ssrc: Option<u32>) -> Self {
        Self::with_encodings(kind, mid, track_id, vec![(ssrc, rtx_ssrc)])
    }

    pub fn with_encodings(kind: MediaKind, mid: &str, track_id: &str, ssrcs: Vec<(u32, Option<u32>)>) -> Self {
        Self {
            kind,
            mid: mid.to_string(),
            direction: Direction::SendOnly,
            port: 9,
            track_id: Some(track_id.to_string()),
            ssrcs,
        }
    }

    /// Sender stopped after negotiation: inactive, msid kept, no SSRCs
    pub fn stopped(kind: MediaKind, mid: &str, track_id: &str) -> Self {
        Self {
            kind,
            mid: mid.to_string(),
            direction: Direction::Inactive,
            port: 9,
            track_id: Some(track_id.to_string()),
            ssrcs: vec![],
        }
    }

    pub fn receiving(kind: MediaKind, mid: &str) -> Self {
        Self {
            kind,
            mid: mid.to_string(),
            direction: Direction::RecvOnly,
            port: 9,
            track_id: None,
            ssrcs: vec![],
        }
    }

    pub fn inactive(kind: MediaKind, mid: &str, port: u16) -> Self {
        Self {
            kind,
            mid: mid.to_string(),
            direction: Direction::Inactive,
            port,
            track_id: None,
            ssrcs: vec![],
        }
    }
}

/// Render a local offer with the default credentials and one host candidate
pub(crate) fn offer_sdp(sections: &[FakeSection]) -> String {
    render_sdp(sections, "localufrag", "localpassword", DtlsRole::Auto, true)
}

fn render_sdp(
    sections: &[FakeSection],
    ufrag: &str,
    pwd: &str,
    role: DtlsRole,
    candidates: bool,
) -> String {
    let mut out = String::new();
    out.push_str("v=0\r\n");
    out.push_str("o=- 4611731400430051336 2 IN IP4 127.0.0.1\r\n");
    out.push_str("s=-\r\n");
    out.push_str("t=0 0\r\n");
    let bundle: Vec<&str> = sections
        .iter()
        .filter(|s| s.port != 0)
        .map(|s| s.mid.as_str())
        .collect();
    if !bundle.is_empty() {
        let _ = write!(out, "a=group:BUNDLE {}\r\n", bundle.join(" "));
    }
    out.push_str("a=msid-semantic: WMS\r\n");

    for section in sections {
        let pts = match section.kind {
            MediaKind::Audio => "111",
            MediaKind::Video => "96 97",
        };
        let _ = write!(out, "m={} {} UDP/TLS/RTP/SAVPF {}\r\n", section.kind, section.port, pts);
        out.push_str("c=IN IP4 0.0.0.0\r\n");
        let _ = write!(out, "a=setup:{}\r\n", role.sdp_setup());
        let _ = write!(out, "a=mid:{}\r\n", section.mid);
        let _ = write!(out, "a=ice-ufrag:{}\r\n", ufrag);
        let _ = write!(out, "a=ice-pwd:{}\r\n", pwd);
        let _ = write!(out, "a=fingerprint:sha-256 {}\r\n", LOCAL_FINGERPRINT);
        if candidates {
            out.push_str("a=candidate:1966762134 1 udp 2122260223 192.168.1.20 50000 typ host\r\n");
            out.push_str("a=end-of-candidates\r\n");
        }
        let _ = write!(out, "a={}\r\n", section.direction.as_str());
        out.push_str("a=rtcp-mux\r\n");
        out.push_str("a=rtcp-rsize\r\n");

        match section.kind {
            MediaKind::Audio => {
                out.push_str("a=rtpmap:111 opus/48000/2\r\n");
                out.push_str("a=fmtp:111 minptime=10;useinbandfec=1\r\n");
                out.push_str("a=rtcp-fb:111 transport-cc\r\n");
                out.push_str("a=extmap:1 urn:ietf:params:rtp-hdrext:sdes:mid\r\n");
                out.push_str("a=extmap:10 urn:ietf:params:rtp-hdrext:ssrc-audio-level\r\n");
            }
            MediaKind::Video => {
                out.push_str("a=rtpmap:96 VP8/90000\r\n");
                out.push_str("a=rtcp-fb:96 goog-remb\r\n");
                out.push_str("a=rtcp-fb:96 transport-cc\r\n");
                out.push_str("a=rtcp-fb:96 ccm fir\r\n");
                out.push_str("a=rtcp-fb:96 nack\r\n");
                out.push_str("a=rtcp-fb:96 nack pli\r\n");
                out.push_str("a=rtpmap:97 rtx/90000\r\n");
                out.push_str("a=fmtp:97 apt=96\r\n");
                out.push_str("a=extmap:1 urn:ietf:params:rtp-hdrext:sdes:mid\r\n");
                out.push_str("a=extmap:4 http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time\r\n");
            }
        }

        if let Some(track_id) = &section.track_id {
            let msid = format!("{} {}", LOCAL_STREAM, track_id);
            let _ = write!(out, "a=msid:{}\r\n", msid);
            for (ssrc, rtx_ssrc) in &section.ssrcs {
                let _ = write!(out, "a=ssrc:{} cname:{}\r\n", ssrc, LOCAL_CNAME);
                let _ = write!(out, "a=ssrc:{} msid:{}\r\n", ssrc, msid);
                if let Some(rtx) = rtx_ssrc {
                    let _ = write!(out, "a=ssrc:{} cname:{}\r\n", rtx, LOCAL_CNAME);
                    let _ = write!(out, "a=ssrc:{} msid:{}\r\n", rtx, msid);
                    let _ = write!(out, "a=ssrc-group:FID {} {}\r\n", ssrc, rtx);
                }
            }
            if section.ssrcs.len() > 1 {
                let rids: Vec<String> = (0..section.ssrcs.len()).map(|i| format!("r{}", i)).collect();
                for rid in &rids {
                    let _ = write!(out, "a=rid:{} send\r\n", rid);
                }
                let _ = write!(out, "a=simulcast:send {}\r\n", rids.join(";"));
            }
        }
    }

    out
}

#[derive(Debug, Clone)]
struct FakeTransceiver {
    mid: Option<String>,
    kind: MediaKind,
    direction: Direction,
    track: Option<FakeTrack>,
    /// Track announced through msid once the sender stopped
    msid_track: Option<String>,
    ssrcs: Vec<(u32, Option<u32>)>,
    /// A local answer covering this transceiver was applied
    negotiated: bool,
    stopped: bool,
}

#[derive(Debug, Default)]
struct FakeState {
    calls: Vec<String>,
    transceivers: Vec<FakeTransceiver>,
    encodings_active: HashMap<String, Vec<bool>>,
    local_descriptions: Vec<(SdpType, String)>,
    /// Last created offer or answer, the only one `set_local_description` accepts
    pending_local: Option<(SdpType, String)>,
    remote_descriptions: Vec<(SdpType, String)>,
    ice_servers: Vec<IceServer>,
    next_mid: u32,
    next_ssrc: u32,
    ice_generation: u32,
    fail_next_remote_description: bool,
    step_delay: Option<Duration>,
    closed: bool,
}

impl FakeState {
    fn ufrag(&self) -> String {
        if self.ice_generation == 0 {
            "localufrag".to_string()
        } else {
            format!("localufrag{}", self.ice_generation)
        }
    }

    fn sections(&self) -> Vec<FakeSection> {
        self.transceivers
            .iter()
            .filter_map(|t| {
                let mid = t.mid.as_deref()?;
                if t.stopped {
                    // Stopped senders keep announcing their msid
                    return Some(match &t.msid_track {
                        Some(track_id) => FakeSection::stopped(t.kind, mid, track_id),
                        None => FakeSection::inactive(t.kind, mid, 0),
                    });
                }
                Some(match (&t.track, t.direction, &t.msid_track) {
                    (Some(track), Direction::SendOnly, _) => {
                        FakeSection::with_encodings(t.kind, mid, &track.id, t.ssrcs.clone())
                    }
                    (_, Direction::RecvOnly, _) => FakeSection::receiving(t.kind, mid),
                    (None, Direction::Inactive, Some(track_id)) => {
                        FakeSection::stopped(t.kind, mid, track_id)
                    }
                    _ => FakeSection::inactive(t.kind, mid, 9),
                })
            })
            .collect()
    }

    fn sender_mut(&mut self, track_id: &str) -> Result<&mut FakeTransceiver> {
        self.transceivers
            .iter_mut()
            .find(|t| t.track.as_ref().is_some_and(|track| track.id == track_id))
            .ok_or_else(|| HandlerError::Engine(format!("no sender for track {}", track_id)))
    }
}

/// Fake engine connection
///
/// Clones share state, so a test can keep one while the handler owns another.
#[derive(Clone)]
pub(crate) struct FakePeerConnection {
    state: Arc<Mutex<FakeState>>,
    events: EngineEventSender,
}

impl FakePeerConnection {
    /// Every engine call so far, in order (`"create_offer"`, `"add_track cam"`, ...)
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn call_count(&self, name: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.split(' ').next() == Some(name))
            .count()
    }

    pub fn fail_next_remote_description(&self) {
        self.state.lock().fail_next_remote_description = true;
    }

    /// Stall every description step for `delay`
    pub fn set_step_delay(&self, delay: Duration) {
        self.state.lock().step_delay = Some(delay);
    }

    pub fn encodings_active(&self, track_id: &str) -> Option<Vec<bool>> {
        self.state.lock().encodings_active.get(track_id).cloned()
    }

    pub fn last_remote_description(&self) -> Option<(SdpType, String)> {
        self.state.lock().remote_descriptions.last().cloned()
    }

    pub fn ice_servers(&self) -> Vec<IceServer> {
        self.state.lock().ice_servers.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Push a notification as the engine would
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    fn record(&self, call: String) {
        self.state.lock().calls.push(call);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state.lock().closed {
            return Err(HandlerError::Engine("connection closed".to_string()));
        }
        Ok(())
    }

    async fn stall(&self) {
        let delay = self.state.lock().step_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl PeerConnection for FakePeerConnection {
    type LocalTrack = FakeTrack;
    type RemoteTrack = FakeRemoteTrack;

    fn name() -> &'static str {
        "fake"
    }

    async fn connect(config: &HandlerConfig, events: EngineEventSender) -> Result<Self> {
        let state = FakeState {
            ice_servers: config.ice_servers.clone(),
            next_ssrc: 1000,
            ..Default::default()
        };
        Ok(Self {
            state: Arc::new(Mutex::new(state)),
            events,
        })
    }

    async fn add_track(&self, track: FakeTrack, encodings: usize) -> Result<()> {
        self.ensure_open()?;
        self.record(format!("add_track {}", track.id));

        let mut state = self.state.lock();
        if state.transceivers.iter().any(|t| t.track.as_ref() == Some(&track)) {
            return Err(HandlerError::Engine(format!("track {} already added", track.id)));
        }
        let mut ssrcs = vec![];
        for _ in 0..encodings.max(1) {
            let ssrc = state.next_ssrc;
            state.next_ssrc += 2;
            ssrcs.push((ssrc, (track.kind == MediaKind::Video).then_some(ssrc + 1)));
        }
        state.transceivers.push(FakeTransceiver {
            mid: None,
            kind: track.kind,
            direction: Direction::SendOnly,
            track: Some(track),
            msid_track: None,
            ssrcs,
            negotiated: false,
            stopped: false,
        });
        Ok(())
    }

    async fn remove_track(&self, track_id: &str) -> Result<()> {
        self.ensure_open()?;
        self.record(format!("remove_track {}", track_id));

        let mut state = self.state.lock();
        let transceiver = state.sender_mut(track_id)?;
        transceiver.msid_track = transceiver.track.take().map(|track| track.id);
        transceiver.direction = Direction::Inactive;
        Ok(())
    }

    async fn replace_track(&self, track_id: &str, new_track: FakeTrack) -> Result<()> {
        self.ensure_open()?;
        self.record(format!("replace_track {} {}", track_id, new_track.id));

        let mut state = self.state.lock();
        let transceiver = state.sender_mut(track_id)?;
        transceiver.track = Some(new_track);
        Ok(())
    }

    async fn add_transceiver(&self, kind: MediaKind, direction: Direction) -> Result<()> {
        self.ensure_open()?;
        self.record(format!("add_transceiver {}", kind));

        self.state.lock().transceivers.push(FakeTransceiver {
            mid: None,
            kind,
            direction,
            track: None,
            msid_track: None,
            ssrcs: vec![],
            negotiated: false,
            stopped: false,
        });
        Ok(())
    }

    async fn set_encodings_active(&self, track_id: &str, active: Vec<bool>) -> Result<()> {
        self.ensure_open()?;
        self.record(format!("set_encodings_active {}", track_id));

        let mut state = self.state.lock();
        state.sender_mut(track_id)?;
        state.encodings_active.insert(track_id.to_string(), active);
        Ok(())
    }

    async fn create_offer(&self, options: OfferOptions) -> Result<String> {
        self.ensure_open()?;
        self.record("create_offer".to_string());

        let mut state = self.state.lock();
        if options.ice_restart {
            state.ice_generation += 1;
        }
        for i in 0..state.transceivers.len() {
            if state.transceivers[i].mid.is_none() {
                let mid = state.next_mid.to_string();
                state.next_mid += 1;
                state.transceivers[i].mid = Some(mid);
            }
        }
        let offer = render_sdp(&state.sections(), &state.ufrag(), "localpassword", DtlsRole::Auto, false);
        state.pending_local = Some((SdpType::Offer, offer.clone()));
        Ok(offer)
    }

    async fn create_answer(&self) -> Result<String> {
        self.ensure_open()?;
        self.record("create_answer".to_string());

        let mut state = self.state.lock();
        if state.remote_descriptions.last().map(|(t, _)| *t) != Some(SdpType::Offer) {
            return Err(HandlerError::NegotiationFailed(
                "no remote offer to answer".to_string(),
            ));
        }
        let answer = render_sdp(&state.sections(), &state.ufrag(), "localpassword", DtlsRole::Client, false);
        state.pending_local = Some((SdpType::Answer, answer.clone()));
        Ok(answer)
    }

    async fn set_local_description(&self, sdp_type: SdpType, sdp: String) -> Result<()> {
        self.ensure_open()?;
        self.record(format!("set_local_description {}", sdp_type));
        self.stall().await;

        parse_sdp(&sdp)?;
        let mut state = self.state.lock();
        match state.pending_local.take() {
            Some((created_type, created)) if created_type == sdp_type && created == sdp => {}
            _ => {
                return Err(HandlerError::NegotiationFailed(format!(
                    "local {} does not match the one created",
                    sdp_type
                )))
            }
        }
        if sdp_type == SdpType::Answer {
            for transceiver in state.transceivers.iter_mut().filter(|t| t.mid.is_some()) {
                transceiver.negotiated = true;
            }
        }
        state.local_descriptions.push((sdp_type, sdp));
        Ok(())
    }

    async fn set_remote_description(&self, sdp_type: SdpType, sdp: String) -> Result<()> {
        self.ensure_open()?;
        self.record(format!("set_remote_description {}", sdp_type));
        self.stall().await;

        let session = parse_sdp(&sdp)?;
        let mut state = self.state.lock();
        if state.fail_next_remote_description {
            state.fail_next_remote_description = false;
            return Err(HandlerError::NegotiationFailed(format!(
                "remote {} rejected",
                sdp_type
            )));
        }

        for media in &session.media_descriptions {
            let (Some(mid), Some(kind)) = (media_mid(media), media_kind(media)) else {
                continue;
            };
            let rejected = media.media_name.port.value == 0;
            let existing = state
                .transceivers
                .iter()
                .position(|t| t.mid.as_deref() == Some(mid));
            match existing {
                Some(index) => state.transceivers[index].stopped |= rejected,
                None if sdp_type == SdpType::Offer => {
                    state.transceivers.push(FakeTransceiver {
                        mid: Some(mid.to_string()),
                        kind,
                        direction: Direction::RecvOnly,
                        track: None,
                        msid_track: None,
                        ssrcs: vec![],
                        negotiated: false,
                        stopped: rejected,
                    });
                }
                None => {}
            }
        }

        state.remote_descriptions.push((sdp_type, sdp));
        Ok(())
    }

    async fn local_description(&self) -> Option<String> {
        let state = self.state.lock();
        let (sdp_type, _) = state.local_descriptions.last()?;
        let role = match sdp_type {
            SdpType::Offer => DtlsRole::Auto,
            SdpType::Answer => DtlsRole::Client,
        };
        // Applied description with the candidates gathered since
        Some(render_sdp(&state.sections(), &state.ufrag(), "localpassword", role, true))
    }

    async fn remote_track(&self, mid: &str) -> Option<FakeRemoteTrack> {
        let state = self.state.lock();
        state
            .transceivers
            .iter()
            .find(|t| {
                t.mid.as_deref() == Some(mid)
                    && t.direction == Direction::RecvOnly
                    && t.negotiated
                    && !t.stopped
            })
            .map(|t| FakeRemoteTrack {
                mid: mid.to_string(),
                kind: t.kind,
            })
    }

    async fn stats(&self) -> Result<Value> {
        self.ensure_open()?;
        let state = self.state.lock();
        Ok(json!({
            "transport": {"type": "transport", "iceGeneration": state.ice_generation},
            "transceivers": state.transceivers.len(),
        }))
    }

    async fn sender_stats(&self, track_id: &str) -> Result<Value> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        let sender = state.sender_mut(track_id)?;
        let ssrc = sender.ssrcs.first().map(|(ssrc, _)| *ssrc);
        Ok(json!({"type": "outbound-rtp", "ssrc": ssrc, "trackId": track_id}))
    }

    async fn receiver_stats(&self, mid: &str) -> Result<Value> {
        self.ensure_open()?;
        let state = self.state.lock();
        let receiver = state
            .transceivers
            .iter()
            .find(|t| t.mid.as_deref() == Some(mid))
            .ok_or_else(|| HandlerError::Engine(format!("no receiver for mid {}", mid)))?;
        Ok(json!({"type": "inbound-rtp", "mid": mid, "kind": receiver.kind}))
    }

    async fn set_ice_servers(&self, ice_servers: &[IceServer]) -> Result<()> {
        self.ensure_open()?;
        self.record("set_ice_servers".to_string());
        self.state.lock().ice_servers = ice_servers.to_vec();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.record("close".to_string());
        let mut state = self.state.lock();
        if state.closed {
            return Err(HandlerError::Engine("already closed".to_string()));
        }
        state.closed = true;
        Ok(())
    }
}

/// Transport parameters of an ice-lite SFU
pub(crate) fn remote_parameters() -> TransportRemoteParameters {
    TransportRemoteParameters {
        ice_parameters: IceParameters {
            username_fragment: "sfuufrag".to_string(),
            password: "sfupassword".to_string(),
            ice_lite: true,
        },
        ice_candidates: vec![IceCandidate {
            foundation: "udpcandidate".to_string(),
            priority: 1078862079,
            ip: "192.0.2.1".to_string(),
            protocol: Protocol::Udp,
            port: 40000,
            typ: IceCandidateType::Host,
            tcp_type: None,
        }],
        dtls_parameters: DtlsParameters {
            role: DtlsRole::Auto,
            fingerprints: vec![DtlsFingerprint {
                algorithm: "sha-256".to_string(),
                value: "AA:BB:CC".to_string(),
            }],
        },
    }
}

/// Listener that keeps every notification
#[derive(Default)]
pub(crate) struct RecordingListener {
    connects: Mutex<Vec<TransportLocalParameters>>,
    states: Mutex<Vec<IceConnectionState>>,
}

impl RecordingListener {
    pub fn connects(&self) -> Vec<TransportLocalParameters> {
        self.connects.lock().clone()
    }

    pub fn states(&self) -> Vec<IceConnectionState> {
        self.states.lock().clone()
    }
}

impl HandlerListener for RecordingListener {
    fn on_connect(&self, parameters: &TransportLocalParameters) {
        self.connects.lock().push(parameters.clone());
    }

    fn on_connection_state_change(&self, state: IceConnectionState) {
        self.states.lock().push(state);
    }
}
