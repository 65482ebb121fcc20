//! Incrementally mutated model of the SFU's session description
//!
//! Sections are append-only: closing a track turns its section inactive
//! (port 0) instead of removing it, so m-line indexes stay stable and a `mid`
//! is never handed out twice within one session.

use std::fmt::Write;

use tracing::debug;

use super::media_section::{MediaSection, TransportContext};
use crate::error::{HandlerError, Result};
use crate::rtp_parameters::{MediaKind, RtpParameters};
use crate::transport::{
    DtlsFingerprint, DtlsParameters, DtlsRole, IceCandidate, IceParameters,
    TransportRemoteParameters,
};

#[derive(Debug)]
pub struct RemoteSdp {
    ice_parameters: IceParameters,
    ice_candidates: Vec<IceCandidate>,
    dtls_parameters: DtlsParameters,
    /// Local DTLS role, once the transport is set up
    local_dtls_role: Option<DtlsRole>,
    sections: Vec<MediaSection>,
    session_id: u64,
    session_version: u64,
    next_mid: u32,
    closed: bool,
}

impl RemoteSdp {
    pub fn new(remote: TransportRemoteParameters) -> Self {
        Self {
            ice_parameters: remote.ice_parameters,
            ice_candidates: remote.ice_candidates,
            dtls_parameters: remote.dtls_parameters,
            local_dtls_role: None,
            sections: vec![],
            session_id: u64::from(rand::random::<u32>()),
            session_version: 1,
            next_mid: 0,
            closed: false,
        }
    }

    /// Add a section answering a local send offer and return its `mid`
    ///
    /// The `mid` comes from `rtp_parameters.mid` when the engine already chose
    /// one, otherwise the next unused one is allocated.
    pub fn add_sending_media(
        &mut self,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
    ) -> Result<String> {
        self.ensure_open()?;
        validate_codecs(kind, rtp_parameters)?;

        let mid = match rtp_parameters.mid {
            Some(ref mid) => mid.clone(),
            None => self.next_mid(),
        };
        if self.has_mid(&mid) {
            return Err(HandlerError::InvalidState(format!(
                "mid {} already used in this session",
                mid
            )));
        }

        let mut params = rtp_parameters.clone();
        params.mid = Some(mid.clone());
        self.reserve_mid(&mid);
        self.sections
            .push(MediaSection::answer(mid.clone(), kind, params));
        self.bump_version();

        debug!("Remote SDP: added sending {} section mid={}", kind, mid);
        Ok(mid)
    }

    /// Answer a local section the SFU will never use (port 0)
    ///
    /// Keeps the answer aligned with an engine offer that carries a section
    /// left over from a failed negotiation.
    pub fn add_rejected_media(
        &mut self,
        kind: MediaKind,
        mid: &str,
        rtp_parameters: &RtpParameters,
    ) -> Result<()> {
        self.ensure_open()?;
        if self.has_mid(mid) {
            return Err(HandlerError::InvalidState(format!(
                "mid {} already used in this session",
                mid
            )));
        }

        let mut params = rtp_parameters.clone();
        params.mid = Some(mid.to_string());
        let mut section = MediaSection::answer(mid.to_string(), kind, params);
        section.close();

        self.reserve_mid(mid);
        self.sections.push(section);
        self.bump_version();

        debug!("Remote SDP: rejected {} section mid={}", kind, mid);
        Ok(())
    }

    /// Register (or update) a section offering a stream the SFU sends
    ///
    /// Receive `mid`s are chosen by the remote side. Updating a closed section
    /// is refused since that would resurrect a retired `mid`.
    pub fn add_receiving_media(
        &mut self,
        kind: MediaKind,
        mid: &str,
        rtp_parameters: &RtpParameters,
        track_id: &str,
    ) -> Result<()> {
        self.ensure_open()?;
        validate_codecs(kind, rtp_parameters)?;

        let mut params = rtp_parameters.clone();
        params.mid = Some(mid.to_string());

        if let Some(index) = self.sections.iter().position(|s| s.mid() == mid) {
            let section = &mut self.sections[index];
            if section.is_closed() || section.kind() != kind {
                return Err(HandlerError::InvalidState(format!(
                    "mid {} already used in this session",
                    mid
                )));
            }
            section.update(params, track_id.to_string());
            debug!("Remote SDP: updated receiving {} section mid={}", kind, mid);
        } else {
            self.reserve_mid(mid);
            self.sections.push(MediaSection::offer(
                mid.to_string(),
                kind,
                params,
                track_id.to_string(),
            ));
            debug!("Remote SDP: added receiving {} section mid={}", kind, mid);
        }

        self.bump_version();
        Ok(())
    }

    /// Deactivate a section; closing an already closed section is a no-op
    pub fn close_media_section(&mut self, mid: &str) -> Result<()> {
        let section = self
            .sections
            .iter_mut()
            .find(|s| s.mid() == mid)
            .ok_or_else(|| HandlerError::InvalidState(format!("no media section with mid {}", mid)))?;

        if !section.is_closed() {
            section.close();
            self.bump_version();
            debug!("Remote SDP: closed section mid={}", mid);
        }
        Ok(())
    }

    /// Record the local DTLS role; the remote side takes the opposite one
    pub fn update_dtls_role(&mut self, local_role: DtlsRole) {
        self.local_dtls_role = Some(local_role);
        self.dtls_parameters.role = local_role.opposite();
        self.bump_version();
    }

    pub fn update_ice_parameters(&mut self, ice_parameters: IceParameters) {
        self.ice_parameters = ice_parameters;
        self.bump_version();
    }

    pub fn add_ice_candidate(&mut self, candidate: IceCandidate) {
        if self.ice_candidates.contains(&candidate) {
            return;
        }
        self.ice_candidates.push(candidate);
        self.bump_version();
    }

    /// Render the full description
    ///
    /// Rendering has no side effects: two calls without a mutation in between
    /// produce identical text.
    pub fn get_sdp(&self) -> String {
        let mut out = String::new();

        out.push_str("v=0\r\n");
        let _ = write!(
            out,
            "o=mediasoup-client {} {} IN IP4 0.0.0.0\r\n",
            self.session_id, self.session_version
        );
        out.push_str("s=-\r\n");
        out.push_str("t=0 0\r\n");

        if self.ice_parameters.ice_lite {
            out.push_str("a=ice-lite\r\n");
        }

        let bundle = self.active_mids();
        if !bundle.is_empty() {
            let _ = write!(out, "a=group:BUNDLE {}\r\n", bundle.join(" "));
        }
        out.push_str("a=msid-semantic: WMS *\r\n");

        if let Some(fingerprint) = self.fingerprint() {
            let _ = write!(
                out,
                "a=fingerprint:{} {}\r\n",
                fingerprint.algorithm, fingerprint.value
            );
        }

        let ctx = TransportContext {
            ice_parameters: &self.ice_parameters,
            ice_candidates: &self.ice_candidates,
            answer_setup: self.answer_setup(),
        };
        for section in &self.sections {
            section.render(&mut out, &ctx);
        }

        out
    }

    /// Next `mid` that has never been used in this session
    pub fn next_mid(&self) -> String {
        self.next_mid.to_string()
    }

    pub fn has_mid(&self, mid: &str) -> bool {
        self.sections.iter().any(|s| s.mid() == mid)
    }

    pub fn section(&self, mid: &str) -> Option<&MediaSection> {
        self.sections.iter().find(|s| s.mid() == mid)
    }

    /// Sections in allocation order
    pub fn sections(&self) -> &[MediaSection] {
        &self.sections
    }

    /// `mid`s of sections that are not closed, in allocation order
    pub fn active_mids(&self) -> Vec<&str> {
        self.sections
            .iter()
            .filter(|s| !s.is_closed())
            .map(|s| s.mid())
            .collect()
    }

    pub fn ice_parameters(&self) -> &IceParameters {
        &self.ice_parameters
    }

    pub fn local_dtls_role(&self) -> Option<DtlsRole> {
        self.local_dtls_role
    }

    /// Refuse further sections; existing ones are kept for inspection
    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(HandlerError::InvalidState(
                "transport closed, no new media sections".to_string(),
            ));
        }
        Ok(())
    }

    fn reserve_mid(&mut self, mid: &str) {
        if let Ok(n) = mid.parse::<u32>() {
            self.next_mid = self.next_mid.max(n.saturating_add(1));
        }
    }

    fn bump_version(&mut self) {
        self.session_version += 1;
    }

    fn answer_setup(&self) -> &'static str {
        match self.local_dtls_role {
            Some(DtlsRole::Client) => DtlsRole::Server.sdp_setup(),
            // Local side is (or defaults to) the DTLS server
            _ => DtlsRole::Client.sdp_setup(),
        }
    }

    /// Prefer sha-256, otherwise the last advertised fingerprint
    fn fingerprint(&self) -> Option<&DtlsFingerprint> {
        let fingerprints = &self.dtls_parameters.fingerprints;
        fingerprints
            .iter()
            .find(|f| f.algorithm.eq_ignore_ascii_case("sha-256"))
            .or_else(|| fingerprints.last())
    }
}

fn validate_codecs(kind: MediaKind, rtp_parameters: &RtpParameters) -> Result<()> {
    if rtp_parameters.primary_codec().is_none() {
        return Err(HandlerError::InvalidParameters(format!(
            "no {} codec in RTP parameters",
            kind
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Direction;
    use crate::rtp_parameters::{RtpCodecParameters, RtpEncodingParameters, RtxParameters};
    use crate::sdp::utils::parse_sdp;
    use crate::transport::{IceCandidateType, Protocol};

    fn remote_parameters() -> TransportRemoteParameters {
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

    fn audio_parameters() -> RtpParameters {
        RtpParameters {
            codecs: vec![RtpCodecParameters::new("audio/opus", 111, 48000)
                .with_channels(2)
                .with_parameter("useinbandfec", 1)],
            ..Default::default()
        }
    }

    fn receiving_parameters(ssrc: u32, rtx: u32) -> RtpParameters {
        RtpParameters {
            codecs: vec![
                RtpCodecParameters::new("video/VP8", 101, 90000),
                RtpCodecParameters::new("video/rtx", 102, 90000).with_parameter("apt", 101),
            ],
            encodings: vec![RtpEncodingParameters {
                rtx: Some(RtxParameters { ssrc: rtx }),
                ..RtpEncodingParameters::with_ssrc(ssrc)
            }],
            rtcp: crate::rtp_parameters::RtcpParameters {
                cname: Some("remotecname".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_sending_mids_are_sequential() {
        let mut sdp = RemoteSdp::new(remote_parameters());
        assert_eq!(sdp.add_sending_media(MediaKind::Audio, &audio_parameters()).unwrap(), "0");
        assert_eq!(sdp.add_sending_media(MediaKind::Audio, &audio_parameters()).unwrap(), "1");
        sdp.close_media_section("0").unwrap();
        // A closed mid is never handed out again
        assert_eq!(sdp.add_sending_media(MediaKind::Audio, &audio_parameters()).unwrap(), "2");
        assert_eq!(sdp.active_mids(), vec!["1", "2"]);
    }

    #[test]
    fn test_sending_with_engine_mid() {
        let mut sdp = RemoteSdp::new(remote_parameters());
        let mut params = audio_parameters();
        params.mid = Some("4".to_string());
        assert_eq!(sdp.add_sending_media(MediaKind::Audio, &params).unwrap(), "4");
        assert_eq!(sdp.next_mid(), "5");

        let err = sdp.add_sending_media(MediaKind::Audio, &params).unwrap_err();
        assert!(matches!(err, HandlerError::InvalidState(_)));
    }

    #[test]
    fn test_sending_without_codecs_is_rejected() {
        let mut sdp = RemoteSdp::new(remote_parameters());
        let err = sdp
            .add_sending_media(MediaKind::Video, &RtpParameters::default())
            .unwrap_err();
        assert!(matches!(err, HandlerError::InvalidParameters(_)));
        assert!(sdp.sections().is_empty());
    }

    #[test]
    fn test_closed_remote_sdp_refuses_sections() {
        let mut sdp = RemoteSdp::new(remote_parameters());
        sdp.close();
        let err = sdp
            .add_sending_media(MediaKind::Audio, &audio_parameters())
            .unwrap_err();
        assert!(matches!(err, HandlerError::InvalidState(_)));
    }

    #[test]
    fn test_render_is_idempotent() {
        let mut sdp = RemoteSdp::new(remote_parameters());
        sdp.update_dtls_role(DtlsRole::Server);
        sdp.add_sending_media(MediaKind::Audio, &audio_parameters()).unwrap();
        let first = sdp.get_sdp();
        assert_eq!(first, sdp.get_sdp());

        sdp.close_media_section("0").unwrap();
        assert_ne!(first, sdp.get_sdp());
    }

    #[test]
    fn test_render_answer_section() {
        let mut sdp = RemoteSdp::new(remote_parameters());
        sdp.update_dtls_role(DtlsRole::Server);
        sdp.add_sending_media(MediaKind::Audio, &audio_parameters()).unwrap();

        let text = sdp.get_sdp();
        assert!(text.contains("a=ice-lite\r\n"));
        assert!(text.contains("a=group:BUNDLE 0\r\n"));
        assert!(text.contains("a=fingerprint:sha-256 AA:BB:CC\r\n"));
        assert!(text.contains("m=audio 7 UDP/TLS/RTP/SAVPF 111\r\n"));
        assert!(text.contains("a=recvonly\r\n"));
        assert!(text.contains("a=setup:active\r\n"));
        assert!(text.contains("a=rtpmap:111 opus/48000/2\r\n"));
        assert!(text.contains("a=fmtp:111 useinbandfec=1\r\n"));
        assert!(text.contains(
            "a=candidate:udpcandidate 1 udp 1078862079 192.0.2.1 40000 typ host\r\n"
        ));

        let parsed = parse_sdp(&text).unwrap();
        assert_eq!(parsed.media_descriptions.len(), 1);
    }

    #[test]
    fn test_render_offer_section_with_ssrcs() {
        let mut sdp = RemoteSdp::new(remote_parameters());
        sdp.add_receiving_media(MediaKind::Video, "0", &receiving_parameters(1111, 1112), "consumer-video-c1")
            .unwrap();

        let text = sdp.get_sdp();
        assert!(text.contains("a=sendonly\r\n"));
        assert!(text.contains("a=setup:actpass\r\n"));
        assert!(text.contains("a=msid:remotecname consumer-video-c1\r\n"));
        assert!(text.contains("a=ssrc:1111 cname:remotecname\r\n"));
        assert!(text.contains("a=ssrc-group:FID 1111 1112\r\n"));
        assert!(text.contains("a=fmtp:102 apt=101\r\n"));
    }

    #[test]
    fn test_closed_section_keeps_order() {
        let mut sdp = RemoteSdp::new(remote_parameters());
        sdp.add_receiving_media(MediaKind::Video, "0", &receiving_parameters(1, 2), "t0")
            .unwrap();
        sdp.add_receiving_media(MediaKind::Video, "1", &receiving_parameters(3, 4), "t1")
            .unwrap();
        sdp.close_media_section("0").unwrap();

        let text = sdp.get_sdp();
        let parsed = parse_sdp(&text).unwrap();
        assert_eq!(parsed.media_descriptions.len(), 2);
        assert_eq!(parsed.media_descriptions[0].media_name.port.value, 0);
        assert!(text.contains("a=group:BUNDLE 1\r\n"));
        assert!(!text.contains("a=ssrc:1 "));
        assert_eq!(sdp.section("0").unwrap().direction(), Direction::Inactive);
    }

    #[test]
    fn test_receiving_mid_reuse_after_close() {
        let mut sdp = RemoteSdp::new(remote_parameters());
        sdp.add_receiving_media(MediaKind::Video, "0", &receiving_parameters(1, 2), "t0")
            .unwrap();
        // Updating an open section is allowed
        sdp.add_receiving_media(MediaKind::Video, "0", &receiving_parameters(5, 6), "t0")
            .unwrap();
        assert_eq!(sdp.section("0").unwrap().rtp_parameters().ssrc(), Some(5));

        sdp.close_media_section("0").unwrap();
        let err = sdp
            .add_receiving_media(MediaKind::Video, "0", &receiving_parameters(7, 8), "t0")
            .unwrap_err();
        assert!(matches!(err, HandlerError::InvalidState(_)));
    }

    #[test]
    fn test_rejected_section_is_closed() {
        let mut sdp = RemoteSdp::new(remote_parameters());
        sdp.add_rejected_media(MediaKind::Audio, "0", &audio_parameters())
            .unwrap();
        assert!(sdp.section("0").unwrap().is_closed());
        assert!(sdp.active_mids().is_empty());
        assert_eq!(sdp.next_mid(), "1");
        assert!(sdp.get_sdp().contains("m=audio 0 UDP/TLS/RTP/SAVPF 111\r\n"));
        assert!(sdp
            .add_rejected_media(MediaKind::Audio, "0", &audio_parameters())
            .is_err());
    }

    #[test]
    fn test_close_unknown_section() {
        let mut sdp = RemoteSdp::new(remote_parameters());
        assert!(sdp.close_media_section("9").is_err());
    }

    #[test]
    fn test_ice_updates() {
        let mut sdp = RemoteSdp::new(remote_parameters());
        sdp.add_sending_media(MediaKind::Audio, &audio_parameters()).unwrap();

        sdp.update_ice_parameters(IceParameters {
            username_fragment: "newufrag".to_string(),
            password: "newpassword".to_string(),
            ice_lite: true,
        });
        let mut candidate = remote_parameters().ice_candidates[0].clone();
        candidate.port = 40001;
        sdp.add_ice_candidate(candidate.clone());
        sdp.add_ice_candidate(candidate);

        let text = sdp.get_sdp();
        assert!(text.contains("a=ice-ufrag:newufrag\r\n"));
        assert_eq!(text.matches("a=candidate:").count(), 2);
    }

    #[test]
    fn test_client_role_makes_remote_passive() {
        let mut sdp = RemoteSdp::new(remote_parameters());
        sdp.update_dtls_role(DtlsRole::Client);
        sdp.add_sending_media(MediaKind::Audio, &audio_parameters()).unwrap();
        assert!(sdp.get_sdp().contains("a=setup:passive\r\n"));
        assert_eq!(sdp.local_dtls_role(), Some(DtlsRole::Client));
    }
}
