//! One m-section of the remote description

use std::fmt::Write;

use crate::engine::Direction;
use crate::rtp_parameters::{format_fmtp, MediaKind, RtpParameters};
use crate::transport::{IceCandidate, IceParameters};

/// Port announced for open sections (candidates carry the real address)
const OPEN_PORT: u16 = 7;

/// Which half of an offer/answer exchange the section belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionRole {
    /// Answers a local send offer; the SFU receives
    Answer,
    /// Offers a stream the SFU sends to us
    Offer,
}

/// Transport fields shared by every section
pub(crate) struct TransportContext<'a> {
    pub ice_parameters: &'a IceParameters,
    pub ice_candidates: &'a [IceCandidate],
    pub answer_setup: &'static str,
}

#[derive(Debug, Clone)]
pub struct MediaSection {
    mid: String,
    kind: MediaKind,
    role: SectionRole,
    rtp_parameters: RtpParameters,
    track_id: Option<String>,
    closed: bool,
}

impl MediaSection {
    pub(crate) fn answer(mid: String, kind: MediaKind, rtp_parameters: RtpParameters) -> Self {
        Self {
            mid,
            kind,
            role: SectionRole::Answer,
            rtp_parameters,
            track_id: None,
            closed: false,
        }
    }

    pub(crate) fn offer(
        mid: String,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        track_id: String,
    ) -> Self {
        Self {
            mid,
            kind,
            role: SectionRole::Offer,
            rtp_parameters,
            track_id: Some(track_id),
            closed: false,
        }
    }

    pub fn mid(&self) -> &str {
        &self.mid
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn role(&self) -> SectionRole {
        self.role
    }

    pub fn rtp_parameters(&self) -> &RtpParameters {
        &self.rtp_parameters
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Direction from the SFU's point of view
    pub fn direction(&self) -> Direction {
        if self.closed {
            return Direction::Inactive;
        }
        match self.role {
            SectionRole::Answer => Direction::RecvOnly,
            SectionRole::Offer => Direction::SendOnly,
        }
    }

    pub(crate) fn update(&mut self, rtp_parameters: RtpParameters, track_id: String) {
        self.rtp_parameters = rtp_parameters;
        self.track_id = Some(track_id);
    }

    pub(crate) fn close(&mut self) {
        self.closed = true;
    }

    pub(crate) fn render(&self, out: &mut String, ctx: &TransportContext<'_>) {
        let params = &self.rtp_parameters;
        let port = if self.closed { 0 } else { OPEN_PORT };
        let payload_types = params
            .codecs
            .iter()
            .map(|c| c.payload_type.to_string())
            .collect::<Vec<_>>()
            .join(" ");

        let _ = write!(out, "m={} {} UDP/TLS/RTP/SAVPF {}\r\n", self.kind, port, payload_types);
        out.push_str("c=IN IP4 127.0.0.1\r\n");
        let _ = write!(out, "a=mid:{}\r\n", self.mid);
        let _ = write!(out, "a={}\r\n", self.direction().as_str());
        let _ = write!(out, "a=ice-ufrag:{}\r\n", ctx.ice_parameters.username_fragment);
        let _ = write!(out, "a=ice-pwd:{}\r\n", ctx.ice_parameters.password);

        if !self.closed {
            for candidate in ctx.ice_candidates {
                let _ = write!(out, "a=candidate:{}\r\n", candidate.to_sdp_value());
            }
            out.push_str("a=end-of-candidates\r\n");
        }
        out.push_str("a=ice-options:renomination\r\n");

        let setup = match self.role {
            SectionRole::Answer => ctx.answer_setup,
            SectionRole::Offer => "actpass",
        };
        let _ = write!(out, "a=setup:{}\r\n", setup);

        if params.rtcp.mux {
            out.push_str("a=rtcp-mux\r\n");
        }
        if params.rtcp.reduced_size {
            out.push_str("a=rtcp-rsize\r\n");
        }

        for codec in &params.codecs {
            let _ = write!(
                out,
                "a=rtpmap:{} {}/{}",
                codec.payload_type,
                codec.codec_name(),
                codec.clock_rate
            );
            match codec.channels {
                Some(channels) if channels > 1 => {
                    let _ = write!(out, "/{}\r\n", channels);
                }
                _ => out.push_str("\r\n"),
            }
            if !codec.parameters.is_empty() {
                let _ = write!(
                    out,
                    "a=fmtp:{} {}\r\n",
                    codec.payload_type,
                    format_fmtp(&codec.parameters)
                );
            }
            for fb in &codec.rtcp_feedback {
                if fb.parameter.is_empty() {
                    let _ = write!(out, "a=rtcp-fb:{} {}\r\n", codec.payload_type, fb.typ);
                } else {
                    let _ = write!(
                        out,
                        "a=rtcp-fb:{} {} {}\r\n",
                        codec.payload_type, fb.typ, fb.parameter
                    );
                }
            }
        }

        for ext in &params.header_extensions {
            let _ = write!(out, "a=extmap:{} {}\r\n", ext.id, ext.uri);
        }

        if !self.closed {
            match self.role {
                SectionRole::Offer => self.render_ssrcs(out),
                SectionRole::Answer => self.render_simulcast(out),
            }
        }
    }

    /// Accept the rids the local offer announced for simulcast
    fn render_simulcast(&self, out: &mut String) {
        let rids: Vec<&str> = self
            .rtp_parameters
            .encodings
            .iter()
            .filter_map(|e| e.rid.as_deref())
            .collect();
        if rids.len() < 2 {
            return;
        }
        for rid in &rids {
            let _ = write!(out, "a=rid:{} recv\r\n", rid);
        }
        let _ = write!(out, "a=simulcast:recv {}\r\n", rids.join(";"));
    }

    fn render_ssrcs(&self, out: &mut String) {
        let params = &self.rtp_parameters;
        let cname = params.rtcp.cname.as_deref().unwrap_or("-");
        let track_id = self.track_id.as_deref().unwrap_or("-");
        let msid = format!("{} {}", cname, track_id);

        let _ = write!(out, "a=msid:{}\r\n", msid);

        for encoding in &params.encodings {
            let Some(ssrc) = encoding.ssrc else {
                continue;
            };
            let _ = write!(out, "a=ssrc:{} cname:{}\r\n", ssrc, cname);
            let _ = write!(out, "a=ssrc:{} msid:{}\r\n", ssrc, msid);

            if let Some(rtx) = encoding.rtx {
                let _ = write!(out, "a=ssrc:{} cname:{}\r\n", rtx.ssrc, cname);
                let _ = write!(out, "a=ssrc:{} msid:{}\r\n", rtx.ssrc, msid);
                let _ = write!(out, "a=ssrc-group:FID {} {}\r\n", ssrc, rtx.ssrc);
            }
        }
    }
}
