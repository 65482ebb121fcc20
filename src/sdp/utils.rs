//! Helpers over engine-produced (local) session descriptions

use std::collections::{HashMap, HashSet};
use std::io::Cursor;

use webrtc::sdp::description::common::Attribute;
use webrtc::sdp::description::media::MediaDescription;
use webrtc::sdp::description::session::SessionDescription;

use crate::engine::Direction;
use crate::error::{HandlerError, Result};
use crate::rtp_parameters::{
    parse_fmtp, MediaKind, RtcpFeedback, RtpCapabilities, RtpCodecCapability,
    RtpCodecParameters, RtpEncodingParameters, RtpHeaderExtension, RtpHeaderExtensionParameters,
    RtpParameters, RtxParameters, SimulcastLayer,
};
use crate::transport::{DtlsFingerprint, DtlsParameters, DtlsRole, IceCandidate, IceParameters};

/// Parse SDP text produced by the engine
pub fn parse_sdp(sdp: &str) -> Result<SessionDescription> {
    let mut reader = Cursor::new(sdp.as_bytes());
    SessionDescription::unmarshal(&mut reader).map_err(|e| HandlerError::Sdp(e.to_string()))
}

/// Values of every attribute named `key`
pub fn attribute_values<'a>(
    attributes: &'a [Attribute],
    key: &'a str,
) -> impl Iterator<Item = &'a str> + 'a {
    attributes
        .iter()
        .filter(move |a| a.key == key)
        .map(|a| a.value.as_deref().unwrap_or(""))
}

/// Value of the first attribute named `key`
pub fn attribute_value<'a>(attributes: &'a [Attribute], key: &'a str) -> Option<&'a str> {
    attribute_values(attributes, key).next()
}

pub fn media_mid(media: &MediaDescription) -> Option<&str> {
    attribute_value(&media.attributes, "mid")
}

pub fn media_kind(media: &MediaDescription) -> Option<MediaKind> {
    MediaKind::from_sdp(&media.media_name.media)
}

/// Direction of a section; `sendrecv` when absent
pub fn media_direction(media: &MediaDescription) -> Direction {
    media
        .attributes
        .iter()
        .find_map(|a| Direction::from_sdp(&a.key))
        .unwrap_or(Direction::SendRecv)
}

/// Index of the first sending section at or after `from` that carries
/// `track_id`, matched through `a=msid` or `a=ssrc:<n> msid:<stream> <track>`
///
/// Stopped sections keep announcing the msid of their last track, so inactive
/// and rejected sections never match.
pub fn find_track_section(session: &SessionDescription, track_id: &str, from: usize) -> Option<usize> {
    session
        .media_descriptions
        .iter()
        .enumerate()
        .skip(from)
        .find(|(_, m)| {
            m.media_name.port.value != 0
                && media_direction(m) != Direction::Inactive
                && section_carries_track(m, track_id)
        })
        .map(|(index, _)| index)
}

fn section_carries_track(media: &MediaDescription, track_id: &str) -> bool {
    let msid_matches = |value: &str| value.split_whitespace().nth(1) == Some(track_id);

    attribute_values(&media.attributes, "msid").any(msid_matches)
        || ssrc_lines(media)
            .iter()
            .any(|line| line.attribute == "msid" && msid_matches(&line.value))
}

/// Attribute shared by the session and the first section (bundle), preferring
/// the section level
fn transport_attribute<'a>(session: &'a SessionDescription, key: &'a str) -> Option<&'a str> {
    session
        .media_descriptions
        .first()
        .and_then(|m| attribute_value(&m.attributes, key))
        .or_else(|| attribute_value(&session.attributes, key))
}

/// DTLS fingerprint and role announced by a local description
pub fn extract_dtls_parameters(session: &SessionDescription) -> Result<DtlsParameters> {
    let fingerprint = transport_attribute(session, "fingerprint")
        .ok_or_else(|| HandlerError::Sdp("no a=fingerprint in local description".to_string()))?;
    let (algorithm, value) = fingerprint
        .trim()
        .split_once(' ')
        .ok_or_else(|| HandlerError::Sdp(format!("malformed a=fingerprint: {}", fingerprint)))?;

    let role = transport_attribute(session, "setup")
        .and_then(DtlsRole::from_sdp_setup)
        .unwrap_or_default();

    Ok(DtlsParameters {
        role,
        fingerprints: vec![DtlsFingerprint {
            algorithm: algorithm.to_string(),
            value: value.trim().to_string(),
        }],
    })
}

/// ICE credentials announced by a local description
pub fn extract_ice_parameters(session: &SessionDescription) -> Option<IceParameters> {
    let username_fragment = transport_attribute(session, "ice-ufrag")?;
    let password = transport_attribute(session, "ice-pwd")?;
    Some(IceParameters {
        username_fragment: username_fragment.to_string(),
        password: password.to_string(),
        ice_lite: session.attributes.iter().any(|a| a.key == "ice-lite"),
    })
}

/// Gathered candidates of the bundle transport
pub fn extract_ice_candidates(session: &SessionDescription) -> Vec<IceCandidate> {
    let Some(media) = session.media_descriptions.first() else {
        return vec![];
    };
    let mut candidates: Vec<IceCandidate> = vec![];
    for value in attribute_values(&media.attributes, "candidate") {
        if let Some(candidate) = IceCandidate::from_sdp_value(value) {
            if !candidates.contains(&candidate) {
                candidates.push(candidate);
            }
        }
    }
    candidates
}

/// Codecs listed in one section, in m-line order
pub fn section_codecs(media: &MediaDescription, kind: MediaKind) -> Vec<RtpCodecParameters> {
    let mut codecs: Vec<RtpCodecParameters> = vec![];

    for rtpmap in attribute_values(&media.attributes, "rtpmap") {
        let Some((pt, encoding)) = rtpmap.trim().split_once(' ') else {
            continue;
        };
        let Ok(payload_type) = pt.parse::<u8>() else {
            continue;
        };
        let mut parts = encoding.split('/');
        let name = parts.next().unwrap_or_default();
        let Some(clock_rate) = parts.next().and_then(|c| c.parse::<u32>().ok()) else {
            continue;
        };
        let mut codec = RtpCodecParameters::new(format!("{}/{}", kind, name), payload_type, clock_rate);
        codec.channels = parts.next().and_then(|c| c.parse::<u8>().ok());
        if kind == MediaKind::Audio && codec.channels.is_none() {
            codec.channels = Some(1);
        }
        codecs.push(codec);
    }

    for fmtp in attribute_values(&media.attributes, "fmtp") {
        let Some((pt, config)) = fmtp.trim().split_once(' ') else {
            continue;
        };
        if let Some(codec) = codec_by_pt(&mut codecs, pt) {
            codec.parameters = parse_fmtp(config);
        }
    }

    for fb in attribute_values(&media.attributes, "rtcp-fb") {
        let mut fields = fb.split_whitespace();
        let (Some(pt), Some(typ)) = (fields.next(), fields.next()) else {
            continue;
        };
        let feedback = RtcpFeedback::new(typ, fields.collect::<Vec<_>>().join(" "));
        if pt == "*" {
            for codec in codecs.iter_mut().filter(|c| !c.is_rtx()) {
                if !codec.rtcp_feedback.contains(&feedback) {
                    codec.rtcp_feedback.push(feedback.clone());
                }
            }
        } else if let Some(codec) = codec_by_pt(&mut codecs, pt) {
            if !codec.rtcp_feedback.contains(&feedback) {
                codec.rtcp_feedback.push(feedback);
            }
        }
    }

    // Keep the preference order of the m-line
    let order: Vec<&str> = media.media_name.formats.iter().map(|f| f.as_str()).collect();
    codecs.sort_by_key(|c| {
        order
            .iter()
            .position(|f| *f == c.payload_type.to_string())
            .unwrap_or(usize::MAX)
    });
    codecs
}

fn codec_by_pt<'a>(codecs: &'a mut [RtpCodecParameters], pt: &str) -> Option<&'a mut RtpCodecParameters> {
    let pt = pt.parse::<u8>().ok()?;
    codecs.iter_mut().find(|c| c.payload_type == pt)
}

/// Header extensions listed in one section
pub fn section_header_extensions(media: &MediaDescription) -> Vec<RtpHeaderExtensionParameters> {
    attribute_values(&media.attributes, "extmap")
        .filter_map(|value| {
            let mut fields = value.split_whitespace();
            // "id[/direction] uri [attributes]"
            let id = fields.next()?.split('/').next()?.parse::<u16>().ok()?;
            let uri = fields.next()?;
            Some(RtpHeaderExtensionParameters {
                uri: uri.to_string(),
                id,
                encrypt: false,
            })
        })
        .collect()
}

/// Everything the engine offers across all audio/video sections
pub fn extract_rtp_capabilities(session: &SessionDescription) -> RtpCapabilities {
    let mut capabilities = RtpCapabilities::default();
    let mut seen_codecs: HashSet<(MediaKind, u8)> = HashSet::new();
    let mut seen_extensions: HashSet<(MediaKind, String)> = HashSet::new();

    for media in &session.media_descriptions {
        let Some(kind) = media_kind(media) else {
            continue;
        };

        for codec in section_codecs(media, kind) {
            if !seen_codecs.insert((kind, codec.payload_type)) {
                continue;
            }
            capabilities.codecs.push(RtpCodecCapability {
                kind,
                mime_type: codec.mime_type,
                preferred_payload_type: Some(codec.payload_type),
                clock_rate: codec.clock_rate,
                channels: codec.channels,
                parameters: codec.parameters,
                rtcp_feedback: codec.rtcp_feedback,
            });
        }

        for ext in section_header_extensions(media) {
            if !seen_extensions.insert((kind, ext.uri.clone())) {
                continue;
            }
            capabilities.header_extensions.push(RtpHeaderExtension {
                kind: Some(kind),
                uri: ext.uri,
                preferred_id: ext.id,
            });
        }
    }

    capabilities
}

/// Intersect a sending template with what the engine offered for one section
///
/// Payload types and extension ids are taken from the offer, so the answer
/// built from the result matches what the engine will actually send.
pub fn negotiate_rtp_parameters(
    template: &RtpParameters,
    kind: MediaKind,
    media: &MediaDescription,
) -> Result<RtpParameters> {
    let offered = section_codecs(media, kind);
    let mut codecs: Vec<RtpCodecParameters> = vec![];
    // template payload type -> engine payload type
    let mut pt_map: HashMap<u8, u8> = HashMap::new();

    for codec in template.codecs.iter().filter(|c| !c.is_rtx()) {
        let matched = offered.iter().find(|o| {
            !o.is_rtx()
                && o.matches(&codec.mime_type, codec.clock_rate, codec.channels)
                && !pt_map.values().any(|pt| *pt == o.payload_type)
        });
        let Some(offer) = matched else {
            continue;
        };

        let mut negotiated = codec.clone();
        negotiated.payload_type = offer.payload_type;
        if !offer.rtcp_feedback.is_empty() {
            negotiated
                .rtcp_feedback
                .retain(|fb| offer.rtcp_feedback.contains(fb));
        }
        pt_map.insert(codec.payload_type, offer.payload_type);
        codecs.push(negotiated);
    }

    if codecs.is_empty() {
        return Err(HandlerError::NegotiationFailed(format!(
            "no common {} codec between sending parameters and engine offer",
            kind
        )));
    }

    for rtx in template.codecs.iter().filter(|c| c.is_rtx()) {
        let Some(apt) = rtx.apt().and_then(|apt| pt_map.get(&apt).copied()) else {
            continue;
        };
        let Some(offer) = offered.iter().find(|o| o.is_rtx() && o.apt() == Some(apt)) else {
            continue;
        };
        let mut negotiated = rtx.clone();
        negotiated.payload_type = offer.payload_type;
        negotiated
            .parameters
            .insert("apt".to_string(), serde_json::Value::from(apt));
        codecs.push(negotiated);
    }

    let offered_extensions = section_header_extensions(media);
    let header_extensions = template
        .header_extensions
        .iter()
        .filter_map(|ext| {
            offered_extensions
                .iter()
                .find(|o| o.uri == ext.uri)
                .map(|o| RtpHeaderExtensionParameters {
                    uri: ext.uri.clone(),
                    id: o.id,
                    encrypt: ext.encrypt,
                })
        })
        .collect();

    Ok(RtpParameters {
        mid: media_mid(media).map(str::to_string),
        codecs,
        header_extensions,
        encodings: vec![],
        rtcp: template.rtcp.clone(),
    })
}

/// One `a=ssrc:<ssrc> <attribute>:<value>` line
struct SsrcLine {
    ssrc: u32,
    attribute: String,
    value: String,
}

fn ssrc_lines(media: &MediaDescription) -> Vec<SsrcLine> {
    attribute_values(&media.attributes, "ssrc")
        .filter_map(|line| {
            let (ssrc, rest) = line.trim().split_once(' ')?;
            let (attribute, value) = rest.split_once(':').unwrap_or((rest, ""));
            Some(SsrcLine {
                ssrc: ssrc.parse().ok()?,
                attribute: attribute.to_string(),
                value: value.to_string(),
            })
        })
        .collect()
}

/// `a=ssrc-group:<semantics> <ssrc>...`
fn ssrc_groups(media: &MediaDescription, semantics: &str) -> Vec<Vec<u32>> {
    attribute_values(&media.attributes, "ssrc-group")
        .filter_map(|value| {
            let mut fields = value.split_whitespace();
            if fields.next()? != semantics {
                return None;
            }
            Some(fields.filter_map(|s| s.parse().ok()).collect())
        })
        .collect()
}

/// `a=rid:<id> send` ids, in announcement order
fn send_rids(media: &MediaDescription) -> Vec<String> {
    attribute_values(&media.attributes, "rid")
        .filter_map(|value| {
            let mut fields = value.split_whitespace();
            let id = fields.next()?;
            (fields.next()? == "send").then(|| id.to_string())
        })
        .collect()
}

/// SSRCs a track sends with: primary streams (layer order) and their RTX pairs
struct TrackSsrcs {
    primaries: Vec<u32>,
    rtx: HashMap<u32, u32>,
    rids: Vec<String>,
    cname: Option<String>,
}

fn track_ssrcs(media: &MediaDescription, track_id: &str) -> Option<TrackSsrcs> {
    let lines = ssrc_lines(media);

    let mut owned: Vec<u32> = lines
        .iter()
        .filter(|l| l.attribute == "msid" && l.value.split_whitespace().nth(1) == Some(track_id))
        .map(|l| l.ssrc)
        .collect();
    if owned.is_empty() {
        // Engines that only announce a=msid at section level
        owned = lines.iter().map(|l| l.ssrc).collect();
    }
    owned.dedup();
    let first = *owned.first()?;

    let rtx: HashMap<u32, u32> = ssrc_groups(media, "FID")
        .into_iter()
        .filter(|g| g.len() == 2 && owned.contains(&g[0]))
        .map(|g| (g[0], g[1]))
        .collect();

    // Simulcast comes either as a SIM group or as one primary per send rid
    let rids = send_rids(media);
    let primaries = ssrc_groups(media, "SIM")
        .into_iter()
        .find(|g| g.first().is_some_and(|s| owned.contains(s)))
        .unwrap_or_else(|| {
            owned
                .iter()
                .copied()
                .filter(|s| !rtx.values().any(|r| r == s))
                .take(rids.len().max(1))
                .collect()
        });
    let rids = if rids.len() == primaries.len() && primaries.len() > 1 {
        rids
    } else {
        vec![]
    };

    let cname = lines
        .iter()
        .find(|l| l.ssrc == first && l.attribute == "cname")
        .map(|l| l.value.clone());

    Some(TrackSsrcs {
        primaries,
        rtx,
        rids,
        cname,
    })
}

/// Fill encodings and RTCP cname of `params` from the section of a track
pub fn fill_rtp_parameters_for_track(
    params: &mut RtpParameters,
    media: &MediaDescription,
    track_id: &str,
    simulcast: &[SimulcastLayer],
) -> Result<()> {
    let ssrcs = track_ssrcs(media, track_id).ok_or_else(|| {
        HandlerError::NegotiationFailed(format!("no SSRC announced for track {}", track_id))
    })?;

    params.encodings = ssrcs
        .primaries
        .iter()
        .enumerate()
        .map(|(i, ssrc)| {
            let layer = simulcast.get(i);
            RtpEncodingParameters {
                ssrc: Some(*ssrc),
                rid: ssrcs.rids.get(i).cloned(),
                rtx: ssrcs.rtx.get(ssrc).map(|r| RtxParameters { ssrc: *r }),
                active: true,
                max_bitrate: layer.and_then(|l| l.max_bitrate),
                scale_resolution_down_by: layer.and_then(|l| l.scale_resolution_down_by),
            }
        })
        .collect();

    if params.encodings.is_empty() {
        return Err(HandlerError::NegotiationFailed(format!(
            "no primary SSRC for track {}",
            track_id
        )));
    }

    params.rtcp.cname = ssrcs.cname;
    Ok(())
}
