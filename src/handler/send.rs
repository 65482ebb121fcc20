//! Producing side of a transport

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{Handler, HandlerListener, TransportHandler};
use crate::config::HandlerConfig;
use crate::engine::{MediaTrack, OfferOptions, PeerConnection, SdpType};
use crate::error::{HandlerError, Result};
use crate::rtp_parameters::{MediaKind, RtpParameters, SimulcastLayer};
use crate::sdp::utils::{
    fill_rtp_parameters_for_track, find_track_section, media_mid, negotiate_rtp_parameters,
    parse_sdp,
};
use crate::transport::{DtlsRole, IceParameters, TransportRemoteParameters};

/// One track being sent
#[derive(Debug, Clone)]
pub struct SendTrackEntry<T> {
    track: T,
    mid: String,
    rtp_parameters: RtpParameters,
    /// Highest active spatial layer, `None` when every encoding is active
    max_spatial_layer: Option<u8>,
}

impl<T> SendTrackEntry<T> {
    pub fn track(&self) -> &T {
        &self.track
    }

    pub fn mid(&self) -> &str {
        &self.mid
    }

    pub fn rtp_parameters(&self) -> &RtpParameters {
        &self.rtp_parameters
    }

    pub fn max_spatial_layer(&self) -> Option<u8> {
        self.max_spatial_layer
    }
}

/// Send handler
///
/// Every sent track gets its own m-section. Stopping a track closes its
/// section for good; sending the same track again allocates a new one.
pub struct SendHandler<P: PeerConnection> {
    core: Handler<P>,
    tracks: HashMap<String, SendTrackEntry<P::LocalTrack>>,
}

impl<P: PeerConnection> SendHandler<P> {
    pub async fn new(
        listener: Arc<dyn HandlerListener>,
        remote: TransportRemoteParameters,
        config: HandlerConfig,
    ) -> Result<Self> {
        Ok(Self {
            core: Handler::new(listener, remote, config).await?,
            tracks: HashMap::new(),
        })
    }

    /// Start sending a track and return the RTP parameters to hand to the SFU
    ///
    /// `simulcast` lists the video encodings to produce, low to high; it is
    /// ignored for audio. The engine announces the encodings itself, so the
    /// track must be able to feed that many.
    pub async fn send(
        &mut self,
        track: P::LocalTrack,
        simulcast: &[SimulcastLayer],
    ) -> Result<RtpParameters> {
        self.core.ensure_open()?;

        let track_id = track.id();
        let kind = track.kind();
        if self.tracks.contains_key(&track_id) {
            return Err(HandlerError::DuplicateTrack(track_id));
        }
        let template = self
            .core
            .config
            .sending_rtp_parameters_by_kind
            .get(&kind)
            .cloned()
            .ok_or_else(|| {
                HandlerError::InvalidParameters(format!("no sending RTP parameters for {}", kind))
            })?;
        let layers: &[SimulcastLayer] = match kind {
            MediaKind::Video => simulcast,
            MediaKind::Audio => &[],
        };

        debug!(
            "Sending {} track {} ({} simulcast layers)",
            kind,
            track_id,
            layers.len()
        );
        self.core
            .step(self.core.engine.add_track(track.clone(), layers.len()))
            .await?;

        match self.negotiate_send(&track_id, kind, &template, layers).await {
            Ok(rtp_parameters) => {
                let mid = rtp_parameters.mid.clone().unwrap_or_default();
                info!("Sending {} track {} on mid {}", kind, track_id, mid);
                self.tracks.insert(
                    track_id,
                    SendTrackEntry {
                        track,
                        mid,
                        rtp_parameters: rtp_parameters.clone(),
                        max_spatial_layer: None,
                    },
                );
                Ok(rtp_parameters)
            }
            Err(e) => {
                if !e.is_closed() {
                    if let Err(rollback) = self.core.engine.remove_track(&track_id).await {
                        warn!("Failed to detach track {} after error: {}", track_id, rollback);
                    }
                }
                Err(e)
            }
        }
    }

    async fn negotiate_send(
        &mut self,
        track_id: &str,
        kind: MediaKind,
        template: &RtpParameters,
        layers: &[SimulcastLayer],
    ) -> Result<RtpParameters> {
        let offer = self
            .core
            .step(self.core.engine.create_offer(OfferOptions::default()))
            .await?;
        let local = parse_sdp(&offer)?;

        // Sections before `answered` belong to earlier tracks, including
        // stopped ones that still announce this track's msid
        let answered = self.core.remote_sdp.sections().len();
        let index = find_track_section(&local, track_id, answered).ok_or_else(|| {
            HandlerError::NegotiationFailed(format!("track {} missing from local offer", track_id))
        })?;
        let mid = media_mid(&local.media_descriptions[index])
            .ok_or_else(|| HandlerError::NegotiationFailed("local section without mid".to_string()))?
            .to_string();
        if self.core.remote_sdp.has_mid(&mid) {
            return Err(HandlerError::NegotiationFailed(format!(
                "engine reused m-section {} (mid {}) for track {}",
                index, mid, track_id
            )));
        }

        let media = &local.media_descriptions[index];
        let mut rtp_parameters = negotiate_rtp_parameters(template, kind, media)?;
        fill_rtp_parameters_for_track(&mut rtp_parameters, media, track_id, layers)?;
        if layers.len() > 1 && rtp_parameters.encodings.len() != layers.len() {
            return Err(HandlerError::NegotiationFailed(format!(
                "engine announced {} encodings for {} simulcast layers of track {}",
                rtp_parameters.encodings.len(),
                layers.len(),
                track_id
            )));
        }

        debug!("Local offer for track {}:\n{}", track_id, offer);
        self.core
            .step(self.core.engine.set_local_description(SdpType::Offer, offer))
            .await?;

        // The SFU answers, so the local side is the DTLS server
        self.core.setup_transport(DtlsRole::Server, &local).await?;
        self.core.reject_unanswered_sections(&local, index)?;

        self.core.ensure_open()?;
        let mid = self.core.remote_sdp.add_sending_media(kind, &rtp_parameters)?;
        let answer = self.core.remote_sdp.get_sdp();
        debug!("Remote answer for track {}:\n{}", track_id, answer);

        if let Err(e) = self
            .core
            .step(self.core.engine.set_remote_description(SdpType::Answer, answer))
            .await
        {
            if !e.is_closed() {
                self.core.remote_sdp.close_media_section(&mid)?;
            }
            return Err(e);
        }

        Ok(rtp_parameters)
    }

    /// Stop sending a track and close its m-section
    pub async fn stop_sending(&mut self, track_id: &str) -> Result<()> {
        self.core.ensure_open()?;
        let mid = self
            .tracks
            .get(track_id)
            .map(|entry| entry.mid.clone())
            .ok_or_else(|| HandlerError::UnknownTrack(track_id.to_string()))?;

        self.core.step(self.core.engine.remove_track(track_id)).await?;

        self.core.ensure_open()?;
        self.core.remote_sdp.close_media_section(&mid)?;
        self.tracks.remove(track_id);
        info!("Stopped sending track {} (mid {})", track_id, mid);

        self.renegotiate(OfferOptions::default()).await
    }

    /// Swap the media source of a sent track in place
    ///
    /// `mid` and SSRCs are kept; no renegotiation happens. The entry is
    /// re-keyed under the new track's id.
    pub async fn replace_track(&mut self, track_id: &str, new_track: P::LocalTrack) -> Result<()> {
        self.core.ensure_open()?;
        let kind = self
            .tracks
            .get(track_id)
            .map(|entry| entry.track.kind())
            .ok_or_else(|| HandlerError::UnknownTrack(track_id.to_string()))?;

        let new_id = new_track.id();
        if new_id != track_id && self.tracks.contains_key(&new_id) {
            return Err(HandlerError::DuplicateTrack(new_id));
        }
        if new_track.kind() != kind {
            return Err(HandlerError::InvalidParameters(format!(
                "cannot replace {} track {} with {} track {}",
                kind,
                track_id,
                new_track.kind(),
                new_id
            )));
        }

        self.core
            .step(self.core.engine.replace_track(track_id, new_track.clone()))
            .await?;

        if let Some(mut entry) = self.tracks.remove(track_id) {
            entry.track = new_track;
            self.tracks.insert(new_id.clone(), entry);
        }
        info!("Replaced track {} with {}", track_id, new_id);
        Ok(())
    }

    /// Keep encodings `0..=layer` active and pause the rest
    pub async fn set_max_spatial_layer(&mut self, track_id: &str, layer: u8) -> Result<()> {
        self.core.ensure_open()?;
        let encodings = self
            .tracks
            .get(track_id)
            .map(|entry| entry.rtp_parameters.encodings.len())
            .ok_or_else(|| HandlerError::UnknownTrack(track_id.to_string()))?;

        if usize::from(layer) >= encodings {
            return Err(HandlerError::InvalidLayer { layer, encodings });
        }

        let active: Vec<bool> = (0..encodings).map(|i| i <= usize::from(layer)).collect();
        self.core
            .step(self.core.engine.set_encodings_active(track_id, active.clone()))
            .await?;

        if let Some(entry) = self.tracks.get_mut(track_id) {
            for (encoding, active) in entry.rtp_parameters.encodings.iter_mut().zip(active) {
                encoding.active = active;
            }
            entry.max_spatial_layer = Some(layer);
        }
        debug!("Track {} max spatial layer set to {}", track_id, layer);
        Ok(())
    }

    pub async fn sender_stats(&self, track_id: &str) -> Result<Value> {
        self.core.ensure_open()?;
        if !self.tracks.contains_key(track_id) {
            return Err(HandlerError::UnknownTrack(track_id.to_string()));
        }
        self.core.step(self.core.engine.sender_stats(track_id)).await
    }

    /// Tracks currently being sent
    pub fn tracks(&self) -> impl Iterator<Item = &SendTrackEntry<P::LocalTrack>> {
        self.tracks.values()
    }

    pub fn track(&self, track_id: &str) -> Option<&SendTrackEntry<P::LocalTrack>> {
        self.tracks.get(track_id)
    }

    /// Local offer, remote answer
    async fn renegotiate(&mut self, options: OfferOptions) -> Result<()> {
        let offer = self.core.step(self.core.engine.create_offer(options)).await?;
        let local = parse_sdp(&offer)?;
        self.core
            .step(self.core.engine.set_local_description(SdpType::Offer, offer))
            .await?;

        self.core.ensure_open()?;
        self.core
            .reject_unanswered_sections(&local, local.media_descriptions.len())?;
        let answer = self.core.remote_sdp.get_sdp();
        self.core
            .step(self.core.engine.set_remote_description(SdpType::Answer, answer))
            .await
    }
}

#[async_trait]
impl<P: PeerConnection> TransportHandler for SendHandler<P> {
    type Engine = P;

    fn handler(&self) -> &Handler<P> {
        &self.core
    }

    fn handler_mut(&mut self) -> &mut Handler<P> {
        &mut self.core
    }

    async fn restart_ice(&mut self, remote: IceParameters) -> Result<()> {
        self.core.update_remote_ice_parameters(remote)?;
        if !self.core.transport_ready {
            debug!("ICE restart before transport setup, remote parameters stored");
            return Ok(());
        }

        self.renegotiate(OfferOptions { ice_restart: true }).await?;
        info!("ICE restarted (send)");
        Ok(())
    }
}
