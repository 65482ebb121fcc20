//! Consuming side of a transport

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use super::{Handler, HandlerListener, TransportHandler};
use crate::config::HandlerConfig;
use crate::engine::{PeerConnection, SdpType};
use crate::error::{HandlerError, Result};
use crate::rtp_parameters::{MediaKind, RtpParameters};
use crate::sdp::utils::parse_sdp;
use crate::transport::{DtlsRole, IceParameters, TransportRemoteParameters};

/// Bookkeeping of one consumer
///
/// Entries are never removed. Stopping a consumer only flags it closed, so
/// its id stays reserved for the lifetime of the handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiverInfo {
    pub mid: String,
    pub kind: MediaKind,
    pub closed: bool,
    pub track_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssrc: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rtx_ssrc: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cname: Option<String>,
}

/// Receive handler
///
/// The SFU offers and the engine answers, so `mid`s come from the caller's
/// RTP parameters and the local DTLS role is client.
pub struct RecvHandler<P: PeerConnection> {
    core: Handler<P>,
    receivers: HashMap<String, ReceiverInfo>,
}

impl<P: PeerConnection> RecvHandler<P> {
    pub async fn new(
        listener: Arc<dyn HandlerListener>,
        remote: TransportRemoteParameters,
        config: HandlerConfig,
    ) -> Result<Self> {
        Ok(Self {
            core: Handler::new(listener, remote, config).await?,
            receivers: HashMap::new(),
        })
    }

    /// Start receiving the stream of consumer `id` and return its receiver
    ///
    /// Without a `mid` in `rtp_parameters` the next unused one is taken. The
    /// receiver exists once negotiation completes; its media track shows up
    /// when the first packets arrive.
    pub async fn receive(
        &mut self,
        id: &str,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<P::RemoteTrack> {
        self.core.ensure_open()?;
        if self.receivers.contains_key(id) {
            return Err(HandlerError::DuplicateId(id.to_string()));
        }

        let mid = rtp_parameters
            .mid
            .clone()
            .unwrap_or_else(|| self.core.remote_sdp.next_mid());
        if self.core.remote_sdp.has_mid(&mid) {
            return Err(HandlerError::InvalidParameters(format!(
                "mid {} already used in this session",
                mid
            )));
        }

        let track_id = format!("consumer-{}-{}", kind, id);
        let info = ReceiverInfo {
            mid: mid.clone(),
            kind,
            closed: false,
            track_id: track_id.clone(),
            ssrc: rtp_parameters.ssrc(),
            rtx_ssrc: rtp_parameters.rtx_ssrc(),
            cname: rtp_parameters.rtcp.cname.clone(),
        };

        self.core
            .remote_sdp
            .add_receiving_media(kind, &mid, &rtp_parameters, &track_id)?;

        match self.negotiate_receive(&mid).await {
            Ok(track) => {
                info!("Receiving {} consumer {} on mid {}", kind, id, mid);
                self.receivers.insert(id.to_string(), info);
                Ok(track)
            }
            Err(e) => {
                if !e.is_closed() {
                    self.core.remote_sdp.close_media_section(&mid)?;
                }
                Err(e)
            }
        }
    }

    async fn negotiate_receive(&mut self, mid: &str) -> Result<P::RemoteTrack> {
        let offer = self.core.remote_sdp.get_sdp();
        debug!("Remote offer for mid {}:\n{}", mid, offer);
        self.core
            .step(self.core.engine.set_remote_description(SdpType::Offer, offer))
            .await?;

        let answer = self.core.step(self.core.engine.create_answer()).await?;
        let local = parse_sdp(&answer)?;

        debug!("Local answer for mid {}:\n{}", mid, answer);
        self.core
            .step(self.core.engine.set_local_description(SdpType::Answer, answer))
            .await?;

        // The SFU offers, so the local side is the DTLS client
        self.core.setup_transport(DtlsRole::Client, &local).await?;

        let receiver = self
            .core
            .step(async { Ok::<_, HandlerError>(self.core.engine.remote_track(mid).await) })
            .await?;
        receiver.ok_or_else(|| {
            HandlerError::NegotiationFailed(format!("no receiver negotiated for mid {}", mid))
        })
    }

    /// Stop receiving consumer `id` and close its m-section
    pub async fn stop_receiving(&mut self, id: &str) -> Result<()> {
        self.core.ensure_open()?;
        let mid = match self.receivers.get_mut(id) {
            Some(info) if !info.closed => {
                info.closed = true;
                info.mid.clone()
            }
            _ => return Err(HandlerError::UnknownId(id.to_string())),
        };

        self.core.remote_sdp.close_media_section(&mid)?;
        info!("Stopped receiving consumer {} (mid {})", id, mid);

        self.renegotiate().await
    }

    pub async fn receiver_stats(&self, id: &str) -> Result<Value> {
        self.core.ensure_open()?;
        let mid = self
            .receivers
            .get(id)
            .filter(|info| !info.closed)
            .map(|info| info.mid.clone())
            .ok_or_else(|| HandlerError::UnknownId(id.to_string()))?;
        self.core.step(self.core.engine.receiver_stats(&mid)).await
    }

    /// Bookkeeping of consumer `id`, closed or not
    pub fn receiver_info(&self, id: &str) -> Option<&ReceiverInfo> {
        self.receivers.get(id)
    }

    pub fn receivers(&self) -> impl Iterator<Item = (&str, &ReceiverInfo)> {
        self.receivers.iter().map(|(id, info)| (id.as_str(), info))
    }

    /// Remote offer, local answer
    async fn renegotiate(&mut self) -> Result<()> {
        let offer = self.core.remote_sdp.get_sdp();
        self.core
            .step(self.core.engine.set_remote_description(SdpType::Offer, offer))
            .await?;
        let answer = self.core.step(self.core.engine.create_answer()).await?;
        self.core
            .step(self.core.engine.set_local_description(SdpType::Answer, answer))
            .await
    }
}

#[async_trait]
impl<P: PeerConnection> TransportHandler for RecvHandler<P> {
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

        self.renegotiate().await?;
        info!("ICE restarted (recv)");
        Ok(())
    }
}
