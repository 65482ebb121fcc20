//! Transport negotiation handlers
//!
//! A [`Handler`] owns one engine connection and the [`RemoteSdp`] that models
//! the SFU side of it. [`SendHandler`] and [`RecvHandler`] compose it and add
//! the producing and consuming track lifecycles.
//!
//! Lifecycle:
//!
//! ```text
//! Uninitialized -> TransportConnecting -> TransportReady -> Closed
//! ```
//!
//! The transport is set up once, on the first successful local description.
//! After that, adding or removing media only adds or closes m-sections.

mod recv;
mod send;

pub use recv::{ReceiverInfo, RecvHandler};
pub use send::{SendHandler, SendTrackEntry};

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::sdp::description::session::SessionDescription;

use crate::config::{HandlerConfig, IceServer};
use crate::engine::{
    event_channel, Direction, EngineEvent, EngineEventReceiver, IceConnectionState, OfferOptions,
    PeerConnection,
};
use crate::error::{HandlerError, Result};
use crate::rtp_parameters::{MediaKind, RtpCapabilities};
use crate::sdp::utils::{
    extract_dtls_parameters, extract_ice_candidates, extract_ice_parameters,
    extract_rtp_capabilities, media_kind, media_mid, parse_sdp,
};
use crate::sdp::RemoteSdp;
use crate::transport::{
    DtlsRole, IceCandidate, IceParameters, TransportLocalParameters, TransportRemoteParameters,
};

/// Notifications a handler sends to its owner
pub trait HandlerListener: Send + Sync {
    /// Local transport parameters are known; called once per handler
    fn on_connect(&self, parameters: &TransportLocalParameters);

    /// The engine reported a new ICE connection state
    fn on_connection_state_change(&self, state: IceConnectionState);
}

/// Handler lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HandlerState {
    /// No local description yet
    Uninitialized,
    /// First local description produced, transport parameters being handed out
    TransportConnecting,
    /// Transport set up, tracks can be added and removed
    TransportReady,
    /// Terminal
    Closed,
}

impl std::fmt::Display for HandlerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandlerState::Uninitialized => write!(f, "uninitialized"),
            HandlerState::TransportConnecting => write!(f, "transport-connecting"),
            HandlerState::TransportReady => write!(f, "transport-ready"),
            HandlerState::Closed => write!(f, "closed"),
        }
    }
}

/// Closes a handler from another task
///
/// Any engine exchange the handler is awaiting is abandoned and the pending
/// operation fails with [`HandlerError::Closed`]. The engine connection itself
/// is released by the owner's next [`Handler::close`].
#[derive(Debug, Clone)]
pub struct CloseHandle {
    token: CancellationToken,
}

impl CloseHandle {
    pub fn close(&self) {
        self.token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Shared negotiation core of the send and receive handlers
pub struct Handler<P: PeerConnection> {
    engine: P,
    remote_sdp: RemoteSdp,
    listener: Arc<dyn HandlerListener>,
    events: EngineEventReceiver,
    config: HandlerConfig,
    cancel: CancellationToken,
    transport_ready: bool,
    state: HandlerState,
    local_parameters: Option<TransportLocalParameters>,
    engine_closed: bool,
}

impl<P: PeerConnection> Handler<P> {
    /// Build the engine connection and an empty remote description
    pub async fn new(
        listener: Arc<dyn HandlerListener>,
        remote: TransportRemoteParameters,
        config: HandlerConfig,
    ) -> Result<Self> {
        let (events_tx, events) = event_channel();
        let engine = P::connect(&config, events_tx).await?;

        debug!(
            "{} handler created (SFU ice-lite: {})",
            P::name(),
            remote.ice_parameters.ice_lite
        );

        Ok(Self {
            engine,
            remote_sdp: RemoteSdp::new(remote),
            listener,
            events,
            config,
            cancel: CancellationToken::new(),
            transport_ready: false,
            state: HandlerState::Uninitialized,
            local_parameters: None,
            engine_closed: false,
        })
    }

    /// Engine name
    pub fn name() -> &'static str {
        P::name()
    }

    /// Codecs and header extensions the engine supports
    ///
    /// Uses a throwaway connection with one receive-only audio and video
    /// transceiver and reads its offer.
    pub async fn native_rtp_capabilities(config: &HandlerConfig) -> Result<RtpCapabilities> {
        let (events_tx, _events) = event_channel();
        let engine = P::connect(config, events_tx).await?;

        let result = async {
            engine
                .add_transceiver(MediaKind::Audio, Direction::RecvOnly)
                .await?;
            engine
                .add_transceiver(MediaKind::Video, Direction::RecvOnly)
                .await?;
            let offer = engine.create_offer(OfferOptions::default()).await?;
            Ok::<_, HandlerError>(extract_rtp_capabilities(&parse_sdp(&offer)?))
        }
        .await;

        if let Err(e) = engine.close().await {
            warn!("Failed to close capability query connection: {}", e);
        }
        result
    }

    pub fn state(&self) -> HandlerState {
        if self.cancel.is_cancelled() {
            HandlerState::Closed
        } else {
            self.state
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state() == HandlerState::Closed
    }

    pub fn is_transport_ready(&self) -> bool {
        self.transport_ready
    }

    pub fn close_handle(&self) -> CloseHandle {
        CloseHandle {
            token: self.cancel.clone(),
        }
    }

    /// Engine connection
    pub fn engine(&self) -> &P {
        &self.engine
    }

    pub fn config(&self) -> &HandlerConfig {
        &self.config
    }

    /// Local transport parameters, once the transport is set up
    pub fn local_parameters(&self) -> Option<&TransportLocalParameters> {
        self.local_parameters.as_ref()
    }

    /// Current remote description text
    pub fn remote_description(&self) -> String {
        self.remote_sdp.get_sdp()
    }

    /// `mid`s of the open m-sections of the remote description
    pub fn active_mids(&self) -> Vec<String> {
        self.remote_sdp
            .active_mids()
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    /// Queue an SFU candidate; it is announced on the next negotiation
    pub fn add_remote_ice_candidate(&mut self, candidate: IceCandidate) -> Result<()> {
        self.ensure_open()?;
        self.remote_sdp.add_ice_candidate(candidate);
        Ok(())
    }

    /// Relay every queued engine notification to the listener
    ///
    /// Returns the number of notifications drained.
    pub fn dispatch_events(&mut self) -> usize {
        let mut count = 0;
        while let Ok(event) = self.events.try_recv() {
            self.handle_event(event);
            count += 1;
        }
        count
    }

    /// Wait for the next ICE connection state change and relay it
    ///
    /// Returns `None` once the handler is closed.
    pub async fn next_connection_state(&mut self) -> Option<IceConnectionState> {
        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                event = self.events.recv() => event?,
            };
            if let Some(state) = self.handle_event(event) {
                return Some(state);
            }
        }
    }

    fn handle_event(&self, event: EngineEvent) -> Option<IceConnectionState> {
        match event {
            EngineEvent::IceConnectionStateChange(state) => {
                debug!("{} ICE connection state: {}", P::name(), state);
                if self.is_closed() {
                    return None;
                }
                self.listener.on_connection_state_change(state);
                Some(state)
            }
            EngineEvent::IceGatheringStateChange(state) => {
                debug!("{} ICE gathering state: {}", P::name(), state);
                None
            }
        }
    }

    pub async fn transport_stats(&self) -> Result<Value> {
        self.ensure_open()?;
        self.step(self.engine.stats()).await
    }

    pub async fn update_ice_servers(&mut self, ice_servers: Vec<IceServer>) -> Result<()> {
        self.ensure_open()?;
        self.step(self.engine.set_ice_servers(&ice_servers)).await?;
        info!("ICE servers updated ({} entries)", ice_servers.len());
        self.config.ice_servers = ice_servers;
        Ok(())
    }

    /// Close the handler; safe to call any number of times
    pub async fn close(&mut self) {
        self.cancel.cancel();
        self.state = HandlerState::Closed;
        self.remote_sdp.close();

        if self.engine_closed {
            return;
        }
        self.engine_closed = true;

        if let Err(e) = self.engine.close().await {
            warn!("Failed to close {} connection: {}", P::name(), e);
        }
        info!("{} handler closed", P::name());
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(HandlerError::Closed);
        }
        Ok(())
    }

    /// Await one engine step, abandoning it if the handler gets closed
    ///
    /// A step that completes after close is reported as [`HandlerError::Closed`]
    /// so its result never reaches the remote description or the listener.
    async fn step<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(HandlerError::Closed),
            res = fut => {
                if self.cancel.is_cancelled() {
                    Err(HandlerError::Closed)
                } else {
                    res
                }
            }
        }
    }

    /// Set up the transport from the first applied local description
    ///
    /// Records the DTLS role, hands the local parameters to the listener and
    /// marks the transport ready. Later calls are no-ops. Candidates come from
    /// the engine's applied description, since created ones carry none before
    /// gathering starts; the ice-lite SFU learns any missing ones from checks.
    async fn setup_transport(&mut self, local_role: DtlsRole, local: &SessionDescription) -> Result<()> {
        if self.transport_ready {
            return Ok(());
        }
        self.ensure_open()?;

        let mut dtls_parameters = extract_dtls_parameters(local)
            .map_err(|e| HandlerError::NegotiationFailed(e.to_string()))?;
        dtls_parameters.role = local_role;

        let applied = self
            .step(async { Ok::<_, HandlerError>(self.engine.local_description().await) })
            .await?;
        let mut ice_candidates = match applied {
            Some(sdp) => extract_ice_candidates(&parse_sdp(&sdp)?),
            None => vec![],
        };
        if ice_candidates.is_empty() {
            ice_candidates = extract_ice_candidates(local);
        }

        let parameters = TransportLocalParameters {
            dtls_parameters,
            ice_parameters: extract_ice_parameters(local),
            ice_candidates,
        };

        let candidates = parameters.ice_candidates.len();
        self.state = HandlerState::TransportConnecting;
        self.remote_sdp.update_dtls_role(local_role);
        self.listener.on_connect(&parameters);
        self.local_parameters = Some(parameters);
        self.transport_ready = true;
        self.state = HandlerState::TransportReady;

        info!(
            "Transport ready (local DTLS role {}, {} candidates)",
            local_role, candidates
        );
        Ok(())
    }

    /// Reject local sections in `[answered, until)` the remote description
    /// does not cover yet
    ///
    /// Such sections are left over from negotiations that failed after the
    /// engine had already assigned their `mid`.
    fn reject_unanswered_sections(&mut self, local: &SessionDescription, until: usize) -> Result<()> {
        let answered = self.remote_sdp.sections().len();
        for media in local.media_descriptions.iter().take(until).skip(answered) {
            let (Some(mid), Some(kind)) = (media_mid(media), media_kind(media)) else {
                return Err(HandlerError::NegotiationFailed(
                    "local section without mid or media kind".to_string(),
                ));
            };
            let template = self
                .config
                .sending_rtp_parameters_by_kind
                .get(&kind)
                .cloned()
                .unwrap_or_default();
            self.remote_sdp.add_rejected_media(kind, mid, &template)?;
            warn!("Rejected unanswered local {} section mid={}", kind, mid);
        }
        Ok(())
    }

    fn update_remote_ice_parameters(&mut self, ice_parameters: IceParameters) -> Result<()> {
        self.ensure_open()?;
        self.remote_sdp.update_ice_parameters(ice_parameters);
        Ok(())
    }
}

/// Operations common to both transport directions
#[async_trait]
pub trait TransportHandler: Send + Sync {
    type Engine: PeerConnection;

    fn handler(&self) -> &Handler<Self::Engine>;

    fn handler_mut(&mut self) -> &mut Handler<Self::Engine>;

    /// Apply fresh SFU ICE credentials and renegotiate ICE only
    async fn restart_ice(&mut self, remote: IceParameters) -> Result<()>;

    async fn transport_stats(&self) -> Result<Value> {
        self.handler().transport_stats().await
    }

    async fn update_ice_servers(&mut self, ice_servers: Vec<IceServer>) -> Result<()> {
        self.handler_mut().update_ice_servers(ice_servers).await
    }

    async fn close(&mut self) {
        self.handler_mut().close().await
    }

    fn state(&self) -> HandlerState {
        self.handler().state()
    }
}
