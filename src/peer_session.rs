use std::{collections::HashMap, fmt, sync::Arc};

use derivative::Derivative;
use webrtc::{
    ice_transport::ice_candidate::RTCIceCandidateInit,
    peer_connection::sdp::session_description::RTCSessionDescription,
};

use crate::{
    audio_monitor::AudioMonitor,
    error::{Error, SessionErrorKind},
    media::{LocalTrack, MediaTrackSet},
    peer_connection::{PeerConnection, PeerConnector, PeerEventSink, TrackSender},
    signal::{MediaKind, ParticipantId},
};

/// Which side of the pair sends the first offer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    /// The lexicographically smaller id initiates.
    pub fn between(local: &ParticipantId, remote: &ParticipantId) -> Self {
        if local < remote {
            Role::Initiator
        } else {
            Role::Responder
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    New,
    HaveLocalOffer,
    Stable,
    Connected,
    Restarting,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::New => "new",
            SessionState::HaveLocalOffer => "have-local-offer",
            SessionState::Stable => "stable",
            SessionState::Connected => "connected",
            SessionState::Restarting => "restarting",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// The binding between one remote participant and the connection to it.
///
/// Every negotiation step takes `&mut self`, so the steps of one session never overlap.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct PeerSession {
    remote_id: ParticipantId,
    remote_name: String,
    role: Role,
    state: SessionState,
    epoch: u64,
    connection: Arc<dyn PeerConnection>,
    #[derivative(Debug = "ignore")]
    senders: HashMap<MediaKind, Arc<dyn TrackSender>>,
    pending_candidates: Vec<RTCIceCandidateInit>,
    remote_description_set: bool,
    restart_attempted: bool,
    monitor: Option<AudioMonitor>,
}

impl PeerSession {
    /// Connects to `remote_id` and attaches every track of `tracks`.
    pub async fn open(
        remote_id: ParticipantId,
        remote_name: String,
        role: Role,
        connector: &dyn PeerConnector,
        sink: PeerEventSink,
        epoch: u64,
        tracks: &MediaTrackSet,
    ) -> Result<Self, Error> {
        let connection = connector.connect(&remote_id, sink).await?;

        let mut senders = HashMap::new();
        for (kind, track) in tracks.iter() {
            match connection.add_track(track.clone()).await {
                Ok(sender) => {
                    senders.insert(kind, sender);
                }
                Err(err) => {
                    let _ = connection.close().await;
                    return Err(err);
                }
            }
        }

        tracing::info!(
            "PeerSession {} is created: role={:?}, epoch={}",
            remote_id,
            role,
            epoch
        );

        Ok(Self {
            remote_id,
            remote_name,
            role,
            state: SessionState::New,
            epoch,
            connection,
            senders,
            pending_candidates: Vec::new(),
            remote_description_set: false,
            restart_attempted: false,
            monitor: None,
        })
    }

    pub fn remote_id(&self) -> &ParticipantId {
        &self.remote_id
    }

    pub fn remote_name(&self) -> &str {
        &self.remote_name
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Creates and applies a local offer. `ice_restart` regenerates the ICE credentials.
    pub async fn create_offer(
        &mut self,
        ice_restart: bool,
    ) -> Result<RTCSessionDescription, Error> {
        self.ensure_open()?;
        let offer = self.connection.create_offer(ice_restart).await?;
        self.connection.set_local_description(offer).await?;
        let offer = self.local_description().await?;

        if ice_restart {
            self.restart_attempted = true;
            self.state = SessionState::Restarting;
        } else {
            self.state = SessionState::HaveLocalOffer;
        }
        tracing::debug!("PeerSession {} offer created, state={}", self.remote_id, self.state);
        Ok(offer)
    }

    /// Applies a remote offer and returns the local answer.
    pub async fn accept_offer(
        &mut self,
        offer: RTCSessionDescription,
    ) -> Result<RTCSessionDescription, Error> {
        self.ensure_open()?;
        if self.state == SessionState::HaveLocalOffer {
            return Err(Error::new_session(
                format!("offer from {} collides with a pending local offer", self.remote_id),
                SessionErrorKind::NegotiationFailed,
            ));
        }

        self.apply_remote_description(offer).await?;
        let answer = self.connection.create_answer().await?;
        self.connection.set_local_description(answer).await?;
        let answer = self.local_description().await?;

        if self.state != SessionState::Connected {
            self.state = SessionState::Stable;
        }
        tracing::debug!("PeerSession {} answer created", self.remote_id);
        Ok(answer)
    }

    pub async fn accept_answer(&mut self, answer: RTCSessionDescription) -> Result<(), Error> {
        self.ensure_open()?;
        if !matches!(
            self.state,
            SessionState::HaveLocalOffer | SessionState::Restarting
        ) {
            return Err(Error::new_session(
                format!("unexpected answer from {} in state {}", self.remote_id, self.state),
                SessionErrorKind::NegotiationFailed,
            ));
        }

        self.apply_remote_description(answer).await?;
        self.state = SessionState::Stable;
        tracing::debug!("PeerSession {} answer applied", self.remote_id);
        Ok(())
    }

    /// Candidates that arrive before the remote description are held back until it is set.
    pub async fn add_candidate(&mut self, candidate: RTCIceCandidateInit) -> Result<(), Error> {
        self.ensure_open()?;
        if !self.remote_description_set {
            tracing::debug!("PeerSession {} pending ICE candidate", self.remote_id);
            self.pending_candidates.push(candidate);
            return Ok(());
        }
        self.connection.add_ice_candidate(candidate).await
    }

    /// Swaps `track` into the sender of its kind. Returns false when there is no such sender.
    pub async fn replace_track(&self, kind: MediaKind, track: LocalTrack) -> Result<bool, Error> {
        self.ensure_open()?;
        let Some(sender) = self.senders.get(&kind) else {
            return Ok(false);
        };
        sender.replace_track(track).await?;
        Ok(true)
    }

    pub fn mark_connected(&mut self) {
        if self.is_closed() {
            return;
        }
        self.state = SessionState::Connected;
        self.restart_attempted = false;
        tracing::info!("PeerSession {} connected", self.remote_id);
    }

    /// Only the initiator restarts, and only once per failure.
    pub fn can_restart(&self) -> bool {
        self.role == Role::Initiator && !self.restart_attempted && !self.is_closed()
    }

    pub fn attach_monitor(&mut self, monitor: AudioMonitor) {
        self.monitor = Some(monitor);
    }

    pub fn has_monitor(&self) -> bool {
        self.monitor.is_some()
    }

    /// Stops the monitor and closes the connection. Safe to call repeatedly.
    pub async fn close(&mut self) {
        if self.is_closed() {
            return;
        }
        self.state = SessionState::Closed;
        self.monitor = None;
        self.pending_candidates.clear();
        if let Err(err) = self.connection.close().await {
            tracing::warn!("failed to close connection to {}: {}", self.remote_id, err);
        }
        tracing::info!("PeerSession {} is closed", self.remote_id);
    }

    async fn apply_remote_description(&mut self, sdp: RTCSessionDescription) -> Result<(), Error> {
        self.connection.set_remote_description(sdp).await?;
        self.remote_description_set = true;

        for candidate in std::mem::take(&mut self.pending_candidates) {
            tracing::debug!("Adding pending ICE candidate: {:?}", candidate);
            if let Err(err) = self.connection.add_ice_candidate(candidate).await {
                tracing::error!("failed to add_ice_candidate: {}", err);
            }
        }
        Ok(())
    }

    async fn local_description(&self) -> Result<RTCSessionDescription, Error> {
        match self.connection.local_description().await {
            Some(sdp) => Ok(sdp),
            None => Err(Error::new_session(
                "Failed to set local description".to_owned(),
                SessionErrorKind::LocalDescriptionError,
            )),
        }
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::new_session(
                format!("session with {} is closed", self.remote_id),
                SessionErrorKind::SessionNotFound,
            ));
        }
        Ok(())
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        tracing::debug!("PeerSession {} is dropped", self.remote_id);
    }
}
