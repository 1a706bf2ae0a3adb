use std::{collections::HashMap, sync::Arc};

use derivative::Derivative;
use futures_util::future::join_all;
use tokio::sync::{mpsc, oneshot};
use webrtc::{
    ice_transport::ice_candidate::RTCIceCandidateInit,
    peer_connection::sdp::session_description::RTCSessionDescription,
};

use crate::{
    audio_monitor::AudioMonitor,
    chat::{ChatClock, ChatMessage},
    config::MeshConfig,
    error::{Error, SessionError, SessionErrorKind},
    event::{EventReceiver, EventSender, MeshEvent},
    media::{LocalMedia, LocalTrack, MediaTrackSet},
    peer_connection::{
        ConnectionState, PeerConnectionEvent, PeerConnector, PeerEvent, PeerEventSink,
    },
    peer_session::{PeerSession, Role},
    signal::{MediaKind, ParticipantId, Signal, SignalMessage},
    transport::{SignalReceiver, SignalingTransport},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Joined,
    Left,
}

/// Owns the whole mesh of one meeting attendance.
///
/// Every reaction takes `&mut self`, so inbound signals, connection events and local commands
/// are applied one at a time. Drive it with [`Coordinator::spawn`], or call the methods
/// directly when embedding it in another event loop.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Coordinator {
    local_id: ParticipantId,
    local_name: String,
    config: MeshConfig,
    phase: Phase,
    transport: Arc<dyn SignalingTransport>,
    connector: Arc<dyn PeerConnector>,
    local_media: Option<Arc<dyn LocalMedia>>,
    tracks: MediaTrackSet,
    sessions: HashMap<ParticipantId, PeerSession>,
    next_epoch: u64,
    local_monitor: Option<AudioMonitor>,
    unmute_pending: bool,
    chat_clock: ChatClock,
    #[derivative(Debug = "ignore")]
    events: EventSender,
    #[derivative(Debug = "ignore")]
    peer_events_sender: mpsc::UnboundedSender<PeerEvent>,
    #[derivative(Debug = "ignore")]
    peer_events_receiver: mpsc::UnboundedReceiver<PeerEvent>,
}

impl Coordinator {
    pub fn new(
        local_id: ParticipantId,
        config: MeshConfig,
        transport: Arc<dyn SignalingTransport>,
        connector: Arc<dyn PeerConnector>,
    ) -> (Self, EventReceiver) {
        let (events, event_receiver) = mpsc::unbounded_channel();
        let (peer_events_sender, peer_events_receiver) = mpsc::unbounded_channel();

        let coordinator = Self {
            local_id,
            local_name: String::new(),
            config,
            phase: Phase::Idle,
            transport,
            connector,
            local_media: None,
            tracks: MediaTrackSet::default(),
            sessions: HashMap::new(),
            next_epoch: 0,
            local_monitor: None,
            unmute_pending: false,
            chat_clock: ChatClock::new(),
            events,
            peer_events_sender,
            peer_events_receiver,
        };
        (coordinator, event_receiver)
    }

    pub fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Remote participants that currently have a session, sorted.
    pub fn participants(&self) -> Vec<ParticipantId> {
        let mut ids: Vec<ParticipantId> = self.sessions.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn session(&self, id: &ParticipantId) -> Option<&PeerSession> {
        self.sessions.get(id)
    }

    /// Records the local identity and announces it to the room. Joining twice is a no-op.
    ///
    /// Must be called inside a tokio runtime; the local speaking monitor starts here.
    pub fn join(&mut self, media: Arc<dyn LocalMedia>, name: String) -> Result<(), Error> {
        match self.phase {
            Phase::Left => {
                return Err(Error::new_session(
                    format!("{} already left the meeting", self.local_id),
                    SessionErrorKind::AlreadyLeft,
                ))
            }
            Phase::Joined => {
                tracing::debug!("{} already joined", self.local_id);
                return Ok(());
            }
            Phase::Idle => {}
        }

        // Replacements made before joining win over the media's own tracks.
        let mut tracks = media.tracks();
        for (kind, track) in self.tracks.iter() {
            tracks.set(kind, track.clone());
        }
        self.tracks = tracks;
        if let Some(levels) = media.audio_levels() {
            self.local_monitor = Some(AudioMonitor::spawn(
                self.local_id.clone(),
                levels,
                self.config.sample_interval,
                self.config.speaking_threshold,
                self.events.clone(),
            ));
        }
        self.local_media = Some(media);
        self.local_name = name.clone();
        self.phase = Phase::Joined;

        tracing::info!("{} joins as {}", self.local_id, self.local_name);
        self.transport.send(Signal::Join { name }, None);
        Ok(())
    }

    /// Announces departure, then closes every session and the transport. Safe to call repeatedly.
    pub async fn leave(&mut self) {
        if self.phase == Phase::Left {
            return;
        }
        if self.phase == Phase::Joined {
            self.transport.send(Signal::Leave {}, None);
        }
        self.phase = Phase::Left;
        self.local_monitor = None;
        self.unmute_pending = false;

        let ids = self.participants();
        for id in ids {
            self.remove_session(&id).await;
        }
        self.transport.close();
        tracing::info!("{} left the meeting", self.local_id);
    }

    /// Applies one inbound signaling message.
    pub async fn handle_signal(&mut self, message: SignalMessage) {
        if self.phase != Phase::Joined {
            tracing::trace!("ignoring {} before join or after leave", message.signal.name());
            return;
        }
        if message.from == self.local_id {
            return;
        }
        if message.to.as_ref().is_some_and(|to| *to != self.local_id) {
            return;
        }

        let SignalMessage {
            from, to, signal, ..
        } = message;
        let addressed = to.is_some();
        if from.is_empty() && !matches!(signal, Signal::Peers { .. }) {
            tracing::debug!("dropping {} without sender", signal.name());
            return;
        }
        tracing::debug!("{} <- {}: {}", self.local_id, from, signal.name());

        match signal {
            Signal::Join { name } => {
                self.transport.send(
                    Signal::Welcome {
                        name: self.local_name.clone(),
                    },
                    Some(from.clone()),
                );
                self.discover(from, name).await;
            }
            Signal::Welcome { name } => self.discover(from, name).await,
            Signal::Peers { peers } if from.is_empty() => {
                for peer in peers {
                    self.discover(peer.id, peer.name).await;
                }
            }
            Signal::Peers { .. } => {
                tracing::warn!("ignoring peers snapshot relayed by {}", from);
            }
            Signal::Offer { name, sdp } => self.on_offer(from, name, sdp).await,
            Signal::Answer { sdp } => self.on_answer(from, sdp).await,
            Signal::Candidate { candidate } => self.on_candidate(from, candidate).await,
            Signal::TrackToggled { kind, enabled } => {
                self.emit(MeshEvent::TrackToggled {
                    id: from,
                    kind,
                    enabled,
                });
            }
            Signal::ScreenShareStatus { is_screen_sharing } => {
                self.emit(MeshEvent::ScreenShareStatus {
                    id: from,
                    is_screen_sharing,
                });
            }
            Signal::ForceMute {} if addressed => self.force_mute(),
            Signal::RequestUnmute {} if addressed => {
                self.unmute_pending = true;
                self.emit(MeshEvent::UnmuteRequested);
            }
            Signal::ForceMute {} | Signal::RequestUnmute {} => {
                tracing::debug!("ignoring broadcast moderation message from {}", from);
            }
            Signal::ChatMessage {
                id,
                sender_name,
                message,
                timestamp,
            } => {
                let sender_name = match self.sessions.get(&from) {
                    Some(session) if !session.remote_name().is_empty() => {
                        session.remote_name().to_owned()
                    }
                    _ => sender_name,
                };
                self.emit(MeshEvent::ChatMessage(ChatMessage {
                    id,
                    sender_id: from,
                    sender_name,
                    message,
                    timestamp,
                }));
            }
            Signal::Leave {} => {
                self.remove_session(&from).await;
            }
        }
    }

    /// Applies one connection event. Events of a torn-down session are ignored.
    pub async fn handle_peer_event(&mut self, event: PeerEvent) {
        let PeerEvent {
            remote,
            epoch,
            event,
        } = event;
        let Some(session) = self.sessions.get_mut(&remote) else {
            tracing::trace!("peer event for unknown session {}", remote);
            return;
        };
        if session.epoch() != epoch {
            tracing::debug!(
                "ignoring stale event for {} (epoch {} != {})",
                remote,
                epoch,
                session.epoch()
            );
            return;
        }

        match event {
            PeerConnectionEvent::IceCandidate(candidate) => {
                self.transport
                    .send(Signal::Candidate { candidate }, Some(remote));
            }
            PeerConnectionEvent::StateChanged(state) => {
                self.on_connection_state(remote, state).await;
            }
            PeerConnectionEvent::Track(track) => {
                if track.kind == MediaKind::Audio {
                    if let Some(levels) = track.levels.clone() {
                        session.attach_monitor(AudioMonitor::spawn(
                            remote.clone(),
                            levels,
                            self.config.sample_interval,
                            self.config.speaking_threshold,
                            self.events.clone(),
                        ));
                    }
                }
                self.emit(MeshEvent::StreamAdded { id: remote, track });
            }
        }
    }

    /// Applies every connection event that is already queued. Returns how many were applied.
    pub async fn process_peer_events(&mut self) -> usize {
        let mut processed = 0;
        while let Ok(event) = self.peer_events_receiver.try_recv() {
            self.handle_peer_event(event).await;
            processed += 1;
        }
        processed
    }

    /// Swaps `track` into every session's sender of the same kind and returns how many took it.
    ///
    /// The new track becomes part of the outbound set first, so sessions created afterwards
    /// start with it. A failing session is logged and does not affect the others.
    pub async fn replace_track(&mut self, track: LocalTrack) -> usize {
        let Some(kind) = MediaKind::from_codec_type(track.kind()) else {
            tracing::warn!("cannot replace track {} of unknown kind", track.id());
            return 0;
        };
        self.tracks.set(kind, track.clone());

        let results = join_all(self.sessions.values().map(|session| {
            let track = track.clone();
            async move { (session.remote_id(), session.replace_track(kind, track).await) }
        }))
        .await;

        let mut replaced = 0;
        for (id, result) in results {
            match result {
                Ok(true) => replaced += 1,
                Ok(false) => tracing::debug!("{} has no {} sender", id, kind),
                Err(err) => tracing::warn!("failed to replace {} track for {}: {}", kind, id, err),
            }
        }
        tracing::info!("{} track replaced on {} sessions", kind, replaced);
        replaced
    }

    /// Enables or disables a local track and tells the room.
    pub fn toggle_track(&mut self, kind: MediaKind, enabled: bool) {
        if self.phase != Phase::Joined {
            return;
        }
        let Some(media) = &self.local_media else {
            return;
        };
        if !media.set_enabled(kind, enabled) {
            tracing::debug!("no local {} track to toggle", kind);
            return;
        }
        self.transport
            .send(Signal::TrackToggled { kind, enabled }, None);
    }

    pub fn set_screen_sharing(&mut self, is_screen_sharing: bool) {
        if self.phase != Phase::Joined {
            return;
        }
        self.transport
            .send(Signal::ScreenShareStatus { is_screen_sharing }, None);
    }

    /// Asks `id` to disable its microphone. There is no acknowledgement.
    pub fn mute_participant(&self, id: &ParticipantId) {
        self.moderate(id, Signal::ForceMute {});
    }

    /// Asks `id` to re-enable its microphone; they are prompted. There is no acknowledgement.
    pub fn unmute_participant(&self, id: &ParticipantId) {
        self.moderate(id, Signal::RequestUnmute {});
    }

    /// Answers the last unmute request. Without a pending request this does nothing.
    pub fn respond_to_unmute_request(&mut self, accept: bool) {
        if !std::mem::take(&mut self.unmute_pending) {
            return;
        }
        if accept {
            self.toggle_track(MediaKind::Audio, true);
        }
    }

    /// Emits the message locally right away and relays it to the room.
    pub fn send_chat_message(&mut self, body: String) -> Option<ChatMessage> {
        if self.phase != Phase::Joined {
            return None;
        }
        let message = ChatMessage::outgoing(
            &mut self.chat_clock,
            self.local_id.clone(),
            self.local_name.clone(),
            body,
        );
        self.emit(MeshEvent::ChatMessage(message.clone()));
        self.transport.send(
            Signal::ChatMessage {
                id: message.id.clone(),
                sender_name: message.sender_name.clone(),
                message: message.message.clone(),
                timestamp: message.timestamp,
            },
            None,
        );
        Some(message)
    }

    /// Runs the coordinator on its own task.
    pub fn spawn(self, inbound: SignalReceiver) -> CoordinatorHandle {
        let (commands, command_receiver) = mpsc::unbounded_channel();
        let local_id = self.local_id.clone();
        tokio::spawn(self.run(inbound, command_receiver));
        CoordinatorHandle { local_id, commands }
    }

    async fn run(
        mut self,
        mut inbound: SignalReceiver,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) {
        let mut inbound_open = true;
        loop {
            let step = tokio::select! {
                message = inbound.recv(), if inbound_open => Step::Inbound(message),
                Some(event) = self.peer_events_receiver.recv() => Step::Peer(event),
                command = commands.recv() => Step::Command(command),
            };

            match step {
                Step::Inbound(Some(message)) => self.handle_signal(message).await,
                Step::Inbound(None) => {
                    tracing::warn!("signaling transport of {} closed", self.local_id);
                    inbound_open = false;
                }
                Step::Peer(event) => self.handle_peer_event(event).await,
                Step::Command(Some(command)) => {
                    if !self.execute(command).await {
                        break;
                    }
                }
                Step::Command(None) => {
                    self.leave().await;
                    break;
                }
            }
        }
        tracing::debug!("coordinator of {} stopped", self.local_id);
    }

    async fn execute(&mut self, command: Command) -> bool {
        match command {
            Command::Join { media, name, reply } => {
                let _ = reply.send(self.join(media, name));
            }
            Command::Leave { reply } => {
                self.leave().await;
                let _ = reply.send(());
                return false;
            }
            Command::ReplaceTrack { track, reply } => {
                let _ = reply.send(self.replace_track(track).await);
            }
            Command::ToggleTrack {
                kind,
                enabled,
                reply,
            } => {
                self.toggle_track(kind, enabled);
                let _ = reply.send(());
            }
            Command::SetScreenSharing { sharing, reply } => {
                self.set_screen_sharing(sharing);
                let _ = reply.send(());
            }
            Command::MuteParticipant { id, reply } => {
                self.mute_participant(&id);
                let _ = reply.send(());
            }
            Command::UnmuteParticipant { id, reply } => {
                self.unmute_participant(&id);
                let _ = reply.send(());
            }
            Command::RespondToUnmute { accept, reply } => {
                self.respond_to_unmute_request(accept);
                let _ = reply.send(());
            }
            Command::SendChat { body, reply } => {
                let _ = reply.send(self.send_chat_message(body));
            }
            Command::Participants { reply } => {
                let _ = reply.send(self.participants());
            }
        }
        true
    }

    async fn discover(&mut self, remote: ParticipantId, name: String) {
        if remote == self.local_id || remote.is_empty() || self.sessions.contains_key(&remote) {
            return;
        }
        let role = Role::between(&self.local_id, &remote);
        if !self.open_session(remote.clone(), name, role).await {
            return;
        }
        if role == Role::Initiator && !self.send_offer(&remote, false).await {
            self.remove_session(&remote).await;
        }
    }

    async fn open_session(&mut self, remote: ParticipantId, name: String, role: Role) -> bool {
        self.next_epoch += 1;
        let epoch = self.next_epoch;
        let sink = PeerEventSink::new(remote.clone(), epoch, self.peer_events_sender.clone());

        match PeerSession::open(
            remote.clone(),
            name.clone(),
            role,
            self.connector.as_ref(),
            sink,
            epoch,
            &self.tracks,
        )
        .await
        {
            Ok(session) => {
                self.sessions.insert(remote.clone(), session);
                self.emit(MeshEvent::ParticipantJoined { id: remote, name });
                true
            }
            Err(err) => {
                tracing::error!("failed to open session with {}: {}", remote, err);
                false
            }
        }
    }

    async fn send_offer(&mut self, remote: &ParticipantId, ice_restart: bool) -> bool {
        let Some(session) = self.sessions.get_mut(remote) else {
            return false;
        };
        match session.create_offer(ice_restart).await {
            Ok(sdp) => {
                self.transport.send(
                    Signal::Offer {
                        name: self.local_name.clone(),
                        sdp,
                    },
                    Some(remote.clone()),
                );
                true
            }
            Err(err) => {
                tracing::warn!("failed to create offer for {}: {}", remote, err);
                false
            }
        }
    }

    async fn on_offer(&mut self, from: ParticipantId, name: String, sdp: RTCSessionDescription) {
        if !self.sessions.contains_key(&from)
            && !self.open_session(from.clone(), name, Role::Responder).await
        {
            return;
        }
        let Some(session) = self.sessions.get_mut(&from) else {
            return;
        };

        match session.accept_offer(sdp).await {
            Ok(answer) => {
                self.transport
                    .send(Signal::Answer { sdp: answer }, Some(from));
            }
            Err(Error::SessionError(SessionError {
                kind: SessionErrorKind::NegotiationFailed,
                message,
            })) => {
                tracing::warn!("ignoring offer: {}", message);
            }
            Err(err) => {
                tracing::warn!("failed to answer {}: {}", from, err);
                self.remove_session(&from).await;
            }
        }
    }

    async fn on_answer(&mut self, from: ParticipantId, sdp: RTCSessionDescription) {
        let Some(session) = self.sessions.get_mut(&from) else {
            tracing::debug!("answer from {} without session", from);
            return;
        };
        if let Err(err) = session.accept_answer(sdp).await {
            tracing::warn!("failed to apply answer from {}: {}", from, err);
            self.remove_session(&from).await;
        }
    }

    async fn on_candidate(&mut self, from: ParticipantId, candidate: RTCIceCandidateInit) {
        let Some(session) = self.sessions.get_mut(&from) else {
            tracing::debug!("candidate from {} without session", from);
            return;
        };
        if let Err(err) = session.add_candidate(candidate).await {
            tracing::warn!("failed to add candidate from {}: {}", from, err);
        }
    }

    async fn on_connection_state(&mut self, remote: ParticipantId, state: ConnectionState) {
        let Some(session) = self.sessions.get_mut(&remote) else {
            return;
        };
        match state {
            ConnectionState::Connected => session.mark_connected(),
            ConnectionState::Failed => {
                if session.can_restart() {
                    tracing::info!("connection to {} failed, restarting ICE", remote);
                    if self.send_offer(&remote, true).await {
                        return;
                    }
                }
                tracing::info!("connection to {} failed", remote);
                self.remove_session(&remote).await;
            }
            ConnectionState::Disconnected | ConnectionState::Closed => {
                tracing::info!("connection to {} is {:?}", remote, state);
                self.remove_session(&remote).await;
            }
            ConnectionState::New | ConnectionState::Connecting => {}
        }
    }

    fn force_mute(&mut self) {
        let Some(media) = self.local_media.clone() else {
            return;
        };
        tracing::info!("{} was muted by a moderator", self.local_id);
        if media.set_enabled(MediaKind::Audio, false) {
            self.transport.send(
                Signal::TrackToggled {
                    kind: MediaKind::Audio,
                    enabled: false,
                },
                None,
            );
        }
        self.emit(MeshEvent::ForceMuteTriggered);
    }

    fn moderate(&self, id: &ParticipantId, signal: Signal) {
        if self.phase != Phase::Joined || *id == self.local_id {
            return;
        }
        self.transport.send(signal, Some(id.clone()));
    }

    async fn remove_session(&mut self, id: &ParticipantId) -> bool {
        let Some(mut session) = self.sessions.remove(id) else {
            return false;
        };
        session.close().await;
        self.emit(MeshEvent::ParticipantLeft { id: id.clone() });
        true
    }

    fn emit(&self, event: MeshEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!("mesh event dropped, nobody is listening");
        }
    }
}

enum Step {
    Inbound(Option<SignalMessage>),
    Peer(PeerEvent),
    Command(Option<Command>),
}

enum Command {
    Join {
        media: Arc<dyn LocalMedia>,
        name: String,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    Leave {
        reply: oneshot::Sender<()>,
    },
    ReplaceTrack {
        track: LocalTrack,
        reply: oneshot::Sender<usize>,
    },
    ToggleTrack {
        kind: MediaKind,
        enabled: bool,
        reply: oneshot::Sender<()>,
    },
    SetScreenSharing {
        sharing: bool,
        reply: oneshot::Sender<()>,
    },
    MuteParticipant {
        id: ParticipantId,
        reply: oneshot::Sender<()>,
    },
    UnmuteParticipant {
        id: ParticipantId,
        reply: oneshot::Sender<()>,
    },
    RespondToUnmute {
        accept: bool,
        reply: oneshot::Sender<()>,
    },
    SendChat {
        body: String,
        reply: oneshot::Sender<Option<ChatMessage>>,
    },
    Participants {
        reply: oneshot::Sender<Vec<ParticipantId>>,
    },
}

/// Cloneable command interface to a spawned [`Coordinator`].
#[derive(Derivative, Clone)]
#[derivative(Debug)]
pub struct CoordinatorHandle {
    local_id: ParticipantId,
    #[derivative(Debug = "ignore")]
    commands: mpsc::UnboundedSender<Command>,
}

impl CoordinatorHandle {
    pub fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    pub async fn join(&self, media: Arc<dyn LocalMedia>, name: String) -> Result<(), Error> {
        self.request(|reply| Command::Join { media, name, reply })
            .await?
    }

    /// Never fails, even when the coordinator already stopped.
    pub async fn leave(&self) {
        if self.request(|reply| Command::Leave { reply }).await.is_err() {
            tracing::debug!("{} already stopped", self.local_id);
        }
    }

    pub async fn replace_track(&self, track: LocalTrack) -> Result<usize, Error> {
        self.request(|reply| Command::ReplaceTrack { track, reply })
            .await
    }

    pub async fn toggle_track(&self, kind: MediaKind, enabled: bool) -> Result<(), Error> {
        self.request(|reply| Command::ToggleTrack {
            kind,
            enabled,
            reply,
        })
        .await
    }

    pub async fn set_screen_sharing(&self, sharing: bool) -> Result<(), Error> {
        self.request(|reply| Command::SetScreenSharing { sharing, reply })
            .await
    }

    pub async fn mute_participant(&self, id: ParticipantId) -> Result<(), Error> {
        self.request(|reply| Command::MuteParticipant { id, reply })
            .await
    }

    pub async fn unmute_participant(&self, id: ParticipantId) -> Result<(), Error> {
        self.request(|reply| Command::UnmuteParticipant { id, reply })
            .await
    }

    pub async fn respond_to_unmute_request(&self, accept: bool) -> Result<(), Error> {
        self.request(|reply| Command::RespondToUnmute { accept, reply })
            .await
    }

    pub async fn send_chat_message(&self, body: String) -> Result<Option<ChatMessage>, Error> {
        self.request(|reply| Command::SendChat { body, reply })
            .await
    }

    pub async fn participants(&self) -> Result<Vec<ParticipantId>, Error> {
        self.request(|reply| Command::Participants { reply }).await
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, Error> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| self.stopped())?;
        response.await.map_err(|_| self.stopped())
    }

    fn stopped(&self) -> Error {
        Error::new_session(
            format!("coordinator of {} is stopped", self.local_id),
            SessionErrorKind::AlreadyLeft,
        )
    }
}
