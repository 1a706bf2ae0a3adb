use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use webrtc::{
    api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8},
    ice_transport::ice_candidate::RTCIceCandidateInit,
    peer_connection::sdp::{sdp_type::RTCSdpType, session_description::RTCSessionDescription},
    rtp_transceiver::rtp_codec::RTCRtpCodecCapability,
    track::track_local::track_local_static_sample::TrackLocalStaticSample,
};

use crate::{
    audio_monitor::EnergyProbe,
    config::MeshConfig,
    coordinator::Coordinator,
    error::{Error, SessionErrorKind},
    event::{EventReceiver, MeshEvent},
    media::{LocalMedia, LocalTrack, MediaTrackSet},
    peer_connection::{
        PeerConnection, PeerConnectionEvent, PeerConnector, PeerEventSink, TrackSender,
    },
    signal::{MediaKind, ParticipantId},
    transport::{local::LocalRoom, SignalReceiver, SignalingTransport},
};

pub(crate) fn candidate(value: &str) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: value.to_owned(),
        ..Default::default()
    }
}

/// Shared record of everything the fake connections of one participant did.
#[derive(Debug, Default)]
pub(crate) struct FakeLedger {
    offers: Arc<AtomicUsize>,
    restart_offers: Arc<AtomicUsize>,
    connections: Mutex<HashMap<ParticipantId, Arc<FakeConnection>>>,
    sinks: Mutex<HashMap<ParticipantId, PeerEventSink>>,
    failing_replace: Mutex<HashSet<ParticipantId>>,
}

impl FakeLedger {
    pub(crate) fn offers(&self) -> usize {
        self.offers.load(Ordering::SeqCst)
    }

    pub(crate) fn restart_offers(&self) -> usize {
        self.restart_offers.load(Ordering::SeqCst)
    }

    /// Latest connection created towards `remote`.
    pub(crate) fn connection(&self, remote: &ParticipantId) -> Option<Arc<FakeConnection>> {
        self.connections.lock().unwrap().get(remote).cloned()
    }

    pub(crate) fn sink(&self, remote: &ParticipantId) -> Option<PeerEventSink> {
        self.sinks.lock().unwrap().get(remote).cloned()
    }

    /// Connections created towards `remote` from now on reject `replace_track`.
    pub(crate) fn fail_replace_for(&self, remote: &str) {
        self.failing_replace.lock().unwrap().insert(remote.into());
    }

    pub(crate) fn fake_description(&self, offer: bool) -> RTCSessionDescription {
        let mut sdp = RTCSessionDescription::default();
        sdp.sdp_type = if offer {
            RTCSdpType::Offer
        } else {
            RTCSdpType::Answer
        };
        sdp.sdp = "v=0\r\n".to_owned();
        sdp
    }
}

#[derive(Debug, Default)]
pub(crate) struct FakeConnector {
    pub(crate) ledger: Arc<FakeLedger>,
}

impl FakeConnector {
    pub(crate) fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PeerConnector for FakeConnector {
    async fn connect(
        &self,
        remote: &ParticipantId,
        sink: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, Error> {
        let fail_replace = self.ledger.failing_replace.lock().unwrap().contains(remote);
        let connection = Arc::new(FakeConnection {
            remote: remote.clone(),
            offers: self.ledger.offers.clone(),
            restart_offers: self.ledger.restart_offers.clone(),
            local: Mutex::new(None),
            remote_description: Mutex::new(None),
            candidates: Mutex::new(vec![]),
            senders: Mutex::new(vec![]),
            closes: AtomicUsize::new(0),
            fail_replace,
            sink: sink.clone(),
        });
        self.ledger
            .connections
            .lock()
            .unwrap()
            .insert(remote.clone(), connection.clone());
        self.ledger.sinks.lock().unwrap().insert(remote.clone(), sink);
        Ok(connection)
    }
}

#[derive(Debug)]
pub(crate) struct FakeConnection {
    remote: ParticipantId,
    offers: Arc<AtomicUsize>,
    restart_offers: Arc<AtomicUsize>,
    local: Mutex<Option<RTCSessionDescription>>,
    remote_description: Mutex<Option<RTCSessionDescription>>,
    candidates: Mutex<Vec<String>>,
    senders: Mutex<Vec<Arc<FakeSender>>>,
    closes: AtomicUsize,
    fail_replace: bool,
    sink: PeerEventSink,
}

impl FakeConnection {
    pub(crate) fn candidates(&self) -> Vec<String> {
        self.candidates.lock().unwrap().clone()
    }

    pub(crate) fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub(crate) fn sender(&self, kind: MediaKind) -> Option<Arc<FakeSender>> {
        self.senders
            .lock()
            .unwrap()
            .iter()
            .find(|sender| sender.kind == kind)
            .cloned()
    }

    fn description(sdp_type: RTCSdpType) -> RTCSessionDescription {
        let mut sdp = RTCSessionDescription::default();
        sdp.sdp_type = sdp_type;
        sdp.sdp = "v=0\r\n".to_owned();
        sdp
    }
}

#[async_trait]
impl PeerConnection for FakeConnection {
    async fn create_offer(&self, ice_restart: bool) -> Result<RTCSessionDescription, Error> {
        self.offers.fetch_add(1, Ordering::SeqCst);
        if ice_restart {
            self.restart_offers.fetch_add(1, Ordering::SeqCst);
        }
        Ok(Self::description(RTCSdpType::Offer))
    }

    async fn create_answer(&self) -> Result<RTCSessionDescription, Error> {
        Ok(Self::description(RTCSdpType::Answer))
    }

    async fn set_local_description(&self, sdp: RTCSessionDescription) -> Result<(), Error> {
        *self.local.lock().unwrap() = Some(sdp);
        self.sink.emit(PeerConnectionEvent::IceCandidate(candidate(&format!(
            "host-for-{}",
            self.remote
        ))));
        Ok(())
    }

    async fn local_description(&self) -> Option<RTCSessionDescription> {
        self.local.lock().unwrap().clone()
    }

    async fn set_remote_description(&self, sdp: RTCSessionDescription) -> Result<(), Error> {
        *self.remote_description.lock().unwrap() = Some(sdp);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), Error> {
        if self.remote_description.lock().unwrap().is_none() {
            return Err(Error::new_session(
                "remote description is not set".to_owned(),
                SessionErrorKind::NoRemoteDescription,
            ));
        }
        self.candidates.lock().unwrap().push(candidate.candidate);
        Ok(())
    }

    async fn add_track(&self, track: LocalTrack) -> Result<Arc<dyn TrackSender>, Error> {
        let sender = Arc::new(FakeSender {
            kind: MediaKind::from_codec_type(track.kind()).unwrap_or(MediaKind::Video),
            track_id: Mutex::new(track.id().to_owned()),
            fail: self.fail_replace,
        });
        self.senders.lock().unwrap().push(sender.clone());
        Ok(sender)
    }

    async fn close(&self) -> Result<(), Error> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug)]
pub(crate) struct FakeSender {
    kind: MediaKind,
    track_id: Mutex<String>,
    fail: bool,
}

impl FakeSender {
    pub(crate) fn track_id(&self) -> String {
        self.track_id.lock().unwrap().clone()
    }
}

#[async_trait]
impl TrackSender for FakeSender {
    async fn replace_track(&self, track: LocalTrack) -> Result<(), Error> {
        if self.fail {
            return Err(Error::new_session(
                "replace_track rejected".to_owned(),
                SessionErrorKind::NegotiationFailed,
            ));
        }
        *self.track_id.lock().unwrap() = track.id().to_owned();
        Ok(())
    }
}

/// Local media that records every enable/disable request.
pub(crate) struct FakeMedia {
    tracks: MediaTrackSet,
    audio: AtomicBool,
    video: AtomicBool,
    toggles: Mutex<Vec<(MediaKind, bool)>>,
}

impl FakeMedia {
    pub(crate) fn new() -> Self {
        Self {
            tracks: MediaTrackSet {
                audio: Some(Self::track("mic", MediaKind::Audio)),
                video: Some(Self::track("camera", MediaKind::Video)),
            },
            audio: AtomicBool::new(true),
            video: AtomicBool::new(true),
            toggles: Mutex::new(vec![]),
        }
    }

    pub(crate) fn track(id: &str, kind: MediaKind) -> LocalTrack {
        let mime_type = match kind {
            MediaKind::Audio => MIME_TYPE_OPUS,
            MediaKind::Video => MIME_TYPE_VP8,
        };
        Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            id.to_owned(),
            "fake".to_owned(),
        ))
    }

    pub(crate) fn toggles(&self) -> Vec<(MediaKind, bool)> {
        self.toggles.lock().unwrap().clone()
    }
}

impl LocalMedia for FakeMedia {
    fn tracks(&self) -> MediaTrackSet {
        self.tracks.clone()
    }

    fn set_enabled(&self, kind: MediaKind, enabled: bool) -> bool {
        self.toggles.lock().unwrap().push((kind, enabled));
        match kind {
            MediaKind::Audio => self.audio.store(enabled, Ordering::SeqCst),
            MediaKind::Video => self.video.store(enabled, Ordering::SeqCst),
        }
        true
    }

    fn is_enabled(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Audio => self.audio.load(Ordering::SeqCst),
            MediaKind::Video => self.video.load(Ordering::SeqCst),
        }
    }

    fn audio_levels(&self) -> Option<Arc<dyn EnergyProbe>> {
        None
    }
}

impl fmt::Debug for FakeMedia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakeMedia").field("tracks", &self.tracks).finish()
    }
}

/// One coordinator wired to a signaling transport and fake connections.
pub(crate) struct Member {
    pub(crate) coordinator: Coordinator,
    pub(crate) inbound: SignalReceiver,
    pub(crate) events: EventReceiver,
    pub(crate) ledger: Arc<FakeLedger>,
    pub(crate) media: Arc<FakeMedia>,
}

impl Member {
    pub(crate) fn new(room: &LocalRoom, id: &str) -> Self {
        let (transport, inbound) = room.connect(id.into());
        Self::with_transport(id, Arc::new(transport), inbound)
    }

    pub(crate) fn with_transport(
        id: &str,
        transport: Arc<dyn SignalingTransport>,
        inbound: SignalReceiver,
    ) -> Self {
        let connector = FakeConnector::new();
        let ledger = connector.ledger.clone();
        let (coordinator, events) = Coordinator::new(
            id.into(),
            MeshConfig::default(),
            transport,
            Arc::new(connector),
        );
        Self {
            coordinator,
            inbound,
            events,
            ledger,
            media: Arc::new(FakeMedia::new()),
        }
    }

    pub(crate) fn join(&mut self, name: &str) {
        self.coordinator
            .join(self.media.clone(), name.to_owned())
            .expect("failed to join");
    }

    pub(crate) fn drain_events(&mut self) -> Vec<MeshEvent> {
        let mut events = vec![];
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Delivers signaling and connection events until every member is idle. Returns whether
/// anything was delivered.
pub(crate) async fn pump(members: &mut [&mut Member]) -> bool {
    let mut delivered = false;
    loop {
        let mut progressed = false;
        for member in members.iter_mut() {
            while let Ok(message) = member.inbound.try_recv() {
                member.coordinator.handle_signal(message).await;
                progressed = true;
            }
            if member.coordinator.process_peer_events().await > 0 {
                progressed = true;
            }
        }
        if !progressed {
            return delivered;
        }
        delivered = true;
    }
}
