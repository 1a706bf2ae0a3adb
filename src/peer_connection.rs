use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;
use derivative::Derivative;
use enclose::enc;
use tokio::sync::{broadcast, mpsc};
use webrtc::{
    api::{
        interceptor_registry::register_default_interceptors, media_engine::MediaEngine,
        APIBuilder,
    },
    ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit},
    interceptor::registry::Registry,
    peer_connection::{
        offer_answer_options::RTCOfferOptions, peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, RTCPeerConnection,
    },
    rtp::{extension::audio_level_extension::AudioLevelExtension, packet::Packet},
    rtp_transceiver::{
        rtp_receiver::RTCRtpReceiver, rtp_sender::RTCRtpSender, RTCRtpTransceiver,
    },
    sdp::extmap,
    track::track_remote::TrackRemote,
    util::Unmarshal,
};

use crate::{
    audio_monitor::{EnergyProbe, LevelMeter},
    config::MeshConfig,
    error::Error,
    media::LocalTrack,
    media_engine,
    signal::{MediaKind, ParticipantId},
};

/// Lifecycle of the underlying connection, as reported by the connection itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl From<RTCPeerConnectionState> for ConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => Self::New,
            RTCPeerConnectionState::Connecting => Self::Connecting,
            RTCPeerConnectionState::Connected => Self::Connected,
            RTCPeerConnectionState::Disconnected => Self::Disconnected,
            RTCPeerConnectionState::Failed => Self::Failed,
            RTCPeerConnectionState::Closed => Self::Closed,
        }
    }
}

/// A media track received from a remote participant.
#[derive(Derivative)]
#[derivative(Clone, Debug)]
pub struct RemoteTrack {
    pub kind: MediaKind,
    pub id: String,
    pub stream_id: String,
    #[derivative(Debug = "ignore")]
    packets: broadcast::Sender<Packet>,
    /// Present for audio tracks; fed from the RTP audio-level header extension.
    #[derivative(Debug = "ignore")]
    pub levels: Option<Arc<dyn EnergyProbe>>,
}

impl RemoteTrack {
    pub fn new(
        kind: MediaKind,
        id: String,
        stream_id: String,
        levels: Option<Arc<dyn EnergyProbe>>,
    ) -> Self {
        let (packets, _) = broadcast::channel(1024);
        Self {
            kind,
            id,
            stream_id,
            packets,
            levels,
        }
    }

    /// RTP packets of this track from now on. The stream ends when the remote track does.
    pub fn subscribe(&self) -> broadcast::Receiver<Packet> {
        self.packets.subscribe()
    }
}

#[derive(Clone, Debug)]
pub enum PeerConnectionEvent {
    IceCandidate(RTCIceCandidateInit),
    StateChanged(ConnectionState),
    Track(RemoteTrack),
}

/// A connection event tagged with the session it belongs to.
#[derive(Clone, Debug)]
pub struct PeerEvent {
    pub remote: ParticipantId,
    pub epoch: u64,
    pub event: PeerConnectionEvent,
}

/// Where one connection reports its events.
#[derive(Clone, Debug)]
pub struct PeerEventSink {
    remote: ParticipantId,
    epoch: u64,
    sender: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerEventSink {
    pub fn new(
        remote: ParticipantId,
        epoch: u64,
        sender: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        Self {
            remote,
            epoch,
            sender,
        }
    }

    pub fn remote(&self) -> &ParticipantId {
        &self.remote
    }

    pub fn emit(&self, event: PeerConnectionEvent) {
        let event = PeerEvent {
            remote: self.remote.clone(),
            epoch: self.epoch,
            event,
        };
        if self.sender.send(event).is_err() {
            tracing::trace!("peer event for {} dropped, coordinator is gone", self.remote);
        }
    }
}

/// The outbound sender of one media kind inside one connection.
#[async_trait]
pub trait TrackSender: Send + Sync {
    async fn replace_track(&self, track: LocalTrack) -> Result<(), Error>;
}

#[async_trait]
impl TrackSender for RTCRtpSender {
    async fn replace_track(&self, track: LocalTrack) -> Result<(), Error> {
        RTCRtpSender::replace_track(self, Some(track)).await?;
        Ok(())
    }
}

/// One direct media connection to one remote participant.
#[async_trait]
pub trait PeerConnection: Send + Sync + Debug {
    async fn create_offer(&self, ice_restart: bool) -> Result<RTCSessionDescription, Error>;
    async fn create_answer(&self) -> Result<RTCSessionDescription, Error>;
    async fn set_local_description(&self, sdp: RTCSessionDescription) -> Result<(), Error>;
    async fn local_description(&self) -> Option<RTCSessionDescription>;
    async fn set_remote_description(&self, sdp: RTCSessionDescription) -> Result<(), Error>;
    async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), Error>;
    async fn add_track(&self, track: LocalTrack) -> Result<Arc<dyn TrackSender>, Error>;
    async fn close(&self) -> Result<(), Error>;
}

/// Creates connections. Every event of the created connection goes to `sink`.
#[async_trait]
pub trait PeerConnector: Send + Sync + Debug {
    async fn connect(
        &self,
        remote: &ParticipantId,
        sink: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, Error>;
}

/// [`PeerConnector`] producing webrtc-rs peer connections.
#[derive(Debug, Clone)]
pub struct RtcPeerConnector {
    config: MeshConfig,
}

impl RtcPeerConnector {
    pub fn new(config: MeshConfig) -> Self {
        Self { config }
    }

    async fn generate_peer_connection(&self) -> Result<RTCPeerConnection, Error> {
        let mut me = MediaEngine::default();
        media_engine::register_mesh_codecs(&mut me)?;
        media_engine::register_mesh_extensions(&mut me)?;
        let registry = register_default_interceptors(Registry::new(), &mut me)?;

        let api = APIBuilder::new()
            .with_media_engine(me)
            .with_interceptor_registry(registry)
            .with_setting_engine(self.config.transport.setting_engine())
            .build();

        let peer_connection = api
            .new_peer_connection(self.config.rtc_configuration())
            .await?;
        Ok(peer_connection)
    }
}

#[async_trait]
impl PeerConnector for RtcPeerConnector {
    async fn connect(
        &self,
        remote: &ParticipantId,
        sink: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, Error> {
        let peer_connection = Arc::new(self.generate_peer_connection().await?);
        let level_window = self.config.remote_level_window;
        let level_max_age = self.config.sample_interval;

        peer_connection.on_ice_candidate(Box::new(enc!((sink) move |candidate: Option<RTCIceCandidate>| {
            Box::pin(enc!((sink) async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => sink.emit(PeerConnectionEvent::IceCandidate(init)),
                    Err(err) => tracing::error!("failed to serialize ICE candidate: {}", err),
                }
            }))
        })));

        peer_connection.on_peer_connection_state_change(Box::new(enc!((sink) move |state: RTCPeerConnectionState| {
            tracing::debug!("connection to {} changed state: {}", sink.remote(), state);
            sink.emit(PeerConnectionEvent::StateChanged(state.into()));
            Box::pin(async {})
        })));

        peer_connection.on_track(Box::new(enc!((sink) move |track: Arc<TrackRemote>,
              receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            Box::pin(enc!((sink) async move {
                let Some(kind) = MediaKind::from_codec_type(track.kind()) else {
                    return;
                };
                tracing::info!(
                    "track received from {}: id={}, kind={}, ssrc={}",
                    sink.remote(),
                    track.id(),
                    kind,
                    track.ssrc()
                );

                let (meter, extension_id) = if kind == MediaKind::Audio {
                    let extension_id = audio_level_extension_id(&receiver).await;
                    let meter = LevelMeter::with_max_age(level_window, level_max_age);
                    (Some(Arc::new(meter)), extension_id)
                } else {
                    (None, None)
                };
                let levels = meter.clone().map(|meter| meter as Arc<dyn EnergyProbe>);
                let remote_track = RemoteTrack::new(kind, track.id(), track.stream_id(), levels);

                tokio::spawn(rtp_reader_loop(
                    track,
                    remote_track.packets.clone(),
                    meter,
                    extension_id,
                ));
                sink.emit(PeerConnectionEvent::Track(remote_track));
            }))
        })));

        tracing::debug!("peer connection to {} is created", remote);
        Ok(Arc::new(RtcPeerConnection { peer_connection }))
    }
}

async fn audio_level_extension_id(receiver: &RTCRtpReceiver) -> Option<u8> {
    receiver
        .get_parameters()
        .await
        .header_extensions
        .iter()
        .find(|extension| extension.uri == extmap::AUDIO_LEVEL_URI)
        .and_then(|extension| u8::try_from(extension.id).ok())
}

async fn rtp_reader_loop(
    track: Arc<TrackRemote>,
    packets: broadcast::Sender<Packet>,
    meter: Option<Arc<LevelMeter>>,
    extension_id: Option<u8>,
) {
    let track_id = track.id();
    tracing::debug!("RTP reader loop has started for {}", track_id);

    loop {
        let packet = match track.read_rtp().await {
            Ok((packet, _attributes)) => packet,
            Err(err) => {
                tracing::debug!("RTP reader for {} stopped: {}", track_id, err);
                break;
            }
        };

        if let (Some(meter), Some(id)) = (&meter, extension_id) {
            if let Some(mut payload) = packet.header.get_extension(id) {
                match AudioLevelExtension::unmarshal(&mut payload) {
                    Ok(extension) => meter.push_audio_level(extension.level),
                    Err(err) => tracing::trace!("bad audio level extension: {}", err),
                }
            }
        }

        if packets.receiver_count() > 0 {
            let _ = packets.send(packet);
        }
    }

    if let Some(meter) = meter {
        meter.clear();
    }
    tracing::debug!("RTP reader loop has finished for {}", track_id);
}

#[derive(Debug)]
pub struct RtcPeerConnection {
    peer_connection: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerConnection for RtcPeerConnection {
    async fn create_offer(&self, ice_restart: bool) -> Result<RTCSessionDescription, Error> {
        let options = RTCOfferOptions {
            ice_restart,
            ..Default::default()
        };
        let offer = self.peer_connection.create_offer(Some(options)).await?;
        Ok(offer)
    }

    async fn create_answer(&self) -> Result<RTCSessionDescription, Error> {
        let answer = self.peer_connection.create_answer(None).await?;
        Ok(answer)
    }

    async fn set_local_description(&self, sdp: RTCSessionDescription) -> Result<(), Error> {
        self.peer_connection.set_local_description(sdp).await?;
        Ok(())
    }

    async fn local_description(&self) -> Option<RTCSessionDescription> {
        self.peer_connection.local_description().await
    }

    async fn set_remote_description(&self, sdp: RTCSessionDescription) -> Result<(), Error> {
        self.peer_connection.set_remote_description(sdp).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), Error> {
        self.peer_connection.add_ice_candidate(candidate).await?;
        Ok(())
    }

    async fn add_track(&self, track: LocalTrack) -> Result<Arc<dyn TrackSender>, Error> {
        let sender = self.peer_connection.add_track(track).await?;

        // RTCP has to be read for interceptors such as NACK to work.
        tokio::spawn(enc!((sender) async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while let Ok((_, _)) = sender.read(&mut rtcp_buf).await {}
            tracing::trace!("RTCP reader loop finished");
        }));

        Ok(sender)
    }

    async fn close(&self) -> Result<(), Error> {
        self.peer_connection.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_connection_state_mapping() {
        assert_eq!(
            ConnectionState::from(RTCPeerConnectionState::Failed),
            ConnectionState::Failed
        );
        assert_eq!(
            ConnectionState::from(RTCPeerConnectionState::Unspecified),
            ConnectionState::New
        );
        assert_eq!(
            ConnectionState::from(RTCPeerConnectionState::Disconnected),
            ConnectionState::Disconnected
        );
    }

    #[test]
    fn test_sink_tags_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = PeerEventSink::new("id-b".into(), 7, tx);
        sink.emit(PeerConnectionEvent::StateChanged(ConnectionState::Connected));

        let event = rx.try_recv().expect("no event");
        assert_eq!(event.remote, ParticipantId::from("id-b"));
        assert_eq!(event.epoch, 7);
        assert!(matches!(
            event.event,
            PeerConnectionEvent::StateChanged(ConnectionState::Connected)
        ));
    }

    #[tokio::test]
    async fn test_rtc_connector_negotiates_offer() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let connector = RtcPeerConnector::new(MeshConfig {
            ice_servers: vec![],
            ..Default::default()
        });
        let connection = connector
            .connect(&"id-b".into(), PeerEventSink::new("id-b".into(), 1, tx))
            .await
            .expect("failed to create connection");

        let source = crate::media::LocalMediaSource::new("stream".to_owned(), 16);
        let tracks = crate::media::LocalMedia::tracks(&source);
        for (_, track) in tracks.iter() {
            connection.add_track(track.clone()).await.expect("failed to add track");
        }

        let offer = connection.create_offer(false).await.expect("failed to create offer");
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("m=video"));
        assert!(offer.sdp.contains("VP8/90000"));
        assert!(!offer.sdp.contains("VP9/90000"));
        assert!(!offer.sdp.contains("H264/90000"));
        connection
            .set_local_description(offer)
            .await
            .expect("failed to set local description");
        assert!(connection.local_description().await.is_some());

        connection.close().await.expect("failed to close");
    }
}
