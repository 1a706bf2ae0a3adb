use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, PoisonError, RwLock,
    },
};

use webrtc::{
    api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8},
    media::Sample,
    rtp_transceiver::rtp_codec::RTCRtpCodecCapability,
    track::track_local::{track_local_static_sample::TrackLocalStaticSample, TrackLocal},
};

use crate::{
    audio_monitor::{EnergyProbe, LevelMeter},
    error::Error,
    signal::MediaKind,
};

pub type LocalTrack = Arc<dyn TrackLocal + Send + Sync>;

/// The outbound tracks attached to every peer session.
#[derive(Clone, Default)]
pub struct MediaTrackSet {
    pub audio: Option<LocalTrack>,
    pub video: Option<LocalTrack>,
}

impl MediaTrackSet {
    pub fn get(&self, kind: MediaKind) -> Option<&LocalTrack> {
        match kind {
            MediaKind::Audio => self.audio.as_ref(),
            MediaKind::Video => self.video.as_ref(),
        }
    }

    pub fn set(&mut self, kind: MediaKind, track: LocalTrack) {
        match kind {
            MediaKind::Audio => self.audio = Some(track),
            MediaKind::Video => self.video = Some(track),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (MediaKind, &LocalTrack)> {
        [
            (MediaKind::Audio, self.audio.as_ref()),
            (MediaKind::Video, self.video.as_ref()),
        ]
        .into_iter()
        .filter_map(|(kind, track)| track.map(|track| (kind, track)))
    }
}

impl fmt::Debug for MediaTrackSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrackSet")
            .field("audio", &self.audio.as_ref().map(|track| track.id().to_owned()))
            .field("video", &self.video.as_ref().map(|track| track.id().to_owned()))
            .finish()
    }
}

/// What the mesh needs from the local capture component.
pub trait LocalMedia: Send + Sync + fmt::Debug {
    fn tracks(&self) -> MediaTrackSet;

    /// Flips the enable flag of the local track of `kind`. Returns false when there is no such track.
    fn set_enabled(&self, kind: MediaKind, enabled: bool) -> bool;

    fn is_enabled(&self, kind: MediaKind) -> bool;

    /// Energy source of the local microphone, if one is being captured.
    fn audio_levels(&self) -> Option<Arc<dyn EnergyProbe>>;
}

/// [`LocalMedia`] backed by sample-fed webrtc-rs tracks.
///
/// Capture code writes encoded frames with [`LocalMediaSource::write_sample`] and raw microphone
/// PCM with [`LocalMediaSource::push_pcm`]. A disabled track swallows its samples.
pub struct LocalMediaSource {
    stream_id: String,
    audio: Arc<TrackLocalStaticSample>,
    video: RwLock<Arc<TrackLocalStaticSample>>,
    audio_enabled: AtomicBool,
    video_enabled: AtomicBool,
    levels: Arc<LevelMeter>,
}

impl LocalMediaSource {
    pub fn new(stream_id: String, analyser_size: usize) -> Self {
        let audio = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            "audio".to_owned(),
            stream_id.clone(),
        ));
        let video = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                ..Default::default()
            },
            "video".to_owned(),
            stream_id.clone(),
        ));

        Self {
            stream_id,
            audio,
            video: RwLock::new(video),
            audio_enabled: AtomicBool::new(true),
            video_enabled: AtomicBool::new(true),
            levels: Arc::new(LevelMeter::new(analyser_size)),
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Swaps the outbound video, e.g. camera for screen capture. Hand the returned track to
    /// the coordinator's `replace_track` so connected peers follow.
    pub fn set_video_track(&self, track: Arc<TrackLocalStaticSample>) -> LocalTrack {
        let mut video = self.video.write().unwrap_or_else(PoisonError::into_inner);
        *video = track.clone();
        track
    }

    pub async fn write_sample(&self, kind: MediaKind, sample: &Sample) -> Result<(), Error> {
        if !self.is_enabled(kind) {
            return Ok(());
        }
        let track = match kind {
            MediaKind::Audio => self.audio.clone(),
            MediaKind::Video => self
                .video
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        };
        track.write_sample(sample).await?;
        Ok(())
    }

    /// Feeds decoded microphone samples to the local speaking analyser.
    pub fn push_pcm(&self, samples: &[f32]) {
        if self.is_enabled(MediaKind::Audio) {
            self.levels.push_samples(samples);
        }
    }

    fn flag(&self, kind: MediaKind) -> &AtomicBool {
        match kind {
            MediaKind::Audio => &self.audio_enabled,
            MediaKind::Video => &self.video_enabled,
        }
    }
}

impl LocalMedia for LocalMediaSource {
    fn tracks(&self) -> MediaTrackSet {
        let video: LocalTrack = self
            .video
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let audio: LocalTrack = self.audio.clone();
        MediaTrackSet {
            audio: Some(audio),
            video: Some(video),
        }
    }

    fn set_enabled(&self, kind: MediaKind, enabled: bool) -> bool {
        self.flag(kind).store(enabled, Ordering::SeqCst);
        if kind == MediaKind::Audio && !enabled {
            self.levels.clear();
        }
        tracing::debug!("local {} track enabled={}", kind, enabled);
        true
    }

    fn is_enabled(&self, kind: MediaKind) -> bool {
        self.flag(kind).load(Ordering::SeqCst)
    }

    fn audio_levels(&self) -> Option<Arc<dyn EnergyProbe>> {
        let levels: Arc<dyn EnergyProbe> = self.levels.clone();
        Some(levels)
    }
}

impl fmt::Debug for LocalMediaSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalMediaSource")
            .field("stream_id", &self.stream_id)
            .field("audio_enabled", &self.is_enabled(MediaKind::Audio))
            .field("video_enabled", &self.is_enabled(MediaKind::Video))
            .finish()
    }
}
