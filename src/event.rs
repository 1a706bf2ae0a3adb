use tokio::sync::mpsc;

use crate::{
    chat::ChatMessage,
    peer_connection::RemoteTrack,
    signal::{MediaKind, ParticipantId},
};

/// Everything the UI layer learns from the mesh. There is a single consumer.
#[derive(Clone, Debug)]
pub enum MeshEvent {
    ParticipantJoined { id: ParticipantId, name: String },
    ParticipantLeft { id: ParticipantId },
    StreamAdded {
        id: ParticipantId,
        track: RemoteTrack,
    },
    TrackToggled {
        id: ParticipantId,
        kind: MediaKind,
        enabled: bool,
    },
    SpeakingStatus {
        id: ParticipantId,
        is_speaking: bool,
    },
    ScreenShareStatus {
        id: ParticipantId,
        is_screen_sharing: bool,
    },
    ForceMuteTriggered,
    UnmuteRequested,
    ChatMessage(ChatMessage),
}

pub type EventSender = mpsc::UnboundedSender<MeshEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<MeshEvent>;
