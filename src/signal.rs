use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;
use webrtc::{
    ice_transport::ice_candidate::RTCIceCandidateInit,
    peer_connection::sdp::session_description::RTCSessionDescription,
    rtp_transceiver::rtp_codec::RTPCodecType,
};

use crate::error::{Error, SignalingErrorKind};

/// Opaque identity of one meeting attendance. Generated once and never reused.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn generate() -> Self {
        Self(format!("id-{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for ParticipantId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for ParticipantId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn from_codec_type(codec_type: RTPCodecType) -> Option<Self> {
        match codec_type {
            RTPCodecType::Audio => Some(MediaKind::Audio),
            RTPCodecType::Video => Some(MediaKind::Video),
            _ => None,
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => f.write_str("audio"),
            MediaKind::Video => f.write_str("video"),
        }
    }
}

/// Entry of the room snapshot the rendezvous server sends on room entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: ParticipantId,
    pub name: String,
}

/// Typed payload of a signaling message. The tag is the wire `type` field.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum Signal {
    Join {
        name: String,
    },
    Welcome {
        name: String,
    },
    Offer {
        #[serde(default)]
        name: String,
        sdp: RTCSessionDescription,
    },
    Answer {
        sdp: RTCSessionDescription,
    },
    Candidate {
        candidate: RTCIceCandidateInit,
    },
    TrackToggled {
        kind: MediaKind,
        enabled: bool,
    },
    #[serde(rename_all = "camelCase")]
    ScreenShareStatus {
        is_screen_sharing: bool,
    },
    ForceMute {},
    RequestUnmute {},
    #[serde(rename_all = "camelCase")]
    ChatMessage {
        id: String,
        sender_name: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
    Leave {},
    Peers {
        peers: Vec<PeerInfo>,
    },
}

impl Signal {
    pub fn name(&self) -> &'static str {
        match self {
            Signal::Join { .. } => "join",
            Signal::Welcome { .. } => "welcome",
            Signal::Offer { .. } => "offer",
            Signal::Answer { .. } => "answer",
            Signal::Candidate { .. } => "candidate",
            Signal::TrackToggled { .. } => "track-toggled",
            Signal::ScreenShareStatus { .. } => "screen-share-status",
            Signal::ForceMute {} => "force-mute",
            Signal::RequestUnmute {} => "request-unmute",
            Signal::ChatMessage { .. } => "chat-message",
            Signal::Leave {} => "leave",
            Signal::Peers { .. } => "peers",
        }
    }
}

/// The untyped wire shape: `{type, room?, from, to?, payload}`.
///
/// The rendezvous server only ever looks at this form and relays `payload` untouched.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<ParticipantId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<ParticipantId>,
    #[serde(default)]
    pub payload: Value,
}

/// A signaling message as seen by a room member.
#[derive(Clone, Debug)]
pub struct SignalMessage {
    pub room: Option<String>,
    /// Empty for messages originating from the rendezvous server itself.
    pub from: ParticipantId,
    pub to: Option<ParticipantId>,
    pub signal: Signal,
}

impl SignalMessage {
    pub fn new(from: ParticipantId, to: Option<ParticipantId>, signal: Signal) -> Self {
        Self {
            room: None,
            from,
            to,
            signal,
        }
    }

    pub fn into_envelope(self) -> Result<Envelope, Error> {
        let (kind, payload) = match serde_json::to_value(&self.signal)? {
            Value::Object(mut tagged) => (tagged.remove("type"), tagged.remove("payload")),
            _ => (None, None),
        };
        let kind = kind
            .and_then(|kind| kind.as_str().map(str::to_owned))
            .ok_or(Error::new_signaling(
                format!("signal {} has no type tag", self.signal.name()),
                SignalingErrorKind::MalformedMessage,
            ))?;

        Ok(Envelope {
            kind,
            room: self.room,
            from: Some(self.from),
            to: self.to,
            payload: payload.unwrap_or(Value::Object(Default::default())),
        })
    }

    pub fn encode(self) -> Result<String, Error> {
        let envelope = self.into_envelope()?;
        Ok(serde_json::to_string(&envelope)?)
    }

    pub fn decode(text: &str) -> Result<Self, Error> {
        let envelope: Envelope = serde_json::from_str(text)?;
        Self::try_from(envelope)
    }
}

impl TryFrom<Envelope> for SignalMessage {
    type Error = Error;

    fn try_from(envelope: Envelope) -> Result<Self, Self::Error> {
        let tagged = serde_json::json!({
            "type": envelope.kind,
            "payload": envelope.payload,
        });
        let signal: Signal = serde_json::from_value(tagged)?;

        Ok(Self {
            room: envelope.room,
            from: envelope.from.unwrap_or_default(),
            to: envelope.to,
            signal,
        })
    }
}
