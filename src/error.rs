use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    WebRTCError(#[from] webrtc::Error),
    #[error(transparent)]
    CodecError(#[from] serde_json::Error),
    #[error(transparent)]
    SignalingError(#[from] SignalingError),
    #[error(transparent)]
    SessionError(#[from] SessionError),
}

#[derive(thiserror::Error)]
#[error("{kind}: {message}")]
pub struct SignalingError {
    pub kind: SignalingErrorKind,
    pub message: String,
}

#[derive(thiserror::Error)]
#[error("{kind}: {message}")]
pub struct SessionError {
    pub kind: SessionErrorKind,
    pub message: String,
}

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum SignalingErrorKind {
    #[error("connect failed error")]
    ConnectFailed,
    #[error("malformed message error")]
    MalformedMessage,
}

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum SessionErrorKind {
    #[error("session not found error")]
    SessionNotFound,
    #[error("no remote description error")]
    NoRemoteDescription,
    #[error("local description error")]
    LocalDescriptionError,
    #[error("negotiation failed error")]
    NegotiationFailed,
    #[error("already left error")]
    AlreadyLeft,
}

impl Error {
    pub fn new_signaling(message: String, kind: SignalingErrorKind) -> Error {
        Error::SignalingError(SignalingError { kind, message })
    }

    pub fn new_session(message: String, kind: SessionErrorKind) -> Error {
        Error::SessionError(SessionError { kind, message })
    }
}

impl fmt::Debug for SignalingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("meshcall::SignalingError");

        builder.field("kind", &self.kind);
        builder.field("message", &self.message);

        builder.finish()
    }
}

impl fmt::Debug for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("meshcall::SessionError");

        builder.field("kind", &self.kind);
        builder.field("message", &self.message);

        builder.finish()
    }
}
