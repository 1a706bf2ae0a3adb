use std::fmt::Debug;

use tokio::sync::mpsc;

use crate::signal::{ParticipantId, Signal, SignalMessage};

/// Process-local room broadcast.
pub mod local;
/// Client side of the routed rendezvous server.
pub mod routed;

pub type SignalSender = mpsc::UnboundedSender<SignalMessage>;
pub type SignalReceiver = mpsc::UnboundedReceiver<SignalMessage>;

/// A bidirectional signaling channel scoped to one member of one meeting room.
///
/// Inbound traffic is handed out as a [`SignalReceiver`] when the transport is created.
/// Implementations never deliver a member's own message back to it and never deliver
/// to a member that already left.
pub trait SignalingTransport: Send + Sync + Debug {
    fn local_id(&self) -> &ParticipantId;

    /// Best-effort, at-most-once delivery to `to`, or to every other room member when `to` is `None`.
    /// A send on an unavailable transport is dropped silently.
    fn send(&self, signal: Signal, to: Option<ParticipantId>);

    /// Leaves the room. Calling this more than once is a no-op.
    fn close(&self);
}
