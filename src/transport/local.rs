use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use tokio::sync::mpsc;

use crate::signal::{ParticipantId, Signal, SignalMessage};

use super::{SignalReceiver, SignalSender, SignalingTransport};

/// A meeting room living inside one process. Every message sent by a member reaches every
/// other member; membership is learned through the join/welcome handshake.
#[derive(Clone, Default)]
pub struct LocalRoom {
    members: Arc<Mutex<HashMap<ParticipantId, SignalSender>>>,
}

impl LocalRoom {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enters the room as `id`.
    pub fn connect(&self, id: ParticipantId) -> (LocalTransport, SignalReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.members().insert(id.clone(), tx);
        tracing::debug!("participant {} entered local room", id);

        let transport = LocalTransport {
            id,
            room: self.clone(),
            closed: AtomicBool::new(false),
        };
        (transport, rx)
    }

    pub fn member_count(&self) -> usize {
        self.members().len()
    }

    fn members(&self) -> MutexGuard<'_, HashMap<ParticipantId, SignalSender>> {
        self.members.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn deliver(&self, message: SignalMessage) {
        let members = self.members();
        match &message.to {
            Some(to) => {
                if *to == message.from {
                    return;
                }
                match members.get(to) {
                    Some(sender) => {
                        let _ = sender.send(message);
                    }
                    None => tracing::trace!("dropping {} for absent {}", message.signal.name(), to),
                }
            }
            None => {
                for (id, sender) in members.iter() {
                    if *id == message.from {
                        continue;
                    }
                    let _ = sender.send(message.clone());
                }
            }
        }
    }
}

impl fmt::Debug for LocalRoom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalRoom")
            .field("members", &self.member_count())
            .finish()
    }
}

#[derive(Debug)]
pub struct LocalTransport {
    id: ParticipantId,
    room: LocalRoom,
    closed: AtomicBool,
}

impl SignalingTransport for LocalTransport {
    fn local_id(&self) -> &ParticipantId {
        &self.id
    }

    fn send(&self, signal: Signal, to: Option<ParticipantId>) {
        if self.closed.load(Ordering::Acquire) {
            tracing::debug!("local transport closed, dropping {}", signal.name());
            return;
        }
        self.room
            .deliver(SignalMessage::new(self.id.clone(), to, signal));
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.room.members().remove(&self.id);
        tracing::debug!("participant {} left local room", self.id);
    }
}

impl Drop for LocalTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn drain(rx: &mut SignalReceiver) -> Vec<SignalMessage> {
        let mut messages = vec![];
        while let Ok(message) = rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    #[test]
    fn test_broadcast_skips_sender() {
        let room = LocalRoom::new();
        let (a, mut a_rx) = room.connect("id-a".into());
        let (_b, mut b_rx) = room.connect("id-b".into());
        let (_c, mut c_rx) = room.connect("id-c".into());

        a.send(
            Signal::Join {
                name: "Alice".to_owned(),
            },
            None,
        );

        assert!(drain(&mut a_rx).is_empty());
        assert_eq!(drain(&mut b_rx).len(), 1);
        let received = drain(&mut c_rx);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].from, ParticipantId::from("id-a"));
    }

    #[test]
    fn test_directed_message_reaches_only_target() {
        let room = LocalRoom::new();
        let (a, _a_rx) = room.connect("id-a".into());
        let (_b, mut b_rx) = room.connect("id-b".into());
        let (_c, mut c_rx) = room.connect("id-c".into());

        a.send(Signal::ForceMute {}, Some("id-b".into()));

        assert_eq!(drain(&mut b_rx).len(), 1);
        assert!(drain(&mut c_rx).is_empty());
    }

    #[test]
    fn test_no_delivery_after_leave() {
        let room = LocalRoom::new();
        let (a, _a_rx) = room.connect("id-a".into());
        let (b, mut b_rx) = room.connect("id-b".into());

        b.close();
        b.close();
        a.send(Signal::Leave {}, None);
        a.send(Signal::ForceMute {}, Some("id-b".into()));

        assert!(drain(&mut b_rx).is_empty());
        assert_eq!(room.member_count(), 1);
    }

    #[test]
    fn test_closed_transport_drops_sends() {
        let room = LocalRoom::new();
        let (a, _a_rx) = room.connect("id-a".into());
        let (_b, mut b_rx) = room.connect("id-b".into());

        a.close();
        a.send(Signal::Leave {}, None);

        assert!(drain(&mut b_rx).is_empty());
    }
}
