use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, PoisonError,
};

use derivative::Derivative;
use futures_util::{SinkExt, StreamExt};
use tokio::{net::TcpStream, sync::mpsc};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use crate::{
    error::{Error, SignalingErrorKind},
    signal::{ParticipantId, Signal, SignalMessage},
};

use super::{SignalReceiver, SignalSender, SignalingTransport};

/// Signaling through the rendezvous server. Messages sent before the WebSocket is open are
/// queued and flushed in order once it is.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct RoutedTransport {
    id: ParticipantId,
    room: String,
    #[derivative(Debug = "ignore")]
    outbound: Mutex<Option<SignalSender>>,
    closed: Arc<AtomicBool>,
}

impl RoutedTransport {
    /// Connects to `url` (for example `ws://localhost:3001/ws`) as `id` inside `room`.
    pub fn connect(url: String, room: String, id: ParticipantId) -> (Self, SignalReceiver) {
        let (outbound_sender, outbound_receiver) = mpsc::unbounded_channel();
        let (inbound_sender, inbound_receiver) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(Self::connection_loop(
            url,
            id.clone(),
            outbound_receiver,
            inbound_sender,
            closed.clone(),
        ));

        let transport = Self {
            id,
            room,
            outbound: Mutex::new(Some(outbound_sender)),
            closed,
        };
        (transport, inbound_receiver)
    }

    async fn connection_loop(
        url: String,
        id: ParticipantId,
        mut outbound: mpsc::UnboundedReceiver<SignalMessage>,
        inbound: SignalSender,
        closed: Arc<AtomicBool>,
    ) {
        let socket = match open_socket(&url).await {
            Ok(socket) => socket,
            Err(err) => {
                tracing::error!("{}", err);
                return;
            }
        };
        tracing::info!("connected to rendezvous server {}", url);
        let (mut sink, mut stream) = socket.split();

        let writer = tokio::spawn(async move {
            while let Some(message) = outbound.recv().await {
                let name = message.signal.name();
                let text = match message.encode() {
                    Ok(text) => text,
                    Err(err) => {
                        tracing::error!("failed to encode {}: {}", name, err);
                        continue;
                    }
                };
                if let Err(err) = sink.send(Message::Text(text)).await {
                    tracing::warn!("failed to send {}: {}", name, err);
                    break;
                }
            }
            let _ = sink.close().await;
            tracing::debug!("rendezvous writer loop finished");
        });

        while let Some(frame) = stream.next().await {
            let text = match frame {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(err) => {
                    tracing::warn!("rendezvous connection error: {}", err);
                    break;
                }
            };
            let message = match SignalMessage::decode(&text) {
                Ok(message) => message,
                Err(err) => {
                    tracing::warn!("discarding malformed signaling message: {}", err);
                    continue;
                }
            };
            if closed.load(Ordering::Acquire) {
                break;
            }
            if message.from == id {
                continue;
            }
            if message.to.as_ref().is_some_and(|to| *to != id) {
                continue;
            }
            if inbound.send(message).is_err() {
                break;
            }
        }

        tracing::debug!("rendezvous reader loop finished");
        let _ = writer.await;
    }
}

async fn open_socket(url: &str) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>, Error> {
    let (socket, _response) = connect_async(url).await.map_err(|err| {
        Error::new_signaling(
            format!("failed to connect to rendezvous server {}: {}", url, err),
            SignalingErrorKind::ConnectFailed,
        )
    })?;
    Ok(socket)
}

impl SignalingTransport for RoutedTransport {
    fn local_id(&self) -> &ParticipantId {
        &self.id
    }

    fn send(&self, signal: Signal, to: Option<ParticipantId>) {
        let outbound = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = outbound.as_ref() else {
            tracing::debug!("routed transport closed, dropping {}", signal.name());
            return;
        };
        let mut message = SignalMessage::new(self.id.clone(), to, signal);
        message.room = Some(self.room.clone());
        if let Err(err) = sender.send(message) {
            tracing::debug!("rendezvous connection gone, dropping {}", err.0.signal.name());
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Dropping the sender lets the writer flush what is queued and then close the socket.
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        tracing::debug!("participant {} closed routed transport", self.id);
    }
}

impl Drop for RoutedTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_open_socket_reports_connect_failure() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = open_socket(&format!("ws://127.0.0.1:{}/ws", port))
            .await
            .unwrap_err();
        match err {
            Error::SignalingError(err) => assert_eq!(err.kind, SignalingErrorKind::ConnectFailed),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_after_close_is_dropped() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (transport, mut inbound) = RoutedTransport::connect(
            format!("ws://127.0.0.1:{}/ws", port),
            "room".to_owned(),
            "id-a".into(),
        );
        transport.close();
        transport.close();
        transport.send(Signal::Leave {}, None);
        assert!(inbound.recv().await.is_none());
    }
}
