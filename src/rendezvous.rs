use std::{collections::HashMap, fmt};

use actix::{
    Actor, ActorContext, Addr, AsyncContext, Context, Handler, Message, Recipient, StreamHandler,
};
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use derivative::Derivative;
use serde_json::{json, Value};

use crate::signal::{Envelope, ParticipantId, PeerInfo};

/// Room membership of the rendezvous server. `R` is whatever handle reaches a connected socket.
pub struct RoomRegistry<R> {
    rooms: HashMap<String, HashMap<ParticipantId, Member<R>>>,
}

struct Member<R> {
    name: String,
    recipient: R,
}

impl<R: Clone> RoomRegistry<R> {
    pub fn new() -> Self {
        Self {
            rooms: HashMap::new(),
        }
    }

    /// Registers `id` in `room` and returns the members that were already present.
    pub fn join(
        &mut self,
        room: &str,
        id: ParticipantId,
        name: String,
        recipient: R,
    ) -> Vec<PeerInfo> {
        let members = self.rooms.entry(room.to_owned()).or_default();
        let peers = members
            .iter()
            .filter(|(member_id, _)| **member_id != id)
            .map(|(member_id, member)| PeerInfo {
                id: member_id.clone(),
                name: member.name.clone(),
            })
            .collect();
        members.insert(id, Member { name, recipient });
        peers
    }

    /// Drops `id` from `room`. Returns whether it was a member.
    pub fn leave(&mut self, room: &str, id: &ParticipantId) -> bool {
        let Some(members) = self.rooms.get_mut(room) else {
            return false;
        };
        let removed = members.remove(id).is_some();
        if members.is_empty() {
            self.rooms.remove(room);
        }
        removed
    }

    pub fn recipient(&self, room: &str, id: &ParticipantId) -> Option<R> {
        self.rooms
            .get(room)
            .and_then(|members| members.get(id))
            .map(|member| member.recipient.clone())
    }

    /// Every member of `room` except `except`.
    pub fn others(&self, room: &str, except: &ParticipantId) -> Vec<R> {
        match self.rooms.get(room) {
            Some(members) => members
                .iter()
                .filter(|(id, _)| *id != except)
                .map(|(_, member)| member.recipient.clone())
                .collect(),
            None => vec![],
        }
    }

    pub fn room_size(&self, room: &str) -> usize {
        self.rooms.get(room).map_or(0, HashMap::len)
    }
}

impl<R: Clone> Default for RoomRegistry<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> fmt::Debug for RoomRegistry<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sizes: HashMap<&String, usize> = self
            .rooms
            .iter()
            .map(|(room, members)| (room, members.len()))
            .collect();
        f.debug_struct("RoomRegistry").field("rooms", &sizes).finish()
    }
}

/// A serialized envelope on its way to one socket.
#[derive(Message, Debug)]
#[rtype(result = "()")]
pub struct Deliver(pub String);

#[derive(Message, Derivative)]
#[derivative(Debug)]
#[rtype(result = "()")]
pub struct Register {
    pub room: String,
    pub id: ParticipantId,
    pub name: String,
    #[derivative(Debug = "ignore")]
    pub recipient: Recipient<Deliver>,
}

#[derive(Message, Debug)]
#[rtype(result = "()")]
pub struct Relay {
    pub room: String,
    pub from: ParticipantId,
    pub envelope: Envelope,
}

#[derive(Message, Debug)]
#[rtype(result = "()")]
pub struct Disconnect {
    pub room: String,
    pub id: ParticipantId,
}

/// Tracks every room and routes envelopes between the sockets in it.
#[derive(Debug, Default)]
pub struct RendezvousServer {
    rooms: RoomRegistry<Recipient<Deliver>>,
}

impl RendezvousServer {
    pub fn new() -> Self {
        Self::default()
    }

    fn broadcast(&self, room: &str, except: &ParticipantId, envelope: &Envelope) {
        let text = match serde_json::to_string(envelope) {
            Ok(text) => text,
            Err(err) => {
                tracing::error!("failed to serialize {}: {}", envelope.kind, err);
                return;
            }
        };
        for recipient in self.rooms.others(room, except) {
            recipient.do_send(Deliver(text.clone()));
        }
    }
}

impl Actor for RendezvousServer {
    type Context = Context<Self>;

    fn started(&mut self, _ctx: &mut Self::Context) {
        tracing::info!("RendezvousServer started");
    }
}

impl Handler<Register> for RendezvousServer {
    type Result = ();

    fn handle(&mut self, msg: Register, _ctx: &mut Self::Context) -> Self::Result {
        let Register {
            room,
            id,
            name,
            recipient,
        } = msg;
        let peers = self
            .rooms
            .join(&room, id.clone(), name.clone(), recipient.clone());
        tracing::info!(
            "participant {} joined room {} ({} present)",
            id,
            room,
            peers.len()
        );

        let snapshot = Envelope {
            kind: "peers".to_owned(),
            room: Some(room.clone()),
            from: None,
            to: Some(id.clone()),
            payload: json!({ "peers": peers }),
        };
        match serde_json::to_string(&snapshot) {
            Ok(text) => recipient.do_send(Deliver(text)),
            Err(err) => tracing::error!("failed to serialize peers snapshot: {}", err),
        }

        let joined = Envelope {
            kind: "join".to_owned(),
            room: Some(room.clone()),
            from: Some(id.clone()),
            to: None,
            payload: json!({ "name": name }),
        };
        self.broadcast(&room, &id, &joined);
    }
}

impl Handler<Relay> for RendezvousServer {
    type Result = ();

    fn handle(&mut self, msg: Relay, _ctx: &mut Self::Context) -> Self::Result {
        let Relay {
            room,
            from,
            mut envelope,
        } = msg;
        // The registered identity wins over whatever the client claims.
        envelope.from = Some(from.clone());

        match envelope.to.clone() {
            Some(to) => {
                let Some(recipient) = self.rooms.recipient(&room, &to) else {
                    tracing::debug!("dropping {} for {} not in room {}", envelope.kind, to, room);
                    return;
                };
                match serde_json::to_string(&envelope) {
                    Ok(text) => recipient.do_send(Deliver(text)),
                    Err(err) => tracing::error!("failed to serialize {}: {}", envelope.kind, err),
                }
            }
            None => self.broadcast(&room, &from, &envelope),
        }
    }
}

impl Handler<Disconnect> for RendezvousServer {
    type Result = ();

    fn handle(&mut self, msg: Disconnect, _ctx: &mut Self::Context) -> Self::Result {
        if !self.rooms.leave(&msg.room, &msg.id) {
            return;
        }
        tracing::info!("participant {} left room {}", msg.id, msg.room);

        let left = Envelope {
            kind: "leave".to_owned(),
            room: Some(msg.room.clone()),
            from: Some(msg.id.clone()),
            to: None,
            payload: json!({}),
        };
        self.broadcast(&msg.room, &msg.id, &left);
    }
}

/// One client WebSocket. It stays silent until the client sends `join`.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct WsSession {
    #[derivative(Debug = "ignore")]
    server: Addr<RendezvousServer>,
    member: Option<(String, ParticipantId)>,
}

impl WsSession {
    pub fn new(server: Addr<RendezvousServer>) -> Self {
        Self {
            server,
            member: None,
        }
    }

    fn handle_envelope(&mut self, envelope: Envelope, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(room) = envelope.room.clone() else {
            return;
        };

        if envelope.kind == "join" {
            if self.member.is_some() {
                tracing::debug!("ignoring repeated join on one socket");
                return;
            }
            let Some(id) = envelope.from.clone().filter(|id| !id.is_empty()) else {
                return;
            };
            let name = envelope
                .payload
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned();
            self.member = Some((room.clone(), id.clone()));
            self.server.do_send(Register {
                room,
                id,
                name,
                recipient: ctx.address().recipient(),
            });
            return;
        }

        let Some((joined_room, id)) = &self.member else {
            return;
        };
        if *joined_room != room {
            return;
        }
        self.server.do_send(Relay {
            room,
            from: id.clone(),
            envelope,
        });
    }
}

impl Actor for WsSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, _ctx: &mut Self::Context) {
        tracing::debug!("WebSocket started");
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if let Some((room, id)) = self.member.take() {
            self.server.do_send(Disconnect { room, id });
        }
        tracing::debug!("WebSocket stopped");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsSession {
    fn handle(&mut self, item: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match item {
            Ok(ws::Message::Ping(msg)) => ctx.pong(&msg),
            Ok(ws::Message::Pong(_)) => tracing::trace!("pong received"),
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<Envelope>(&text) {
                Ok(envelope) => self.handle_envelope(envelope, ctx),
                Err(error) => {
                    tracing::warn!("failed to parse client message: {}", error);
                }
            },
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            Err(error) => {
                tracing::warn!("WebSocket protocol error: {}", error);
                ctx.stop();
            }
            _ => (),
        }
    }
}

impl Handler<Deliver> for WsSession {
    type Result = ();

    fn handle(&mut self, msg: Deliver, ctx: &mut Self::Context) -> Self::Result {
        ctx.text(msg.0);
    }
}

/// Upgrades the request to a [`WsSession`] attached to the shared server.
pub async fn websocket_route(
    req: HttpRequest,
    stream: web::Payload,
    server: web::Data<Addr<RendezvousServer>>,
) -> Result<HttpResponse, actix_web::Error> {
    let session = WsSession::new(server.get_ref().clone());
    ws::start(session, &req, stream)
}
