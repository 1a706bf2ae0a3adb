#![deny(missing_debug_implementations)]
//! # Meshcall
//! Meshcall keeps a fully-connected mesh of WebRTC peer connections between the participants of one meeting.
//! Every participant holds a direct connection to every other participant; there is no media server.
//! A small signaling protocol negotiates those connections, and the same channel carries session events
//! such as track mute state, screen sharing, moderation and chat.
//!
//! The [`coordinator::Coordinator`] is the entry point. It needs a [`transport::SignalingTransport`], either
//! [`transport::local::LocalRoom`] for participants living in one process or [`transport::routed::RoutedTransport`]
//! talking to the `rendezvous` binary, and a [`peer_connection::PeerConnector`].

/// Speaking detection on local and remote audio.
pub mod audio_monitor;
pub mod chat;
/// Configuration for [`coordinator::Coordinator`] and the rendezvous server.
pub mod config;
/// Session coordinator owning every peer session of one participant.
pub mod coordinator;
pub mod error;
/// Events consumed by the UI layer.
pub mod event;
/// Local outbound media.
pub mod media;
pub mod media_engine;
/// [`webrtc::peer_connection::RTCPeerConnection`] behind a trait seam.
pub mod peer_connection;
/// Negotiation state of one remote participant.
pub mod peer_session;
/// Routed rendezvous server.
pub mod rendezvous;
/// Signaling wire protocol.
pub mod signal;
pub mod transport;

#[cfg(test)]
mod test_support;
