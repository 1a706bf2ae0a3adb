use std::{env, net::IpAddr, sync::Arc, time::Duration};

use derivative::Derivative;
use webrtc::{
    api::setting_engine::SettingEngine,
    ice_transport::ice_server::RTCIceServer,
    peer_connection::configuration::RTCConfiguration,
};
use webrtc_ice::network_type::NetworkType;

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_SPEAKING_THRESHOLD: f32 = 5.0;
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(200);
pub const DEFAULT_SIGNALING_PORT: u16 = 3001;

/// Configuration for [`crate::coordinator::Coordinator`] and the peer connections it creates.
#[derive(Clone, Debug)]
pub struct MeshConfig {
    /// Path-discovery hint handed to every peer connection.
    pub ice_servers: Vec<String>,
    pub transport: WebRTCTransportConfig,
    /// A stream is speaking when its RMS amplitude times 100 exceeds this.
    pub speaking_threshold: f32,
    pub sample_interval: Duration,
    /// Number of PCM samples kept for the local microphone.
    pub local_analyser_size: usize,
    /// Number of RTP audio-level readings kept per remote participant.
    pub remote_level_window: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![DEFAULT_STUN_SERVER.to_owned()],
            transport: WebRTCTransportConfig::default(),
            speaking_threshold: DEFAULT_SPEAKING_THRESHOLD,
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
            local_analyser_size: 2048,
            remote_level_window: 10,
        }
    }
}

impl MeshConfig {
    pub fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            vec![]
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };

        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

/// ICE knobs for the underlying [`webrtc::peer_connection::RTCPeerConnection`].
#[derive(Derivative, Default)]
#[derivative(Clone, Debug)]
pub struct WebRTCTransportConfig {
    pub announced_ips: Vec<IpAddr>,
    pub ice_disconnected_timeout: Option<Duration>,
    pub ice_failed_timeout: Option<Duration>,
    pub ice_keep_alive_interval: Option<Duration>,
    #[derivative(Debug = "ignore")]
    pub network_types: Vec<NetworkType>,
}

impl WebRTCTransportConfig {
    pub(crate) fn setting_engine(&self) -> SettingEngine {
        let mut setting_engine = SettingEngine::default();

        if self.ice_disconnected_timeout.is_some()
            || self.ice_failed_timeout.is_some()
            || self.ice_keep_alive_interval.is_some()
        {
            setting_engine.set_ice_timeouts(
                self.ice_disconnected_timeout,
                self.ice_failed_timeout,
                self.ice_keep_alive_interval,
            );
        }

        if !self.announced_ips.is_empty() {
            let announced_ips = Arc::new(self.announced_ips.clone());
            setting_engine.set_ip_filter(Box::new({
                let announced_ips = Arc::clone(&announced_ips);
                move |ip| announced_ips.contains(&ip)
            }));
        }

        if !self.network_types.is_empty() {
            setting_engine.set_network_types(self.network_types.clone());
        }

        setting_engine
    }
}

/// Configuration for the routed rendezvous server binary.
#[derive(Clone, Debug, PartialEq)]
pub struct RendezvousConfig {
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_owned(),
            port: DEFAULT_SIGNALING_PORT,
            path: "/ws".to_owned(),
        }
    }
}

impl RendezvousConfig {
    /// Reads `SIGNALING_HOST` and `SIGNALING_PORT`, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(host) = lookup("SIGNALING_HOST").filter(|host| !host.is_empty()) {
            config.host = host;
        }
        if let Some(port) = lookup("SIGNALING_PORT") {
            match port.parse::<u16>() {
                Ok(port) => config.port = port,
                Err(err) => tracing::warn!("ignoring SIGNALING_PORT={}: {}", port, err),
            }
        }
        config
    }
}
