//! WebRTC PeerConnection creation
//!
//! Builds `RTCPeerConnection` instances from the ICE and network settings in
//! the configuration. The relay forwards whatever codecs the capture endpoint
//! offers, so the default codec set is registered.

use super::RtcError;
use crate::config::{IceServerConfig, WebRTCConfig};
use log::{debug, warn};
use std::sync::Arc;
use tokio::net::UdpSocket;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::ice::udp_mux::{UDPMuxDefault, UDPMuxParams};
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::RTCPeerConnection;

/// Creates peer connections with the configured settings.
///
/// Cheap to clone; a muxed UDP socket, when configured, is bound once and
/// shared by every connection.
#[derive(Clone)]
pub struct PeerConnectionFactory {
    config: WebRTCConfig,
    ice_servers: Vec<IceServerConfig>,
    udp_mux: Option<Arc<UDPMuxDefault>>,
}

impl PeerConnectionFactory {
    /// Create a factory without a shared UDP mux
    pub fn new(config: WebRTCConfig, ice_servers: Vec<IceServerConfig>) -> Self {
        Self {
            config,
            ice_servers,
            udp_mux: None,
        }
    }

    /// Create a factory, binding the UDP mux socket if one is configured
    pub async fn bind(config: WebRTCConfig, ice_servers: Vec<IceServerConfig>) -> Result<Self, RtcError> {
        let mut factory = Self::new(config, ice_servers);

        if factory.config.udp_mux_port != 0 {
            if factory.config.ephemeral_udp_port_range.is_some() {
                warn!("UDP mux is enabled; ignoring ephemeral UDP port range");
            }
            let addr = format!("0.0.0.0:{}", factory.config.udp_mux_port);
            let socket = UdpSocket::bind(&addr)
                .await
                .map_err(|e| RtcError::ConnectionFailed(format!("Failed to bind UDP mux socket {}: {}", addr, e)))?;
            factory.udp_mux = Some(UDPMuxDefault::new(UDPMuxParams::new(socket)));
        }

        Ok(factory)
    }

    pub fn ice_servers(&self) -> &[IceServerConfig] {
        &self.ice_servers
    }

    /// Create a new PeerConnection with the configured settings
    pub async fn create_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, RtcError> {
        let mut setting_engine = SettingEngine::default();

        if !self.config.nat1to1_ips.is_empty() {
            setting_engine.set_nat_1to1_ips(self.config.nat1to1_ips.clone(), RTCIceCandidateType::Host);
        }

        if let Some(ref udp_mux) = self.udp_mux {
            setting_engine.set_udp_network(UDPNetwork::Muxed(udp_mux.clone()));
        } else if let Some(range) = self.config.ephemeral_udp_port_range {
            let ephemeral = EphemeralUDP::new(range[0], range[1])
                .map_err(|e| RtcError::ConnectionFailed(format!("Invalid ICE UDP port range: {}", e)))?;
            setting_engine.set_udp_network(UDPNetwork::Ephemeral(ephemeral));
        }

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| RtcError::ConnectionFailed(format!("Failed to register codecs: {}", e)))?;

        // Interceptors provide NACK/RTCP report handling for relayed tracks
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| RtcError::ConnectionFailed(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: self.rtc_ice_servers(),
            ..Default::default()
        };

        let peer_connection = api
            .new_peer_connection(rtc_config)
            .await
            .map_err(|e| RtcError::ConnectionFailed(format!("Failed to create peer connection: {}", e)))?;

        debug!("Created peer connection with {} ICE server(s)", self.ice_servers.len());
        Ok(Arc::new(peer_connection))
    }

    fn rtc_ice_servers(&self) -> Vec<RTCIceServer> {
        self.ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect()
    }
}
