//! Desktop-wide WebRTC peer-connection factory.
//!
//! One API instance serves every session: the media engine is built from
//! the mixer's source codecs, NACK feedback is advertised on video, and
//! PLI is not (the encoder cannot produce keyframes on demand).
//! Retransmission is handled by our own ring, so the interceptor registry
//! stays empty.

use anyhow::Context;
use padcast_protocol::IceServerInfo;
use tokio::net::UdpSocket;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice::udp_mux::{UDPMuxDefault, UDPMuxParams};
use webrtc::ice::udp_network::UDPNetwork;
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::RTCPFeedback;

use crate::mixer::Mixer;

#[derive(Debug, Clone, Default)]
pub struct RtcFactoryConfig {
    /// When nonzero, every ICE connection shares this UDP port.
    pub single_port: u16,
    /// NAT 1:1 addresses advertised as server-reflexive candidates.
    pub external_ips: Vec<String>,
}

pub async fn build_api(mixer: &Mixer, config: &RtcFactoryConfig) -> anyhow::Result<API> {
    let mut media_engine = MediaEngine::default();
    for params in mixer.audio_codecs() {
        media_engine
            .register_codec(params, RTPCodecType::Audio)
            .context("registering audio codec")?;
    }
    for params in mixer.video_codecs() {
        media_engine
            .register_codec(params, RTPCodecType::Video)
            .context("registering video codec")?;
    }
    media_engine.register_feedback(
        RTCPFeedback {
            typ: "nack".to_string(),
            parameter: String::new(),
        },
        RTPCodecType::Video,
    );

    let mut setting_engine = SettingEngine::default();
    if config.single_port != 0 {
        let socket = UdpSocket::bind(("0.0.0.0", config.single_port))
            .await
            .with_context(|| format!("binding shared WebRTC port {}", config.single_port))?;
        let udp_mux = UDPMuxDefault::new(UDPMuxParams::new(socket));
        setting_engine.set_udp_network(UDPNetwork::Muxed(udp_mux));
    }
    if !config.external_ips.is_empty() {
        setting_engine
            .set_nat_1to1_ips(config.external_ips.clone(), RTCIceCandidateType::Srflx);
    }

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(Registry::new())
        .with_setting_engine(setting_engine)
        .build())
}

/// Compose the per-session configuration: the startup list is preserved,
/// broker-pushed servers are appended.
pub fn rtc_configuration(base: &[IceServerInfo], extra: &[IceServerInfo]) -> RTCConfiguration {
    let ice_servers = base
        .iter()
        .chain(extra.iter())
        .map(|info| RTCIceServer {
            urls: info.urls.clone(),
            username: info.username.clone().unwrap_or_default(),
            credential: info.credential.clone().unwrap_or_default(),
            credential_type: Default::default(),
        })
        .collect();
    RTCConfiguration {
        ice_servers,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(url: &str) -> IceServerInfo {
        IceServerInfo {
            urls: vec![url.to_string()],
            username: None,
            credential: None,
        }
    }

    #[test]
    fn base_servers_come_before_extras() {
        let base = vec![info("stun:base.example")];
        let extra = vec![info("turn:extra.example")];
        let config = rtc_configuration(&base, &extra);
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.ice_servers[0].urls, vec!["stun:base.example"]);
        assert_eq!(config.ice_servers[1].urls, vec!["turn:extra.example"]);
    }

    #[test]
    fn credentials_map_to_empty_strings() {
        let mut with_creds = info("turn:t.example");
        with_creds.username = Some("user".into());
        with_creds.credential = Some("pass".into());
        let config = rtc_configuration(&[with_creds], &[info("stun:s.example")]);
        assert_eq!(config.ice_servers[0].username, "user");
        assert_eq!(config.ice_servers[0].credential, "pass");
        assert_eq!(config.ice_servers[1].username, "");
    }

    #[tokio::test]
    async fn api_builds_with_registered_codecs() {
        use crate::capture::{h264_codec_parameters, opus_codec_parameters};
        use crate::mixer::Mixer;

        // A mixer with no sources still yields a usable (if silent) API.
        let mixer = Mixer::new(0.0);
        build_api(&mixer, &RtcFactoryConfig::default()).await.unwrap();

        // Codec registration shape is what sessions negotiate with.
        assert_eq!(h264_codec_parameters().capability.clock_rate, 90000);
        assert_eq!(opus_codec_parameters().payload_type, 111);
    }
}
