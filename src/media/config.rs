#![forbid(unsafe_code)]

// Engine-neutral configuration for media workers, routers, and transports

use super::types::MediaKind;
use serde_json::{json, Value};
use std::net::{IpAddr, Ipv4Addr};

/// Main media configuration
#[derive(Debug, Clone)]
pub struct MediaConfig {
    pub worker_config: WorkerConfig,
    pub codecs: Vec<CodecPreference>,
    pub transport_config: TransportConfig,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self::new(WorkerConfig::default(), TransportConfig::default())
    }
}

impl MediaConfig {
    pub fn new(worker_config: WorkerConfig, transport_config: TransportConfig) -> Self {
        Self {
            worker_config,
            codecs: CodecPreference::default_codecs(),
            transport_config,
        }
    }

    /// Router RTP capabilities in the shape client libraries expect
    pub fn rtp_capabilities(&self) -> Value {
        json!({
            "codecs": self.codecs.iter().map(CodecPreference::to_capability).collect::<Vec<_>>(),
            "headerExtensions": [],
        })
    }
}

/// Worker pool configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub num_workers: usize,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    /// Worker `i` listens for WebRTC on `webrtc_server_port_base + i`
    pub webrtc_server_port_base: u16,
    pub dtls_certificate_file: Option<String>,
    pub dtls_private_key_file: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus::get(),
            rtc_min_port: 10000,
            rtc_max_port: 59999,
            webrtc_server_port_base: 44444,
            dtls_certificate_file: None,
            dtls_private_key_file: None,
        }
    }
}

/// WebRTC transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub listen_ip: IpAddr,
    pub announced_address: Option<String>,
    pub initial_available_outgoing_bitrate: u32,
    pub max_incoming_bitrate: Option<u32>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            announced_address: None,
            initial_available_outgoing_bitrate: 600_000,
            max_incoming_bitrate: Some(1_500_000),
        }
    }
}

impl TransportConfig {
    /// Sets the address advertised in ICE candidates
    pub fn with_public_ip(mut self, public_ip: IpAddr) -> Self {
        self.announced_address = Some(public_ip.to_string());
        self
    }
}

/// A codec the routers are willing to negotiate, in preference order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecPreference {
    Opus,
    Vp8,
    Vp9,
    H264 { profile_level_id: &'static str },
}

impl CodecPreference {
    pub fn default_codecs() -> Vec<CodecPreference> {
        vec![
            CodecPreference::Opus,
            CodecPreference::Vp8,
            CodecPreference::Vp9,
            CodecPreference::H264 { profile_level_id: "42e01f" },
        ]
    }

    pub fn kind(&self) -> MediaKind {
        match self {
            CodecPreference::Opus => MediaKind::Audio,
            _ => MediaKind::Video,
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            CodecPreference::Opus => "audio/opus",
            CodecPreference::Vp8 => "video/VP8",
            CodecPreference::Vp9 => "video/VP9",
            CodecPreference::H264 { .. } => "video/H264",
        }
    }

    pub fn preferred_payload_type(&self) -> u8 {
        match self {
            CodecPreference::Opus => 111,
            CodecPreference::Vp8 => 96,
            CodecPreference::Vp9 => 98,
            CodecPreference::H264 { .. } => 102,
        }
    }

    pub fn clock_rate(&self) -> u32 {
        match self {
            CodecPreference::Opus => 48000,
            _ => 90000,
        }
    }

    pub fn parameters(&self) -> Value {
        match self {
            CodecPreference::Opus => json!({ "minptime": 10, "useinbandfec": 1 }),
            CodecPreference::Vp8 | CodecPreference::Vp9 => json!({}),
            CodecPreference::H264 { profile_level_id } => json!({
                "level-asymmetry-allowed": 1,
                "packetization-mode": 1,
                "profile-level-id": profile_level_id,
            }),
        }
    }

    fn rtcp_feedback(&self) -> Value {
        match self {
            CodecPreference::Opus => json!([{ "type": "transport-cc" }]),
            _ => json!([
                { "type": "nack" },
                { "type": "nack", "parameter": "pli" },
                { "type": "ccm", "parameter": "fir" },
                { "type": "goog-remb" },
                { "type": "transport-cc" },
            ]),
        }
    }

    /// JSON codec capability entry
    pub fn to_capability(&self) -> Value {
        let mut codec = json!({
            "kind": self.kind(),
            "mimeType": self.mime_type(),
            "preferredPayloadType": self.preferred_payload_type(),
            "clockRate": self.clock_rate(),
            "parameters": self.parameters(),
            "rtcpFeedback": self.rtcp_feedback(),
        });
        if *self == CodecPreference::Opus {
            codec["channels"] = json!(2);
        }
        codec
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_codecs_cover_audio_and_video() {
        let codecs = CodecPreference::default_codecs();
        assert_eq!(codecs[0].kind(), MediaKind::Audio);
        assert!(codecs.iter().any(|c| c.mime_type() == "video/VP8"));
        assert!(codecs.iter().any(|c| c.mime_type() == "video/H264"));
    }

    #[test]
    fn rtp_capabilities_list_every_codec() {
        let config = MediaConfig::new(WorkerConfig::default(), TransportConfig::default());
        let caps = config.rtp_capabilities();
        let codecs = caps["codecs"].as_array().unwrap();
        assert_eq!(codecs.len(), 4);
        assert_eq!(codecs[0]["mimeType"], "audio/opus");
        assert_eq!(codecs[0]["channels"], 2);
        assert_eq!(codecs[3]["parameters"]["profile-level-id"], "42e01f");
    }

    #[test]
    fn public_ip_is_announced() {
        let config = TransportConfig::default().with_public_ip("203.0.113.7".parse().unwrap());
        assert_eq!(config.announced_address.as_deref(), Some("203.0.113.7"));
    }
}
