//! Environment-driven configuration.
//!
//! Variable names are operational surface; deployments already set them:
//! `MQTT_HOST`, `DESKTOP_ID`, `DESKTOP_PSK`, `ICE_SERVERS`, `LOG_LEVEL`,
//! `WEBRTC_PORT`, `WEBRTC_IPS`, `PACKET_LOSS`, `VIDEO_CAPTURE_CMD`,
//! `AUDIO_CAPTURE_CMD`. A bad parse is fatal at startup.

use anyhow::{bail, Context};
use padcast_protocol::IceServerInfo;

pub const DEFAULT_MQTT_HOST: &str = "tcp://localhost:1883";

/// How the video encoder hands us its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoTransport {
    /// H.264 Annex-B written into a named pipe.
    H264Fifo,
    /// Ready-made RTP sent to a loopback UDP port.
    RtpUdp,
}

/// How the audio encoder hands us its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    /// Ogg-encapsulated Opus in a named pipe.
    Ogg,
    /// Raw μ-law blocks in a named pipe.
    Pcmu,
    /// Ready-made RTP sent to a loopback UDP port.
    RtpUdp,
}

#[derive(Debug, Clone)]
pub struct DesktopConfig {
    pub mqtt_host: String,
    pub desktop_id: String,
    pub desktop_psk: String,
    /// Base TURN/STUN list; broker-pushed updates are appended, not merged.
    pub ice_servers: Vec<IceServerInfo>,
    /// 0 = let ICE pick ephemeral ports per connection.
    pub webrtc_port: u16,
    /// NAT 1:1 addresses advertised as server-reflexive candidates.
    pub webrtc_ips: Vec<String>,
    /// Fault injection: probability of dropping a mixed packet. 0 disables.
    pub packet_loss: f32,
    /// Video capture pipeline; `{path}` / `{port}` are replaced with the
    /// transport endpoint.
    pub video_capture_cmd: Vec<String>,
    pub video_transport: VideoTransport,
    /// Audio capture pipeline; `{path}` / `{port}` are replaced with the
    /// transport endpoint.
    pub audio_capture_cmd: Vec<String>,
    pub audio_format: AudioFormat,
}

impl DesktopConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Parse from any variable lookup. Tests pass closures instead of
    /// mutating the process environment.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let mqtt_host = get("MQTT_HOST").unwrap_or_else(|| DEFAULT_MQTT_HOST.to_string());

        let desktop_id = match get("DESKTOP_ID") {
            Some(id) if !id.is_empty() => id,
            _ => nix::unistd::gethostname()
                .context("DESKTOP_ID is unset and the hostname is unreadable")?
                .to_string_lossy()
                .into_owned(),
        };

        let ice_servers = match get("ICE_SERVERS") {
            Some(json) if !json.is_empty() => IceServerInfo::parse_list(&json)
                .context("ICE_SERVERS must be a JSON array of server descriptors")?,
            _ => Vec::new(),
        };

        let webrtc_port = match get("WEBRTC_PORT") {
            Some(port) if !port.is_empty() => {
                port.parse().context("WEBRTC_PORT must be a port number")?
            }
            _ => 0,
        };

        let webrtc_ips = get("WEBRTC_IPS")
            .map(|ips| {
                ips.split(',')
                    .map(str::trim)
                    .filter(|ip| !ip.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let packet_loss = match get("PACKET_LOSS") {
            Some(loss) if !loss.is_empty() => {
                let loss: f32 = loss.parse().context("PACKET_LOSS must be a float")?;
                if !(0.0..=1.0).contains(&loss) {
                    bail!("PACKET_LOSS must be within [0, 1], got {loss}");
                }
                loss
            }
            _ => 0.0,
        };

        let video_capture_cmd = split_command(
            &get("VIDEO_CAPTURE_CMD").unwrap_or_else(|| default_video_cmd().to_string()),
        );
        let audio_capture_cmd = split_command(
            &get("AUDIO_CAPTURE_CMD").unwrap_or_else(|| default_audio_cmd().to_string()),
        );

        let video_transport = match get("VIDEO_CAPTURE_TRANSPORT").as_deref() {
            None | Some("") | Some("fifo") => VideoTransport::H264Fifo,
            Some("udp") => VideoTransport::RtpUdp,
            Some(other) => bail!("VIDEO_CAPTURE_TRANSPORT must be fifo or udp, got {other:?}"),
        };
        let audio_format = match get("AUDIO_CAPTURE_FORMAT").as_deref() {
            None | Some("") | Some("ogg") => AudioFormat::Ogg,
            Some("pcmu") => AudioFormat::Pcmu,
            Some("udp") => AudioFormat::RtpUdp,
            Some(other) => bail!("AUDIO_CAPTURE_FORMAT must be ogg, pcmu, or udp, got {other:?}"),
        };

        Ok(Self {
            mqtt_host,
            desktop_id,
            desktop_psk: get("DESKTOP_PSK").unwrap_or_default(),
            ice_servers,
            webrtc_port,
            webrtc_ips,
            packet_loss,
            video_capture_cmd,
            video_transport,
            audio_capture_cmd,
            audio_format,
        })
    }
}

/// Whitespace-split; capture pipelines with arguments that need quoting
/// should use a wrapper script.
fn split_command(cmd: &str) -> Vec<String> {
    cmd.split_whitespace().map(str::to_string).collect()
}

fn default_video_cmd() -> &'static str {
    "wf-recorder -c libx264 -D -r 60 -m h264 -f {path} -x yuv420p \
     -p preset=ultrafast -p tune=zerolatency -p profile=baseline \
     -p gop_size=30 -p open_gop=0 -p slices=1 -p slice-max-size=1200"
}

fn default_audio_cmd() -> &'static str {
    "gst-launch-1.0 pulsesrc ! audioconvert ! audioresample ! \
     audio/x-raw,rate=48000,channels=2,format=S16LE ! \
     opusenc frame-size=2 max-payload-size=1200 bitrate=48000 ! \
     oggmux max-page-delay=1 ! filesink buffer-mode=unbuffered location={path}"
}
