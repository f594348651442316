//! The runtime seams of the desktop: sources, input devices, and
//! signalers are trait objects so a test harness can substitute an
//! in-memory signaler or a silent source without touching the core.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use padcast_protocol::{GamepadInput, GamepadRumble, KeyboardInput};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecParameters;

use crate::desktop::Desktop;

/// Opaque viewer-chosen session identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Shared rumble sink handed to every gamepad at open time.
pub type RumbleHandler = Arc<dyn Fn(GamepadRumble) + Send + Sync>;

#[async_trait]
pub trait VideoSource: Send + Sync {
    fn name(&self) -> &str;
    fn video_codec(&self) -> RTCRtpCodecParameters;
    /// Stream RTP packets into the channel until the token fires or the
    /// source ends. The producer must never block on a full channel.
    async fn stream_video(
        &self,
        token: CancellationToken,
        packets: mpsc::Sender<rtp::packet::Packet>,
    ) -> anyhow::Result<()>;
}

#[async_trait]
pub trait AudioSource: Send + Sync {
    fn name(&self) -> &str;
    fn audio_codec(&self) -> RTCRtpCodecParameters;
    async fn stream_audio(
        &self,
        token: CancellationToken,
        packets: mpsc::Sender<rtp::packet::Packet>,
    ) -> anyhow::Result<()>;
}

pub trait Gamepad: Send + Sync {
    fn name(&self) -> &str;
    fn open(&self) -> anyhow::Result<()>;
    fn set_input_state(&self, input: &GamepadInput) -> anyhow::Result<()>;
    fn set_rumble_handler(&self, handler: RumbleHandler);
    fn close(&self);
}

pub trait Keyboard: Send + Sync {
    fn name(&self) -> &str;
    fn open(&self) -> anyhow::Result<()>;
    fn set_key(&self, input: &KeyboardInput) -> anyhow::Result<()>;
    fn close(&self);
}

pub trait Mouse: Send + Sync {
    fn name(&self) -> &str;
    fn open(&self) -> anyhow::Result<()>;
    fn set_button_left(&self, down: bool) -> anyhow::Result<()>;
    fn set_button_right(&self, down: bool) -> anyhow::Result<()>;
    fn set_button_middle(&self, down: bool) -> anyhow::Result<()>;
    /// Relative motion in pixels.
    fn move_mouse(&self, dx: f64, dy: f64) -> anyhow::Result<()>;
    /// Wheel motion in lines scrolled.
    fn move_wheel(&self, dx: f64, dy: f64) -> anyhow::Result<()>;
    fn close(&self);
}

#[async_trait]
pub trait Signaler: Send + Sync {
    fn name(&self) -> &str;
    /// Serve signaling until the token fires. Transport errors must be
    /// retried internally; returning an error means the signaler cannot
    /// run at all.
    async fn run(&self, token: CancellationToken, desktop: Arc<Desktop>) -> anyhow::Result<()>;
}
