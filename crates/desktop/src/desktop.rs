//! The root coordinator: owns the virtual devices, the mixer, the
//! signalers, and the peer-connection factory; funnels input from every
//! session's data channel into the devices and rumble back out to every
//! viewer.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use padcast_protocol::{
    GamepadInput, GamepadRumble, IceServerInfo, InputKind, KeyboardInput, MouseInput,
    ProtocolError,
};
use parking_lot::RwLock;
use rtcp::transport_feedbacks::transport_layer_nack::TransportLayerNack;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use webrtc::api::API;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

use crate::api::{
    AudioSource, Gamepad, Keyboard, Mouse, RumbleHandler, SessionId, Signaler, VideoSource,
};
use crate::mixer::Mixer;
use crate::nack::NackBuffer;
use crate::rtc::{build_api, rtc_configuration, RtcFactoryConfig};
use crate::session::Session;

/// Pre-negotiated on both ends: same id, same protocol string, no SCTP
/// negotiation round-trip.
pub const INPUT_CHANNEL_ID: u16 = 0;
pub const INPUT_PROTOCOL: &str = "pod-arcade-input-v1";

pub struct Desktop {
    signalers: Vec<Arc<dyn Signaler>>,
    gamepads: Vec<Arc<dyn Gamepad>>,
    keyboard: Option<Arc<dyn Keyboard>>,
    mouse: Option<Arc<dyn Mouse>>,
    mixer: Mixer,
    api: API,
    base_ice: Vec<IceServerInfo>,
    input_channels: RwLock<HashMap<SessionId, Arc<RTCDataChannel>>>,
}

#[derive(Default)]
pub struct DesktopBuilder {
    signalers: Vec<Arc<dyn Signaler>>,
    gamepads: Vec<Arc<dyn Gamepad>>,
    keyboard: Option<Arc<dyn Keyboard>>,
    mouse: Option<Arc<dyn Mouse>>,
    video_sources: Vec<Arc<dyn VideoSource>>,
    audio_sources: Vec<Arc<dyn AudioSource>>,
    packet_loss: f32,
}

impl DesktopBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn packet_loss(mut self, loss_rate: f32) -> Self {
        self.packet_loss = loss_rate;
        self
    }

    pub fn with_signaler(mut self, signaler: Arc<dyn Signaler>) -> Self {
        info!(signaler = signaler.name(), "adding signaler");
        self.signalers.push(signaler);
        self
    }

    pub fn with_gamepad(mut self, gamepad: Arc<dyn Gamepad>) -> Self {
        info!(gamepad = gamepad.name(), "adding gamepad");
        self.gamepads.push(gamepad);
        self
    }

    pub fn with_keyboard(mut self, keyboard: Arc<dyn Keyboard>) -> Self {
        info!(keyboard = keyboard.name(), "adding keyboard");
        self.keyboard = Some(keyboard);
        self
    }

    pub fn with_mouse(mut self, mouse: Arc<dyn Mouse>) -> Self {
        info!(mouse = mouse.name(), "adding mouse");
        self.mouse = Some(mouse);
        self
    }

    pub fn with_video_source(mut self, source: Arc<dyn VideoSource>) -> Self {
        info!(source = source.name(), "adding video source");
        self.video_sources.push(source);
        self
    }

    pub fn with_audio_source(mut self, source: Arc<dyn AudioSource>) -> Self {
        info!(source = source.name(), "adding audio source");
        self.audio_sources.push(source);
        self
    }

    pub async fn build(
        self,
        factory: &RtcFactoryConfig,
        base_ice: Vec<IceServerInfo>,
    ) -> anyhow::Result<Arc<Desktop>> {
        let mut mixer = Mixer::new(self.packet_loss);
        for source in self.video_sources {
            mixer.add_video_source(source);
        }
        for source in self.audio_sources {
            mixer.add_audio_source(source);
        }
        let api = build_api(&mixer, factory)
            .await
            .context("building WebRTC API")?;
        Ok(Arc::new(Desktop {
            signalers: self.signalers,
            gamepads: self.gamepads,
            keyboard: self.keyboard,
            mouse: self.mouse,
            mixer,
            api,
            base_ice,
            input_channels: RwLock::new(HashMap::new()),
        }))
    }
}

impl Desktop {
    /// Create a session's peer connection and bind it to the desktop:
    /// every mixer track added as a sender, the pre-negotiated input
    /// channel wired into the dispatcher.
    pub async fn create_session(
        self: &Arc<Self>,
        id: SessionId,
        extra_ice: &[IceServerInfo],
    ) -> anyhow::Result<Arc<Session>> {
        let config = rtc_configuration(&self.base_ice, extra_ice);
        let session = Session::new(id, &self.api, config).await?;
        self.bind_session(&session).await?;
        Ok(session)
    }

    async fn bind_session(self: &Arc<Self>, session: &Arc<Session>) -> anyhow::Result<()> {
        let peer_connection = session.peer_connection();

        for (track, nack) in self.mixer.video_outputs() {
            let sender = peer_connection
                .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .context("adding video track")?;
            spawn_rtcp_reader(sender, Some((nack, track)));
        }
        for track in self.mixer.audio_outputs() {
            let sender = peer_connection
                .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .context("adding audio track")?;
            spawn_rtcp_reader(sender, None);
        }

        let channel = peer_connection
            .create_data_channel(
                "input",
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    protocol: Some(INPUT_PROTOCOL.to_string()),
                    negotiated: Some(INPUT_CHANNEL_ID),
                    ..Default::default()
                }),
            )
            .await
            .context("creating input data channel")?;

        self.input_channels
            .write()
            .insert(session.id().clone(), Arc::clone(&channel));

        let desktop = Arc::clone(self);
        channel.on_message(Box::new(move |message| {
            let desktop = Arc::clone(&desktop);
            Box::pin(async move {
                desktop.handle_input(&message.data);
            })
        }));

        // The signaler owns session teardown; this guard only makes sure a
        // channel handle never outlives its peer.
        let desktop = Arc::clone(self);
        let session_id = session.id().clone();
        channel.on_close(Box::new(move || {
            desktop.remove_input_channel(&session_id);
            Box::pin(async {})
        }));

        Ok(())
    }

    pub fn remove_input_channel(&self, id: &SessionId) {
        if self.input_channels.write().remove(id).is_some() {
            debug!(session = %id, "input channel dropped");
        }
    }

    /// Single entry point for every input message a viewer sends.
    /// Malformed or unroutable messages warn and are dropped; nothing here
    /// may tear down a session.
    pub fn handle_input(&self, data: &[u8]) {
        let Some(&tag) = data.first() else {
            warn!("discarding empty input message");
            return;
        };
        match InputKind::from_tag(tag) {
            Some(InputKind::Keyboard) => match KeyboardInput::from_bytes(data) {
                Ok(input) => {
                    let Some(keyboard) = &self.keyboard else { return };
                    if let Err(e) = keyboard.set_key(&input) {
                        warn!("failed to set keyboard key: {e:#}");
                    }
                }
                Err(e) => warn!("failed to parse keyboard input: {e}"),
            },
            Some(InputKind::Mouse) => match MouseInput::from_bytes(data) {
                Ok(input) => self.apply_mouse(&input),
                Err(e) => warn!("failed to parse mouse input: {e}"),
            },
            Some(InputKind::Touchscreen) => {
                warn!("{}", ProtocolError::Unsupported(InputKind::Touchscreen));
            }
            Some(InputKind::Gamepad) => match GamepadInput::from_bytes(data) {
                Ok(input) => {
                    let Some(gamepad) = self.gamepads.get(input.pad_id as usize) else {
                        warn!(
                            pad = input.pad_id,
                            available = self.gamepads.len(),
                            "gamepad input for a pad we do not have"
                        );
                        return;
                    };
                    if let Err(e) = gamepad.set_input_state(&input) {
                        warn!(pad = input.pad_id, "failed to set gamepad state: {e:#}");
                    }
                }
                Err(e) => warn!("failed to parse gamepad input: {e}"),
            },
            Some(InputKind::GamepadRumble) => {
                // Rumble flows desktop → viewer only.
                warn!("ignoring inbound rumble message");
            }
            None => warn!(tag, "unknown input type"),
        }
    }

    fn apply_mouse(&self, input: &MouseInput) {
        let Some(mouse) = &self.mouse else { return };
        // Buttons are absolute state; the device latches transitions.
        for (result, what) in [
            (mouse.set_button_left(input.button_left), "left button"),
            (mouse.set_button_right(input.button_right), "right button"),
            (mouse.set_button_middle(input.button_middle), "middle button"),
            (
                mouse.move_mouse(input.mouse_x as f64, input.mouse_y as f64),
                "motion",
            ),
            (
                mouse.move_wheel(input.wheel_x as f64, input.wheel_y as f64),
                "wheel",
            ),
        ] {
            if let Err(e) = result {
                warn!("failed to apply mouse {what}: {e:#}");
            }
        }
    }

    /// Rumble fan-out: encode once, send to every live session channel.
    /// Channels are snapshotted under the read lock; the sends happen
    /// outside it because they can yield.
    pub async fn broadcast_rumble(&self, rumble: GamepadRumble) {
        let data = Bytes::copy_from_slice(&rumble.to_bytes());
        let channels: Vec<Arc<RTCDataChannel>> =
            self.input_channels.read().values().cloned().collect();
        for channel in channels {
            if let Err(e) = channel.send(&data).await {
                debug!("failed to send rumble to a session: {e}");
            }
        }
    }

    fn rumble_handler(self: &Arc<Self>) -> RumbleHandler {
        let weak = Arc::downgrade(self);
        let handle = tokio::runtime::Handle::current();
        Arc::new(move |rumble| {
            let Some(desktop) = weak.upgrade() else { return };
            handle.spawn(async move {
                desktop.broadcast_rumble(rumble).await;
            });
        })
    }

    /// Bring the desktop up and serve until the token fires. Device
    /// failures are fatal; signalers and the mixer run until cancellation
    /// and are joined before returning.
    pub async fn run(self: Arc<Self>, token: CancellationToken) -> anyhow::Result<()> {
        let rumble_handler = self.rumble_handler();
        for gamepad in &self.gamepads {
            debug!(gamepad = gamepad.name(), "opening gamepad");
            gamepad
                .open()
                .with_context(|| format!("opening gamepad {}", gamepad.name()))?;
            gamepad.set_rumble_handler(Arc::clone(&rumble_handler));
        }
        if let Some(keyboard) = &self.keyboard {
            debug!(keyboard = keyboard.name(), "opening keyboard");
            keyboard
                .open()
                .with_context(|| format!("opening keyboard {}", keyboard.name()))?;
        }
        if let Some(mouse) = &self.mouse {
            debug!(mouse = mouse.name(), "opening mouse");
            mouse
                .open()
                .with_context(|| format!("opening mouse {}", mouse.name()))?;
        }

        let mut signaler_tasks = Vec::new();
        for signaler in &self.signalers {
            info!(signaler = signaler.name(), "starting signaler");
            let signaler = Arc::clone(signaler);
            let desktop = Arc::clone(&self);
            let signaler_token = token.clone();
            signaler_tasks.push(tokio::spawn(async move {
                if let Err(e) = signaler.run(signaler_token, desktop).await {
                    error!(signaler = signaler.name(), "signaler failed: {e:#}");
                }
            }));
        }

        info!("desktop running");
        let stream_result = self.mixer.stream(token).await;

        // Signalers clean up their sessions on the way out; wait for them
        // regardless of how streaming ended.
        for task in signaler_tasks {
            let _ = task.await;
        }

        for gamepad in &self.gamepads {
            gamepad.close();
        }
        if let Some(keyboard) = &self.keyboard {
            keyboard.close();
        }
        if let Some(mouse) = &self.mouse {
            mouse.close();
        }
        info!("desktop stopped");
        stream_result
    }
}

/// Drain RTCP from a sender so the stack processes feedback internally.
/// Video senders additionally answer transport-layer NACKs from the
/// retransmission ring.
fn spawn_rtcp_reader(
    sender: Arc<RTCRtpSender>,
    nack_path: Option<(Arc<NackBuffer>, Arc<TrackLocalStaticRTP>)>,
) {
    tokio::spawn(async move {
        while let Ok((packets, _attributes)) = sender.read_rtcp().await {
            let Some((nack_buffer, track)) = &nack_path else {
                continue;
            };
            for packet in &packets {
                if let Some(nack) = packet.as_any().downcast_ref::<TransportLayerNack>() {
                    nack_buffer.retransmit(nack, track).await;
                }
            }
        }
        debug!("RTCP reader stopped");
    });
}

/// Peer states after which a session cannot come back.
pub(crate) fn is_terminal(state: RTCPeerConnectionState) -> bool {
    matches!(
        state,
        RTCPeerConnectionState::Disconnected
            | RTCPeerConnectionState::Failed
            | RTCPeerConnectionState::Closed
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        keys: Mutex<Vec<(bool, u16)>>,
        pads: Mutex<Vec<GamepadInput>>,
        mouse_buttons: Mutex<Vec<(char, bool)>>,
        motions: Mutex<Vec<(f64, f64)>>,
    }

    struct MockKeyboard(Arc<Recorder>);

    impl Keyboard for MockKeyboard {
        fn name(&self) -> &str {
            "mock-keyboard"
        }
        fn open(&self) -> anyhow::Result<()> {
            Ok(())
        }
        fn set_key(&self, input: &KeyboardInput) -> anyhow::Result<()> {
            self.0
                .keys
                .lock()
                .unwrap()
                .push((input.state, input.keycode));
            Ok(())
        }
        fn close(&self) {}
    }

    struct MockMouse(Arc<Recorder>);

    impl Mouse for MockMouse {
        fn name(&self) -> &str {
            "mock-mouse"
        }
        fn open(&self) -> anyhow::Result<()> {
            Ok(())
        }
        fn set_button_left(&self, down: bool) -> anyhow::Result<()> {
            self.0.mouse_buttons.lock().unwrap().push(('L', down));
            Ok(())
        }
        fn set_button_right(&self, down: bool) -> anyhow::Result<()> {
            self.0.mouse_buttons.lock().unwrap().push(('R', down));
            Ok(())
        }
        fn set_button_middle(&self, down: bool) -> anyhow::Result<()> {
            self.0.mouse_buttons.lock().unwrap().push(('M', down));
            Ok(())
        }
        fn move_mouse(&self, dx: f64, dy: f64) -> anyhow::Result<()> {
            self.0.motions.lock().unwrap().push((dx, dy));
            Ok(())
        }
        fn move_wheel(&self, _dx: f64, _dy: f64) -> anyhow::Result<()> {
            Ok(())
        }
        fn close(&self) {}
    }

    struct MockGamepad(Arc<Recorder>);

    impl Gamepad for MockGamepad {
        fn name(&self) -> &str {
            "mock-gamepad"
        }
        fn open(&self) -> anyhow::Result<()> {
            Ok(())
        }
        fn set_input_state(&self, input: &GamepadInput) -> anyhow::Result<()> {
            self.0.pads.lock().unwrap().push(*input);
            Ok(())
        }
        fn set_rumble_handler(&self, _handler: RumbleHandler) {}
        fn close(&self) {}
    }

    async fn desktop_with(recorder: &Arc<Recorder>, pads: usize) -> Arc<Desktop> {
        let mut builder = DesktopBuilder::new()
            .with_keyboard(Arc::new(MockKeyboard(Arc::clone(recorder))))
            .with_mouse(Arc::new(MockMouse(Arc::clone(recorder))));
        for _ in 0..pads {
            builder = builder.with_gamepad(Arc::new(MockGamepad(Arc::clone(recorder))));
        }
        builder
            .build(&RtcFactoryConfig::default(), Vec::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn keyboard_messages_reach_the_keyboard() {
        let recorder = Arc::new(Recorder::default());
        let desktop = desktop_with(&recorder, 0).await;

        let input = KeyboardInput {
            state: true,
            keycode: 30,
            ..Default::default()
        };
        desktop.handle_input(&input.to_bytes());
        assert_eq!(recorder.keys.lock().unwrap().as_slice(), &[(true, 30)]);
    }

    #[tokio::test]
    async fn mouse_messages_apply_buttons_and_motion() {
        let recorder = Arc::new(Recorder::default());
        let desktop = desktop_with(&recorder, 0).await;

        let input = MouseInput {
            button_left: true,
            mouse_x: 4.0,
            mouse_y: -2.0,
            ..Default::default()
        };
        desktop.handle_input(&input.to_bytes());
        let buttons = recorder.mouse_buttons.lock().unwrap();
        assert!(buttons.contains(&('L', true)));
        assert!(buttons.contains(&('R', false)));
        assert_eq!(recorder.motions.lock().unwrap().as_slice(), &[(4.0, -2.0)]);
    }

    #[tokio::test]
    async fn gamepad_routes_by_pad_id() {
        let recorder = Arc::new(Recorder::default());
        let desktop = desktop_with(&recorder, 4).await;

        let input = GamepadInput {
            pad_id: 2,
            south: true,
            ..Default::default()
        };
        desktop.handle_input(&input.to_bytes());
        let pads = recorder.pads.lock().unwrap();
        assert_eq!(pads.len(), 1);
        assert_eq!(pads[0].pad_id, 2);
        assert!(pads[0].south);
    }

    #[tokio::test]
    async fn out_of_range_pad_is_rejected() {
        let recorder = Arc::new(Recorder::default());
        let desktop = desktop_with(&recorder, 2).await;

        let input = GamepadInput {
            pad_id: 2,
            ..Default::default()
        };
        desktop.handle_input(&input.to_bytes());
        assert!(recorder.pads.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_and_unknown_messages_are_dropped() {
        let recorder = Arc::new(Recorder::default());
        let desktop = desktop_with(&recorder, 1).await;

        desktop.handle_input(&[]); // empty
        desktop.handle_input(&[0x01, 0x00]); // truncated keyboard
        desktop.handle_input(&[0x03, 0x00, 0x00]); // touchscreen, reserved
        desktop.handle_input(&[0xEE, 1, 2, 3]); // unknown tag
        assert!(recorder.keys.lock().unwrap().is_empty());
        assert!(recorder.pads.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn terminal_states_classified() {
        assert!(is_terminal(RTCPeerConnectionState::Failed));
        assert!(is_terminal(RTCPeerConnectionState::Closed));
        assert!(is_terminal(RTCPeerConnectionState::Disconnected));
        assert!(!is_terminal(RTCPeerConnectionState::Connected));
        assert!(!is_terminal(RTCPeerConnectionState::New));
    }
}
