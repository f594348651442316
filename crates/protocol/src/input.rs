//! The compact binary input protocol carried over the viewer data channel.
//!
//! Every message starts with a one-byte type tag; all multi-byte integers
//! and floats are little-endian:
//! ```text
//! Keyboard (4 B):   0x01 | bits{state,shift,alt,ctrl,meta,caps,0,0} | u16 keycode
//! Mouse    (18 B):  0x02 | bits{L,R,M,0,0,0,0,0} | f32 dx | f32 dy | f32 wx | f32 wy
//! Gamepad  (28 B):  0x04 | u8 pad_id |
//!                   bits{N,S,W,E,L1,R1,LZ,RZ} | bits{Sel,Start,U,D,L,R,Home,0} |
//!                   f32×6 (LX,LY,RX,RY,LT,RT)
//! Rumble   (10 B):  0x05 | u8 pad_id | f32 left | f32 right
//! ```
//! Decoding fails when the leading tag mismatches or the payload length is
//! not the fixed per-type size. Encoding is infallible. The codec carries
//! no clock and no session state.

use crate::bits::{pack_bits, unpack_bits};

/// Message type tags. Touchscreen is reserved on the wire but carries no
/// payload definition yet; decoding it yields [`ProtocolError::Unsupported`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InputKind {
    Keyboard = 0x01,
    Mouse = 0x02,
    Touchscreen = 0x03,
    Gamepad = 0x04,
    GamepadRumble = 0x05,
}

impl InputKind {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x01 => Some(Self::Keyboard),
            0x02 => Some(Self::Mouse),
            0x03 => Some(Self::Touchscreen),
            0x04 => Some(Self::Gamepad),
            0x05 => Some(Self::GamepadRumble),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("empty input message")]
    Empty,
    #[error("message tag 0x{found:02x} is not a {expected:?} message")]
    WrongTag { expected: InputKind, found: u8 },
    #[error("unknown input type 0x{0:02x}")]
    UnknownTag(u8),
    #[error("invalid {kind:?} length: got {got} bytes, want {want}")]
    BadLength {
        kind: InputKind,
        got: usize,
        want: usize,
    },
    #[error("input type {0:?} is not supported")]
    Unsupported(InputKind),
}

/// Keyboard key transition with the modifier plane sampled at the same
/// instant. Bit order in the state byte is pinned by tests: state is bit 0,
/// then shift, alt, ctrl, meta, caps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyboardInput {
    /// true = key down, false = key up
    pub state: bool,
    pub shift: bool,
    pub alt: bool,
    pub ctrl: bool,
    pub meta: bool,
    pub caps: bool,
    /// Linux evdev keycode
    pub keycode: u16,
}

pub const KEYBOARD_WIRE_LEN: usize = 4;

impl KeyboardInput {
    pub fn to_bytes(&self) -> [u8; KEYBOARD_WIRE_LEN] {
        let mut out = [0u8; KEYBOARD_WIRE_LEN];
        out[0] = InputKind::Keyboard as u8;
        out[1] = pack_bits(
            self.state, self.shift, self.alt, self.ctrl, self.meta, self.caps, false, false,
        );
        out[2..4].copy_from_slice(&self.keycode.to_le_bytes());
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        check_frame(InputKind::Keyboard, KEYBOARD_WIRE_LEN, data)?;
        let [state, shift, alt, ctrl, meta, caps, _, _] = unpack_bits(data[1]);
        Ok(Self {
            state,
            shift,
            alt,
            ctrl,
            meta,
            caps,
            keycode: u16::from_le_bytes([data[2], data[3]]),
        })
    }
}

/// Absolute mouse button state plus relative motion deltas. The wire
/// carries state, not transitions, so the receiving side must deduplicate
/// repeated press/release.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MouseInput {
    pub button_left: bool,
    pub button_right: bool,
    pub button_middle: bool,
    /// Pointer delta in pixels.
    pub mouse_x: f32,
    pub mouse_y: f32,
    /// Wheel delta in lines scrolled.
    pub wheel_x: f32,
    pub wheel_y: f32,
}

pub const MOUSE_WIRE_LEN: usize = 18;

impl MouseInput {
    pub fn to_bytes(&self) -> [u8; MOUSE_WIRE_LEN] {
        let mut out = [0u8; MOUSE_WIRE_LEN];
        out[0] = InputKind::Mouse as u8;
        out[1] = pack_bits(
            self.button_left,
            self.button_right,
            self.button_middle,
            false,
            false,
            false,
            false,
            false,
        );
        out[2..6].copy_from_slice(&self.mouse_x.to_le_bytes());
        out[6..10].copy_from_slice(&self.mouse_y.to_le_bytes());
        out[10..14].copy_from_slice(&self.wheel_x.to_le_bytes());
        out[14..18].copy_from_slice(&self.wheel_y.to_le_bytes());
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        check_frame(InputKind::Mouse, MOUSE_WIRE_LEN, data)?;
        let [left, right, middle, ..] = unpack_bits(data[1]);
        Ok(Self {
            button_left: left,
            button_right: right,
            button_middle: middle,
            mouse_x: f32_at(data, 2),
            mouse_y: f32_at(data, 6),
            wheel_x: f32_at(data, 10),
            wheel_y: f32_at(data, 14),
        })
    }
}

/// Full gamepad state snapshot.
///
/// `l2`, `r2` and `capture` exist on physical pads but have no wire slots;
/// they decode as false and are dropped on encode. Sticks range [-1, 1],
/// triggers [0, 1].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GamepadInput {
    pub pad_id: u8,

    /// Top face button. Xbox: Y, PlayStation: triangle.
    pub north: bool,
    /// Bottom face button. Xbox: A, PlayStation: cross.
    pub south: bool,
    /// Left face button. Xbox: X, PlayStation: square.
    pub west: bool,
    /// Right face button. Xbox: B, PlayStation: circle.
    pub east: bool,

    /// Bumpers.
    pub l1: bool,
    pub r1: bool,
    /// Triggers as buttons (no wire slot; derived from the analog axes).
    pub l2: bool,
    pub r2: bool,
    /// Thumbstick clicks.
    pub lz: bool,
    pub rz: bool,

    pub select: bool,
    pub start: bool,

    pub dpad_up: bool,
    pub dpad_down: bool,
    pub dpad_left: bool,
    pub dpad_right: bool,

    /// Xbox button / PS button / Switch home.
    pub home: bool,
    /// Switch screenshot button (no wire slot).
    pub capture: bool,

    pub axis_left_x: f32,
    pub axis_left_y: f32,
    pub axis_right_x: f32,
    pub axis_right_y: f32,
    pub axis_left_trigger: f32,
    pub axis_right_trigger: f32,
}

pub const GAMEPAD_WIRE_LEN: usize = 28;

impl GamepadInput {
    pub fn to_bytes(&self) -> [u8; GAMEPAD_WIRE_LEN] {
        let mut out = [0u8; GAMEPAD_WIRE_LEN];
        out[0] = InputKind::Gamepad as u8;
        out[1] = self.pad_id;
        out[2] = pack_bits(
            self.north, self.south, self.west, self.east, self.l1, self.r1, self.lz, self.rz,
        );
        out[3] = pack_bits(
            self.select,
            self.start,
            self.dpad_up,
            self.dpad_down,
            self.dpad_left,
            self.dpad_right,
            self.home,
            false,
        );
        out[4..8].copy_from_slice(&self.axis_left_x.to_le_bytes());
        out[8..12].copy_from_slice(&self.axis_left_y.to_le_bytes());
        out[12..16].copy_from_slice(&self.axis_right_x.to_le_bytes());
        out[16..20].copy_from_slice(&self.axis_right_y.to_le_bytes());
        out[20..24].copy_from_slice(&self.axis_left_trigger.to_le_bytes());
        out[24..28].copy_from_slice(&self.axis_right_trigger.to_le_bytes());
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        check_frame(InputKind::Gamepad, GAMEPAD_WIRE_LEN, data)?;
        let [north, south, west, east, l1, r1, lz, rz] = unpack_bits(data[2]);
        let [select, start, dpad_up, dpad_down, dpad_left, dpad_right, home, _] =
            unpack_bits(data[3]);
        Ok(Self {
            pad_id: data[1],
            north,
            south,
            west,
            east,
            l1,
            r1,
            l2: false,
            r2: false,
            lz,
            rz,
            select,
            start,
            dpad_up,
            dpad_down,
            dpad_left,
            dpad_right,
            home,
            capture: false,
            axis_left_x: f32_at(data, 4),
            axis_left_y: f32_at(data, 8),
            axis_right_x: f32_at(data, 12),
            axis_right_y: f32_at(data, 16),
            axis_left_trigger: f32_at(data, 20),
            axis_right_trigger: f32_at(data, 24),
        })
    }
}

/// Rumble intensity for one pad, both motors in [0, 1].
///
/// Note: some legacy peers framed this message as 9 bytes and validated the
/// body against the 26-byte gamepad size, so they could neither emit nor
/// accept a well-formed rumble. We use the full 10-byte frame (8-byte body)
/// in both directions.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GamepadRumble {
    pub pad_id: u8,
    pub left: f32,
    pub right: f32,
}

pub const RUMBLE_WIRE_LEN: usize = 10;

impl GamepadRumble {
    pub fn to_bytes(&self) -> [u8; RUMBLE_WIRE_LEN] {
        let mut out = [0u8; RUMBLE_WIRE_LEN];
        out[0] = InputKind::GamepadRumble as u8;
        out[1] = self.pad_id;
        out[2..6].copy_from_slice(&self.left.to_le_bytes());
        out[6..10].copy_from_slice(&self.right.to_le_bytes());
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        check_frame(InputKind::GamepadRumble, RUMBLE_WIRE_LEN, data)?;
        Ok(Self {
            pad_id: data[1],
            left: f32_at(data, 2),
            right: f32_at(data, 6),
        })
    }
}

fn check_frame(kind: InputKind, want: usize, data: &[u8]) -> Result<(), ProtocolError> {
    let Some(&tag) = data.first() else {
        return Err(ProtocolError::Empty);
    };
    if tag != kind as u8 {
        return Err(ProtocolError::WrongTag {
            expected: kind,
            found: tag,
        });
    }
    if data.len() != want {
        return Err(ProtocolError::BadLength {
            kind,
            got: data.len(),
            want,
        });
    }
    Ok(())
}

fn f32_at(data: &[u8], offset: usize) -> f32 {
    f32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}
