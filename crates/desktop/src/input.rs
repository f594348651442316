//! uinput-backed implementations of the desktop device traits.

use std::sync::Arc;

use padcast_protocol::{GamepadInput, KeyboardInput};
use padcast_vinput::{Udev, VirtualGamepad, VirtualKeyboard, VirtualMouse};

use crate::api::{Gamepad, Keyboard, Mouse, RumbleHandler};

pub struct UinputGamepad {
    inner: VirtualGamepad,
}

impl UinputGamepad {
    pub fn new(udev: Arc<Udev>, pad_id: u8, vendor: u16, product: u16) -> Self {
        Self {
            inner: VirtualGamepad::new(udev, pad_id, vendor, product),
        }
    }
}

impl Gamepad for UinputGamepad {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn open(&self) -> anyhow::Result<()> {
        Ok(self.inner.open()?)
    }

    fn set_input_state(&self, input: &GamepadInput) -> anyhow::Result<()> {
        Ok(self.inner.set_input_state(input)?)
    }

    fn set_rumble_handler(&self, handler: RumbleHandler) {
        self.inner
            .set_rumble_handler(Box::new(move |rumble| handler(rumble)));
    }

    fn close(&self) {
        self.inner.close();
    }
}

pub struct UinputKeyboard {
    inner: VirtualKeyboard,
}

impl UinputKeyboard {
    pub fn new(udev: Arc<Udev>) -> Self {
        Self {
            inner: VirtualKeyboard::new(udev),
        }
    }
}

impl Keyboard for UinputKeyboard {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn open(&self) -> anyhow::Result<()> {
        Ok(self.inner.open()?)
    }

    fn set_key(&self, input: &KeyboardInput) -> anyhow::Result<()> {
        // Modifier keys arrive as their own keycodes; only the transition
        // matters here.
        Ok(self.inner.key_event(input.state, input.keycode)?)
    }

    fn close(&self) {
        self.inner.close();
    }
}

pub struct UinputMouse {
    inner: VirtualMouse,
}

impl UinputMouse {
    pub fn new(udev: Arc<Udev>) -> Self {
        Self {
            inner: VirtualMouse::new(udev),
        }
    }
}

impl Mouse for UinputMouse {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn open(&self) -> anyhow::Result<()> {
        Ok(self.inner.open()?)
    }

    fn set_button_left(&self, down: bool) -> anyhow::Result<()> {
        Ok(self.inner.set_button_left(down)?)
    }

    fn set_button_right(&self, down: bool) -> anyhow::Result<()> {
        Ok(self.inner.set_button_right(down)?)
    }

    fn set_button_middle(&self, down: bool) -> anyhow::Result<()> {
        Ok(self.inner.set_button_middle(down)?)
    }

    fn move_mouse(&self, dx: f64, dy: f64) -> anyhow::Result<()> {
        Ok(self.inner.move_mouse(dx, dy)?)
    }

    fn move_wheel(&self, dx: f64, dy: f64) -> anyhow::Result<()> {
        Ok(self.inner.move_wheel(dx, dy)?)
    }

    fn close(&self) {
        self.inner.close();
    }
}
