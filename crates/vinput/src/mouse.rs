//! Virtual relative mouse. The kernel materializes both an `eventN` and a
//! `mouseN` node for it; each gets its own database records.
//!
//! Button state is latched: the wire protocol carries absolute state with
//! every motion update, so a held button arrives as an endless run of
//! `true`. Only transitions may reach the kernel.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::error::VinputError;
use crate::keyboard::node_id;
use crate::netlink::{Uevent, UeventAction};
use crate::udev::{syspath_matches, DeviceClass, DeviceRecord, Udev};
use crate::uinput::{
    UinputHandle, BTN_MOUSE_LEFT, BTN_MOUSE_MIDDLE, BTN_MOUSE_RIGHT, UINPUT_PATH,
};

/// Deduplicates absolute button state into press/release transitions.
#[derive(Debug, Default)]
pub struct ButtonLatch {
    down: bool,
}

impl ButtonLatch {
    /// Returns the new state when it changed, `None` when the update is
    /// redundant and must not produce a kernel event.
    pub fn transition(&mut self, want: bool) -> Option<bool> {
        if self.down == want {
            None
        } else {
            self.down = want;
            Some(want)
        }
    }
}

#[derive(Default)]
struct MouseState {
    raw: Option<UinputHandle>,
    syspath: String,
    event_device: Option<DeviceRecord>,
    mouse_device: Option<DeviceRecord>,
    left: ButtonLatch,
    right: ButtonLatch,
    middle: ButtonLatch,
}

pub struct VirtualMouse {
    udev: Arc<Udev>,
    state: Arc<Mutex<MouseState>>,
}

impl VirtualMouse {
    pub fn new(udev: Arc<Udev>) -> Self {
        Self {
            udev,
            state: Arc::new(Mutex::new(MouseState::default())),
        }
    }

    pub fn name(&self) -> &'static str {
        "uinput-mouse"
    }

    pub fn open(&self) -> Result<(), VinputError> {
        let mut events = self.udev.subscribe();

        let raw = UinputHandle::create_mouse(UINPUT_PATH, "padcast mouse")?;
        let syspath = raw.fetch_syspath()?;
        debug!(syspath = %syspath, "virtual mouse created");

        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.raw = Some(raw);
            state.syspath = syspath;
        }

        let state = Arc::clone(&self.state);
        let udev = Arc::clone(&self.udev);
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if event.action != UeventAction::Add {
                    continue;
                }
                let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
                if !syspath_matches(&state.syspath, &event.kobj) {
                    continue;
                }
                handle_add(&mut state, &udev, &event);
            }
        });

        Ok(())
    }

    pub fn set_button_left(&self, down: bool) -> Result<(), VinputError> {
        self.button(BTN_MOUSE_LEFT, down, |s| &mut s.left)
    }

    pub fn set_button_right(&self, down: bool) -> Result<(), VinputError> {
        self.button(BTN_MOUSE_RIGHT, down, |s| &mut s.right)
    }

    pub fn set_button_middle(&self, down: bool) -> Result<(), VinputError> {
        self.button(BTN_MOUSE_MIDDLE, down, |s| &mut s.middle)
    }

    fn button(
        &self,
        code: u16,
        down: bool,
        latch: impl FnOnce(&mut MouseState) -> &mut ButtonLatch,
    ) -> Result<(), VinputError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let Some(transition) = latch(&mut state).transition(down) else {
            return Ok(());
        };
        match state.raw.as_mut() {
            Some(raw) => raw.key_event(code, transition),
            None => Ok(()),
        }
    }

    /// Relative motion in pixels.
    pub fn move_mouse(&self, dx: f64, dy: f64) -> Result<(), VinputError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match state.raw.as_mut() {
            Some(raw) => raw.move_rel(dx as i32, dy as i32),
            None => Ok(()),
        }
    }

    /// Wheel motion in lines scrolled.
    pub fn move_wheel(&self, dx: f64, dy: f64) -> Result<(), VinputError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let Some(raw) = state.raw.as_mut() else {
            return Ok(());
        };
        raw.wheel(true, dx as i32)?;
        raw.wheel(false, dy as i32)
    }

    pub fn close(&self) {
        debug!("closing virtual mouse");
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(device) = state.event_device.take() {
            device.close(&self.udev);
        }
        if let Some(device) = state.mouse_device.take() {
            device.close(&self.udev);
        }
        state.raw = None;
    }
}

fn handle_add(state: &mut MouseState, udev: &Udev, event: &Uevent) {
    let Some(last) = event.kobj.rsplit('/').next() else {
        return;
    };
    let (kernel_id, slot) = if let Some(id) = node_id(last, "mouse") {
        (id, &mut state.mouse_device)
    } else if let Some(id) = node_id(last, "event") {
        (id, &mut state.event_device)
    } else {
        debug!(node = last, "ignoring unrelated child node");
        return;
    };

    let mut device = DeviceRecord::new(
        kernel_id,
        kernel_id,
        DeviceClass::Mouse,
        PathBuf::from(format!("/dev/input/{last}")),
        event,
    );
    device.initialize(udev);
    if slot.replace(device).is_some() {
        warn!(kobj = %event.kobj, "mouse child node announced twice");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latch_suppresses_redundant_press() {
        let mut latch = ButtonLatch::default();
        assert_eq!(latch.transition(true), Some(true));
        assert_eq!(latch.transition(true), None);
        assert_eq!(latch.transition(true), None);
        assert_eq!(latch.transition(false), Some(false));
    }

    #[test]
    fn latch_suppresses_redundant_release() {
        let mut latch = ButtonLatch::default();
        assert_eq!(latch.transition(false), None);
        assert_eq!(latch.transition(true), Some(true));
        assert_eq!(latch.transition(false), Some(false));
        assert_eq!(latch.transition(false), None);
    }

    #[test]
    fn latch_full_click_cycle() {
        let mut latch = ButtonLatch::default();
        let events: Vec<_> = [true, true, false, true, false, false]
            .into_iter()
            .filter_map(|want| latch.transition(want))
            .collect();
        assert_eq!(events, vec![true, false, true, false]);
    }
}
