//! Virtual gamepad. The kernel materializes an `eventN` node and a `jsN`
//! node; the joystick id is remapped to the caller's pad index so
//! containerized games always see `js0`..`js3` regardless of what the
//! kernel picked.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use padcast_protocol::{GamepadInput, GamepadRumble};
use tracing::{debug, info, warn};

use crate::error::VinputError;
use crate::keyboard::node_id;
use crate::netlink::{Uevent, UeventAction};
use crate::udev::{syspath_matches, DeviceClass, DeviceRecord, Udev};
use crate::uinput::{
    denormalize, UinputHandle, ABS_RX, ABS_RY, ABS_RZ, ABS_X, ABS_Y, ABS_Z, BTN_BUMPER_LEFT,
    BTN_BUMPER_RIGHT, BTN_DPAD_DOWN, BTN_DPAD_LEFT, BTN_DPAD_RIGHT, BTN_DPAD_UP, BTN_EAST,
    BTN_MODE, BTN_NORTH, BTN_SELECT, BTN_SOUTH, BTN_START, BTN_THUMB_LEFT, BTN_THUMB_RIGHT,
    BTN_TRIGGER_LEFT, BTN_TRIGGER_RIGHT, BTN_WEST, UINPUT_PATH,
};

pub type RumbleHandler = Box<dyn Fn(GamepadRumble) + Send + Sync>;

#[derive(Default)]
struct PadState {
    raw: Option<UinputHandle>,
    syspath: String,
    event_device: Option<DeviceRecord>,
    joystick_device: Option<DeviceRecord>,
}

pub struct VirtualGamepad {
    pad_id: u8,
    vendor: u16,
    product: u16,
    udev: Arc<Udev>,
    state: Arc<Mutex<PadState>>,
}

impl VirtualGamepad {
    pub fn new(udev: Arc<Udev>, pad_id: u8, vendor: u16, product: u16) -> Self {
        Self {
            pad_id,
            vendor,
            product,
            udev,
            state: Arc::new(Mutex::new(PadState::default())),
        }
    }

    pub fn name(&self) -> &'static str {
        "uinput-gamepad"
    }

    pub fn pad_id(&self) -> u8 {
        self.pad_id
    }

    /// Forward kernel force-feedback requests to the viewer.
    ///
    /// TODO: service UI_BEGIN_FF_UPLOAD/UI_END_FF_UPLOAD on the uinput fd
    /// and call the handler with the uploaded effect magnitudes.
    pub fn set_rumble_handler(&self, _handler: RumbleHandler) {}

    pub fn open(&self) -> Result<(), VinputError> {
        let mut events = self.udev.subscribe();

        let name = format!("padcast gamepad {}", self.pad_id);
        let raw = UinputHandle::create_gamepad(UINPUT_PATH, &name, self.vendor, self.product)?;
        let syspath = raw.fetch_syspath()?;
        info!(pad = self.pad_id, syspath = %syspath, "virtual gamepad created");

        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.raw = Some(raw);
            state.syspath = syspath;
        }

        let state = Arc::clone(&self.state);
        let udev = Arc::clone(&self.udev);
        let pad_id = self.pad_id;
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if event.action != UeventAction::Add {
                    continue;
                }
                let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
                if !syspath_matches(&state.syspath, &event.kobj) {
                    continue;
                }
                handle_add(&mut state, &udev, pad_id, &event);
            }
        });

        Ok(())
    }

    /// Apply a full state snapshot: every button plus all six axes, each
    /// batch closed with a sync report by the raw device.
    pub fn set_input_state(&self, input: &GamepadInput) -> Result<(), VinputError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let Some(raw) = state.raw.as_mut() else {
            return Ok(());
        };

        let buttons = [
            (BTN_NORTH, input.north),
            (BTN_SOUTH, input.south),
            (BTN_WEST, input.west),
            (BTN_EAST, input.east),
            (BTN_BUMPER_LEFT, input.l1),
            (BTN_BUMPER_RIGHT, input.r1),
            (BTN_THUMB_LEFT, input.lz),
            (BTN_THUMB_RIGHT, input.rz),
            (BTN_SELECT, input.select),
            (BTN_START, input.start),
            (BTN_DPAD_UP, input.dpad_up),
            (BTN_DPAD_DOWN, input.dpad_down),
            (BTN_DPAD_LEFT, input.dpad_left),
            (BTN_DPAD_RIGHT, input.dpad_right),
            (BTN_MODE, input.home),
            // The analog triggers double as digital buttons past half travel.
            (BTN_TRIGGER_LEFT, input.axis_left_trigger > 0.5),
            (BTN_TRIGGER_RIGHT, input.axis_right_trigger > 0.5),
        ];
        for (code, pressed) in buttons {
            raw.key_event(code, pressed)?;
        }

        raw.abs_events(&[
            (ABS_X, denormalize(input.axis_left_x)),
            (ABS_Y, denormalize(input.axis_left_y)),
        ])?;
        raw.abs_events(&[
            (ABS_RX, denormalize(input.axis_right_x)),
            (ABS_RY, denormalize(input.axis_right_y)),
        ])?;
        raw.abs_events(&[(ABS_Z, denormalize(input.axis_left_trigger))])?;
        raw.abs_events(&[(ABS_RZ, denormalize(input.axis_right_trigger))])?;
        Ok(())
    }

    pub fn close(&self) {
        debug!(pad = self.pad_id, "closing virtual gamepad");
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(device) = state.event_device.take() {
            device.close(&self.udev);
        }
        if let Some(device) = state.joystick_device.take() {
            device.close(&self.udev);
        }
        state.raw = None;
    }
}

fn handle_add(state: &mut PadState, udev: &Udev, pad_id: u8, event: &Uevent) {
    let Some(last) = event.kobj.rsplit('/').next() else {
        return;
    };

    if let Some(kernel_id) = node_id(last, "js") {
        // The exposed joystick id is ours, not the kernel's.
        let mut device = DeviceRecord::new(
            kernel_id,
            pad_id as u32,
            DeviceClass::Gamepad,
            PathBuf::from(format!("/dev/input/js{pad_id}")),
            event,
        );
        info!(pad = pad_id, kernel_js = kernel_id, "creating joystick node");
        device.initialize(udev);
        if state.joystick_device.replace(device).is_some() {
            warn!(kobj = %event.kobj, "joystick node announced twice");
        }
    } else if let Some(kernel_id) = node_id(last, "event") {
        let mut device = DeviceRecord::new(
            kernel_id,
            kernel_id,
            DeviceClass::Gamepad,
            PathBuf::from(format!("/dev/input/event{kernel_id}")),
            event,
        );
        info!(pad = pad_id, event_node = kernel_id, "creating event node");
        device.initialize(udev);
        if state.event_device.replace(device).is_some() {
            warn!(kobj = %event.kobj, "event node announced twice");
        }
    } else {
        debug!(node = last, "matching child node without a known family");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn add_event(kobj: &str, major: &str, minor: &str) -> Uevent {
        let mut env = BTreeMap::new();
        env.insert("MAJOR".into(), major.into());
        env.insert("MINOR".into(), minor.into());
        Uevent {
            action: UeventAction::Add,
            kobj: kobj.into(),
            env,
        }
    }

    #[test]
    fn joystick_id_is_remapped_to_pad_index() {
        // Exercise the id/devpath decisions without touching the kernel:
        // the record construction is what assigns paths and ids.
        let event = add_event("/devices/virtual/input/input9/js7", "13", "7");
        let device = DeviceRecord::new(
            7,
            2,
            DeviceClass::Gamepad,
            PathBuf::from("/dev/input/js2"),
            &event,
        );
        assert_eq!(device.original_id, 7);
        assert_eq!(device.id, 2);
        assert_eq!(device.dev_path, PathBuf::from("/dev/input/js2"));
        assert_eq!(device.major, 13);
        assert_eq!(device.minor, 7);
    }

    #[test]
    fn event_node_keeps_kernel_id() {
        let event = add_event("/devices/virtual/input/input9/event12", "13", "76");
        let device = DeviceRecord::new(
            12,
            12,
            DeviceClass::Gamepad,
            PathBuf::from("/dev/input/event12"),
            &event,
        );
        assert_eq!(device.dev_path, PathBuf::from("/dev/input/event12"));
        assert_eq!(device.original_id, device.id);
    }
}
