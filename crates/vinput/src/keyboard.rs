//! Virtual keyboard: a uinput device plus its materialized `eventN` node.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::error::VinputError;
use crate::netlink::{Uevent, UeventAction};
use crate::udev::{syspath_matches, DeviceClass, DeviceRecord, Udev};
use crate::uinput::{UinputHandle, UINPUT_PATH};

/// Parse the final path component of a kernel object into its node family
/// and kernel-assigned id, e.g. `event4` → `("event", 4)`.
pub(crate) fn node_id(last: &str, prefix: &str) -> Option<u32> {
    last.strip_prefix(prefix)
        .filter(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|rest| rest.parse().ok())
}

#[derive(Default)]
struct KeyboardState {
    raw: Option<UinputHandle>,
    syspath: String,
    device: Option<DeviceRecord>,
}

pub struct VirtualKeyboard {
    udev: Arc<Udev>,
    state: Arc<Mutex<KeyboardState>>,
}

impl VirtualKeyboard {
    pub fn new(udev: Arc<Udev>) -> Self {
        Self {
            udev,
            state: Arc::new(Mutex::new(KeyboardState::default())),
        }
    }

    pub fn name(&self) -> &'static str {
        "uinput-keyboard"
    }

    /// Create the kernel device and start materializing its child node
    /// when the announcement arrives. The uevent subscription is taken
    /// before the device exists so the announcement cannot be missed.
    pub fn open(&self) -> Result<(), VinputError> {
        let mut events = self.udev.subscribe();

        let raw = UinputHandle::create_keyboard(UINPUT_PATH, "padcast keyboard")?;
        let syspath = raw.fetch_syspath()?;
        debug!(syspath = %syspath, "virtual keyboard created");

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

    pub fn key_event(&self, down: bool, code: u16) -> Result<(), VinputError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match state.raw.as_mut() {
            Some(raw) => raw.key_event(code, down),
            None => Ok(()),
        }
    }

    pub fn close(&self) {
        debug!("closing virtual keyboard");
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(device) = state.device.take() {
            device.close(&self.udev);
        }
        state.raw = None;
    }
}

fn handle_add(state: &mut KeyboardState, udev: &Udev, event: &Uevent) {
    let Some(last) = event.kobj.rsplit('/').next() else {
        return;
    };
    let Some(kernel_id) = node_id(last, "event") else {
        debug!(node = last, "ignoring non-event child node");
        return;
    };
    let mut device = DeviceRecord::new(
        kernel_id,
        kernel_id,
        DeviceClass::Keyboard,
        PathBuf::from(format!("/dev/input/{last}")),
        event,
    );
    device.initialize(udev);
    if state.device.replace(device).is_some() {
        warn!(kobj = %event.kobj, "keyboard event node announced twice");
    }
}
