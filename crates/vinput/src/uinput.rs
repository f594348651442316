//! Raw `/dev/uinput` device construction and event synthesis.
//!
//! The control file accepts a `uinput_user_dev` descriptor (name, USB-like
//! id triple, capability bits, per-axis bounds) followed by the
//! `UI_DEV_CREATE` ioctl; afterwards it accepts `input_event` records, each
//! batch terminated with a `SYN_REPORT`. Everything is little-endian and
//! mirrors `<linux/uinput.h>` / `<linux/input.h>`.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::time::Duration;

use crate::error::VinputError;

pub const UINPUT_PATH: &str = "/dev/uinput";
const UINPUT_MAX_NAME_SIZE: usize = 80;
const ABS_SIZE: usize = 64;

const UI_DEV_CREATE: u64 = 0x5501;
const UI_DEV_DESTROY: u64 = 0x5502;
// 64-byte name buffer plus NUL; other lengths are (len << 16) | 0x8000_552c
const UI_GET_SYSNAME: u64 = 0x8041_552c;
const UI_SET_EVBIT: u64 = 0x4004_5564;
const UI_SET_KEYBIT: u64 = 0x4004_5565;
const UI_SET_RELBIT: u64 = 0x4004_5566;
const UI_SET_ABSBIT: u64 = 0x4004_5567;

const BUS_USB: u16 = 0x03;

pub const EV_SYN: u16 = 0x00;
pub const EV_KEY: u16 = 0x01;
pub const EV_REL: u16 = 0x02;
pub const EV_ABS: u16 = 0x03;
pub const SYN_REPORT: u16 = 0;

pub const REL_X: u16 = 0x00;
pub const REL_Y: u16 = 0x01;
pub const REL_HWHEEL: u16 = 0x06;
pub const REL_WHEEL: u16 = 0x08;

pub const ABS_X: u16 = 0x00;
pub const ABS_Y: u16 = 0x01;
pub const ABS_Z: u16 = 0x02;
pub const ABS_RX: u16 = 0x03;
pub const ABS_RY: u16 = 0x04;
pub const ABS_RZ: u16 = 0x05;
pub const ABS_HAT0X: u16 = 0x10;
pub const ABS_HAT0Y: u16 = 0x11;

pub const BTN_MOUSE_LEFT: u16 = 0x110;
pub const BTN_MOUSE_RIGHT: u16 = 0x111;
pub const BTN_MOUSE_MIDDLE: u16 = 0x112;

pub const BTN_GAMEPAD: u16 = 0x130;
pub const BTN_SOUTH: u16 = 0x130;
pub const BTN_EAST: u16 = 0x131;
pub const BTN_NORTH: u16 = 0x133;
pub const BTN_WEST: u16 = 0x134;
pub const BTN_BUMPER_LEFT: u16 = 0x136;
pub const BTN_BUMPER_RIGHT: u16 = 0x137;
pub const BTN_TRIGGER_LEFT: u16 = 0x138;
pub const BTN_TRIGGER_RIGHT: u16 = 0x139;
pub const BTN_SELECT: u16 = 0x13a;
pub const BTN_START: u16 = 0x13b;
pub const BTN_MODE: u16 = 0x13c;
pub const BTN_THUMB_LEFT: u16 = 0x13d;
pub const BTN_THUMB_RIGHT: u16 = 0x13e;
pub const BTN_DPAD_UP: u16 = 0x220;
pub const BTN_DPAD_DOWN: u16 = 0x221;
pub const BTN_DPAD_LEFT: u16 = 0x222;
pub const BTN_DPAD_RIGHT: u16 = 0x223;

pub const MAX_AXIS_VALUE: i32 = 32767;

/// Scale a normalized stick/trigger value into the declared axis range.
pub fn denormalize(value: f32) -> i32 {
    (value * MAX_AXIS_VALUE as f32) as i32
}

/// One open kernel input device backed by `/dev/uinput`.
///
/// Control-file errors during creation are fatal to the device; event-write
/// errors are surfaced to the caller per batch. Dropping the handle
/// destroys the kernel device.
pub struct UinputHandle {
    file: File,
}

impl UinputHandle {
    /// Keyboard: every ordinary key code the kernel knows about.
    pub fn create_keyboard(path: &str, name: &str) -> Result<Self, VinputError> {
        let mut dev = Self::open_control(path, name)?;
        dev.set_ev_bit(EV_KEY)?;
        // 0 is KEY_RESERVED; 0x100 is where the button ranges begin.
        for code in 1u16..0x100 {
            dev.set_key_bit(code)?;
        }
        dev.register(name, 0x4711, 0x0815, &[])?;
        Ok(dev)
    }

    /// Relative mouse: three buttons, two motion axes and both wheels.
    pub fn create_mouse(path: &str, name: &str) -> Result<Self, VinputError> {
        let mut dev = Self::open_control(path, name)?;
        dev.set_ev_bit(EV_KEY)?;
        for code in [BTN_MOUSE_LEFT, BTN_MOUSE_RIGHT, BTN_MOUSE_MIDDLE] {
            dev.set_key_bit(code)?;
        }
        dev.set_ev_bit(EV_REL)?;
        for code in [REL_X, REL_Y, REL_WHEEL, REL_HWHEEL] {
            dev.ioctl(UI_SET_RELBIT, code as u64)?;
        }
        dev.register(name, 0x4711, 0x0816, &[])?;
        Ok(dev)
    }

    /// Gamepad: the full modern pad button set plus six absolute axes and
    /// the d-pad hat. Sticks are declared ±32767, triggers 0..=32767.
    pub fn create_gamepad(
        path: &str,
        name: &str,
        vendor: u16,
        product: u16,
    ) -> Result<Self, VinputError> {
        let mut dev = Self::open_control(path, name)?;

        dev.set_ev_bit(EV_KEY)?;
        for code in [
            BTN_GAMEPAD,
            BTN_SOUTH,
            BTN_EAST,
            BTN_NORTH,
            BTN_WEST,
            BTN_BUMPER_LEFT,
            BTN_BUMPER_RIGHT,
            BTN_TRIGGER_LEFT,
            BTN_TRIGGER_RIGHT,
            BTN_THUMB_LEFT,
            BTN_THUMB_RIGHT,
            BTN_SELECT,
            BTN_START,
            BTN_DPAD_UP,
            BTN_DPAD_DOWN,
            BTN_DPAD_LEFT,
            BTN_DPAD_RIGHT,
            BTN_MODE,
        ] {
            dev.set_key_bit(code)?;
        }

        dev.set_ev_bit(EV_ABS)?;
        let axes = [
            ABS_X, ABS_Y, ABS_Z, ABS_RX, ABS_RY, ABS_RZ, ABS_HAT0X, ABS_HAT0Y,
        ];
        let mut bounds = Vec::with_capacity(axes.len());
        for axis in axes {
            dev.ioctl(UI_SET_ABSBIT, axis as u64)?;
            // Triggers rest at zero; everything else is centered.
            let min = if axis == ABS_Z || axis == ABS_RZ {
                0
            } else {
                -MAX_AXIS_VALUE
            };
            bounds.push((axis, min, MAX_AXIS_VALUE));
        }

        dev.register(name, vendor, product, &bounds)?;
        Ok(dev)
    }

    fn open_control(path: &str, name: &str) -> Result<Self, VinputError> {
        if name.is_empty() {
            return Err(VinputError::EmptyDeviceName);
        }
        if name.len() >= UINPUT_MAX_NAME_SIZE {
            return Err(VinputError::DeviceNameTooLong(
                name.to_string(),
                UINPUT_MAX_NAME_SIZE - 1,
            ));
        }
        if !Path::new(path).exists() {
            return Err(VinputError::ControlFile {
                path: path.to_string(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        }
        let file = OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .map_err(|source| VinputError::ControlFile {
                path: path.to_string(),
                source,
            })?;
        Ok(Self { file })
    }

    /// Push the `uinput_user_dev` descriptor and issue `UI_DEV_CREATE`.
    fn register(
        &mut self,
        name: &str,
        vendor: u16,
        product: u16,
        abs_bounds: &[(u16, i32, i32)],
    ) -> Result<(), VinputError> {
        let descriptor = user_dev_bytes(name, vendor, product, abs_bounds);
        self.file
            .write_all(&descriptor)
            .map_err(VinputError::DeviceWrite)?;
        self.ioctl(UI_DEV_CREATE, 0)?;
        // Give the kernel a moment to materialize the child nodes before the
        // caller starts writing events.
        std::thread::sleep(Duration::from_millis(200));
        Ok(())
    }

    /// The sysfs directory of this device, e.g.
    /// `/sys/devices/virtual/input/input13`.
    pub fn fetch_syspath(&self) -> Result<String, VinputError> {
        let mut buf = [0u8; 65];
        let rc = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                UI_GET_SYSNAME as libc::c_ulong,
                buf.as_mut_ptr(),
            )
        };
        if rc < 0 {
            return Err(VinputError::Ioctl {
                request: UI_GET_SYSNAME,
                source: std::io::Error::last_os_error(),
            });
        }
        let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        let sysname = String::from_utf8_lossy(&buf[..len]).into_owned();
        Ok(format!("/sys/devices/virtual/input/{sysname}"))
    }

    /// Key or button transition, terminated with a sync report.
    pub fn key_event(&mut self, code: u16, pressed: bool) -> Result<(), VinputError> {
        self.emit(EV_KEY, code, pressed as i32)?;
        self.sync()
    }

    /// Relative pointer motion.
    pub fn move_rel(&mut self, dx: i32, dy: i32) -> Result<(), VinputError> {
        if dx != 0 {
            self.emit(EV_REL, REL_X, dx)?;
        }
        if dy != 0 {
            self.emit(EV_REL, REL_Y, dy)?;
        }
        self.sync()
    }

    /// Wheel movement in detents; `horizontal` selects REL_HWHEEL.
    pub fn wheel(&mut self, horizontal: bool, delta: i32) -> Result<(), VinputError> {
        if delta == 0 {
            return Ok(());
        }
        let code = if horizontal { REL_HWHEEL } else { REL_WHEEL };
        self.emit(EV_REL, code, delta)?;
        self.sync()
    }

    /// A batch of absolute-axis positions followed by one sync report.
    pub fn abs_events(&mut self, axes: &[(u16, i32)]) -> Result<(), VinputError> {
        for &(code, value) in axes {
            self.emit(EV_ABS, code, value)?;
        }
        self.sync()
    }

    fn emit(&mut self, ev_type: u16, code: u16, value: i32) -> Result<(), VinputError> {
        self.file
            .write_all(&input_event_bytes(ev_type, code, value))
            .map_err(VinputError::DeviceWrite)
    }

    fn sync(&mut self) -> Result<(), VinputError> {
        self.emit(EV_SYN, SYN_REPORT, 0)
    }

    fn set_ev_bit(&mut self, ev_type: u16) -> Result<(), VinputError> {
        self.ioctl(UI_SET_EVBIT, ev_type as u64)
    }

    fn set_key_bit(&mut self, code: u16) -> Result<(), VinputError> {
        self.ioctl(UI_SET_KEYBIT, code as u64)
    }

    fn ioctl(&self, request: u64, arg: u64) -> Result<(), VinputError> {
        let rc = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                request as libc::c_ulong,
                arg as libc::c_ulong,
            )
        };
        if rc < 0 {
            Err(VinputError::Ioctl {
                request,
                source: std::io::Error::last_os_error(),
            })
        } else {
            Ok(())
        }
    }
}

impl Drop for UinputHandle {
    fn drop(&mut self) {
        // Best effort: the fd close below releases the device anyway.
        let _ = self.ioctl(UI_DEV_DESTROY, 0);
    }
}

/// Serialize a `struct input_event` (16-byte timeval on 64-bit targets,
/// zeroed like every other uinput user). 24 bytes total.
fn input_event_bytes(ev_type: u16, code: u16, value: i32) -> [u8; 24] {
    let mut buf = [0u8; 24];
    buf[16..18].copy_from_slice(&ev_type.to_le_bytes());
    buf[18..20].copy_from_slice(&code.to_le_bytes());
    buf[20..24].copy_from_slice(&value.to_le_bytes());
    buf
}

/// Serialize a `struct uinput_user_dev`: name[80], input_id, effects_max,
/// absmax[64], absmin[64], absfuzz[64], absflat[64].
fn user_dev_bytes(name: &str, vendor: u16, product: u16, abs_bounds: &[(u16, i32, i32)]) -> Vec<u8> {
    let mut buf = vec![0u8; UINPUT_MAX_NAME_SIZE + 8 + 4 + 4 * ABS_SIZE * 4];

    buf[..name.len()].copy_from_slice(name.as_bytes());

    let id_base = UINPUT_MAX_NAME_SIZE;
    buf[id_base..id_base + 2].copy_from_slice(&BUS_USB.to_le_bytes());
    buf[id_base + 2..id_base + 4].copy_from_slice(&vendor.to_le_bytes());
    buf[id_base + 4..id_base + 6].copy_from_slice(&product.to_le_bytes());
    buf[id_base + 6..id_base + 8].copy_from_slice(&1u16.to_le_bytes()); // version

    let absmax_base = id_base + 8 + 4;
    let absmin_base = absmax_base + ABS_SIZE * 4;
    for &(axis, min, max) in abs_bounds {
        let off = axis as usize * 4;
        buf[absmax_base + off..absmax_base + off + 4].copy_from_slice(&max.to_le_bytes());
        buf[absmin_base + off..absmin_base + off + 4].copy_from_slice(&min.to_le_bytes());
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denormalize_full_scale() {
        assert_eq!(denormalize(1.0), 32767);
        assert_eq!(denormalize(-1.0), -32767);
        assert_eq!(denormalize(0.0), 0);
        assert_eq!(denormalize(0.5), 16383);
    }

    #[test]
    fn input_event_layout() {
        let buf = input_event_bytes(EV_KEY, BTN_SOUTH, 1);
        // timeval is zeroed
        assert!(buf[..16].iter().all(|&b| b == 0));
        assert_eq!(u16::from_le_bytes([buf[16], buf[17]]), EV_KEY);
        assert_eq!(u16::from_le_bytes([buf[18], buf[19]]), 0x130);
        assert_eq!(i32::from_le_bytes([buf[20], buf[21], buf[22], buf[23]]), 1);
    }

    #[test]
    fn user_dev_descriptor_size_and_id() {
        let buf = user_dev_bytes("pad", 0x045e, 0x02d1, &[]);
        assert_eq!(buf.len(), 80 + 8 + 4 + 4 * 64 * 4);
        assert_eq!(&buf[..3], b"pad");
        assert_eq!(buf[3], 0); // NUL padded
        assert_eq!(u16::from_le_bytes([buf[80], buf[81]]), 0x03); // BUS_USB
        assert_eq!(u16::from_le_bytes([buf[82], buf[83]]), 0x045e);
        assert_eq!(u16::from_le_bytes([buf[84], buf[85]]), 0x02d1);
    }

    #[test]
    fn user_dev_descriptor_axis_bounds() {
        let buf = user_dev_bytes("pad", 1, 2, &[(ABS_Z, 0, MAX_AXIS_VALUE), (ABS_X, -MAX_AXIS_VALUE, MAX_AXIS_VALUE)]);
        let absmax_base = 80 + 8 + 4;
        let absmin_base = absmax_base + 64 * 4;
        let max_z = i32::from_le_bytes(buf[absmax_base + 8..absmax_base + 12].try_into().unwrap());
        let min_z = i32::from_le_bytes(buf[absmin_base + 8..absmin_base + 12].try_into().unwrap());
        let min_x = i32::from_le_bytes(buf[absmin_base..absmin_base + 4].try_into().unwrap());
        assert_eq!(max_z, 32767);
        assert_eq!(min_z, 0);
        assert_eq!(min_x, -32767);
    }
}
