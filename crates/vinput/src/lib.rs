//! Virtual input devices for a headless Linux desktop.
//!
//! Containerized applications discover input hardware through three
//! kernel/userspace surfaces, and this crate drives all of them:
//!
//! 1. `/dev/uinput`, which materializes the kernel input devices themselves and
//!    accepts the synthesized key/axis events.
//! 2. The kobject-uevent netlink multicast groups: group 1 carries the
//!    kernel's genuine hot-plug announcements (we read), group 2 carries the
//!    post-processed events a device manager would broadcast (we write).
//! 3. The udev on-disk database under `/run/udev`: small text records that
//!    libinput and SDL consult to classify devices and grant seat access.
//!
//! [`udev::Udev`] owns the netlink side; [`keyboard::VirtualKeyboard`],
//! [`mouse::VirtualMouse`] and [`gamepad::VirtualGamepad`] tie the three
//! surfaces together per device.

pub mod error;
pub mod gamepad;
pub mod keyboard;
pub mod mouse;
pub mod netlink;
pub mod udev;
pub mod uinput;

pub use error::VinputError;
pub use gamepad::VirtualGamepad;
pub use keyboard::VirtualKeyboard;
pub use mouse::VirtualMouse;
pub use udev::Udev;
