//! The device-manager side of hot-plug: reads genuine kernel uevents,
//! synthesizes the enriched counterparts, and maintains the on-disk
//! database that libinput/SDL consult.
//!
//! Consumers depend on the exact paths and record bodies:
//! `/run/udev/control` (touched, 0755), `/run/udev/data/c<major>:<minor>`
//! and `/run/udev/data/+input:<id>` per device, and `/dev/input/*` nodes
//! with mode 0777.

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use nix::sys::stat::{makedev, mknod, Mode, SFlag};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::error::VinputError;
use crate::netlink::{NetlinkMode, NetlinkSocket, Uevent, UeventAction};

const UDEV_DATA_DIR: &str = "/run/udev/data";
const UDEV_CONTROL: &str = "/run/udev/control";
const DEV_INPUT_DIR: &str = "/dev/input";

/// Sequence numbers restart from seconds-since-epoch modulo one year so a
/// restarted desktop keeps them increasing from the consumer's viewpoint.
const SEQNUM_MODULUS: i64 = 24 * 3600 * 30 * 12;

const KERNEL_POLL_MS: u16 = 500;

/// Owns both netlink sockets and the process-local SEQNUM counter.
///
/// A single reader drains the kernel socket and fans events out over a
/// broadcast channel; a single writer (this struct) emits synthesized
/// events, so kernel announcements are always observed before their
/// device-manager counterparts.
pub struct Udev {
    udev_sock: NetlinkSocket,
    seqnum: AtomicI64,
    events: broadcast::Sender<Uevent>,
    closed: Arc<AtomicBool>,
}

impl Udev {
    pub fn open() -> Result<Arc<Self>, VinputError> {
        let kernel_sock = NetlinkSocket::open(NetlinkMode::Kernel)?;
        let udev_sock = NetlinkSocket::open(NetlinkMode::Udev)?;

        let (events, _) = broadcast::channel(256);
        let closed = Arc::new(AtomicBool::new(false));

        let udev = Arc::new(Self {
            udev_sock,
            seqnum: AtomicI64::new(seqnum_seed()),
            events: events.clone(),
            closed: closed.clone(),
        });

        std::thread::Builder::new()
            .name("udev-kernel-events".into())
            .spawn(move || {
                while !closed.load(Ordering::Relaxed) {
                    match kernel_sock.read_uevent(KERNEL_POLL_MS) {
                        Ok(Some(event)) => {
                            debug!(action = %event.action, kobj = %event.kobj, "kernel uevent");
                            let _ = events.send(event);
                        }
                        Ok(None) => {}
                        Err(e) => {
                            if closed.load(Ordering::Relaxed) {
                                break;
                            }
                            warn!("error reading kernel uevent: {e}");
                        }
                    }
                }
                debug!("kernel uevent reader stopped");
            })?;

        Ok(udev)
    }

    /// Subscribe to genuine kernel announcements.
    pub fn subscribe(&self) -> broadcast::Receiver<Uevent> {
        self.events.subscribe()
    }

    /// Stamp the next SEQNUM onto the event and broadcast it on the
    /// device-manager group.
    pub fn write_uevent(&self, mut event: Uevent) -> Result<(), VinputError> {
        let seq = self.seqnum.fetch_add(1, Ordering::Relaxed) + 1;
        event.env.insert("SEQNUM".into(), seq.to_string());
        self.udev_sock.write_uevent(&event)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}

impl Drop for Udev {
    fn drop(&mut self) {
        self.close();
    }
}

fn seqnum_seed() -> i64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    now % SEQNUM_MODULUS
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    Keyboard,
    Mouse,
    Gamepad,
}

/// One materialized `/dev/input` node with its database records and
/// synthesized uevents.
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    /// The id the kernel picked (the `N` in `jsN`/`eventN`).
    pub original_id: u32,
    /// The id we expose; gamepads remap this to the pad index.
    pub id: u32,
    pub kobj: String,
    pub env: BTreeMap<String, String>,
    pub major: u32,
    pub minor: u32,
    pub dev_path: PathBuf,
    pub class: DeviceClass,
    init_usec: i64,
}

impl DeviceRecord {
    pub fn new(
        original_id: u32,
        id: u32,
        class: DeviceClass,
        dev_path: PathBuf,
        event: &Uevent,
    ) -> Self {
        let major = event
            .env
            .get("MAJOR")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| {
                error!(kobj = %event.kobj, "uevent carries no parseable MAJOR");
                0
            });
        let minor = event
            .env
            .get("MINOR")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| {
                error!(kobj = %event.kobj, "uevent carries no parseable MINOR");
                0
            });
        Self {
            original_id,
            id,
            kobj: event.kobj.clone(),
            env: event.env.clone(),
            major,
            minor,
            dev_path,
            class,
            init_usec: 0,
        }
    }

    /// Create the device node, write the database records, and synthesize
    /// the enriched `add` event. Database failures are logged, not
    /// retried; the device stays usable without them.
    pub fn initialize(&mut self, udev: &Udev) {
        if let Err(e) = fs::create_dir_all(UDEV_DATA_DIR)
            .and_then(|_| fs::set_permissions(UDEV_DATA_DIR, fs::Permissions::from_mode(0o755)))
        {
            error!("failed to prepare {UDEV_DATA_DIR}: {e}");
        }
        if let Err(e) = touch(Path::new(UDEV_CONTROL), 0o755) {
            error!("failed to create {UDEV_CONTROL}: {e}");
        }
        if let Err(e) = fs::remove_file(&self.dev_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                error!(path = %self.dev_path.display(), "failed to remove existing device node: {e}");
            }
        }

        self.init_usec = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as i64;

        self.make_node();
        self.write_database();
        if let Err(e) = self.emit_uevent(udev, UeventAction::Add) {
            error!("failed to emit add uevent: {e}");
        }
        debug!(path = %self.dev_path.display(), major = self.major, minor = self.minor, "device created");
    }

    pub fn db_device_path(&self) -> PathBuf {
        PathBuf::from(format!("{UDEV_DATA_DIR}/c{}:{}", self.major, self.minor))
    }

    pub fn db_input_path(&self) -> Result<PathBuf, VinputError> {
        let id = input_component(&self.kobj)?;
        Ok(PathBuf::from(format!("{UDEV_DATA_DIR}/+input:{id}")))
    }

    /// The record body both database files share.
    fn database_body(&self) -> String {
        let mut data = String::new();
        data.push_str(&format!("I:{}\n", self.init_usec));
        if self.class == DeviceClass::Gamepad {
            data.push_str("E:ID_INPUT_JOYSTICK=1\n");
        }
        if self.class == DeviceClass::Mouse {
            data.push_str("E:ID_INPUT_MOUSE=1\n");
        }
        data.push_str("E:ID_INPUT=1\n");
        data.push_str("E:ID_SERIAL=noserial\n");
        data.push_str("G:seat\n");
        data.push_str("G:uaccess\n");
        data.push_str("Q:seat\n");
        data.push_str("Q:uaccess\n");
        data.push_str("V:1\n");
        data
    }

    fn write_database(&self) {
        let body = self.database_body();
        if let Err(e) = fs::write(self.db_device_path(), &body) {
            error!(path = %self.db_device_path().display(), "failed to write device database record: {e}");
        }
        match self.db_input_path() {
            Ok(path) => {
                if let Err(e) = fs::write(&path, &body) {
                    error!(path = %path.display(), "failed to write input database record: {e}");
                }
            }
            Err(e) => error!("cannot derive input database path: {e}"),
        }
    }

    fn remove_database(&self) {
        if let Err(e) = fs::remove_file(self.db_device_path()) {
            debug!("removing device database record: {e}");
        }
        if let Ok(path) = self.db_input_path() {
            if let Err(e) = fs::remove_file(path) {
                debug!("removing input database record: {e}");
            }
        }
    }

    fn make_node(&self) {
        let dev = makedev(self.major as u64, self.minor as u64);
        if let Err(e) = fs::create_dir_all(DEV_INPUT_DIR) {
            error!("failed to create {DEV_INPUT_DIR}: {e}");
        }
        if let Err(e) = mknod(
            &self.dev_path,
            SFlag::S_IFCHR,
            Mode::from_bits_truncate(0o777),
            dev,
        ) {
            error!(path = %self.dev_path.display(), "mknod failed: {e}");
            return;
        }
        if let Err(e) = fs::set_permissions(&self.dev_path, fs::Permissions::from_mode(0o777)) {
            error!(path = %self.dev_path.display(), "failed to open up node permissions: {e}");
        }
    }

    /// Synthesize the device-manager event, enriched with the tags and
    /// class hints a real device manager would add.
    pub fn emit_uevent(&self, udev: &Udev, action: UeventAction) -> Result<(), VinputError> {
        let event = Uevent {
            action,
            kobj: self.kobj.clone(),
            env: self.enriched_env(action),
        };
        info!(action = %action, kobj = %self.kobj, "emitting synthesized uevent");
        udev.write_uevent(event)
    }

    fn enriched_env(&self, action: UeventAction) -> BTreeMap<String, String> {
        let mut env = self.env.clone();
        env.insert("ACTION".into(), action.as_str().to_string());
        env.insert("DEVNAME".into(), self.dev_path.display().to_string());
        env.insert("SUBSYSTEM".into(), "input".into());
        env.insert("USEC_INITIALIZED".into(), self.init_usec.to_string());
        match self.class {
            DeviceClass::Gamepad => {
                env.insert("ID_INPUT".into(), "1".into());
                env.insert("ID_INPUT_JOYSTICK".into(), "1".into());
                env.insert(".INPUT_CLASS".into(), "joystick".into());
            }
            DeviceClass::Mouse => {
                env.insert("ID_INPUT".into(), "1".into());
                env.insert("ID_INPUT_MOUSE".into(), "1".into());
                env.insert(".INPUT_CLASS".into(), "mouse".into());
            }
            DeviceClass::Keyboard => {}
        }
        env.insert("ID_SERIAL".into(), "noserial".into());
        env.insert("TAGS".into(), ":seat:uaccess:".into());
        env.insert("CURRENT_TAGS".into(), ":seat:uaccess:".into());
        env
    }

    /// Tear the device back down: synthesized `remove`, node unlinked,
    /// database records deleted.
    pub fn close(&self, udev: &Udev) {
        if let Err(e) = self.emit_uevent(udev, UeventAction::Remove) {
            warn!("failed to emit remove uevent: {e}");
        }
        if let Err(e) = fs::remove_file(&self.dev_path) {
            debug!(path = %self.dev_path.display(), "removing device node: {e}");
        }
        self.remove_database();
    }

    pub fn sys_path(&self) -> String {
        format!("/sys{}", self.kobj)
    }
}

fn touch(path: &Path, mode: u32) -> std::io::Result<()> {
    fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

/// The `inputN` component of a kernel object path like
/// `/devices/virtual/input/input13/js0`.
pub fn input_component(kobj: &str) -> Result<&str, VinputError> {
    kobj.split('/')
        .nth(4)
        .filter(|c| c.starts_with("input"))
        .ok_or_else(|| VinputError::KobjFormat(kobj.to_string()))
}

/// Whether a kernel object belongs to the device rooted at `syspath`.
///
/// A plain prefix test is not enough: `/sys/.../input1` would also match
/// `/sys/.../input12`, so the continuation must start at a `/` boundary.
pub fn syspath_matches(syspath: &str, kobj: &str) -> bool {
    if syspath.is_empty() {
        return false;
    }
    let full = format!("/sys{kobj}");
    match full.strip_prefix(syspath) {
        Some("") => true,
        Some(rest) => rest.starts_with('/'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(class: DeviceClass) -> DeviceRecord {
        let mut env = BTreeMap::new();
        env.insert("MAJOR".into(), "13".into());
        env.insert("MINOR".into(), "68".into());
        let event = Uevent {
            action: UeventAction::Add,
            kobj: "/devices/virtual/input/input13/event4".into(),
            env,
        };
        DeviceRecord::new(4, 0, class, PathBuf::from("/dev/input/event4"), &event)
    }

    #[test]
    fn db_paths_encode_major_minor_and_input_id() {
        let rec = record(DeviceClass::Keyboard);
        assert_eq!(rec.db_device_path(), PathBuf::from("/run/udev/data/c13:68"));
        assert_eq!(
            rec.db_input_path().unwrap(),
            PathBuf::from("/run/udev/data/+input:input13")
        );
    }

    #[test]
    fn database_body_gamepad() {
        let mut rec = record(DeviceClass::Gamepad);
        rec.init_usec = 1700000000000000;
        assert_eq!(
            rec.database_body(),
            "I:1700000000000000\n\
             E:ID_INPUT_JOYSTICK=1\n\
             E:ID_INPUT=1\n\
             E:ID_SERIAL=noserial\n\
             G:seat\nG:uaccess\nQ:seat\nQ:uaccess\nV:1\n"
        );
    }

    #[test]
    fn database_body_mouse_and_keyboard_hints() {
        let rec = record(DeviceClass::Mouse);
        let body = rec.database_body();
        assert!(body.contains("E:ID_INPUT_MOUSE=1\n"));
        assert!(!body.contains("JOYSTICK"));

        let rec = record(DeviceClass::Keyboard);
        let body = rec.database_body();
        assert!(!body.contains("MOUSE"));
        assert!(!body.contains("JOYSTICK"));
        assert!(body.contains("E:ID_INPUT=1\n"));
    }

    #[test]
    fn input_component_extraction() {
        assert_eq!(
            input_component("/devices/virtual/input/input13/js0").unwrap(),
            "input13"
        );
        assert!(input_component("/devices/foo").is_err());
        assert!(input_component("/devices/pci0000/usb1/1-1").is_err());
    }

    #[test]
    fn syspath_prefix_requires_component_boundary() {
        let syspath = "/sys/devices/virtual/input/input1";
        assert!(syspath_matches(syspath, "/devices/virtual/input/input1"));
        assert!(syspath_matches(syspath, "/devices/virtual/input/input1/js0"));
        // input12 shares the string prefix but is a different device
        assert!(!syspath_matches(syspath, "/devices/virtual/input/input12"));
        assert!(!syspath_matches(syspath, "/devices/virtual/input/input12/js0"));
        assert!(!syspath_matches("", "/devices/virtual/input/input1"));
    }

    #[test]
    fn synthesized_env_is_enriched() {
        let mut rec = record(DeviceClass::Gamepad);
        rec.init_usec = 42;
        let env = rec.enriched_env(UeventAction::Add);
        assert_eq!(env.get("ACTION").map(String::as_str), Some("add"));
        assert_eq!(env.get("DEVNAME").map(String::as_str), Some("/dev/input/event4"));
        assert_eq!(env.get("SUBSYSTEM").map(String::as_str), Some("input"));
        assert_eq!(env.get("USEC_INITIALIZED").map(String::as_str), Some("42"));
        assert_eq!(env.get("ID_INPUT_JOYSTICK").map(String::as_str), Some("1"));
        assert_eq!(env.get(".INPUT_CLASS").map(String::as_str), Some("joystick"));
        assert_eq!(env.get("TAGS").map(String::as_str), Some(":seat:uaccess:"));
        assert_eq!(env.get("CURRENT_TAGS").map(String::as_str), Some(":seat:uaccess:"));
        // original kernel env is preserved
        assert_eq!(env.get("MAJOR").map(String::as_str), Some("13"));
    }

    #[test]
    fn keyboard_env_has_no_class_hint() {
        let rec = record(DeviceClass::Keyboard);
        let env = rec.enriched_env(UeventAction::Add);
        assert!(!env.contains_key("ID_INPUT_JOYSTICK"));
        assert!(!env.contains_key("ID_INPUT_MOUSE"));
        assert_eq!(env.get("ID_SERIAL").map(String::as_str), Some("noserial"));
    }

    #[test]
    fn sys_path_prefixes_sysfs_mount() {
        let rec = record(DeviceClass::Gamepad);
        assert_eq!(rec.sys_path(), "/sys/devices/virtual/input/input13/event4");
    }

    #[test]
    fn seqnum_seed_in_range() {
        let seed = seqnum_seed();
        assert!(seed >= 0 && seed < SEQNUM_MODULUS);
    }
}
