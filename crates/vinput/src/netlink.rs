//! Raw kobject-uevent netlink sockets and the uevent wire codec.
//!
//! Multicast group 1 carries the kernel's own hot-plug announcements and is
//! only ever read; group 2 is where a device manager broadcasts its
//! post-processed events and is only ever written. A uevent on the wire is
//! `action@kobj\0` followed by NUL-terminated `KEY=VALUE` pairs.

use std::collections::BTreeMap;
use std::fmt;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{
    bind, recv, sendto, socket, AddressFamily, MsgFlags, NetlinkAddr, SockFlag, SockProtocol,
    SockType,
};

use crate::error::VinputError;

/// Which multicast group the socket joins, and therefore which direction
/// it is used in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetlinkMode {
    /// Group 1: genuine kernel announcements, read-only.
    Kernel = 1,
    /// Group 2: synthesized device-manager events, write-only.
    Udev = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UeventAction {
    Add,
    Remove,
    Change,
    Move,
    Online,
    Offline,
    Bind,
    Unbind,
}

impl UeventAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Remove => "remove",
            Self::Change => "change",
            Self::Move => "move",
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Bind => "bind",
            Self::Unbind => "unbind",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "add" => Some(Self::Add),
            "remove" => Some(Self::Remove),
            "change" => Some(Self::Change),
            "move" => Some(Self::Move),
            "online" => Some(Self::Online),
            "offline" => Some(Self::Offline),
            "bind" => Some(Self::Bind),
            "unbind" => Some(Self::Unbind),
            _ => None,
        }
    }
}

impl fmt::Display for UeventAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One hot-plug event, either read off the kernel socket or about to be
/// synthesized onto the device-manager socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uevent {
    pub action: UeventAction,
    /// Kernel object path, e.g. `/devices/virtual/input/input7/event5`.
    pub kobj: String,
    pub env: BTreeMap<String, String>,
}

impl Uevent {
    pub fn parse(data: &[u8]) -> Result<Self, VinputError> {
        let mut fields = data.split(|&b| b == 0).filter(|f| !f.is_empty());
        let header = fields
            .next()
            .ok_or_else(|| VinputError::MalformedUevent("empty message".into()))?;
        let header = std::str::from_utf8(header)
            .map_err(|_| VinputError::MalformedUevent("header is not UTF-8".into()))?;
        let (action, kobj) = header
            .split_once('@')
            .ok_or_else(|| VinputError::MalformedUevent(format!("no '@' in header {header:?}")))?;
        let action = UeventAction::parse(action)
            .ok_or_else(|| VinputError::MalformedUevent(format!("unknown action {action:?}")))?;

        let mut env = BTreeMap::new();
        for field in fields {
            let Ok(field) = std::str::from_utf8(field) else {
                continue;
            };
            if let Some((key, value)) = field.split_once('=') {
                env.insert(key.to_string(), value.to_string());
            }
        }
        Ok(Self {
            action,
            kobj: kobj.to_string(),
            env,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.env.len() * 32);
        out.extend_from_slice(self.action.as_str().as_bytes());
        out.push(b'@');
        out.extend_from_slice(self.kobj.as_bytes());
        out.push(0);
        for (key, value) in &self.env {
            out.extend_from_slice(key.as_bytes());
            out.push(b'=');
            out.extend_from_slice(value.as_bytes());
            out.push(0);
        }
        out
    }
}

/// A bound `AF_NETLINK` / `NETLINK_KOBJECT_UEVENT` socket.
pub struct NetlinkSocket {
    fd: OwnedFd,
    mode: NetlinkMode,
    peer: NetlinkAddr,
}

impl NetlinkSocket {
    pub fn open(mode: NetlinkMode) -> Result<Self, VinputError> {
        let fd = socket(
            AddressFamily::Netlink,
            SockType::Raw,
            SockFlag::empty(),
            SockProtocol::NetlinkKObjectUEvent,
        )
        .map_err(VinputError::Netlink)?;
        let addr = NetlinkAddr::new(0, mode as u32);
        bind(fd.as_raw_fd(), &addr).map_err(VinputError::Netlink)?;
        Ok(Self {
            fd,
            mode,
            peer: addr,
        })
    }

    pub fn mode(&self) -> NetlinkMode {
        self.mode
    }

    /// Read one kernel uevent. Returns `None` when the poll times out so a
    /// shutdown flag can be checked between reads.
    pub fn read_uevent(&self, timeout_ms: u16) -> Result<Option<Uevent>, VinputError> {
        if self.mode != NetlinkMode::Kernel {
            return Err(VinputError::WrongNetlinkMode("kernel"));
        }
        let mut poll_fds = [PollFd::new(self.fd.as_fd(), PollFlags::POLLIN)];
        let ready = poll(&mut poll_fds, PollTimeout::from(timeout_ms)).map_err(VinputError::Netlink)?;
        if ready == 0 {
            return Ok(None);
        }
        let mut buf = vec![0u8; 8192];
        let n = recv(self.fd.as_raw_fd(), &mut buf, MsgFlags::empty())
            .map_err(VinputError::Netlink)?;
        Uevent::parse(&buf[..n]).map(Some)
    }

    /// Broadcast a synthesized event to the device-manager group.
    pub fn write_uevent(&self, event: &Uevent) -> Result<(), VinputError> {
        if self.mode != NetlinkMode::Udev {
            return Err(VinputError::WrongNetlinkMode("udev"));
        }
        let data = event.to_bytes();
        sendto(self.fd.as_raw_fd(), &data, &self.peer, MsgFlags::empty())
            .map_err(VinputError::Netlink)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> Uevent {
        let mut env = BTreeMap::new();
        env.insert("ACTION".into(), "add".into());
        env.insert("DEVPATH".into(), "/devices/virtual/input/input7/js0".into());
        env.insert("MAJOR".into(), "13".into());
        env.insert("MINOR".into(), "0".into());
        env.insert("SUBSYSTEM".into(), "input".into());
        Uevent {
            action: UeventAction::Add,
            kobj: "/devices/virtual/input/input7/js0".into(),
            env,
        }
    }

    #[test]
    fn uevent_roundtrip() {
        let event = sample_event();
        let parsed = Uevent::parse(&event.to_bytes()).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn parse_kernel_style_message() {
        let raw = b"add@/devices/virtual/input/input3/event2\0\
            ACTION=add\0DEVPATH=/devices/virtual/input/input3/event2\0\
            SUBSYSTEM=input\0MAJOR=13\0MINOR=66\0DEVNAME=input/event2\0SEQNUM=4711\0";
        let event = Uevent::parse(raw).unwrap();
        assert_eq!(event.action, UeventAction::Add);
        assert_eq!(event.kobj, "/devices/virtual/input/input3/event2");
        assert_eq!(event.env.get("MAJOR").map(String::as_str), Some("13"));
        assert_eq!(event.env.get("MINOR").map(String::as_str), Some("66"));
        assert_eq!(event.env.get("SEQNUM").map(String::as_str), Some("4711"));
    }

    #[test]
    fn parse_rejects_missing_separator() {
        assert!(matches!(
            Uevent::parse(b"libudev\0whatever\0"),
            Err(VinputError::MalformedUevent(_))
        ));
    }

    #[test]
    fn parse_rejects_unknown_action() {
        assert!(matches!(
            Uevent::parse(b"explode@/devices/foo\0"),
            Err(VinputError::MalformedUevent(_))
        ));
    }

    #[test]
    fn serialized_header_comes_first() {
        let bytes = sample_event().to_bytes();
        let first = bytes.split(|&b| b == 0).next().unwrap();
        assert_eq!(first, b"add@/devices/virtual/input/input7/js0");
    }

    #[test]
    fn remove_action_roundtrip() {
        let mut event = sample_event();
        event.action = UeventAction::Remove;
        event.env.insert("ACTION".into(), "remove".into());
        let parsed = Uevent::parse(&event.to_bytes()).unwrap();
        assert_eq!(parsed.action, UeventAction::Remove);
    }
}
