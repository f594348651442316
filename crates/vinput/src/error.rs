use std::io;

#[derive(Debug, thiserror::Error)]
pub enum VinputError {
    #[error("device name may not be empty")]
    EmptyDeviceName,
    #[error("device name {0:?} is too long (maximum of {1} bytes)")]
    DeviceNameTooLong(String, usize),
    #[error("uinput control file {path}: {source}")]
    ControlFile {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("uinput ioctl 0x{request:x} failed: {source}")]
    Ioctl {
        request: u64,
        #[source]
        source: io::Error,
    },
    #[error("writing to uinput device failed: {0}")]
    DeviceWrite(#[source] io::Error),
    #[error("netlink socket: {0}")]
    Netlink(#[source] nix::Error),
    #[error("netlink socket is not in {0} mode")]
    WrongNetlinkMode(&'static str),
    #[error("malformed uevent: {0}")]
    MalformedUevent(String),
    #[error("kernel object path {0:?} is not in the expected format")]
    KobjFormat(String),
    #[error("{0}")]
    Io(#[from] io::Error),
}
