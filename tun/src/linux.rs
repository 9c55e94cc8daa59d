use std::ffi::CStr;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use crate::{Mode, ioctl};

const TUN_FILE: &CStr = c"/dev/net/tun";

/// Binds an already-open fd for `/dev/net/tun` to a TUN or TAP interface.
///
/// The caller keeps ownership of `fd`; this function neither opens nor
/// closes it. An empty `name` lets the kernel assign one (`tun0`, `tun1`,
/// ...). With `packet_info` set to `false` the interface omits the 4-byte
/// packet-information header from every packet (`IFF_NO_PI`).
///
/// Returns the name the kernel confirmed for the interface. Creating the
/// interface makes it visible system-wide; that is the point of the call.
///
/// Any failure of the underlying ioctl is returned verbatim as the raw OS
/// error (name in use, permission denied, ...). On failure the fd remains
/// unbound and is not usable as a network handle.
pub fn setup(fd: RawFd, name: &str, mode: Mode, packet_info: bool) -> io::Result<String> {
    let mut flags = match mode {
        Mode::Tun => libc::IFF_TUN,
        Mode::Tap => libc::IFF_TAP,
    };

    if !packet_info {
        flags |= libc::IFF_NO_PI;
    }

    let mut req = ioctl::Request::<ioctl::TunFlagsPayload>::new(name, flags as _)?;

    // Safety: The caller guarantees that the file descriptor is open.
    unsafe {
        ioctl::exec(fd, ioctl::TUNSETIFF, &mut req)?;
    }

    Ok(req.name().into_owned())
}

/// An owned handle to a TUN/TAP interface.
///
/// Reads yield one packet (or frame) at a time, writes submit one packet at
/// a time. The fd is closed on drop; the interface disappears with it
/// unless the kernel keeps it alive for another reason (persistence,
/// multi-queue siblings).
#[derive(Debug)]
pub struct TunDevice {
    fd: OwnedFd,
    name: String,
}

impl TunDevice {
    /// Opens `/dev/net/tun` and binds it to an interface.
    ///
    /// Requires `CAP_NET_ADMIN`.
    pub fn create(name: &str, mode: Mode, packet_info: bool) -> io::Result<Self> {
        let fd = match unsafe { libc::open(TUN_FILE.as_ptr() as _, libc::O_RDWR) } {
            -1 => return Err(io::Error::last_os_error()),
            // Safety: `open` returned a new, valid file descriptor.
            fd => unsafe { OwnedFd::from_raw_fd(fd) },
        };

        let name = setup(fd.as_raw_fd(), name, mode, packet_info)?;

        tracing::debug!(%name, ?mode, "Created TUN device");

        Ok(Self { fd, name })
    }

    /// Wraps an fd that is already bound to an interface, e.g. one handed
    /// over by a privileged parent process.
    pub fn from_fd(fd: OwnedFd, name: impl Into<String>) -> Self {
        Self {
            fd,
            name: name.into(),
        }
    }

    /// The interface name as confirmed by the kernel.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reads a single packet from the interface.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        // Safety: The file descriptor is valid for the lifetime of `self`.
        match unsafe { libc::read(self.fd.as_raw_fd(), buf.as_mut_ptr() as _, buf.len()) } {
            -1 => Err(io::Error::last_os_error()),
            n => Ok(n as usize),
        }
    }

    /// Writes a single packet to the interface.
    pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
        // Safety: The file descriptor is valid for the lifetime of `self`.
        match unsafe { libc::write(self.fd.as_raw_fd(), buf.as_ptr() as _, buf.len()) } {
            -1 => Err(io::Error::last_os_error()),
            n => Ok(n as usize),
        }
    }

    pub fn set_non_blocking(&self) -> io::Result<()> {
        set_non_blocking(self.fd.as_raw_fd())
    }
}

impl AsRawFd for TunDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl AsFd for TunDevice {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl From<TunDevice> for OwnedFd {
    fn from(device: TunDevice) -> Self {
        device.fd
    }
}

pub(crate) fn set_non_blocking(fd: RawFd) -> io::Result<()> {
    match unsafe { libc::fcntl(fd, libc::F_GETFL) } {
        -1 => Err(io::Error::last_os_error()),
        flags => match unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } {
            -1 => Err(io::Error::last_os_error()),
            _ => Ok(()),
        },
    }
}
