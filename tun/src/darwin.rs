use std::io;
use std::mem::{size_of, size_of_val};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use libc::{
    AF_INET, AF_INET6, AF_SYS_CONTROL, AF_SYSTEM, CTLIOCGINFO, PF_SYSTEM, SOCK_DGRAM,
    SYSPROTO_CONTROL, UTUN_OPT_IFNAME, connect, ctl_info, getsockopt, ioctl, iovec, msghdr,
    recvmsg, sendmsg, sockaddr_ctl, socket, socklen_t,
};

const UTUN_CONTROL_NAME: &[u8] = b"com.apple.net.utun_control";

/// Highest unit [`TunDevice::create_any`] will try before giving up.
const MAX_UNITS: u32 = 256;

/// Opens a system-control socket and connects it to `utun` unit `unit`.
///
/// The interface is named `utunN` for unit `N`; the kernel numbers units
/// from 1 internally, so we connect to `unit + 1`.
///
/// The three steps are strictly ordered and each failure short-circuits:
/// socket creation, control-id resolution (`CTLIOCGINFO`), connect. All
/// errors carry the raw OS code, and the socket is closed on every failure
/// path, so nothing leaks. A connect failure means the unit is already
/// bound by someone else; check with [`is_in_use`] and pick another unit.
///
/// On success the connected socket itself is the interface's I/O handle.
pub fn setup(unit: u32) -> io::Result<OwnedFd> {
    let sc_unit = unit.checked_add(1).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "utun unit number out of range")
    })?;

    let fd = match unsafe { socket(PF_SYSTEM, SOCK_DGRAM, SYSPROTO_CONTROL) } {
        -1 => return Err(io::Error::last_os_error()),
        // Safety: `socket` returned a new, valid file descriptor. `OwnedFd`
        // closes it on every early return below.
        fd => unsafe { OwnedFd::from_raw_fd(fd) },
    };

    let mut info = ctl_info {
        ctl_id: 0,
        ctl_name: [0; 96],
    };
    info.ctl_name[..UTUN_CONTROL_NAME.len()]
        // Safety: We only care about maintaining the same byte values; the
        // cast is needed because `c_char` is `i8` on this platform.
        // `UTUN_CONTROL_NAME` is shorter than 96 bytes, so the
        // zero-initialised array keeps the field nul-terminated.
        .copy_from_slice(unsafe { &*(UTUN_CONTROL_NAME as *const [u8] as *const [i8]) });

    if unsafe { ioctl(fd.as_raw_fd(), CTLIOCGINFO, &mut info as *mut ctl_info) } < 0 {
        return Err(io::Error::last_os_error());
    }

    let addr = sockaddr_ctl {
        sc_len: size_of::<sockaddr_ctl>() as u8,
        sc_family: AF_SYSTEM as u8,
        ss_sysaddr: AF_SYS_CONTROL as u16,
        sc_id: info.ctl_id,
        sc_unit,
        sc_reserved: Default::default(),
    };

    if unsafe {
        connect(
            fd.as_raw_fd(),
            &addr as *const sockaddr_ctl as _,
            size_of_val(&addr) as _,
        )
    } < 0
    {
        return Err(io::Error::last_os_error());
    }

    Ok(fd)
}

/// Whether the error means the requested `utun` unit is already connected
/// by another socket.
///
/// Two concurrent claims on one unit race at the kernel; exactly one wins
/// and the other observes this condition. It clears once the winning
/// socket is closed.
pub fn is_in_use(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::EBUSY)
}

/// An owned handle to a `utun` interface.
///
/// `utun` devices are always TUN (layer 3) and the kernel prepends a 4-byte
/// protocol-family header to every packet; [`TunDevice::recv`] and
/// [`TunDevice::send`] strip and restore that header, so callers see the
/// same bare-IP-packet contract as a Linux device without packet info.
#[derive(Debug)]
pub struct TunDevice {
    fd: OwnedFd,
    name: String,
}

impl TunDevice {
    /// Connects to `utun` unit `unit`; the interface will be named `utunN`.
    ///
    /// Requires root.
    pub fn create(unit: u32) -> io::Result<Self> {
        let fd = setup(unit)?;
        let name = name(fd.as_raw_fd())?;

        tracing::debug!(%name, "Created TUN device");

        Ok(Self { fd, name })
    }

    /// Connects to the first `utun` unit that is not already in use.
    pub fn create_any() -> io::Result<Self> {
        for unit in 0..MAX_UNITS {
            match Self::create(unit) {
                Err(e) if is_in_use(&e) => {
                    tracing::trace!(unit, "utun unit is in use, trying the next one");
                    continue;
                }
                result => return result,
            }
        }

        Err(io::Error::new(
            io::ErrorKind::AddrInUse,
            format!("all {MAX_UNITS} utun units are in use"),
        ))
    }

    /// Wraps a socket that is already connected to a `utun` unit, e.g. one
    /// handed over by a packet tunnel provider.
    ///
    /// The interface name is looked up from the socket.
    pub fn from_fd(fd: OwnedFd) -> io::Result<Self> {
        let name = name(fd.as_raw_fd())?;

        Ok(Self { fd, name })
    }

    /// The interface name as reported by the kernel.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reads a single IP packet from the interface.
    ///
    /// The kernel's 4-byte protocol header is stripped.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut hdr = [0u8; 4];

        let mut iov = [
            iovec {
                iov_base: hdr.as_mut_ptr() as _,
                iov_len: hdr.len(),
            },
            iovec {
                iov_base: buf.as_mut_ptr() as _,
                iov_len: buf.len(),
            },
        ];

        let mut msg_hdr = msghdr {
            msg_name: std::ptr::null_mut(),
            msg_namelen: 0,
            msg_iov: &mut iov[0],
            msg_iovlen: iov.len() as _,
            msg_control: std::ptr::null_mut(),
            msg_controllen: 0,
            msg_flags: 0,
        };

        // Safety: The file descriptor is valid for the lifetime of `self`.
        match unsafe { recvmsg(self.fd.as_raw_fd(), &mut msg_hdr, 0) } {
            -1 => Err(io::Error::last_os_error()),
            0..=4 => Ok(0),
            n => Ok((n - 4) as usize),
        }
    }

    /// Writes a single IP packet to the interface.
    ///
    /// The protocol header is derived from the packet's IP version nibble.
    pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
        let af = match buf.first().map(|b| b >> 4) {
            Some(6) => AF_INET6,
            _ => AF_INET,
        };

        let mut hdr = [0u8, 0u8, 0u8, af as u8];
        let mut iov = [
            iovec {
                iov_base: hdr.as_mut_ptr() as _,
                iov_len: hdr.len(),
            },
            iovec {
                iov_base: buf.as_ptr() as _,
                iov_len: buf.len(),
            },
        ];

        let msg_hdr = msghdr {
            msg_name: std::ptr::null_mut(),
            msg_namelen: 0,
            msg_iov: &mut iov[0],
            msg_iovlen: iov.len() as _,
            msg_control: std::ptr::null_mut(),
            msg_controllen: 0,
            msg_flags: 0,
        };

        // Safety: The file descriptor is valid for the lifetime of `self`.
        match unsafe { sendmsg(self.fd.as_raw_fd(), &msg_hdr, 0) } {
            -1 => Err(io::Error::last_os_error()),
            n => Ok((n as usize).saturating_sub(hdr.len())),
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

fn name(fd: RawFd) -> io::Result<String> {
    let mut tunnel_name = [0u8; libc::IF_NAMESIZE];
    let mut tunnel_name_len = tunnel_name.len() as socklen_t;

    if unsafe {
        getsockopt(
            fd,
            SYSPROTO_CONTROL,
            UTUN_OPT_IFNAME,
            tunnel_name.as_mut_ptr() as _,
            &mut tunnel_name_len,
        )
    } < 0
        || tunnel_name_len == 0
    {
        return Err(io::Error::last_os_error());
    }

    Ok(String::from_utf8_lossy(&tunnel_name[..(tunnel_name_len - 1) as usize]).to_string())
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

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn unit_number_without_room_for_the_kernel_offset_is_rejected() {
        let err = setup(u32::MAX).unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
