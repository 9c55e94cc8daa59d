use std::{io, os::fd::RawFd};

/// `TUNSETIFF`: binds an fd for `/dev/net/tun` to the interface named in the request.
pub const TUNSETIFF: libc::c_ulong = 0x4004_54ca;

/// Executes the `ioctl` syscall on the given file descriptor with the provided request.
///
/// A negative return surfaces as [`io::Error::last_os_error`], i.e. the raw
/// OS error code is preserved for the caller.
///
/// # Safety
///
/// The file descriptor must be open.
pub unsafe fn exec<P>(fd: RawFd, code: libc::c_ulong, req: &mut Request<P>) -> io::Result<()> {
    let ret = unsafe { libc::ioctl(fd, code as _, req) };

    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

/// Represents a control request to an IO device, addressed by the device's name.
///
/// The layout must match the kernel's `ifreq` exactly: a fixed
/// `IF_NAMESIZE` byte name field followed by the request payload.
/// The payload MUST also be `#[repr(C)]` and its layout depends on the particular request you are sending.
#[derive(Debug)]
#[repr(C)]
pub struct Request<P> {
    name: [std::ffi::c_uchar; libc::IF_NAMESIZE],
    payload: P,
}

/// Payload for [`TUNSETIFF`]: the `IFF_*` flag word of the interface to create.
#[derive(Debug)]
#[repr(C)]
pub struct TunFlagsPayload {
    flags: std::ffi::c_short,
}

impl Request<TunFlagsPayload> {
    /// Builds a [`TUNSETIFF`] request for the given interface name and flags.
    ///
    /// An empty `name` asks the kernel to pick one. The name must leave
    /// room for the trailing nul in the fixed-size field; anything longer
    /// is rejected with [`io::ErrorKind::InvalidInput`] before a single
    /// byte is copied.
    pub fn new(name: &str, flags: libc::c_short) -> io::Result<Self> {
        let name_as_bytes = name.as_bytes();

        if name_as_bytes.len() >= libc::IF_NAMESIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "interface name must be shorter than {} bytes",
                    libc::IF_NAMESIZE
                ),
            ));
        }

        let mut name = [0u8; libc::IF_NAMESIZE];
        name[..name_as_bytes.len()].copy_from_slice(name_as_bytes);

        Ok(Self {
            name,
            payload: TunFlagsPayload { flags },
        })
    }

    /// The interface name as confirmed by the kernel.
    ///
    /// On success, `TUNSETIFF` writes the final name back into the request,
    /// which matters when the kernel assigned one.
    pub fn name(&self) -> std::borrow::Cow<'_, str> {
        // Safety: The memory of `self.name` is always initialized and the
        // constructor guarantees a trailing nul within the array.
        let cstr = unsafe { std::ffi::CStr::from_ptr(self.name.as_ptr() as _) };

        cstr.to_string_lossy()
    }
}
