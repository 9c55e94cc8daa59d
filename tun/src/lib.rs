//! Creation of TUN/TAP virtual network devices.
//!
//! The single job of this crate is to turn a platform-specific setup
//! sequence into a ready-to-use I/O handle:
//!
//! - On Linux, an fd for `/dev/net/tun` is bound to a named (or
//!   kernel-named) TUN/TAP interface with a `TUNSETIFF` ioctl.
//! - On macOS / iOS, a `PF_SYSTEM` control socket is connected to a
//!   numbered unit of the `utun` control family; the connected socket is
//!   the interface's I/O handle.
//!
//! [`TunDevice`] owns the resulting handle, [`AsyncTunDevice`] integrates
//! it with the tokio reactor. Addressing, routing and MTU of the created
//! interface are the caller's business.

#[cfg(target_os = "linux")]
pub mod ioctl;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use linux::{TunDevice, setup};

#[cfg(any(target_os = "macos", target_os = "ios"))]
mod darwin;
#[cfg(any(target_os = "macos", target_os = "ios"))]
pub use darwin::{TunDevice, is_in_use, setup};

#[cfg(any(target_os = "linux", target_os = "macos", target_os = "ios"))]
mod async_device;
#[cfg(any(target_os = "linux", target_os = "macos", target_os = "ios"))]
pub use async_device::AsyncTunDevice;

/// The layer at which a virtual network device operates.
///
/// On macOS / iOS only TUN is available; `utun` devices always transport
/// raw IP packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Layer 3; the device transports raw IP packets.
    Tun,
    /// Layer 2; the device transports Ethernet frames.
    Tap,
}
