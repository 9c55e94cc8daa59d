use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, Interest, ReadBuf};

use crate::TunDevice;

/// A [`TunDevice`] registered with the tokio reactor.
///
/// The device is switched to non-blocking mode on construction. Packets can
/// be exchanged either through [`recv`](AsyncTunDevice::recv) /
/// [`send`](AsyncTunDevice::send) or through the [`AsyncRead`] /
/// [`AsyncWrite`] implementations.
#[derive(Debug)]
pub struct AsyncTunDevice {
    inner: AsyncFd<TunDevice>,
}

impl AsyncTunDevice {
    /// Must be called from within a tokio runtime.
    pub fn new(device: TunDevice) -> io::Result<Self> {
        device.set_non_blocking()?;

        Ok(Self {
            inner: AsyncFd::new(device)?,
        })
    }

    /// The interface name as confirmed by the kernel.
    pub fn name(&self) -> &str {
        self.inner.get_ref().name()
    }

    /// Reads a single packet from the interface.
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner
            .async_io(Interest::READABLE, |device| device.recv(buf))
            .await
    }

    /// Writes a single packet to the interface.
    pub async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.inner
            .async_io(Interest::WRITABLE, |device| device.send(buf))
            .await
    }

    /// Deregisters the device from the reactor and returns it.
    pub fn into_inner(self) -> TunDevice {
        self.inner.into_inner()
    }
}

impl AsRawFd for AsyncTunDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.get_ref().as_raw_fd()
    }
}

impl AsyncRead for AsyncTunDevice {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        loop {
            let mut guard = ready!(this.inner.poll_read_ready(cx))?;

            match guard.try_io(|inner| inner.get_ref().recv(buf.initialize_unfilled())) {
                // A header-only datagram decodes to zero payload bytes, not
                // end-of-file; the device is still live, so keep reading.
                Ok(Ok(0)) => continue,
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for AsyncTunDevice {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        loop {
            let mut guard = ready!(this.inner.poll_write_ready(cx))?;

            match guard.try_io(|inner| inner.get_ref().send(buf)) {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Packets are handed to the kernel one `write` at a time; there is
        // no userspace buffer to flush.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::os::fd::OwnedFd;
    use std::os::unix::net::UnixDatagram;

    use tokio::io::AsyncReadExt;

    use super::*;

    #[tokio::test]
    async fn zero_length_packet_is_not_end_of_file() {
        let (tx, rx) = UnixDatagram::pair().unwrap();
        let mut device =
            AsyncTunDevice::new(TunDevice::from_fd(OwnedFd::from(rx), "tuntest")).unwrap();

        tx.send(b"").unwrap();
        tx.send(b"hello").unwrap();

        let mut buf = [0u8; 1500];
        let num_read = device.read(&mut buf).await.unwrap();

        assert_eq!(&buf[..num_read], b"hello");
    }
}
