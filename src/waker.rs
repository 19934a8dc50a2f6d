use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};

use log::error;

/// Cross-thread wakeup primitive backed by `eventfd`.
///
/// `eventfd` is effectively a 64 bit counter. All writes must be of 8 bytes
/// (64 bits) and are added to the count; reads must also be 8 bytes and
/// reset the count to 0. A loop registers the descriptor with read interest
/// and drains it from the wakeup channel's read callback.
#[derive(Debug)]
pub(crate) struct Waker {
    fd: File,
}

impl Waker {
    pub(crate) fn new() -> io::Result<Waker> {
        let fd = syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?;
        // SAFETY: `eventfd(2)` returned a valid, owned descriptor.
        let file = unsafe { File::from_raw_fd(fd) };
        Ok(Waker { fd: file })
    }

    #[allow(clippy::unused_io_amount)] // an eventfd write is all-or-nothing
    pub(crate) fn wake(&self) -> io::Result<()> {
        let buf: [u8; 8] = 1u64.to_ne_bytes();
        match (&self.fd).write(&buf) {
            Ok(_) => Ok(()),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                // Writing only blocks if the counter would overflow; reset it
                // and wake again.
                self.drain();
                (&self.fd).write(&buf).map(|_| ())
            }
            Err(err) => Err(err),
        }
    }

    /// Resets the counter to 0. Called from the wakeup channel's read
    /// callback, and from `wake` on overflow.
    pub(crate) fn drain(&self) {
        let mut buf = [0u8; 8];
        match (&self.fd).read(&mut buf) {
            Ok(n) if n != buf.len() => {
                error!("wakeup read returned {} bytes instead of 8", n);
            }
            Ok(_) => {}
            // Not awoken since the last drain; nothing to reset.
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => error!("wakeup read failed: {}", err),
        }
    }
}

impl AsRawFd for Waker {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
