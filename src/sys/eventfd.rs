use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use super::fd::FileDesc;

/// A Linux eventfd used as a cross-thread wakeup counter.
///
/// The descriptor is created non-blocking and close-on-exec. Every transfer
/// moves exactly one 8-byte word: a write adds to the kernel-side counter,
/// a read returns the accumulated count and resets it to zero, so any
/// number of wakeups posted while the owning loop is busy collapse into a
/// single readable event.
#[derive(Debug)]
pub struct EventFd {
    fd: FileDesc,
}

impl EventFd {
    pub fn new() -> io::Result<EventFd> {
        let fd = syscall!(eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC))?;

        Ok(EventFd { fd: FileDesc::new(fd) })
    }

    /// Adds `n` to the counter. Fails with `WouldBlock` once the counter
    /// would pass `u64::MAX - 1`, the kernel's limit.
    pub fn write(&self, n: u64) -> io::Result<()> {
        self.fd.write_all(&n.to_ne_bytes())
    }

    /// Returns the accumulated count, resetting it to zero. Fails with
    /// `WouldBlock` while the counter is zero.
    pub fn read(&self) -> io::Result<u64> {
        let mut word = [0u8; 8];
        self.fd.read_exact(&mut word)?;

        Ok(u64::from_ne_bytes(word))
    }
}

impl AsRawFd for EventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.raw()
    }
}

#[cfg(test)]
mod test {
    use super::EventFd;
    use std::io::ErrorKind;

    // the kernel caps the counter just below u64::MAX
    const COUNTER_LIMIT: u64 = u64::MAX - 1;

    #[test]
    fn writes_accumulate_until_read() {
        let event = EventFd::new().unwrap();

        event.write(3).unwrap();
        event.write(4).unwrap();
        assert_eq!(event.read().unwrap(), 7);

        // drained, so the next read has nothing to report
        assert_eq!(event.read().unwrap_err().kind(), ErrorKind::WouldBlock);
    }

    #[test]
    fn counter_saturates_at_the_kernel_limit() {
        let event = EventFd::new().unwrap();

        event.write(COUNTER_LIMIT).unwrap();
        assert_eq!(event.write(1).unwrap_err().kind(), ErrorKind::WouldBlock);

        assert_eq!(event.read().unwrap(), COUNTER_LIMIT);
    }
}
