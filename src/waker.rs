use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

use crate::sys::EventFd;

/// Cross-thread notifier backing an event loop's wakeup channel.
///
/// A `wakeup` adds one to the eventfd counter, making the descriptor
/// readable and forcing a blocked `epoll_wait` to return; `drain` consumes
/// the counter once the loop is awake. Cloning shares the same descriptor.
#[derive(Debug, Clone)]
pub struct Waker {
    inner: Arc<EventFd>,
}

impl Waker {
    pub fn new() -> io::Result<Waker> {
        let eventfd = EventFd::new()?;

        Ok(Waker {
            inner: Arc::new(eventfd),
        })
    }

    pub fn wakeup(&self) -> io::Result<()> {
        match self.inner.write(1) {
            Ok(_) => Ok(()),
            Err(e) => {
                if e.kind() == io::ErrorKind::WouldBlock {
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }

    pub fn drain(&self) -> io::Result<()> {
        match self.inner.read() {
            Ok(_) => Ok(()),
            Err(e) => {
                if e.kind() == io::ErrorKind::WouldBlock {
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }
}

impl AsRawFd for Waker {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

#[cfg(test)]
mod test {
    use super::Waker;

    #[test]
    fn wakeup_and_drain() {
        let waker = Waker::new().unwrap();
        waker.wakeup().unwrap();
        waker.wakeup().unwrap();
        waker.drain().unwrap();
        // counter is consumed in one read
        waker.drain().unwrap();
    }
}
