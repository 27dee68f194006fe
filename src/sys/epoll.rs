use std::cmp;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use libc::{self, c_int};
use libc::{EPOLLERR, EPOLLHUP};
use libc::{EPOLLIN, EPOLLOUT, EPOLLPRI, EPOLLRDHUP};

use crate::ready::Ready;

/// Thin wrapper around an epoll instance. Registration is level-triggered
/// and keyed by the registered descriptor itself.
#[derive(Debug)]
pub struct Epoll {
    epfd: RawFd,
}

impl Epoll {
    pub fn new() -> io::Result<Epoll> {
        let epfd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;

        Ok(Epoll { epfd })
    }

    pub fn wait(&self, evts: &mut Events, timeout: Option<Duration>) -> io::Result<usize> {
        let timeout = timeout
            .map(|to| cmp::min(to.as_millis(), libc::c_int::MAX as u128) as libc::c_int)
            .unwrap_or(-1);

        let cnt = syscall!(epoll_wait(
            self.epfd,
            evts.events.as_mut_ptr(),
            evts.events.capacity() as i32,
            timeout
        ))?;

        unsafe { evts.events.set_len(cnt as usize) };

        Ok(evts.len())
    }

    pub fn add(&self, fd: RawFd, interest: Ready) -> io::Result<()> {
        let mut info = libc::epoll_event {
            events: interest_to_epoll(interest),
            u64: fd as u64,
        };

        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut info))?;

        Ok(())
    }

    pub fn modify(&self, fd: RawFd, interest: Ready) -> io::Result<()> {
        let mut info = libc::epoll_event {
            events: interest_to_epoll(interest),
            u64: fd as u64,
        };

        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_MOD, fd, &mut info))?;

        Ok(())
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        let mut info = libc::epoll_event { events: 0, u64: 0 };

        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut info))?;

        Ok(())
    }
}

fn interest_to_epoll(interest: Ready) -> u32 {
    let mut kind = 0;

    if interest.is_readable() {
        kind |= EPOLLIN | EPOLLPRI;
    }

    if interest.is_writable() {
        kind |= EPOLLOUT;
    }

    kind as u32
}

impl AsRawFd for Epoll {
    fn as_raw_fd(&self) -> RawFd {
        self.epfd
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::close(self.epfd);
        }
    }
}

pub struct Events {
    events: Vec<libc::epoll_event>,
}

impl Events {
    pub fn with_capacity(u: usize) -> Events {
        Events {
            events: Vec::with_capacity(u),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.events.capacity()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Doubles the backing storage. Called when a wait fills the whole
    /// capacity, so the next wait can report more descriptors at once.
    pub fn grow(&mut self) {
        let cap = self.events.capacity();
        self.events.reserve(cap);
    }

    #[inline]
    pub fn get(&self, idx: usize) -> Option<Event> {
        self.events.get(idx).map(|event| {
            let epoll = event.events as c_int;
            let mut kind = Ready::empty();

            if (epoll & EPOLLIN) != 0 || (epoll & EPOLLPRI) != 0 {
                kind |= Ready::readable();
            }

            if (epoll & EPOLLOUT) != 0 {
                kind |= Ready::writable();
            }

            if (epoll & EPOLLERR) != 0 {
                kind |= Ready::error();
            }

            if (epoll & EPOLLRDHUP) != 0 || (epoll & EPOLLHUP) != 0 {
                kind |= Ready::hup();
            }

            Event::new(kind, event.u64 as RawFd)
        })
    }
}

/// One readiness notification: which descriptor, and what it is ready for.
#[derive(Debug, Clone, Copy)]
pub struct Event {
    kind: Ready,
    fd: RawFd,
}

impl Event {
    pub fn new(kind: Ready, fd: RawFd) -> Event {
        Event { kind, fd }
    }

    pub fn readiness(&self) -> Ready {
        self.kind
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }
}
