use std::io;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use indexmap::IndexMap;

use crate::channel::Channel;
use crate::sys;

// membership states recorded in a channel's poller index
pub(crate) const INDEX_NEW: usize = 0;
pub(crate) const INDEX_ADDED: usize = 1;
pub(crate) const INDEX_DELETED: usize = 2;

/// Readiness demultiplexer backing one event loop.
///
/// Keeps the `fd -> channel` registry and mirrors each channel's membership
/// state into the kernel. A channel whose interest set goes empty is removed
/// from the kernel but kept in the registry (`INDEX_DELETED`) so it can be
/// re-armed cheaply; `remove_channel` erases it for good.
pub struct Poller {
    epoll: sys::Epoll,
    events: Mutex<sys::Events>,
    channels: Mutex<IndexMap<RawFd, Arc<Channel>>>,
}

const EVENTS_CAPACITY: usize = 1024;

impl Poller {
    pub fn new() -> io::Result<Poller> {
        Ok(Poller {
            epoll: sys::Epoll::new()?,
            events: Mutex::new(sys::Events::with_capacity(EVENTS_CAPACITY)),
            channels: Mutex::new(IndexMap::new()),
        })
    }

    /// Waits for readiness and fills `active` with the channels that have
    /// events pending, each with its revents freshly set. Returns the time
    /// the wait call returned.
    ///
    /// Poll failures other than interruption are logged and produce an empty
    /// active set; the loop carries on.
    pub fn poll(&self, timeout: Option<Duration>, active: &mut Vec<Arc<Channel>>) -> Instant {
        let mut events = self.events.lock().unwrap();
        let result = self.epoll.wait(&mut events, timeout);
        let receive_time = Instant::now();

        match result {
            Ok(n) => {
                if n > 0 {
                    trace!("{} events happened", n);
                }

                let channels = self.channels.lock().unwrap();
                for i in 0..n {
                    let event = events.get(i).unwrap();
                    if let Some(channel) = channels.get(&event.fd()) {
                        channel.set_revents(event.readiness());
                        active.push(channel.clone());
                    }
                }

                if n == events.capacity() {
                    events.grow();
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                error!("poller wait error: {}", e);
            }
        }

        receive_time
    }

    pub fn update_channel(&self, channel: &Arc<Channel>) -> io::Result<()> {
        let index = channel.index();
        trace!(
            "update channel fd = {} interest = {:?} index = {}",
            channel.fd(),
            channel.interest(),
            index
        );

        if index == INDEX_NEW || index == INDEX_DELETED {
            let fd = channel.fd();
            let mut channels = self.channels.lock().unwrap();

            if index == INDEX_NEW {
                channels.insert(fd, channel.clone());
            } else {
                debug_assert!(channels.contains_key(&fd));
            }

            self.epoll.add(fd, channel.interest())?;
            channel.set_index(INDEX_ADDED);
        } else {
            // already registered with the kernel
            debug_assert!(self.has_channel(channel));

            if channel.is_none_event() {
                self.epoll.delete(channel.fd())?;
                channel.set_index(INDEX_DELETED);
            } else {
                self.epoll.modify(channel.fd(), channel.interest())?;
            }
        }

        Ok(())
    }

    pub fn remove_channel(&self, channel: &Arc<Channel>) -> io::Result<()> {
        let fd = channel.fd();
        trace!("remove channel fd = {}", fd);

        let removed = self.channels.lock().unwrap().swap_remove(&fd);
        if removed.is_none() {
            // never registered, nothing to undo
            channel.set_index(INDEX_NEW);
            return Ok(());
        }

        let result = if channel.index() == INDEX_ADDED {
            self.epoll.delete(fd)
        } else {
            Ok(())
        };

        channel.set_index(INDEX_NEW);
        result
    }

    pub fn has_channel(&self, channel: &Arc<Channel>) -> bool {
        self.channels
            .lock()
            .unwrap()
            .get(&channel.fd())
            .map(|c| Arc::ptr_eq(c, channel))
            .unwrap_or(false)
    }
}
