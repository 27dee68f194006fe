use std::any::Any;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use crate::event_loop::EventLoop;
use crate::poller;
use crate::ready::Ready;

pub type ReadCallback = Arc<dyn Fn(Instant) + Send + Sync>;
pub type EventCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Handlers {
    read: Option<ReadCallback>,
    write: Option<EventCallback>,
    close: Option<EventCallback>,
    error: Option<EventCallback>,
}

/// Binds one file descriptor to an interest set and typed callbacks.
///
/// A channel belongs to exactly one [`EventLoop`]; interest changes and event
/// dispatch happen on that loop's thread only. The channel does not own the
/// descriptor; whoever created it (connection, acceptor, loop) keeps the fd
/// alive and must call [`remove`](Channel::remove) before closing it.
pub struct Channel {
    event_loop: Weak<EventLoop>,
    fd: RawFd,
    events: AtomicUsize,
    revents: AtomicUsize,
    index: AtomicUsize,
    handlers: Mutex<Handlers>,
    tie: Mutex<Weak<dyn Any + Send + Sync>>,
    tied: AtomicBool,
}

impl Channel {
    pub fn new(event_loop: Weak<EventLoop>, fd: RawFd) -> Channel {
        let tie: Weak<dyn Any + Send + Sync> = Weak::<()>::new();

        Channel {
            event_loop,
            fd,
            events: AtomicUsize::new(Ready::empty().as_usize()),
            revents: AtomicUsize::new(Ready::empty().as_usize()),
            index: AtomicUsize::new(poller::INDEX_NEW),
            handlers: Mutex::new(Handlers::default()),
            tie: Mutex::new(tie),
            tied: AtomicBool::new(false),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn interest(&self) -> Ready {
        Ready::from(self.events.load(Ordering::Acquire))
    }

    pub fn set_read_callback(&self, cb: impl Fn(Instant) + Send + Sync + 'static) {
        self.handlers.lock().unwrap().read = Some(Arc::new(cb));
    }

    pub fn set_write_callback(&self, cb: impl Fn() + Send + Sync + 'static) {
        self.handlers.lock().unwrap().write = Some(Arc::new(cb));
    }

    pub fn set_close_callback(&self, cb: impl Fn() + Send + Sync + 'static) {
        self.handlers.lock().unwrap().close = Some(Arc::new(cb));
    }

    pub fn set_error_callback(&self, cb: impl Fn() + Send + Sync + 'static) {
        self.handlers.lock().unwrap().error = Some(Arc::new(cb));
    }

    /// Ties the channel to the object whose callbacks it dispatches into.
    ///
    /// The tie is weak; `handle_event` promotes it to a strong reference for
    /// the duration of one dispatch, so a handler that drops the last owning
    /// reference mid-callback cannot free the object under our feet. If the
    /// promotion fails the dispatch is skipped entirely.
    pub fn tie<T: Send + Sync + 'static>(&self, owner: &Arc<T>) {
        let any: Arc<dyn Any + Send + Sync> = owner.clone();
        *self.tie.lock().unwrap() = Arc::downgrade(&any);
        self.tied.store(true, Ordering::Release);
    }

    pub fn enable_reading(self: &Arc<Self>) {
        self.events
            .fetch_or(Ready::readable().as_usize(), Ordering::AcqRel);
        self.update();
    }

    pub fn disable_reading(self: &Arc<Self>) {
        self.events
            .fetch_and(!Ready::readable().as_usize(), Ordering::AcqRel);
        self.update();
    }

    pub fn enable_writing(self: &Arc<Self>) {
        self.events
            .fetch_or(Ready::writable().as_usize(), Ordering::AcqRel);
        self.update();
    }

    pub fn disable_writing(self: &Arc<Self>) {
        self.events
            .fetch_and(!Ready::writable().as_usize(), Ordering::AcqRel);
        self.update();
    }

    pub fn disable_all(self: &Arc<Self>) {
        self.events
            .store(Ready::empty().as_usize(), Ordering::Release);
        self.update();
    }

    pub fn is_none_event(&self) -> bool {
        self.interest().is_empty()
    }

    pub fn is_reading(&self) -> bool {
        self.interest().is_readable()
    }

    pub fn is_writing(&self) -> bool {
        self.interest().is_writable()
    }

    /// Detaches the channel from its loop's poller. The channel must not be
    /// dispatched to afterwards.
    pub fn remove(self: &Arc<Self>) {
        assert!(self.is_none_event());
        if let Some(event_loop) = self.event_loop.upgrade() {
            event_loop.remove_channel(self);
        }
    }

    fn update(self: &Arc<Self>) {
        if let Some(event_loop) = self.event_loop.upgrade() {
            event_loop.update_channel(self);
        }
    }

    pub(crate) fn set_revents(&self, revents: Ready) {
        self.revents.store(revents.as_usize(), Ordering::Release);
    }

    pub(crate) fn index(&self) -> usize {
        self.index.load(Ordering::Acquire)
    }

    pub(crate) fn set_index(&self, index: usize) {
        self.index.store(index, Ordering::Release);
    }

    /// Dispatches the revents set by the poller to the registered callbacks.
    ///
    /// Order: error, then close (peer hung up with no data left), then read,
    /// then write.
    pub fn handle_event(&self, receive_time: Instant) {
        if self.tied.load(Ordering::Acquire) {
            let guard = self.tie.lock().unwrap().upgrade();
            if guard.is_some() {
                self.handle_event_with_guard(receive_time);
            }
            // owner already destroyed: skip dispatch
        } else {
            self.handle_event_with_guard(receive_time);
        }
    }

    fn handle_event_with_guard(&self, receive_time: Instant) {
        let revents = Ready::from(self.revents.load(Ordering::Acquire));
        trace!("channel fd = {} handle revents = {:?}", self.fd, revents);

        let (read, write, close, error) = {
            let handlers = self.handlers.lock().unwrap();
            (
                handlers.read.clone(),
                handlers.write.clone(),
                handlers.close.clone(),
                handlers.error.clone(),
            )
        };

        if revents.is_error() {
            if let Some(cb) = error {
                cb();
            }
        }

        if revents.is_hup() && !revents.is_readable() {
            if let Some(cb) = close {
                cb();
            }
        }

        if revents.is_readable() {
            if let Some(cb) = read {
                cb(receive_time);
            }
        }

        if revents.is_writable() {
            if let Some(cb) = write {
                cb();
            }
        }
    }
}
