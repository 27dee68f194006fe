use std::cell::RefCell;
use std::io;
use std::mem;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crate::channel::Channel;
use crate::poller::Poller;
use crate::waker::Waker;

const POLL_TIMEOUT: Duration = Duration::from_secs(10);

type Task = Box<dyn FnOnce() + Send>;

thread_local! {
    // enforces one loop per thread
    static CURRENT_LOOP: RefCell<Weak<EventLoop>> = RefCell::new(Weak::new());
}

/// Single-thread scheduler: poll for readiness, dispatch active channels,
/// then run tasks posted from other threads.
///
/// A loop is bound to the thread that created it. Channel and poller mutation
/// must happen on that thread; any other thread interacts with the loop by
/// posting closures through [`run_in_loop`](EventLoop::run_in_loop) /
/// [`queue_in_loop`](EventLoop::queue_in_loop), which wake the loop out of
/// `epoll_wait` via an eventfd when needed.
pub struct EventLoop {
    thread_id: ThreadId,
    looping: AtomicBool,
    quit: AtomicBool,
    calling_pending: AtomicBool,
    poll_return_time: Mutex<Instant>,
    poller: Poller,
    waker: Waker,
    wake_channel: Arc<Channel>,
    pending: Mutex<Vec<Task>>,
}

impl EventLoop {
    /// Creates the loop owned by the calling thread.
    ///
    /// Fails with `AlreadyExists` if this thread already owns a live loop.
    pub fn new() -> io::Result<Arc<EventLoop>> {
        let occupied = CURRENT_LOOP.with(|current| current.borrow().upgrade().is_some());
        if occupied {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "another event loop already runs on this thread",
            ));
        }

        let poller = Poller::new()?;
        let waker = Waker::new()?;
        let wake_fd = waker.as_raw_fd();

        let event_loop = Arc::new_cyclic(|weak: &Weak<EventLoop>| EventLoop {
            thread_id: thread::current().id(),
            looping: AtomicBool::new(false),
            quit: AtomicBool::new(false),
            calling_pending: AtomicBool::new(false),
            poll_return_time: Mutex::new(Instant::now()),
            poller,
            waker,
            wake_channel: Arc::new(Channel::new(weak.clone(), wake_fd)),
            pending: Mutex::new(Vec::new()),
        });

        let waker = event_loop.waker.clone();
        event_loop.wake_channel.set_read_callback(move |_| {
            // short or failed reads are harmless, the loop is awake either way
            if let Err(e) = waker.drain() {
                error!("wakeup drain error: {}", e);
            }
        });
        event_loop.wake_channel.enable_reading();

        CURRENT_LOOP.with(|current| *current.borrow_mut() = Arc::downgrade(&event_loop));

        debug!("event loop created on {:?}", event_loop.thread_id);

        Ok(event_loop)
    }

    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    pub fn assert_in_loop_thread(&self) {
        assert!(
            self.is_in_loop_thread(),
            "event loop owned by thread {:?} was used from thread {:?}",
            self.thread_id,
            thread::current().id()
        );
    }

    /// Runs the dispatch cycle until [`quit`](EventLoop::quit) is observed.
    ///
    /// Must be called on the owning thread, and only once at a time.
    pub fn run(&self) {
        self.assert_in_loop_thread();
        let was_looping = self.looping.swap(true, Ordering::AcqRel);
        assert!(!was_looping, "event loop is already running");

        debug!("event loop {:?} start looping", self.thread_id);

        let mut active: Vec<Arc<Channel>> = Vec::new();

        while !self.quit.load(Ordering::Acquire) {
            active.clear();
            let receive_time = self.poller.poll(Some(POLL_TIMEOUT), &mut active);
            *self.poll_return_time.lock().unwrap() = receive_time;

            for channel in &active {
                channel.handle_event(receive_time);
            }

            self.do_pending_tasks();
        }

        debug!("event loop {:?} stop looping", self.thread_id);
        self.looping.store(false, Ordering::Release);
    }

    /// Makes `run` return after it finishes the current iteration. Safe to
    /// call from any thread; an off-thread caller also wakes the loop so the
    /// flag is seen without waiting out the poll timeout.
    pub fn quit(&self) {
        self.quit.store(true, Ordering::Release);

        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    /// Runs `task` immediately when called on the loop thread, otherwise
    /// posts it.
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Appends `task` to the pending queue.
    ///
    /// Wakes the loop if the caller is off-thread, or if the loop is
    /// currently draining the queue: tasks enqueued by a running task would
    /// otherwise sit unobserved until the next readiness event.
    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        {
            let mut pending = self.pending.lock().unwrap();
            pending.push(Box::new(task));
        }

        if !self.is_in_loop_thread() || self.calling_pending.load(Ordering::Acquire) {
            self.wakeup();
        }
    }

    pub fn wakeup(&self) {
        if let Err(e) = self.waker.wakeup() {
            error!("event loop wakeup error: {}", e);
        }
    }

    /// Time the most recent poll returned.
    pub fn poll_return_time(&self) -> Instant {
        *self.poll_return_time.lock().unwrap()
    }

    pub fn update_channel(&self, channel: &Arc<Channel>) {
        self.assert_in_loop_thread();
        if let Err(e) = self.poller.update_channel(channel) {
            error!("update channel fd = {} failed: {}", channel.fd(), e);
        }
    }

    pub fn remove_channel(&self, channel: &Arc<Channel>) {
        self.assert_in_loop_thread();
        if let Err(e) = self.poller.remove_channel(channel) {
            error!("remove channel fd = {} failed: {}", channel.fd(), e);
        }
    }

    pub fn has_channel(&self, channel: &Arc<Channel>) -> bool {
        self.assert_in_loop_thread();
        self.poller.has_channel(channel)
    }

    fn do_pending_tasks(&self) {
        let mut tasks = Vec::new();
        self.calling_pending.store(true, Ordering::Release);

        // swap under the lock, run outside it: a task is free to enqueue
        // further tasks, which land in the next round
        mem::swap(&mut tasks, &mut *self.pending.lock().unwrap());

        for task in tasks {
            task();
        }

        self.calling_pending.store(false, Ordering::Release);
    }
}
