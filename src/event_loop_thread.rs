use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crate::callbacks::ThreadInitCallback;
use crate::event_loop::EventLoop;

struct Shared {
    slot: Mutex<Option<io::Result<Arc<EventLoop>>>>,
    cond: Condvar,
}

/// Owns one worker thread and the event loop running on it.
///
/// The worker constructs its own loop (loops are bound to their creating
/// thread), publishes it through a mutex/condvar pair, and then parks in
/// `run()` until quit. Dropping the handle quits the loop and joins the
/// thread.
pub struct EventLoopThread {
    name: String,
    init: Option<ThreadInitCallback>,
    event_loop: Option<Arc<EventLoop>>,
    thread: Option<JoinHandle<()>>,
    shared: Arc<Shared>,
}

impl EventLoopThread {
    pub fn new(name: String, init: Option<ThreadInitCallback>) -> EventLoopThread {
        EventLoopThread {
            name,
            init,
            event_loop: None,
            thread: None,
            shared: Arc::new(Shared {
                slot: Mutex::new(None),
                cond: Condvar::new(),
            }),
        }
    }

    /// Spawns the worker and blocks until its loop is published (or its
    /// construction failed).
    pub fn start_loop(&mut self) -> io::Result<Arc<EventLoop>> {
        assert!(self.thread.is_none(), "loop thread already started");

        let shared = self.shared.clone();
        let init = self.init.clone();

        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                let event_loop = match EventLoop::new() {
                    Ok(event_loop) => event_loop,
                    Err(e) => {
                        let mut slot = shared.slot.lock().unwrap();
                        *slot = Some(Err(e));
                        shared.cond.notify_one();
                        return;
                    }
                };

                if let Some(init) = init {
                    init(&event_loop);
                }

                {
                    let mut slot = shared.slot.lock().unwrap();
                    *slot = Some(Ok(event_loop.clone()));
                    shared.cond.notify_one();
                }

                event_loop.run();
            })?;

        self.thread = Some(handle);

        let mut slot = self.shared.slot.lock().unwrap();
        while slot.is_none() {
            slot = self.shared.cond.wait(slot).unwrap();
        }
        let result = slot.take().unwrap();
        drop(slot);

        let event_loop = result?;
        self.event_loop = Some(event_loop.clone());
        Ok(event_loop)
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        if let Some(event_loop) = self.event_loop.take() {
            event_loop.quit();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
