use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::callbacks::ThreadInitCallback;
use crate::event_loop::EventLoop;
use crate::event_loop_thread::EventLoopThread;

/// Pool of worker loops fed by the base loop's acceptor.
///
/// With zero workers every connection stays on the base loop; otherwise
/// `get_next_loop` deals workers out round-robin.
pub struct EventLoopThreadPool {
    base_loop: Arc<EventLoop>,
    name: String,
    started: AtomicBool,
    num_threads: AtomicUsize,
    next: AtomicUsize,
    threads: Mutex<Vec<EventLoopThread>>,
    loops: Mutex<Vec<Arc<EventLoop>>>,
}

impl EventLoopThreadPool {
    pub fn new(base_loop: Arc<EventLoop>, name: String) -> EventLoopThreadPool {
        EventLoopThreadPool {
            base_loop,
            name,
            started: AtomicBool::new(false),
            num_threads: AtomicUsize::new(0),
            next: AtomicUsize::new(0),
            threads: Mutex::new(Vec::new()),
            loops: Mutex::new(Vec::new()),
        }
    }

    pub fn set_thread_num(&self, num_threads: usize) {
        self.num_threads.store(num_threads, Ordering::Release);
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawns the workers, waiting for each to publish its loop. May be
    /// called at most once.
    pub fn start(&self, init: Option<ThreadInitCallback>) -> io::Result<()> {
        self.base_loop.assert_in_loop_thread();
        let already = self.started.swap(true, Ordering::AcqRel);
        assert!(!already, "thread pool started twice");

        let num_threads = self.num_threads.load(Ordering::Acquire);

        for i in 0..num_threads {
            let mut thread = EventLoopThread::new(format!("{}{}", self.name, i), init.clone());
            let event_loop = thread.start_loop()?;
            self.threads.lock().unwrap().push(thread);
            self.loops.lock().unwrap().push(event_loop);
        }

        if num_threads == 0 {
            if let Some(init) = init {
                init(&self.base_loop);
            }
        }

        Ok(())
    }

    /// Next worker loop, round-robin; the base loop when the pool is empty.
    pub fn get_next_loop(&self) -> Arc<EventLoop> {
        self.base_loop.assert_in_loop_thread();
        let loops = self.loops.lock().unwrap();

        if loops.is_empty() {
            self.base_loop.clone()
        } else {
            let next = self.next.fetch_add(1, Ordering::Relaxed);
            loops[next % loops.len()].clone()
        }
    }

    pub fn get_all_loops(&self) -> Vec<Arc<EventLoop>> {
        let loops = self.loops.lock().unwrap();

        if loops.is_empty() {
            vec![self.base_loop.clone()]
        } else {
            loops.clone()
        }
    }
}
