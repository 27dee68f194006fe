use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use hive_net::EventLoop;

fn spawn_loop() -> (Arc<EventLoop>, thread::JoinHandle<Duration>) {
    let (tx, rx) = mpsc::channel();

    let handle = thread::spawn(move || {
        let event_loop = EventLoop::new().unwrap();
        tx.send(event_loop.clone()).unwrap();

        let start = Instant::now();
        event_loop.run();
        start.elapsed()
    });

    let event_loop = rx.recv().unwrap();
    (event_loop, handle)
}

#[test]
fn one_loop_per_thread() {
    let event_loop = EventLoop::new().unwrap();
    assert!(EventLoop::new().is_err());

    drop(event_loop);
    assert!(EventLoop::new().is_ok());
}

#[test]
fn run_in_loop_runs_inline_on_owner_thread() {
    let event_loop = EventLoop::new().unwrap();

    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();
    event_loop.run_in_loop(move || flag.store(true, Ordering::Release));

    // inline, without the loop ever running
    assert!(ran.load(Ordering::Acquire));
}

#[test]
fn quit_from_other_thread_returns_promptly() {
    let (event_loop, handle) = spawn_loop();

    // let the loop block in poll
    thread::sleep(Duration::from_millis(100));
    event_loop.quit();

    let elapsed = handle.join().unwrap();
    // the wakeup must beat the 10 s poll timeout by a wide margin
    assert!(elapsed < Duration::from_secs(5), "loop took {:?} to quit", elapsed);
}

#[test]
fn tasks_run_in_posting_order() {
    let (event_loop, handle) = spawn_loop();

    let order = Arc::new(Mutex::new(Vec::new()));

    for i in 0..100 {
        let order = order.clone();
        event_loop.queue_in_loop(move || order.lock().unwrap().push(i));
    }

    let quitter = event_loop.clone();
    event_loop.queue_in_loop(move || quitter.quit());
    handle.join().unwrap();

    assert_eq!(*order.lock().unwrap(), (0..100).collect::<Vec<_>>());
}

#[test]
fn task_enqueued_during_drain_is_seen_promptly() {
    let (event_loop, handle) = spawn_loop();

    thread::sleep(Duration::from_millis(100));
    let start = Instant::now();

    // the outer task runs in the drain phase; the follow-up it enqueues must
    // wake the loop instead of waiting out the next poll timeout
    let outer = event_loop.clone();
    event_loop.queue_in_loop(move || {
        let inner = outer.clone();
        outer.queue_in_loop(move || inner.quit());
    });

    handle.join().unwrap();
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[test]
fn poll_return_time_advances() {
    let (event_loop, handle) = spawn_loop();

    thread::sleep(Duration::from_millis(100));
    let first = event_loop.poll_return_time();

    let quitter = event_loop.clone();
    event_loop.queue_in_loop(move || quitter.quit());
    handle.join().unwrap();

    assert!(event_loop.poll_return_time() >= first);
}
