//! A multi-threaded, event-driven TCP server library built on the
//! one-loop-per-thread reactor pattern.
//!
//! A [`TcpServer`] accepts on a base [`EventLoop`] and deals connections out
//! to a pool of worker loops round-robin. Each connection's I/O, buffering
//! and lifecycle are driven by epoll readiness notifications on its worker
//! loop; user code reacts through callbacks and may talk back to a
//! connection from any thread.
//!
//! ## Usage
//!
//! First, add this to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! hive-net = "0.1"
//! ```
//!
//! # Example
//!
//! An echo server with four worker loops:
//!
//! ```no_run
//! use std::sync::Arc;
//! use hive_net::{EventLoop, TcpServer, TcpServerOption};
//!
//! let addr = "127.0.0.1:7000".parse().unwrap();
//!
//! let event_loop = EventLoop::new().unwrap();
//! let server = TcpServer::new(&event_loop, &addr, "echo",
//!                             TcpServerOption::NoReusePort).unwrap();
//!
//! server.set_thread_num(4);
//! server.set_message_callback(Arc::new(|conn, buffer, _receive_time| {
//!     let data = buffer.retrieve_all_as_vec();
//!     conn.send(&data);
//! }));
//!
//! server.start().unwrap();
//! event_loop.run();
//! ```

#[macro_use]
extern crate log;

#[macro_use]
mod sys;

mod acceptor;
mod buffer;
mod callbacks;
mod channel;
mod connection;
mod event_loop;
mod event_loop_thread;
mod poller;
mod ready;
mod server;
mod thread_pool;
mod waker;

pub use acceptor::{Acceptor, NewConnectionCallback};
pub use buffer::Buffer;
pub use callbacks::{
    CloseCallback, ConnectionCallback, HighWaterMarkCallback, MessageCallback, TcpConnectionPtr,
    ThreadInitCallback, WriteCompleteCallback,
};
pub use channel::Channel;
pub use connection::TcpConnection;
pub use event_loop::EventLoop;
pub use event_loop_thread::EventLoopThread;
pub use poller::Poller;
pub use ready::Ready;
pub use server::{TcpServer, TcpServerOption};
pub use sys::Socket;
pub use thread_pool::EventLoopThreadPool;
pub use waker::Waker;
