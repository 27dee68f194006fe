use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::buffer::Buffer;
use crate::callbacks::{
    CloseCallback, ConnectionCallback, HighWaterMarkCallback, MessageCallback, TcpConnectionPtr,
    WriteCompleteCallback,
};
use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::sys::Socket;

const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Disconnecting = 3,
}

#[derive(Default)]
struct Callbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<WriteCompleteCallback>,
    high_water_mark: Option<HighWaterMarkCallback>,
    close: Option<CloseCallback>,
}

/// One accepted TCP connection, bound to a worker loop.
///
/// The connection is shared: the server's map holds one strong reference and
/// every in-flight callback or posted task holds another, so it stays alive
/// until [`connect_destroyed`](TcpConnection::connect_destroyed) has run on
/// its loop. Its channel holds only a weak tie.
///
/// All state transitions and buffer mutation happen on the worker loop;
/// [`send`](TcpConnection::send) and [`shutdown`](TcpConnection::shutdown)
/// may be called from any thread and post themselves over when needed.
pub struct TcpConnection {
    event_loop: Arc<EventLoop>,
    name: String,
    state: AtomicUsize,
    socket: Socket,
    channel: Arc<Channel>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    callbacks: Mutex<Callbacks>,
    high_water_mark: AtomicUsize,
    input_buffer: Mutex<Buffer>,
    output_buffer: Mutex<Buffer>,
}

impl TcpConnection {
    pub fn new(
        event_loop: Arc<EventLoop>,
        name: String,
        socket: Socket,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> TcpConnectionPtr {
        if let Err(e) = socket.set_keepalive(true) {
            warn!("connection {}: enabling keepalive failed: {}", name, e);
        }

        let fd = socket.as_raw_fd();
        let channel = Arc::new(Channel::new(Arc::downgrade(&event_loop), fd));
        debug!("connection {} created, fd = {}", name, fd);

        let conn = Arc::new(TcpConnection {
            event_loop,
            name,
            state: AtomicUsize::new(State::Connecting as usize),
            socket,
            channel,
            local_addr,
            peer_addr,
            callbacks: Mutex::new(Callbacks::default()),
            high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
            input_buffer: Mutex::new(Buffer::new()),
            output_buffer: Mutex::new(Buffer::new()),
        });

        let weak = Arc::downgrade(&conn);
        conn.channel.set_read_callback(move |receive_time| {
            if let Some(conn) = weak.upgrade() {
                conn.handle_read(receive_time);
            }
        });

        let weak = Arc::downgrade(&conn);
        conn.channel.set_write_callback(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_write();
            }
        });

        let weak = Arc::downgrade(&conn);
        conn.channel.set_close_callback(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_close();
            }
        });

        let weak = Arc::downgrade(&conn);
        conn.channel.set_error_callback(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_error();
            }
        });

        conn
    }

    pub fn get_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn connected(&self) -> bool {
        self.state() == State::Connected
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        self.callbacks.lock().unwrap().connection = Some(cb);
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        self.callbacks.lock().unwrap().message = Some(cb);
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        self.callbacks.lock().unwrap().write_complete = Some(cb);
    }

    pub fn set_high_water_mark_callback(&self, cb: HighWaterMarkCallback, mark: usize) {
        self.high_water_mark.store(mark, Ordering::Release);
        self.callbacks.lock().unwrap().high_water_mark = Some(cb);
    }

    pub fn set_close_callback(&self, cb: CloseCallback) {
        self.callbacks.lock().unwrap().close = Some(cb);
    }

    pub fn set_tcp_nodelay(&self, on: bool) {
        if let Err(e) = self.socket.set_nodelay(on) {
            warn!("connection {}: TCP_NODELAY failed: {}", self.name, e);
        }
    }

    /// Queues `data` for delivery to the peer.
    ///
    /// May be called from any thread. Off the loop thread the payload is
    /// copied into an owned buffer and the write is posted, so the caller's
    /// slice is never captured beyond this call.
    pub fn send(self: &Arc<Self>, data: &[u8]) {
        if self.state() != State::Connected {
            return;
        }

        if self.event_loop.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let conn = self.clone();
            let data = data.to_vec();
            self.event_loop.run_in_loop(move || conn.send_in_loop(&data));
        }
    }

    /// Closes the write side once pending output has drained.
    ///
    /// The read side stays open; the connection finishes tearing down when
    /// the peer closes its end.
    pub fn shutdown(self: &Arc<Self>) {
        if self.state() == State::Connected {
            self.set_state(State::Disconnecting);
            let conn = self.clone();
            self.event_loop.run_in_loop(move || conn.shutdown_in_loop());
        }
    }

    /// Completes establishment on the worker loop: ties the channel, arms
    /// read interest and reports the connection up.
    pub fn connect_established(self: &Arc<Self>) {
        self.event_loop.assert_in_loop_thread();
        assert_eq!(self.state(), State::Connecting);
        self.set_state(State::Connected);

        self.channel.tie(self);
        self.channel.enable_reading();

        if let Some(cb) = self.connection_callback() {
            cb(self);
        }
    }

    /// Final teardown on the worker loop; removes the channel from the
    /// poller. After this returns the last strong reference may be dropped.
    pub fn connect_destroyed(self: &Arc<Self>) {
        self.event_loop.assert_in_loop_thread();

        if self.state() == State::Connected {
            self.set_state(State::Disconnected);
            self.channel.disable_all();

            if let Some(cb) = self.connection_callback() {
                cb(self);
            }
        }

        self.channel.remove();
    }

    fn handle_read(self: &Arc<Self>, receive_time: Instant) {
        self.event_loop.assert_in_loop_thread();

        let result = {
            let mut input = self.input_buffer.lock().unwrap();
            input.read_socket(&self.socket)
        };

        match result {
            Ok(0) => self.handle_close(),
            Ok(_) => {
                if let Some(cb) = self.message_callback() {
                    let mut input = self.input_buffer.lock().unwrap();
                    cb(self, &mut input, receive_time);
                }
            }
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                error!("connection {}: read error: {}", self.name, e);
                self.handle_error();
                self.handle_close();
            }
        }
    }

    fn handle_write(self: &Arc<Self>) {
        self.event_loop.assert_in_loop_thread();

        if !self.channel.is_writing() {
            trace!("connection {} is down, no more writing", self.name);
            return;
        }

        let mut output = self.output_buffer.lock().unwrap();
        match self.socket.write(output.peek()) {
            Ok(n) => {
                output.retrieve(n);
                if output.readable_bytes() == 0 {
                    drop(output);
                    self.channel.disable_writing();

                    if let Some(cb) = self.write_complete_callback() {
                        let conn = self.clone();
                        self.event_loop.queue_in_loop(move || cb(&conn));
                    }

                    if self.state() == State::Disconnecting {
                        self.shutdown_in_loop();
                    }
                }
            }
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                drop(output);
                error!("connection {}: write error: {}", self.name, e);
                self.handle_error();
            }
        }
    }

    /// Delivered at most once; later close events on an already-closed
    /// connection are ignored.
    fn handle_close(self: &Arc<Self>) {
        self.event_loop.assert_in_loop_thread();

        match self.state() {
            State::Connected | State::Disconnecting => {}
            _ => return,
        }

        trace!(
            "connection {} fd = {} closing",
            self.name,
            self.socket.as_raw_fd()
        );
        self.set_state(State::Disconnected);
        self.channel.disable_all();

        if let Some(cb) = self.connection_callback() {
            cb(self);
        }
        // the server turns this into removeConnection
        if let Some(cb) = self.close_callback() {
            cb(self);
        }
    }

    fn handle_error(&self) {
        match self.socket.take_error() {
            Ok(Some(e)) => error!("connection {}: SO_ERROR = {}", self.name, e),
            Ok(None) => {}
            Err(e) => error!("connection {}: failed to read SO_ERROR: {}", self.name, e),
        }
    }

    fn send_in_loop(self: &Arc<Self>, data: &[u8]) {
        self.event_loop.assert_in_loop_thread();

        if self.state() == State::Disconnected {
            warn!("connection {}: disconnected, give up writing", self.name);
            return;
        }

        let len = data.len();
        let mut nwrote = 0;
        let mut remaining = len;
        let mut fault = false;

        let mut output = self.output_buffer.lock().unwrap();

        // fast path: nothing queued and write interest off, try the fd once
        if !self.channel.is_writing() && output.readable_bytes() == 0 {
            match self.socket.write(data) {
                Ok(n) => {
                    nwrote = n;
                    remaining = len - n;

                    if remaining == 0 {
                        if let Some(cb) = self.write_complete_callback() {
                            let conn = self.clone();
                            self.event_loop.queue_in_loop(move || cb(&conn));
                        }
                    }
                }
                Err(ref e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    error!("connection {}: send error: {}", self.name, e);
                    if e.raw_os_error() == Some(libc::EPIPE)
                        || e.raw_os_error() == Some(libc::ECONNRESET)
                    {
                        fault = true;
                    }
                }
            }
        }

        if !fault && remaining > 0 {
            let old_len = output.readable_bytes();
            let mark = self.high_water_mark.load(Ordering::Acquire);

            if old_len + remaining >= mark && old_len < mark {
                if let Some(cb) = self.high_water_mark_callback() {
                    let conn = self.clone();
                    let size = old_len + remaining;
                    self.event_loop.queue_in_loop(move || cb(&conn, size));
                }
            }

            output.append(&data[nwrote..]);
            if !self.channel.is_writing() {
                self.channel.enable_writing();
            }
        }
    }

    fn shutdown_in_loop(&self) {
        self.event_loop.assert_in_loop_thread();

        // write interest still on means the output buffer has not drained;
        // handle_write performs the half-close once it empties
        if !self.channel.is_writing() {
            if let Err(e) = self.socket.shutdown_write() {
                error!("connection {}: shutdown error: {}", self.name, e);
            }
        }
    }

    fn state(&self) -> State {
        match self.state.load(Ordering::Acquire) {
            0 => State::Disconnected,
            1 => State::Connecting,
            2 => State::Connected,
            _ => State::Disconnecting,
        }
    }

    fn set_state(&self, state: State) {
        self.state.store(state as usize, Ordering::Release);
    }

    fn connection_callback(&self) -> Option<ConnectionCallback> {
        self.callbacks.lock().unwrap().connection.clone()
    }

    fn message_callback(&self) -> Option<MessageCallback> {
        self.callbacks.lock().unwrap().message.clone()
    }

    fn write_complete_callback(&self) -> Option<WriteCompleteCallback> {
        self.callbacks.lock().unwrap().write_complete.clone()
    }

    fn high_water_mark_callback(&self) -> Option<HighWaterMarkCallback> {
        self.callbacks.lock().unwrap().high_water_mark.clone()
    }

    fn close_callback(&self) -> Option<CloseCallback> {
        self.callbacks.lock().unwrap().close.clone()
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        debug!(
            "connection {} destroyed, fd = {}",
            self.name,
            self.socket.as_raw_fd()
        );
    }
}
