use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use indexmap::IndexMap;

use crate::acceptor::Acceptor;
use crate::callbacks::{
    default_connection_callback, default_message_callback, ConnectionCallback, MessageCallback,
    TcpConnectionPtr, ThreadInitCallback, WriteCompleteCallback,
};
use crate::connection::TcpConnection;
use crate::event_loop::EventLoop;
use crate::sys::Socket;
use crate::thread_pool::EventLoopThreadPool;

/// Whether the listening socket sets `SO_REUSEPORT`. `SO_REUSEADDR` is
/// always set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TcpServerOption {
    NoReusePort,
    ReusePort,
}

/// Facade composing the acceptor on the base loop with a pool of worker
/// loops.
///
/// Register callbacks and a worker count, then [`start`](TcpServer::start)
/// and run the base loop. Each accepted connection is handed to the next
/// worker round-robin; the server's connection map keeps it alive until its
/// close callback routes back here for removal.
pub struct TcpServer {
    inner: Arc<Inner>,
}

struct Inner {
    event_loop: Arc<EventLoop>,
    ip_port: String,
    name: String,
    acceptor: Arc<Acceptor>,
    thread_pool: EventLoopThreadPool,
    connection_callback: Mutex<Option<ConnectionCallback>>,
    message_callback: Mutex<Option<MessageCallback>>,
    write_complete_callback: Mutex<Option<WriteCompleteCallback>>,
    thread_init_callback: Mutex<Option<ThreadInitCallback>>,
    started: AtomicBool,
    next_conn_id: AtomicU64,
    connections: Mutex<IndexMap<String, TcpConnectionPtr>>,
}

impl TcpServer {
    pub fn new(
        event_loop: &Arc<EventLoop>,
        listen_addr: &SocketAddr,
        name: &str,
        option: TcpServerOption,
    ) -> io::Result<TcpServer> {
        let acceptor = Acceptor::new(
            event_loop,
            listen_addr,
            option == TcpServerOption::ReusePort,
        )?;

        let inner = Arc::new(Inner {
            event_loop: event_loop.clone(),
            ip_port: listen_addr.to_string(),
            name: name.to_string(),
            acceptor,
            thread_pool: EventLoopThreadPool::new(event_loop.clone(), name.to_string()),
            connection_callback: Mutex::new(None),
            message_callback: Mutex::new(None),
            write_complete_callback: Mutex::new(None),
            thread_init_callback: Mutex::new(None),
            started: AtomicBool::new(false),
            next_conn_id: AtomicU64::new(1),
            connections: Mutex::new(IndexMap::new()),
        });

        let weak = Arc::downgrade(&inner);
        inner
            .acceptor
            .set_new_connection_callback(move |socket, peer_addr| {
                if let Some(server) = weak.upgrade() {
                    server.new_connection(socket, peer_addr);
                }
            });

        Ok(TcpServer { inner })
    }

    pub fn event_loop(&self) -> &Arc<EventLoop> {
        &self.inner.event_loop
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn ip_port(&self) -> &str {
        &self.inner.ip_port
    }

    /// Address the acceptor is actually bound to; useful after binding
    /// port 0.
    pub fn listen_addr(&self) -> io::Result<SocketAddr> {
        self.inner.acceptor.local_addr()
    }

    /// Number of worker loops. Zero (the default) keeps all I/O on the base
    /// loop. Must be set before [`start`](TcpServer::start).
    pub fn set_thread_num(&self, num_threads: usize) {
        self.inner.thread_pool.set_thread_num(num_threads);
    }

    pub fn set_thread_init_callback(&self, cb: ThreadInitCallback) {
        *self.inner.thread_init_callback.lock().unwrap() = Some(cb);
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        *self.inner.connection_callback.lock().unwrap() = Some(cb);
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        *self.inner.message_callback.lock().unwrap() = Some(cb);
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        *self.inner.write_complete_callback.lock().unwrap() = Some(cb);
    }

    /// Starts the worker pool and posts `listen` to the base loop. Calling
    /// it again is a no-op.
    pub fn start(&self) -> io::Result<()> {
        if !self.inner.started.swap(true, Ordering::AcqRel) {
            let init = self.inner.thread_init_callback.lock().unwrap().clone();
            self.inner.thread_pool.start(init)?;

            let acceptor = self.inner.acceptor.clone();
            let ip_port = self.inner.ip_port.clone();
            self.inner.event_loop.run_in_loop(move || {
                // bind/listen failure is construction-fatal
                if let Err(e) = acceptor.listen() {
                    panic!("listen on {} failed: {}", ip_port, e);
                }
            });
        }

        Ok(())
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        let connections: Vec<TcpConnectionPtr> = {
            let mut map = self.inner.connections.lock().unwrap();
            map.drain(..).map(|(_, conn)| conn).collect()
        };

        for conn in connections {
            let task_conn = conn.clone();
            conn.get_loop()
                .run_in_loop(move || task_conn.connect_destroyed());
        }
    }
}

impl Inner {
    fn new_connection(self: &Arc<Self>, socket: Socket, peer_addr: SocketAddr) {
        self.event_loop.assert_in_loop_thread();

        let io_loop = self.thread_pool.get_next_loop();
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn_name = format!("{}-{}#{}", self.name, self.ip_port, conn_id);

        info!(
            "server {}: new connection [{}] from {}",
            self.name, conn_name, peer_addr
        );

        // capture the local address by value now; the fd may be gone by the
        // time anyone asks
        let local_addr = socket.local_addr().unwrap_or_else(|e| {
            error!("server {}: getsockname failed: {}", self.name, e);
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
        });

        let conn = TcpConnection::new(
            io_loop.clone(),
            conn_name.clone(),
            socket,
            local_addr,
            peer_addr,
        );

        self.connections
            .lock()
            .unwrap()
            .insert(conn_name, conn.clone());

        let connection_cb = self
            .connection_callback
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| Arc::new(default_connection_callback));
        conn.set_connection_callback(connection_cb);

        let message_cb = self
            .message_callback
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| Arc::new(default_message_callback));
        conn.set_message_callback(message_cb);

        if let Some(cb) = self.write_complete_callback.lock().unwrap().clone() {
            conn.set_write_complete_callback(cb);
        }

        let weak = Arc::downgrade(self);
        conn.set_close_callback(Arc::new(move |conn: &TcpConnectionPtr| {
            if let Some(server) = weak.upgrade() {
                server.remove_connection(conn);
            }
        }));

        let task_conn = conn.clone();
        io_loop.run_in_loop(move || task_conn.connect_established());
    }

    /// Callable from any worker loop; hops to the base loop where the
    /// connection map lives.
    fn remove_connection(self: &Arc<Self>, conn: &TcpConnectionPtr) {
        let server = self.clone();
        let conn = conn.clone();
        self.event_loop
            .run_in_loop(move || server.remove_connection_in_loop(&conn));
    }

    fn remove_connection_in_loop(&self, conn: &TcpConnectionPtr) {
        self.event_loop.assert_in_loop_thread();

        info!(
            "server {}: removing connection {}",
            self.name,
            conn.name()
        );

        self.connections.lock().unwrap().swap_remove(conn.name());

        // the posted task keeps the connection alive until the channel has
        // been removed on its own loop
        let task_conn = conn.clone();
        conn.get_loop()
            .queue_in_loop(move || task_conn.connect_destroyed());
    }
}
