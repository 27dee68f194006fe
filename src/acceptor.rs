use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::sys::{FileDesc, Socket};

pub type NewConnectionCallback = Arc<dyn Fn(Socket, SocketAddr) + Send + Sync>;

/// Listening socket plus the accept-ready channel on the base loop.
///
/// On read readiness the acceptor drains the accept queue and hands each
/// accepted socket (already non-blocking and close-on-exec) with its peer
/// address to the registered callback.
pub struct Acceptor {
    event_loop: Arc<EventLoop>,
    socket: Socket,
    channel: Arc<Channel>,
    new_connection: Mutex<Option<NewConnectionCallback>>,
    listening: AtomicBool,
    // reserve descriptor, spent and restored to shed connections under EMFILE
    idle_fd: Mutex<Option<FileDesc>>,
}

impl Acceptor {
    pub fn new(
        event_loop: &Arc<EventLoop>,
        listen_addr: &SocketAddr,
        reuse_port: bool,
    ) -> io::Result<Arc<Acceptor>> {
        let socket = Socket::new_stream(listen_addr)?;
        socket.set_reuse_addr(true)?;
        if reuse_port {
            socket.set_reuse_port(true)?;
        }
        socket.bind(listen_addr)?;

        let idle_fd = open_idle_fd()?;
        let channel = Arc::new(Channel::new(Arc::downgrade(event_loop), socket.as_raw_fd()));

        let acceptor = Arc::new(Acceptor {
            event_loop: event_loop.clone(),
            socket,
            channel,
            new_connection: Mutex::new(None),
            listening: AtomicBool::new(false),
            idle_fd: Mutex::new(Some(idle_fd)),
        });

        let weak = Arc::downgrade(&acceptor);
        acceptor.channel.set_read_callback(move |_| {
            if let Some(acceptor) = weak.upgrade() {
                acceptor.handle_read();
            }
        });

        Ok(acceptor)
    }

    pub fn set_new_connection_callback(&self, cb: impl Fn(Socket, SocketAddr) + Send + Sync + 'static) {
        *self.new_connection.lock().unwrap() = Some(Arc::new(cb));
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    /// Address the listening socket is actually bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Marks the socket listening and arms read interest on the base loop.
    pub fn listen(self: &Arc<Self>) -> io::Result<()> {
        self.event_loop.assert_in_loop_thread();
        self.socket.listen()?;
        self.listening.store(true, Ordering::Release);
        self.channel.enable_reading();
        Ok(())
    }

    fn handle_read(&self) {
        self.event_loop.assert_in_loop_thread();

        loop {
            match self.socket.accept() {
                Ok((socket, peer_addr)) => {
                    trace!("accepted connection from {}", peer_addr);
                    let cb = self.new_connection.lock().unwrap().clone();
                    match cb {
                        Some(cb) => cb(socket, peer_addr),
                        None => drop(socket),
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e)
                    if e.raw_os_error() == Some(libc::EMFILE)
                        || e.raw_os_error() == Some(libc::ENFILE) =>
                {
                    error!("accept: file descriptors exhausted");
                    self.shed_connection();
                    break;
                }
                Err(e) => {
                    error!("accept error: {}", e);
                    break;
                }
            }
        }
    }

    /// Frees the reserve descriptor, accepts the pending connection so the
    /// peer sees an orderly close instead of the listen queue spinning the
    /// loop forever, then restores the reserve.
    fn shed_connection(&self) {
        let mut idle = self.idle_fd.lock().unwrap();
        idle.take();

        if let Ok((socket, peer_addr)) = self.socket.accept() {
            warn!("out of file descriptors, closing connection from {}", peer_addr);
            drop(socket);
        }

        match open_idle_fd() {
            Ok(fd) => *idle = Some(fd),
            Err(e) => error!("failed to restore reserve descriptor: {}", e),
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.channel.disable_all();
        self.channel.remove();
    }
}

fn open_idle_fd() -> io::Result<FileDesc> {
    let fd = syscall!(open(
        b"/dev/null\0".as_ptr() as *const libc::c_char,
        libc::O_RDONLY | libc::O_CLOEXEC
    ))?;
    Ok(FileDesc::new(fd))
}
