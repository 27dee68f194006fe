use std::io::{self, Error, ErrorKind, IoSliceMut};
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::ptr;

use libc::{self, c_int, c_void};

use super::fd::FileDesc;

/// A non-blocking, close-on-exec TCP socket.
///
/// Every descriptor produced here (freshly created or accepted) carries
/// `SOCK_NONBLOCK | SOCK_CLOEXEC`; callers never have to fix up flags after
/// the fact.
#[derive(Debug)]
pub struct Socket(FileDesc);

impl Socket {
    pub fn new_stream(addr: &SocketAddr) -> io::Result<Socket> {
        let family = match *addr {
            SocketAddr::V4(..) => libc::AF_INET,
            SocketAddr::V6(..) => libc::AF_INET6,
        };

        let fd = syscall!(socket(
            family,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            libc::IPPROTO_TCP
        ))?;

        Ok(Socket(FileDesc::new(fd)))
    }

    pub fn bind(&self, addr: &SocketAddr) -> io::Result<()> {
        let (storage, len) = addr_to_raw(addr);
        syscall!(bind(
            self.raw(),
            &storage as *const _ as *const libc::sockaddr,
            len
        ))?;
        Ok(())
    }

    pub fn listen(&self) -> io::Result<()> {
        syscall!(listen(self.raw(), libc::SOMAXCONN))?;
        Ok(())
    }

    pub fn accept(&self) -> io::Result<(Socket, SocketAddr)> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of_val(&storage) as libc::socklen_t;

        let fd = syscall!(accept4(
            self.raw(),
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC
        ))?;

        let sock = Socket(FileDesc::new(fd));
        let addr = raw_to_addr(&storage, len as usize)?;

        Ok((sock, addr))
    }

    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }

    pub fn read_vectored(&self, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
        self.0.read_vectored(bufs)
    }

    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    /// Half-close: shuts down the write side, leaving the read side open.
    pub fn shutdown_write(&self) -> io::Result<()> {
        syscall!(shutdown(self.raw(), libc::SHUT_WR))?;
        Ok(())
    }

    pub fn set_reuse_addr(&self, on: bool) -> io::Result<()> {
        setsockopt(self, libc::SOL_SOCKET, libc::SO_REUSEADDR, on as c_int)
    }

    pub fn set_reuse_port(&self, on: bool) -> io::Result<()> {
        setsockopt(self, libc::SOL_SOCKET, libc::SO_REUSEPORT, on as c_int)
    }

    pub fn set_keepalive(&self, on: bool) -> io::Result<()> {
        setsockopt(self, libc::SOL_SOCKET, libc::SO_KEEPALIVE, on as c_int)
    }

    pub fn set_nodelay(&self, on: bool) -> io::Result<()> {
        setsockopt(self, libc::IPPROTO_TCP, libc::TCP_NODELAY, on as c_int)
    }

    /// Reads and clears the pending socket error, if any.
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        let raw: c_int = getsockopt(self, libc::SOL_SOCKET, libc::SO_ERROR)?;
        if raw == 0 {
            Ok(None)
        } else {
            Ok(Some(io::Error::from_raw_os_error(raw)))
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of_val(&storage) as libc::socklen_t;

        syscall!(getsockname(
            self.raw(),
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len
        ))?;

        raw_to_addr(&storage, len as usize)
    }

    fn raw(&self) -> RawFd {
        self.0.raw()
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.0.raw()
    }
}

impl FromRawFd for Socket {
    unsafe fn from_raw_fd(fd: RawFd) -> Socket {
        Socket(FileDesc::new(fd))
    }
}

fn setsockopt<T>(sock: &Socket, level: c_int, name: c_int, payload: T) -> io::Result<()> {
    let payload = &payload as *const T as *const c_void;
    syscall!(setsockopt(
        sock.raw(),
        level,
        name,
        payload,
        mem::size_of::<T>() as libc::socklen_t
    ))?;
    Ok(())
}

fn getsockopt<T: Copy>(sock: &Socket, level: c_int, name: c_int) -> io::Result<T> {
    let mut slot: T = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<T>() as libc::socklen_t;
    syscall!(getsockopt(
        sock.raw(),
        level,
        name,
        &mut slot as *mut _ as *mut _,
        &mut len
    ))?;
    assert_eq!(len as usize, mem::size_of::<T>());
    Ok(slot)
}

fn addr_to_raw(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };

    match *addr {
        SocketAddr::V4(ref a) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: a.port().to_be(),
                sin_addr: libc::in_addr {
                    // octets are already network order
                    s_addr: u32::from_ne_bytes(a.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                ptr::copy_nonoverlapping(
                    &sin as *const _ as *const u8,
                    &mut storage as *mut _ as *mut u8,
                    mem::size_of::<libc::sockaddr_in>(),
                );
            }
            (storage, mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(ref a) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: a.port().to_be(),
                sin6_flowinfo: a.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: a.ip().octets(),
                },
                sin6_scope_id: a.scope_id(),
            };
            unsafe {
                ptr::copy_nonoverlapping(
                    &sin6 as *const _ as *const u8,
                    &mut storage as *mut _ as *mut u8,
                    mem::size_of::<libc::sockaddr_in6>(),
                );
            }
            (storage, mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

fn raw_to_addr(storage: &libc::sockaddr_storage, len: usize) -> io::Result<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            assert!(len >= mem::size_of::<libc::sockaddr_in>());
            let sin = unsafe { *(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Ok(SocketAddr::V4(SocketAddrV4::new(
                ip,
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            assert!(len >= mem::size_of::<libc::sockaddr_in6>());
            let sin6 = unsafe { *(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Ok(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => Err(Error::new(ErrorKind::InvalidInput, "invalid address family")),
    }
}

#[cfg(test)]
mod test {
    use super::Socket;

    #[test]
    fn bind_and_local_addr() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let sock = Socket::new_stream(&addr).unwrap();
        sock.set_reuse_addr(true).unwrap();
        sock.bind(&addr).unwrap();

        let local = sock.local_addr().unwrap();
        assert_eq!(local.ip(), addr.ip());
        assert_ne!(local.port(), 0);
    }

    #[test]
    fn accept_would_block() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let sock = Socket::new_stream(&addr).unwrap();
        sock.bind(&addr).unwrap();
        sock.listen().unwrap();

        let err = sock.accept().unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
    }
}
