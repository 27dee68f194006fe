use std::fs::File;
use std::io::{self, IoSliceMut, Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

/// Owned file descriptor. Closes on drop.
#[derive(Debug)]
pub struct FileDesc(File);

impl FileDesc {
    /// Takes ownership of `fd`; the descriptor must not be closed elsewhere.
    pub fn new(fd: RawFd) -> FileDesc {
        FileDesc(unsafe { File::from_raw_fd(fd) })
    }

    pub fn raw(&self) -> RawFd {
        self.0.as_raw_fd()
    }

    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.0).read(buf)
    }

    pub fn read_vectored(&self, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
        (&self.0).read_vectored(bufs)
    }

    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        (&self.0).write(buf)
    }

    pub fn read_exact(&self, buf: &mut [u8]) -> io::Result<()> {
        (&self.0).read_exact(buf)
    }

    pub fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        (&self.0).write_all(buf)
    }
}

impl AsRawFd for FileDesc {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}
