use std::io::{self, IoSliceMut};

use crate::sys::Socket;

const CHEAP_PREPEND: usize = 8;
const INITIAL_SIZE: usize = 1024;

/// Growable byte queue used for per-connection input and output.
///
/// Layout:
///
/// ```text
/// +-------------------+------------------+------------------+
/// | prependable bytes |  readable bytes  |  writable bytes  |
/// +-------------------+------------------+------------------+
/// 0      <=      reader_index   <=   writer_index   <=   capacity
/// ```
///
/// The prependable region starts out `CHEAP_PREPEND` bytes wide so a length
/// or header prefix can be prepended in O(1) after the payload has been
/// appended. Reading retrieves from the front, appending extends the back;
/// when both indices meet, they reset to `CHEAP_PREPEND`.
pub struct Buffer {
    buf: Vec<u8>,
    reader_index: usize,
    writer_index: usize,
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer {
            buf: vec![0; CHEAP_PREPEND + INITIAL_SIZE],
            reader_index: CHEAP_PREPEND,
            writer_index: CHEAP_PREPEND,
        }
    }

    pub fn readable_bytes(&self) -> usize {
        self.writer_index - self.reader_index
    }

    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.writer_index
    }

    pub fn prependable_bytes(&self) -> usize {
        self.reader_index
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// The readable region, without consuming it.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.reader_index..self.writer_index]
    }

    /// Consumes `len` readable bytes.
    pub fn retrieve(&mut self, len: usize) {
        if len < self.readable_bytes() {
            self.reader_index += len;
        } else {
            self.retrieve_all();
        }
    }

    pub fn retrieve_all(&mut self) {
        self.reader_index = CHEAP_PREPEND;
        self.writer_index = CHEAP_PREPEND;
    }

    /// Consumes `len` readable bytes and returns them as an owned vector.
    pub fn retrieve_as_vec(&mut self, len: usize) -> Vec<u8> {
        let len = len.min(self.readable_bytes());
        let data = self.peek()[..len].to_vec();
        self.retrieve(len);
        data
    }

    pub fn retrieve_all_as_vec(&mut self) -> Vec<u8> {
        self.retrieve_as_vec(self.readable_bytes())
    }

    pub fn retrieve_all_as_string(&mut self) -> String {
        String::from_utf8_lossy(&self.retrieve_all_as_vec()).into_owned()
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable_bytes(data.len());
        self.buf[self.writer_index..self.writer_index + data.len()].copy_from_slice(data);
        self.writer_index += data.len();
    }

    /// Writes `data` immediately in front of the readable region.
    ///
    /// Panics if the prependable region is smaller than `data`.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(data.len() <= self.prependable_bytes());
        self.reader_index -= data.len();
        self.buf[self.reader_index..self.reader_index + data.len()].copy_from_slice(data);
    }

    pub fn ensure_writable_bytes(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + CHEAP_PREPEND {
            self.buf.resize(self.writer_index + len, 0);
        } else {
            // compact: move readable bytes up against the cheap-prepend mark
            let readable = self.readable_bytes();
            self.buf
                .copy_within(self.reader_index..self.writer_index, CHEAP_PREPEND);
            self.reader_index = CHEAP_PREPEND;
            self.writer_index = CHEAP_PREPEND + readable;
        }
    }

    /// Reads from `socket` directly into the buffer with a single scattered
    /// read. A 64 KiB stack extension catches whatever does not fit in the
    /// writable region, so short reads never force the heap to grow.
    pub fn read_socket(&mut self, socket: &Socket) -> io::Result<usize> {
        let mut extrabuf = [0u8; 65536];
        let writable = self.writable_bytes();

        let n = {
            let (_, tail) = self.buf.split_at_mut(self.writer_index);
            let mut iovs = [IoSliceMut::new(tail), IoSliceMut::new(&mut extrabuf)];
            socket.read_vectored(&mut iovs)?
        };

        if n <= writable {
            self.writer_index += n;
        } else {
            self.writer_index = self.buf.len();
            self.append(&extrabuf[..n - writable]);
        }

        Ok(n)
    }
}

impl Default for Buffer {
    fn default() -> Buffer {
        Buffer::new()
    }
}

#[cfg(test)]
mod test {
    use super::{Buffer, CHEAP_PREPEND, INITIAL_SIZE};

    #[test]
    fn append_retrieve() {
        let mut buf = Buffer::new();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);

        let data = vec![b'x'; 200];
        buf.append(&data);
        assert_eq!(buf.readable_bytes(), 200);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE - 200);

        let out = buf.retrieve_as_vec(50);
        assert_eq!(out.len(), 50);
        assert_eq!(buf.readable_bytes(), 150);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND + 50);

        let rest = buf.retrieve_all_as_vec();
        assert_eq!(rest, vec![b'x'; 150]);
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
    }

    #[test]
    fn readable_size_restored_after_roundtrip() {
        let mut buf = Buffer::new();
        buf.append(b"leftover");
        let before = buf.readable_bytes();

        buf.append(b"hello world");
        let _ = buf.retrieve_as_vec(b"hello world".len());

        // the drained bytes come off the front, so the same byte count remains
        assert_eq!(buf.readable_bytes(), before);
    }

    #[test]
    fn index_invariant() {
        let mut buf = Buffer::new();
        buf.append(&vec![b'a'; 700]);
        buf.retrieve(100);
        buf.append(&vec![b'b'; 600]);

        assert_eq!(
            buf.prependable_bytes() + buf.readable_bytes() + buf.writable_bytes(),
            buf.capacity()
        );
    }

    #[test]
    fn grow() {
        let mut buf = Buffer::new();
        buf.append(&vec![b'y'; INITIAL_SIZE + 300]);
        assert_eq!(buf.readable_bytes(), INITIAL_SIZE + 300);
        assert!(buf.capacity() >= CHEAP_PREPEND + INITIAL_SIZE + 300);
    }

    #[test]
    fn compact_instead_of_grow() {
        let mut buf = Buffer::new();
        buf.append(&vec![b'z'; 800]);
        buf.retrieve(600);

        let cap = buf.capacity();
        buf.append(&vec![b'w'; 500]);

        // 200 readable + 500 new fit after compaction, no reallocation
        assert_eq!(buf.capacity(), cap);
        assert_eq!(buf.readable_bytes(), 700);
    }

    #[test]
    fn prepend() {
        let mut buf = Buffer::new();
        buf.append(b"payload");

        let len = (b"payload".len() as u32).to_be_bytes();
        buf.prepend(&len);

        assert_eq!(buf.readable_bytes(), 4 + 7);
        assert_eq!(&buf.peek()[..4], &len);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND - 4);
    }
}
