//! Growable byte buffer with read/write cursors.

use std::io;
use std::os::unix::io::RawFd;

/// Reserved space in front of the readable region, so a length or header
/// can be prepended without shifting the payload.
const PREPEND: usize = 8;
/// Initial tail capacity.
const INITIAL: usize = 1024;
/// Stack spillover used by [`Buffer::read_fd`].
const EXTRA: usize = 64 * 1024;

/// A contiguous byte buffer.
///
/// ```text
/// +-------------+------------------+------------------+
/// | prependable |     readable     |     writable     |
/// +-------------+------------------+------------------+
/// 0          read_pos           write_pos         data.len()
/// ```
///
/// Bytes in `[read_pos, write_pos)` are readable. Growing compacts the
/// consumed front before resizing.
#[derive(Debug)]
pub struct Buffer {
    data: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer {
            data: vec![0; PREPEND + INITIAL],
            read_pos: PREPEND,
            write_pos: PREPEND,
        }
    }

    pub fn readable_bytes(&self) -> usize {
        self.write_pos - self.read_pos
    }

    pub fn writable_bytes(&self) -> usize {
        self.data.len() - self.write_pos
    }

    pub fn prependable_bytes(&self) -> usize {
        self.read_pos
    }

    /// The readable region, without consuming it.
    pub fn peek(&self) -> &[u8] {
        &self.data[self.read_pos..self.write_pos]
    }

    /// Consume `n` readable bytes.
    pub fn retrieve(&mut self, n: usize) {
        debug_assert!(n <= self.readable_bytes());
        if n < self.readable_bytes() {
            self.read_pos += n;
        } else {
            self.retrieve_all();
        }
    }

    pub fn retrieve_all(&mut self) {
        self.read_pos = PREPEND;
        self.write_pos = PREPEND;
    }

    /// Consume and return the whole readable region.
    pub fn take(&mut self) -> Vec<u8> {
        let bytes = self.peek().to_vec();
        self.retrieve_all();
        bytes
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.ensure_writable(bytes.len());
        self.data[self.write_pos..self.write_pos + bytes.len()].copy_from_slice(bytes);
        self.write_pos += bytes.len();
    }

    /// Write into the prepend region, in front of the readable bytes.
    pub fn prepend(&mut self, bytes: &[u8]) {
        assert!(bytes.len() <= self.prependable_bytes());
        self.read_pos -= bytes.len();
        self.data[self.read_pos..self.read_pos + bytes.len()].copy_from_slice(bytes);
    }

    fn ensure_writable(&mut self, n: usize) {
        if self.writable_bytes() >= n {
            return;
        }
        if self.writable_bytes() + self.prependable_bytes() >= n + PREPEND {
            // Enough slack overall: compact the consumed front.
            let readable = self.readable_bytes();
            self.data.copy_within(self.read_pos..self.write_pos, PREPEND);
            self.read_pos = PREPEND;
            self.write_pos = PREPEND + readable;
        } else {
            self.data.resize(self.write_pos + n, 0);
        }
    }

    /// Scatter-read from `fd` into the writable tail plus a stack
    /// spillover, so one syscall drains whatever the kernel has buffered.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extra = [0u8; EXTRA];
        let writable = self.writable_bytes();

        let mut iov = [
            libc::iovec {
                iov_base: self.data[self.write_pos..].as_mut_ptr() as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extra.as_mut_ptr() as *mut libc::c_void,
                iov_len: EXTRA,
            },
        ];
        let iovcnt = if writable < EXTRA { 2 } else { 1 };

        let n = syscall!(readv(fd, iov.as_mut_ptr(), iovcnt))? as usize;
        if n <= writable {
            self.write_pos += n;
        } else {
            self.write_pos = self.data.len();
            self.append(&extra[..n - writable]);
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_retrieve() {
        let mut buf = Buffer::new();
        assert_eq!(buf.readable_bytes(), 0);

        buf.append(b"hello world");
        assert_eq!(buf.readable_bytes(), 11);
        assert_eq!(buf.peek(), b"hello world");

        buf.retrieve(6);
        assert_eq!(buf.peek(), b"world");
        assert_eq!(buf.take(), b"world");
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.prependable_bytes(), PREPEND);
    }

    #[test]
    fn grows_past_initial_capacity() {
        let mut buf = Buffer::new();
        let payload = vec![0xA5u8; INITIAL * 3];
        buf.append(&payload);
        assert_eq!(buf.peek(), payload.as_slice());
    }

    #[test]
    fn compacts_before_growing() {
        let mut buf = Buffer::new();
        buf.append(&vec![1u8; INITIAL]);
        buf.retrieve(INITIAL - 16);

        // 16 readable bytes left; this fits after compaction without
        // reallocating the backing store.
        let capacity = buf.data.len();
        buf.append(&vec![2u8; INITIAL - 32]);
        assert_eq!(buf.data.len(), capacity);
        assert_eq!(buf.readable_bytes(), 16 + INITIAL - 32);
        assert_eq!(buf.prependable_bytes(), PREPEND);
    }

    #[test]
    fn prepend_uses_reserved_space() {
        let mut buf = Buffer::new();
        buf.append(b"payload");
        buf.prepend(&7u32.to_be_bytes());
        assert_eq!(buf.peek(), [&7u32.to_be_bytes()[..], b"payload"].concat());
    }

    #[test]
    fn read_fd_drains_a_pipe() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (rd, wr) = (fds[0], fds[1]);

        let payload = vec![0x5Au8; INITIAL + 512];
        let n = unsafe {
            libc::write(
                wr,
                payload.as_ptr() as *const libc::c_void,
                payload.len(),
            )
        };
        assert_eq!(n as usize, payload.len());

        let mut buf = Buffer::new();
        let read = buf.read_fd(rd).unwrap();
        assert_eq!(read, payload.len());
        assert_eq!(buf.peek(), payload.as_slice());

        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
    }
}
