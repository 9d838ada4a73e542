//! Per-connection I/O buffer.
//!
//! A contiguous byte region split into three zones by two indices:
//! `[0, read_index)` is consumed/prependable headroom, `[read_index,
//! write_index)` is readable, `[write_index, capacity)` is writable. The
//! first 8 bytes are reserved so short protocol headers can be prepended
//! in place without sliding data.
//!
//! Filling from a socket goes through a gathered `readv` with a 64 KiB
//! stack scratch as the second segment, which bounds kernel entries per
//! call no matter how lazily the buffer grows.

use bytes::Bytes;
use std::io;
use std::os::unix::io::RawFd;
use tracing::error;

/// Headroom reserved at the front for cheap prepends.
const CHEAP_PREPEND: usize = 8;

/// Initial writable capacity beyond the prepend reserve.
const INITIAL_SIZE: usize = 1024;

/// Size of the stack scratch used by [`Buffer::fill_from`].
const EXTRA_BUF_SIZE: usize = 65536;

const CRLF: &[u8] = b"\r\n";

/// Growable read/write buffer with cheap-prepend headroom.
///
/// Exclusively owned by its connection; one instance for input, one for
/// output. All methods are total except `prepend`, which logs and drops
/// the data when the headroom is insufficient.
pub struct Buffer {
    storage: Vec<u8>,
    read_index: usize,
    write_index: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Buffer {
    /// Create a buffer with the default initial capacity.
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_SIZE)
    }

    /// Create a buffer with a specific initial writable capacity.
    pub fn with_capacity(initial_size: usize) -> Self {
        Self {
            storage: vec![0u8; CHEAP_PREPEND + initial_size],
            read_index: CHEAP_PREPEND,
            write_index: CHEAP_PREPEND,
        }
    }

    /// Number of readable bytes.
    pub fn readable_bytes(&self) -> usize {
        self.write_index - self.read_index
    }

    /// Number of writable bytes at the tail.
    pub fn writable_bytes(&self) -> usize {
        self.storage.len() - self.write_index
    }

    /// Headroom in front of the readable zone (includes the reserve).
    pub fn prependable_bytes(&self) -> usize {
        self.read_index
    }

    /// View of the readable zone.
    pub fn peek(&self) -> &[u8] {
        &self.storage[self.read_index..self.write_index]
    }

    /// Find the first CRLF in the readable zone.
    ///
    /// Returns the offset of the `\r` relative to [`Buffer::peek`].
    pub fn find_crlf(&self) -> Option<usize> {
        self.peek().windows(CRLF.len()).position(|w| w == CRLF)
    }

    /// Find the first `\n` in the readable zone, relative to [`Buffer::peek`].
    pub fn find_eol(&self) -> Option<usize> {
        self.peek().iter().position(|&b| b == b'\n')
    }

    /// Consume `len` readable bytes.
    ///
    /// Consuming everything resets both indices to the reserve so an empty
    /// buffer always has its full capacity writable again.
    pub fn retrieve(&mut self, len: usize) {
        if len < self.readable_bytes() {
            self.read_index += len;
        } else {
            self.retrieve_all();
        }
    }

    /// Consume all readable bytes.
    pub fn retrieve_all(&mut self) {
        self.read_index = CHEAP_PREPEND;
        self.write_index = CHEAP_PREPEND;
    }

    /// Consume up to `len` bytes and return them as a string.
    ///
    /// Non-UTF-8 input is replaced lossily.
    pub fn retrieve_as_string(&mut self, len: usize) -> String {
        let len = len.min(self.readable_bytes());
        let result = String::from_utf8_lossy(&self.peek()[..len]).into_owned();
        self.retrieve(len);
        result
    }

    /// Consume all readable bytes and return them as a string.
    pub fn retrieve_all_as_string(&mut self) -> String {
        self.retrieve_as_string(self.readable_bytes())
    }

    /// Consume all readable bytes and return them as `Bytes`.
    pub fn retrieve_all_as_bytes(&mut self) -> Bytes {
        let result = Bytes::copy_from_slice(self.peek());
        self.retrieve_all();
        result
    }

    /// Append data at the tail, growing or compacting as needed.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.storage[self.write_index..self.write_index + data.len()].copy_from_slice(data);
        self.has_written(data.len());
    }

    /// Make sure at least `len` bytes are writable at the tail.
    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
    }

    /// Advance the write index after filling the writable zone directly.
    pub fn has_written(&mut self, len: usize) {
        debug_assert!(len <= self.writable_bytes());
        self.write_index += len;
    }

    /// Write data into the headroom in front of the readable zone.
    ///
    /// With more data than headroom this is a precondition violation: it is
    /// logged and the buffer is left untouched.
    pub fn prepend(&mut self, data: &[u8]) {
        if data.len() > self.prependable_bytes() {
            error!(
                len = data.len(),
                prependable = self.prependable_bytes(),
                "buffer prepend rejected: not enough headroom"
            );
            return;
        }
        self.read_index -= data.len();
        self.storage[self.read_index..self.read_index + data.len()].copy_from_slice(data);
    }

    /// Fill the buffer from a descriptor with one gathered read.
    ///
    /// The second segment is a 64 KiB stack scratch; any overflow past the
    /// writable zone is appended afterwards. `Ok(0)` means EOF.
    pub fn fill_from(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extra = [0u8; EXTRA_BUF_SIZE];
        let writable = self.writable_bytes();

        let mut iov = [
            libc::iovec {
                iov_base: self.storage[self.write_index..].as_mut_ptr() as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extra.as_mut_ptr() as *mut libc::c_void,
                iov_len: extra.len(),
            },
        ];
        let iovcnt = if writable < extra.len() { 2 } else { 1 };

        let n = unsafe { libc::readv(fd, iov.as_mut_ptr(), iovcnt) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        let n = n as usize;
        if n <= writable {
            self.write_index += n;
        } else {
            self.write_index = self.storage.len();
            self.append(&extra[..n - writable]);
        }
        Ok(n)
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + CHEAP_PREPEND {
            self.storage.resize(self.write_index + len, 0);
        } else {
            // Enough total room: slide the readable zone back to the reserve.
            let readable = self.readable_bytes();
            self.storage
                .copy_within(self.read_index..self.write_index, CHEAP_PREPEND);
            self.read_index = CHEAP_PREPEND;
            self.write_index = self.read_index + readable;
        }
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        assert!(CHEAP_PREPEND <= self.read_index);
        assert!(self.read_index <= self.write_index);
        assert!(self.write_index <= self.storage.len());
    }
}
