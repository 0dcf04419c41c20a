//! Bounded byte queue for protocol input.
//!
//! Accumulates partially-received data, hands out complete lines from the
//! front, and compacts leftovers. Grows on demand but never past its cap, so
//! a server that streams garbage without a newline cannot balloon memory;
//! hitting the cap without a terminator is the caller's "line too long"
//! error.

/// Step by which the backing storage grows toward the cap.
const GROW_CHUNK: usize = 4096;

#[derive(Debug)]
pub struct LineBuffer {
    buf: Vec<u8>,
    len: usize,
    cap: usize,
}

impl LineBuffer {
    pub fn new(cap: usize) -> Self {
        assert!(cap > 0);
        Self {
            buf: Vec::new(),
            len: 0,
            cap,
        }
    }

    /// Writable spare room, growing the backing storage if needed.
    /// Empty exactly when the buffer is at its cap.
    pub fn space(&mut self) -> &mut [u8] {
        if self.len == self.buf.len() && self.buf.len() < self.cap {
            let new_len = (self.buf.len() + GROW_CHUNK).min(self.cap);
            self.buf.resize(new_len, 0);
        }
        &mut self.buf[self.len..]
    }

    /// Mark `n` bytes of [`space`](Self::space) as filled.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(self.len + n <= self.buf.len());
        self.len += n;
    }

    /// Buffered bytes.
    pub fn data(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True once the buffer holds `cap` bytes and cannot take more.
    pub fn is_full(&self) -> bool {
        self.len >= self.cap
    }

    /// Drop `n` bytes from the front, shifting the remainder down.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.len);
        self.buf.copy_within(n..self.len, 0);
        self.len -= n;
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Take one LF-terminated line off the front, trimming any trailing CRs.
    /// Returns `None` when no full line is buffered yet. Non-UTF-8 bytes are
    /// replaced; header values we care about are ASCII anyway.
    pub fn take_line(&mut self) -> Option<String> {
        let nl = self.data().iter().position(|&b| b == b'\n')?;
        let mut end = nl;
        while end > 0 && self.buf[end - 1] == b'\r' {
            end -= 1;
        }
        let line = String::from_utf8_lossy(&self.buf[..end]).into_owned();
        self.consume(nl + 1);
        Some(line)
    }
}
