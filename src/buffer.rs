//! Per-direction data buffer: a fixed-capacity byte ring plus the flags and
//! timestamps the stream interface and session layer hang off it.
//!
//! Preallocated, fixed capacity, split into contiguous slices for vectored
//! I/O rather than copying on every read or write.

use crate::time::Tick;

/// A circular byte buffer with a fixed capacity set at construction.
///
/// `read_shut`/`write_shut` record which end of the pipe this buffer feeds
/// has been closed (the producer will send no more bytes; the consumer will
/// accept no more bytes), `send_max` is the forwarding watermark a caller
/// sets to bound how much of the buffered data should be pushed downstream
/// in one turn, and `sticky_read`/`sticky_write` latch "this buffer became
/// readable/writable at least once since last consumed" across several
/// speculative poll turns the way a stuck edge-triggered event would.
pub struct Buffer {
    data: Vec<u8>,
    head: usize,
    len: usize,
    read_shut: bool,
    write_shut: bool,
    send_max: usize,
    read_expire: Option<Tick>,
    write_expire: Option<Tick>,
    sticky_read: bool,
    sticky_write: bool,
}

impl Buffer {
    pub fn with_capacity(capacity: usize) -> Buffer {
        Buffer {
            data: vec![0; capacity],
            head: 0,
            len: 0,
            read_shut: false,
            write_shut: false,
            send_max: 0,
            read_expire: None,
            write_expire: None,
            sticky_read: false,
            sticky_write: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    pub fn available(&self) -> usize {
        self.capacity() - self.len
    }

    fn tail(&self) -> usize {
        let cap = self.capacity();
        if cap == 0 {
            0
        } else {
            (self.head + self.len) % cap
        }
    }

    /// The readable data as up to two contiguous slices, in order, for a
    /// vectored write out to a socket without an intermediate copy.
    pub fn data_slices(&self) -> (&[u8], &[u8]) {
        let cap = self.capacity();
        if cap == 0 || self.len == 0 {
            return (&[], &[]);
        }
        let first_len = (cap - self.head).min(self.len);
        let first = &self.data[self.head..self.head + first_len];
        let second_len = self.len - first_len;
        (first, &self.data[..second_len])
    }

    /// The writable spare space as up to two contiguous slices, for reading
    /// directly from a socket into the buffer without an intermediate copy.
    pub fn spare_slices(&mut self) -> (&mut [u8], &mut [u8]) {
        let cap = self.capacity();
        let avail = self.available();
        if cap == 0 || avail == 0 {
            return (&mut [], &mut []);
        }
        let tail = self.tail();
        let first_len = (cap - tail).min(avail);
        let second_len = avail - first_len;
        let (head_part, tail_part) = self.data.split_at_mut(tail);
        let (first, _) = tail_part.split_at_mut(first_len);
        let second = &mut head_part[..second_len];
        (first, second)
    }

    /// Commit `n` bytes written into the slices returned by
    /// [`Buffer::spare_slices`].
    pub fn commit_write(&mut self, n: usize) {
        debug_assert!(n <= self.available());
        self.len += n;
    }

    /// Copy `src` into the buffer, wrapping around the ring as needed.
    /// Returns the number of bytes actually copied (bounded by available
    /// space).
    pub fn write(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.available());
        if n == 0 {
            return n;
        }
        let cap = self.capacity();
        let tail = self.tail();
        let first = (cap - tail).min(n);
        self.data[tail..tail + first].copy_from_slice(&src[..first]);
        if first < n {
            self.data[..n - first].copy_from_slice(&src[first..n]);
        }
        self.len += n;
        n
    }

    /// Copy out up to `dst.len()` bytes without consuming them.
    pub fn peek(&self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.len);
        if n == 0 {
            return n;
        }
        let cap = self.capacity();
        let first = (cap - self.head).min(n);
        dst[..first].copy_from_slice(&self.data[self.head..self.head + first]);
        if first < n {
            dst[first..n].copy_from_slice(&self.data[..n - first]);
        }
        n
    }

    /// Advance past `n` already-consumed bytes without copying.
    pub fn skip(&mut self, n: usize) {
        let n = n.min(self.len);
        let cap = self.capacity();
        if cap > 0 {
            self.head = (self.head + n) % cap;
        }
        self.len -= n;
    }

    /// Copy out and consume up to `dst.len()` bytes.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        let n = self.peek(dst);
        self.skip(n);
        n
    }

    pub fn shut_read(&mut self) {
        self.read_shut = true;
    }

    pub fn shut_write(&mut self) {
        self.write_shut = true;
    }

    pub fn is_read_shut(&self) -> bool {
        self.read_shut
    }

    pub fn is_write_shut(&self) -> bool {
        self.write_shut
    }

    pub fn set_send_max(&mut self, n: usize) {
        self.send_max = n;
    }

    pub fn send_max(&self) -> usize {
        self.send_max
    }

    pub fn set_read_expire(&mut self, tick: Option<Tick>) {
        self.read_expire = tick;
    }

    pub fn read_expire(&self) -> Option<Tick> {
        self.read_expire
    }

    pub fn set_write_expire(&mut self, tick: Option<Tick>) {
        self.write_expire = tick;
    }

    pub fn write_expire(&self) -> Option<Tick> {
        self.write_expire
    }

    pub fn fold_sticky(&mut self, readable: bool, writable: bool) {
        self.sticky_read |= readable;
        self.sticky_write |= writable;
    }

    /// Read and clear the read-side sticky bit.
    pub fn take_sticky_read(&mut self) -> bool {
        std::mem::take(&mut self.sticky_read)
    }

    /// Read and clear the write-side sticky bit.
    pub fn take_sticky_write(&mut self) -> bool {
        std::mem::take(&mut self.sticky_write)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_read_round_trip() {
        let mut buf = Buffer::with_capacity(8);
        assert_eq!(buf.write(b"hello"), 5);
        assert_eq!(buf.len(), 5);
        let mut out = [0u8; 5];
        assert_eq!(buf.read(&mut out), 5);
        assert_eq!(&out, b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn wraps_around_the_ring() {
        let mut buf = Buffer::with_capacity(4);
        assert_eq!(buf.write(b"ab"), 2);
        let mut out = [0u8; 1];
        buf.read(&mut out);
        assert_eq!(buf.write(b"cde"), 3);
        let mut rest = [0u8; 4];
        let n = buf.read(&mut rest);
        assert_eq!(n, 4);
        assert_eq!(&rest, b"bcde");
    }

    #[test]
    fn write_is_bounded_by_available_space() {
        let mut buf = Buffer::with_capacity(4);
        assert_eq!(buf.write(b"abcdef"), 4);
        assert!(buf.is_full());
        assert_eq!(buf.available(), 0);
    }

    #[test]
    fn sticky_bits_latch_until_taken() {
        let mut buf = Buffer::with_capacity(4);
        buf.fold_sticky(true, false);
        buf.fold_sticky(false, true);
        assert!(buf.take_sticky_read());
        assert!(buf.take_sticky_write());
        assert!(!buf.take_sticky_read());
    }
}
