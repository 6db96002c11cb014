//! Fixed-capacity circular byte buffer
//!
//! The relay path moves bytes between sockets and staging buffers without
//! intermediate copies: the two wraparound segments are exposed as slices
//! (`as_slices`/`spare_slices_mut`) with explicit `consume`/`commit`, and
//! the socket-facing variants feed those segments straight into vectored
//! non-blocking reads and writes.

use std::io::{self, IoSlice, IoSliceMut};
use tokio::net::TcpStream;

/// Circular byte queue. Not thread safe; callers guard it.
///
/// Bulk operations transfer `min(requested, available)` and return the
/// actual count. They never fail partially and never block.
pub struct RingBuffer {
    buf: Box<[u8]>,
    ptr: usize,
    used: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            ptr: 0,
            used: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn free(&self) -> usize {
        self.buf.len() - self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    pub fn is_full(&self) -> bool {
        self.used == self.buf.len()
    }

    /// Store one byte. Returns false when full.
    pub fn put_byte(&mut self, b: u8) -> bool {
        if self.is_full() {
            return false;
        }
        let w = (self.ptr + self.used) % self.buf.len();
        self.buf[w] = b;
        self.used += 1;
        true
    }

    /// Take one byte. Returns None when empty.
    pub fn get_byte(&mut self) -> Option<u8> {
        if self.used == 0 {
            return None;
        }
        let b = self.buf[self.ptr];
        self.ptr = (self.ptr + 1) % self.buf.len();
        self.used -= 1;
        Some(b)
    }

    /// Copy bytes in; returns how many fit.
    pub fn put(&mut self, src: &[u8]) -> usize {
        let (a, b) = self.spare_slices_mut();
        let n = src.len().min(a.len() + b.len());
        let first = n.min(a.len());
        a[..first].copy_from_slice(&src[..first]);
        b[..n - first].copy_from_slice(&src[first..n]);
        self.commit(n);
        n
    }

    /// Copy bytes out; returns how many were available.
    pub fn get(&mut self, dst: &mut [u8]) -> usize {
        let n;
        {
            let (a, b) = self.as_slices();
            n = dst.len().min(a.len() + b.len());
            let first = n.min(a.len());
            dst[..first].copy_from_slice(&a[..first]);
            dst[first..n].copy_from_slice(&b[..n - first]);
        }
        self.consume(n);
        n
    }

    /// Readable content as up to two segments, in order.
    pub fn as_slices(&self) -> (&[u8], &[u8]) {
        if self.used == 0 {
            return (&[], &[]);
        }
        let first = self.used.min(self.buf.len() - self.ptr);
        (
            &self.buf[self.ptr..self.ptr + first],
            &self.buf[..self.used - first],
        )
    }

    /// Discard `n` bytes from the front. `n` must not exceed `used`.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.used);
        self.ptr = (self.ptr + n) % self.buf.len();
        self.used -= n;
    }

    /// Writable free space as up to two segments, in order.
    pub fn spare_slices_mut(&mut self) -> (&mut [u8], &mut [u8]) {
        let cap = self.buf.len();
        let free = cap - self.used;
        if free == 0 {
            return (&mut [], &mut []);
        }
        let w = (self.ptr + self.used) % cap;
        let first = free.min(cap - w);
        if free == first {
            (&mut self.buf[w..w + first], &mut [])
        } else {
            let (head, tail) = self.buf.split_at_mut(w);
            let second = free - first;
            (&mut tail[..first], &mut head[..second])
        }
    }

    /// Mark `n` bytes of spare space as written. `n` must not exceed `free`.
    pub fn commit(&mut self, n: usize) {
        debug_assert!(n <= self.free());
        self.used += n;
    }

    /// Fill the ring from a socket without an intermediate copy, reading at
    /// most `max` bytes. Uses non-blocking I/O: `Err(WouldBlock)` means the
    /// socket was not ready, `Ok(0)` means EOF (callers must not invoke
    /// this with a zero budget or a full ring).
    pub fn read_from(&mut self, socket: &TcpStream, max: usize) -> io::Result<usize> {
        let n = {
            let (a, b) = self.spare_slices_mut();
            let first = a.len().min(max);
            let second = b.len().min(max - first);
            let mut bufs = [
                IoSliceMut::new(&mut a[..first]),
                IoSliceMut::new(&mut b[..second]),
            ];
            socket.try_read_vectored(&mut bufs)?
        };
        self.commit(n);
        Ok(n)
    }

    /// Drain the ring into a socket without an intermediate copy.
    /// `Err(WouldBlock)` means the socket was not ready.
    pub fn write_to(&mut self, socket: &TcpStream) -> io::Result<usize> {
        let n = {
            let (a, b) = self.as_slices();
            let bufs = [IoSlice::new(a), IoSlice::new(b)];
            socket.try_write_vectored(&bufs)?
        };
        self.consume(n);
        Ok(n)
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.buf.len())
            .field("used", &self.used)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, RngCore, SeedableRng};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    /// Random interleaving of puts and gets (10% single-byte ops) must
    /// round-trip the data in order, with used + free == capacity held
    /// throughout.
    fn round_trip(datalen: usize, bufcap: usize, seed: u64) {
        let mut rng = StdRng::seed_from_u64(bufcap as u64 + datalen as u64 + seed);
        let mut ring = RingBuffer::new(bufcap);
        let mut indata = vec![0u8; datalen];
        rng.fill_bytes(&mut indata);
        let mut outdata = vec![0u8; datalen];
        let mut inptr = 0;
        let mut outptr = 0;

        while outptr < datalen {
            assert_eq!(ring.used() + ring.free(), bufcap);
            if rng.gen_bool(0.5) && inptr < datalen {
                if rng.gen_range(0..10) < 1 && !ring.is_full() {
                    assert!(ring.put_byte(indata[inptr]));
                    inptr += 1;
                } else {
                    let size = rng.gen_range(0..bufcap + bufcap / 10 + 1).min(datalen - inptr);
                    let expected = size.min(ring.free());
                    let copied = ring.put(&indata[inptr..inptr + size]);
                    assert_eq!(copied, expected);
                    inptr += copied;
                }
            } else if rng.gen_range(0..10) < 1 && !ring.is_empty() {
                outdata[outptr] = ring.get_byte().unwrap();
                outptr += 1;
            } else {
                let size = rng.gen_range(0..bufcap + bufcap / 10 + 1).min(datalen - outptr);
                let expected = size.min(ring.used());
                let copied = ring.get(&mut outdata[outptr..outptr + size]);
                assert_eq!(copied, expected);
                outptr += copied;
            }
        }

        assert!(ring.is_empty());
        assert_eq!(indata, outdata);
    }

    #[test]
    fn test_round_trip_tiny_buffer() {
        round_trip(10000, 5, 1);
    }

    #[test]
    fn test_round_trip_odd_sizes() {
        round_trip(2015, 11, 1);
    }

    #[test]
    fn test_round_trip_medium() {
        round_trip(100000, 99, 2);
    }

    #[test]
    fn test_round_trip_large_buffer() {
        round_trip(100000, 1600, 3);
    }

    #[test]
    fn test_single_byte_ops() {
        let mut ring = RingBuffer::new(2);
        assert!(ring.put_byte(1));
        assert!(ring.put_byte(2));
        assert!(!ring.put_byte(3));
        assert!(ring.is_full());
        assert_eq!(ring.get_byte(), Some(1));
        assert!(ring.put_byte(3));
        assert_eq!(ring.get_byte(), Some(2));
        assert_eq!(ring.get_byte(), Some(3));
        assert_eq!(ring.get_byte(), None);
    }

    #[test]
    fn test_slices_wrap_around() {
        let mut ring = RingBuffer::new(8);
        assert_eq!(ring.put(b"abcdef"), 6);
        let mut tmp = [0u8; 4];
        assert_eq!(ring.get(&mut tmp), 4);
        // content "ef" at offsets 4..6; spare wraps 6..8 then 0..4
        assert_eq!(ring.put(b"ghijkl"), 6);
        let (a, b) = ring.as_slices();
        assert_eq!(a, b"efgh");
        assert_eq!(b, b"ijkl");
        let (sa, sb) = ring.spare_slices_mut();
        assert!(sa.is_empty() && sb.is_empty());
    }

    #[test]
    fn test_commit_consume() {
        let mut ring = RingBuffer::new(16);
        {
            let (a, _) = ring.spare_slices_mut();
            a[..3].copy_from_slice(b"xyz");
        }
        ring.commit(3);
        assert_eq!(ring.used(), 3);
        let (a, _) = ring.as_slices();
        assert_eq!(a, b"xyz");
        ring.consume(2);
        assert_eq!(ring.used(), 1);
        let (a, _) = ring.as_slices();
        assert_eq!(a, b"z");
    }

    #[tokio::test]
    async fn test_socket_transfer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut sender = TcpStream::connect(addr).await.unwrap();
        let (receiver, _) = listener.accept().await.unwrap();

        sender.write_all(b"hello ring").await.unwrap();
        sender.flush().await.unwrap();

        let mut ring = RingBuffer::new(6);
        let mut collected = Vec::new();
        while collected.len() < 10 {
            receiver.readable().await.unwrap();
            match ring.read_from(&receiver, ring.free().max(1)) {
                Ok(0) => break,
                Ok(_) => {
                    let mut tmp = [0u8; 16];
                    let n = ring.get(&mut tmp);
                    collected.extend_from_slice(&tmp[..n]);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => panic!("read_from: {}", e),
            }
        }
        assert_eq!(&collected, b"hello ring");
    }
}
