//! Capture-ring adapter (C1): bridges the capture card's driver -- an
//! external collaborator out of scope for this crate (§2) -- to a
//! `(bottom, top)` byte window the record walker can consume.
//!
//! The concrete [`MmapRing`] stands in for that driver in this crate: a
//! double-mapped anonymous ring so any `[bottom, bottom + available)` window
//! reads as one contiguous slice, the same trick the hardware's own mmap
//! region relies on, using the head/tail/fence discipline from the teacher's
//! ring buffer (see `ring_buffer.rs`).

use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Minimum bytes a stream thread waits for before returning a window to the
/// walker (§4.1, `DAG_POLL_MINDATA` in the original design).
pub const POLL_MINDATA: usize = 8000;
/// Longest a thread waits for `POLL_MINDATA` bytes before giving up and
/// returning whatever is available, in microseconds.
pub const POLL_MAXWAIT_US: u64 = 100_000;
/// Sleep granularity of the poll loop, in microseconds.
pub const POLL_FREQ_US: u64 = 10_000;

/// The driver side of the ring: a monotonically increasing head cursor over
/// a byte region, with a tail the consumer advances once it has finished
/// with a prefix (§4.1). Implementations never wrap `head`/`tail` -- callers
/// reduce by `capacity()` when indexing into `bytes()`.
pub trait RingSource: Send {
    fn capacity(&self) -> usize;
    /// Bytes made available by the driver so far.
    fn head(&self) -> u64;
    /// Tells the driver everything before `tail` has been consumed and may
    /// be overwritten.
    fn set_tail(&mut self, tail: u64);
    /// The double-mapped buffer: `bytes()[i % capacity()]` for any `i`.
    fn bytes(&self) -> &[u8];
}

/// Polls a [`RingSource`] for a record-walkable window and tracks the
/// consumer-side bottom cursor between calls (§4.1).
pub struct CaptureRing<S: RingSource> {
    source: S,
    bottom: u64,
}

impl<S: RingSource> CaptureRing<S> {
    pub fn new(source: S) -> Self {
        CaptureRing { source, bottom: 0 }
    }

    /// Blocks in a bounded sleep-poll loop until `min_data` bytes are
    /// available past the current bottom or `max_wait` elapses, then returns
    /// a `(bottom, top)` pair indexing into [`Self::window_bytes`]. Never
    /// returns an empty window unless the ring genuinely has nothing new.
    pub fn poll_window(&mut self, min_data: usize, max_wait: Duration) -> (usize, usize) {
        let deadline = Instant::now() + max_wait;
        loop {
            let head = self.source.head();
            let available = (head - self.bottom) as usize;
            if available >= min_data || Instant::now() >= deadline {
                let bottom = (self.bottom % self.source.capacity() as u64) as usize;
                return (bottom, bottom + available);
            }
            thread::sleep(Duration::from_micros(POLL_FREQ_US));
        }
    }

    /// The contiguous view `poll_window`'s offsets index into.
    pub fn window_bytes(&self) -> &[u8] {
        self.source.bytes()
    }

    /// Releases everything before `new_bottom` (an absolute offset returned
    /// by a prior `poll_window`, i.e. `bottom + consumed`) back to the
    /// driver.
    pub fn release(&mut self, new_bottom: usize) {
        let advance = new_bottom as u64 - (self.bottom % self.source.capacity() as u64);
        self.bottom += advance;
        self.source.set_tail(self.bottom);
    }
}

/// Anonymous, double-mapped ring used in place of a real capture card for
/// this crate's demonstration and tests. Backed by `memfd_create` + two
/// adjacent `mmap`s of the same pages, mirroring `ring_buffer.rs`'s use of
/// a raw `mmap`/`munmap`/fence discipline.
pub struct MmapRing {
    base: *mut u8,
    len: usize,
    capacity: usize,
    head: Arc<AtomicU64>,
    fd: RawFd,
}

unsafe impl Send for MmapRing {}

impl MmapRing {
    pub fn new(capacity: usize) -> Result<Self> {
        let page = page_size::get();
        let capacity = capacity.div_ceil(page) * page;

        let name = CString::new("telescope-multiplexer-ring").unwrap();
        let fd = unsafe { libc::memfd_create(name.as_ptr(), 0) };
        if fd < 0 {
            return Err(alloc_err("memfd_create failed"));
        }
        if unsafe { libc::ftruncate(fd, capacity as libc::off_t) } != 0 {
            unsafe { libc::close(fd) };
            return Err(alloc_err("ftruncate failed"));
        }

        let len = capacity * 2;
        let reservation = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if reservation == libc::MAP_FAILED {
            unsafe { libc::close(fd) };
            return Err(alloc_err("address space reservation failed"));
        }

        for offset in [0usize, capacity] {
            let at = unsafe { (reservation as *mut u8).add(offset) };
            let mapped = unsafe {
                libc::mmap(
                    at as *mut libc::c_void,
                    capacity,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED | libc::MAP_FIXED,
                    fd,
                    0,
                )
            };
            if mapped == libc::MAP_FAILED {
                unsafe {
                    libc::munmap(reservation, len);
                    libc::close(fd);
                }
                return Err(alloc_err("mirrored mapping failed"));
            }
        }

        Ok(MmapRing {
            base: reservation as *mut u8,
            len,
            capacity,
            head: Arc::new(AtomicU64::new(0)),
            fd,
        })
    }

    /// Driver-side append, used by tests standing in for the capture card.
    /// Writes are visible through both mirrored halves automatically.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        if data.len() > self.capacity {
            return Err(alloc_err("write larger than ring capacity"));
        }
        let head = self.head.load(Ordering::Relaxed);
        let offset = (head % self.capacity as u64) as usize;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.base.add(offset), data.len());
        }
        fence(Ordering::Release);
        self.head.store(head + data.len() as u64, Ordering::Release);
        Ok(())
    }
}

fn alloc_err(reason: &str) -> Error {
    log::error!("capture ring setup failed: {}", reason);
    Error::AllocationFailed { stream: 0 }
}

impl RingSource for MmapRing {
    fn capacity(&self) -> usize {
        self.capacity
    }

    fn head(&self) -> u64 {
        let head = self.head.load(Ordering::Acquire);
        fence(Ordering::Acquire);
        head
    }

    fn set_tail(&mut self, _tail: u64) {
        fence(Ordering::Release);
    }

    fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.base, self.len) }
    }
}

impl Drop for MmapRing {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.len);
            libc::close(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::KeepAll;
    use crate::record::{walk, IovecPool};
    use crate::stats::StreamStats;
    use pretty_assertions::assert_eq;

    fn record(body_len: usize) -> Vec<u8> {
        let rlen = (4 + body_len) as u16;
        let mut buf = Vec::with_capacity(rlen as usize);
        buf.extend_from_slice(&rlen.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend(std::iter::repeat_n(0xCDu8, body_len));
        buf
    }

    #[test]
    fn window_mirrors_across_the_wrap_point() {
        let ring = MmapRing::new(4096).unwrap();
        let tail_probe = b"tail-bytes";
        let head_probe = b"head-bytes";
        // Fill up to a few bytes before the wrap, then write past it.
        ring.write(&vec![0u8; ring.capacity - 5]).unwrap();
        ring.write(tail_probe).unwrap();
        ring.write(head_probe).unwrap();

        let mut cap = CaptureRing::new(ring);
        let (bottom, top) = cap.poll_window(1, Duration::from_millis(1));
        let window = cap.window_bytes();
        assert!(top > bottom);
        // The probes land exactly at the wrap boundary; the mirrored mapping
        // must present them contiguously regardless.
        assert_eq!(&window[top - head_probe.len()..top], head_probe);
    }

    #[test]
    fn poll_window_feeds_the_walker() {
        let ring = MmapRing::new(8192).unwrap();
        let recs: Vec<Vec<u8>> = (0..5).map(|_| record(96)).collect();
        for r in &recs {
            ring.write(r).unwrap();
        }

        let mut cap = CaptureRing::new(ring);
        let (bottom, top) = cap.poll_window(1, Duration::from_millis(5));
        let window = cap.window_bytes().to_vec();

        let mut pool = IovecPool::new();
        let stats = StreamStats::default();
        let filter = KeepAll;
        let outcome = walk(&window, bottom, top, 1368, Some(&filter), &mut pool, &stats).unwrap();
        assert_eq!(outcome.record_count, 5);

        cap.release(outcome.new_bottom);
        let (bottom2, top2) = cap.poll_window(1, Duration::from_millis(5));
        assert_eq!(bottom2, top2, "nothing new was written");
    }

    #[test]
    fn poll_window_gives_up_after_max_wait() {
        let ring = MmapRing::new(4096).unwrap();
        ring.write(&record(16)).unwrap();
        let mut cap = CaptureRing::new(ring);
        let started = Instant::now();
        let (bottom, top) = cap.poll_window(POLL_MINDATA, Duration::from_millis(20));
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert!(top - bottom < POLL_MINDATA);
    }
}
