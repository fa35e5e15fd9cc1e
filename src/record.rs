//! Record framing and the record walker (C2): parses per-record headers out
//! of a capture window, enforces the per-datagram size budget, and fills an
//! [`IovecPool`] slot per run of kept records.

use crate::error::{Error, Result};
use crate::filter::{Decision, RecordFilter};
use crate::stats::StreamStats;

/// Size in bytes of the fixed per-record framing header: a 16-bit record
/// length followed by a 16-bit hardware loss counter, both network byte
/// order, mirroring the ERF record header this system walks.
pub const RECORD_HEADER_LEN: usize = 4;

/// The fixed framing header prefixing every captured record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// Total length of the record (header + body), in bytes.
    pub rlen: u16,
    /// Hardware loss counter; non-zero means records were dropped by the
    /// capture card before this one and the stream must halt (§4.2b).
    pub lctr: u16,
}

impl RecordHeader {
    /// Parses a header from the front of `buf`. `buf` must be at least
    /// [`RECORD_HEADER_LEN`] bytes; the walker only calls this once it has
    /// confirmed that much is available.
    pub fn parse(buf: &[u8]) -> RecordHeader {
        debug_assert!(buf.len() >= RECORD_HEADER_LEN);
        RecordHeader {
            rlen: u16::from_be_bytes([buf[0], buf[1]]),
            lctr: u16::from_be_bytes([buf[2], buf[3]]),
        }
    }
}

/// A `(base_offset, length)` slice into the current capture window. Bases
/// are offsets rather than raw pointers so the pool stays safe to build
/// before the window's backing slice is borrowed for publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Iovec {
    pub base: usize,
    pub len: usize,
}

impl Iovec {
    fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Up to eight simultaneous destination classes per outgoing bundle;
/// `DAG_COLOR_SLOTS` below. No bit set means "drop".
pub const DAG_COLOR_SLOTS: usize = 8;

bitflags::bitflags! {
    /// 8-bit bit-field tagging an output iovec bundle with destination
    /// classes (§3). Each bit corresponds to one of the eight sink slots a
    /// worker may export to.
    #[derive(Default)]
    pub struct Color: u8 {
        const SINK_0 = 0b0000_0001;
        const SINK_1 = 0b0000_0010;
        const SINK_2 = 0b0000_0100;
        const SINK_3 = 0b0000_1000;
        const SINK_4 = 0b0001_0000;
        const SINK_5 = 0b0010_0000;
        const SINK_6 = 0b0100_0000;
        const SINK_7 = 0b1000_0000;
    }
}

/// The per-worker, per-datagram iovec pool: an ordered sequence of slices
/// into the current capture window, grown in amortised steps rather than
/// reallocated mid-build (a previously recorded iovec base must stay valid
/// until `push` on the publisher completes -- see design notes in §9).
#[derive(Debug, Default)]
pub struct IovecPool {
    slots: Vec<Iovec>,
    /// Index of the iovec currently being filled.
    cur: usize,
}

const POOL_GROWTH_STEP: usize = 10;

impl IovecPool {
    pub fn new() -> Self {
        let mut pool = IovecPool {
            slots: Vec::with_capacity(POOL_GROWTH_STEP),
            cur: 0,
        };
        pool.slots.push(Iovec::default());
        pool
    }

    /// Resets the pool for a fresh walk, keeping the underlying allocation.
    fn reset(&mut self) {
        self.cur = 0;
        self.slots.truncate(1);
        self.slots[0] = Iovec::default();
    }

    fn current_mut(&mut self) -> &mut Iovec {
        &mut self.slots[self.cur]
    }

    /// Closes the current iovec (if non-empty) and advances to a fresh one,
    /// growing the backing storage by [`POOL_GROWTH_STEP`] at slot-count
    /// boundaries only -- never while a base pointer from this batch is
    /// still referenced by an in-flight build.
    fn advance_slot(&mut self) -> Result<()> {
        self.cur += 1;
        if self.cur == self.slots.len() {
            if self.slots.len() >= DAG_COLOR_SLOTS * POOL_GROWTH_STEP {
                return Err(Error::AllocationFailed { stream: 0 });
            }
            self.slots
                .resize(self.slots.len() + POOL_GROWTH_STEP, Iovec::default());
        }
        self.slots[self.cur] = Iovec::default();
        Ok(())
    }

    /// Slices in use by the most recent walk, in order.
    pub fn filled(&self) -> &[Iovec] {
        let used = if self.slots[self.cur].is_empty() {
            self.cur
        } else {
            self.cur + 1
        };
        &self.slots[..used]
    }
}

/// Outcome of one call to [`walk`]: the unconsumed suffix start and how many
/// records were folded into the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkOutcome {
    pub new_bottom: usize,
    pub record_count: u16,
    /// Set when the walker observed a non-zero hardware loss counter and the
    /// caller must halt the stream (§4.2b, invariant in §3).
    pub loss_detected: Option<u16>,
}

/// Walks `window[bottom..top]`, filling `pool` with iovecs that together fit
/// within `budget` bytes (MTU minus encapsulation overhead), applying
/// `filter` per record when present. Pure over its inputs: performs no I/O
/// and never blocks (§4.2, §5).
pub fn walk(
    window: &[u8],
    bottom: usize,
    top: usize,
    budget: usize,
    filter: Option<&dyn RecordFilter>,
    pool: &mut IovecPool,
    stats: &StreamStats,
) -> Result<WalkOutcome> {
    pool.reset();
    let mut walked = 0usize;
    let mut bottom = bottom;
    let mut record_count: u16 = 0;

    while bottom < top && walked < budget {
        if top - bottom < RECORD_HEADER_LEN {
            break;
        }
        let header = RecordHeader::parse(&window[bottom..bottom + RECORD_HEADER_LEN]);
        let len = header.rlen as usize;

        if header.lctr != 0 {
            stats.record_loss();
            return Ok(WalkOutcome {
                new_bottom: bottom,
                record_count,
                loss_detected: Some(header.lctr),
            });
        }

        if top - bottom < len {
            // Partial record at the window tail: leave it for next time.
            break;
        }

        if let Some(filter) = filter {
            let body_start = bottom + RECORD_HEADER_LEN.min(len);
            match filter
                .apply(&window[body_start..bottom + len])
                .map_err(|reason| Error::FilterError { reason })?
            {
                Decision::Drop => {
                    if !pool.current_mut().is_empty() {
                        pool.advance_slot()?;
                    }
                    bottom += len;
                    continue;
                }
                Decision::Keep => {}
            }
        }

        if walked > 0 && walked + len > budget {
            break;
        }

        let iov = pool.current_mut();
        if iov.is_empty() {
            iov.base = bottom;
        }
        iov.len += len;

        walked += len;
        bottom += len;
        record_count += 1;
        stats.record_walked(len as u64, (len - RECORD_HEADER_LEN) as u64);
    }

    Ok(WalkOutcome {
        new_bottom: bottom,
        record_count,
        loss_detected: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::KeepAll;
    use pretty_assertions::assert_eq;

    fn record(body_len: usize, lctr: u16) -> Vec<u8> {
        let rlen = (RECORD_HEADER_LEN + body_len) as u16;
        let mut buf = Vec::with_capacity(rlen as usize);
        buf.extend_from_slice(&rlen.to_be_bytes());
        buf.extend_from_slice(&lctr.to_be_bytes());
        buf.extend(std::iter::repeat_n(0xABu8, body_len));
        buf
    }

    fn concat(records: &[Vec<u8>]) -> Vec<u8> {
        records.iter().flat_map(|r| r.iter().copied()).collect()
    }

    #[test]
    fn single_small_record() {
        // S1: one 100-byte record, MTU=1400, overhead=32 -> budget 1368.
        let rec = record(96, 0);
        let window = concat(&[rec]);
        let mut pool = IovecPool::new();
        let stats = StreamStats::default();
        let outcome = walk(&window, 0, window.len(), 1368, None, &mut pool, &stats).unwrap();
        assert_eq!(outcome.record_count, 1);
        assert_eq!(outcome.new_bottom, window.len());
        assert_eq!(pool.filled().len(), 1);
        assert_eq!(pool.filled()[0], Iovec { base: 0, len: 100 });
    }

    #[test]
    fn exact_fit_ten_records() {
        // S2: 10 records of length 130 exactly filling budget 1368? 10*130=1300 < 1368.
        let recs: Vec<Vec<u8>> = (0..10).map(|_| record(126, 0)).collect();
        let window = concat(&recs);
        let mut pool = IovecPool::new();
        let stats = StreamStats::default();
        let outcome = walk(&window, 0, window.len(), 1368, None, &mut pool, &stats).unwrap();
        assert_eq!(outcome.record_count, 10);
        assert_eq!(outcome.new_bottom, 1300);
        assert_eq!(pool.filled().len(), 1);
        assert_eq!(pool.filled()[0], Iovec { base: 0, len: 1300 });
    }

    #[test]
    fn overflow_boundary_splits_into_two_advances() {
        // S3: 11 records of 130 bytes; budget only fits 10.
        let recs: Vec<Vec<u8>> = (0..11).map(|_| record(126, 0)).collect();
        let window = concat(&recs);
        let mut pool = IovecPool::new();
        let stats = StreamStats::default();
        let first = walk(&window, 0, window.len(), 1368, None, &mut pool, &stats).unwrap();
        assert_eq!(first.record_count, 10);
        assert_eq!(first.new_bottom, 1300);

        let mut pool2 = IovecPool::new();
        let second = walk(
            &window,
            first.new_bottom,
            window.len(),
            1368,
            None,
            &mut pool2,
            &stats,
        )
        .unwrap();
        assert_eq!(second.record_count, 1);
        assert_eq!(second.new_bottom, window.len());
    }

    #[test]
    fn oversized_first_record_emitted_alone() {
        // S4: one record far larger than the MTU budget must still go out.
        let rec = record(2000 - RECORD_HEADER_LEN, 0);
        let window = concat(&[rec]);
        let mut pool = IovecPool::new();
        let stats = StreamStats::default();
        let outcome = walk(&window, 0, window.len(), 1368, None, &mut pool, &stats).unwrap();
        assert_eq!(outcome.record_count, 1);
        assert_eq!(pool.filled()[0].len, 2000);
    }

    #[test]
    fn loss_counter_halts_without_consuming() {
        // S5: a loss record after two clean ones.
        let recs = vec![record(96, 0), record(96, 0), record(96, 1)];
        let window = concat(&recs);
        let mut pool = IovecPool::new();
        let stats = StreamStats::default();
        let outcome = walk(&window, 0, window.len(), 1368, None, &mut pool, &stats).unwrap();
        assert_eq!(outcome.loss_detected, Some(1));
        assert_eq!(outcome.new_bottom, 200);
    }

    #[test]
    fn partial_tail_is_preserved() {
        let rec = record(96, 0);
        let mut window = concat(std::slice::from_ref(&rec));
        window.extend_from_slice(&rec[..50]); // partial second record
        let mut pool = IovecPool::new();
        let stats = StreamStats::default();
        let outcome = walk(&window, 0, window.len(), 1368, None, &mut pool, &stats).unwrap();
        assert_eq!(outcome.record_count, 1);
        assert_eq!(outcome.new_bottom, 100);

        // Next window starts at the same byte, now with the rest available.
        let mut window2 = window[100..].to_vec();
        window2.extend_from_slice(&rec[50..]);
        let mut pool2 = IovecPool::new();
        let outcome2 = walk(&window2, 0, window2.len(), 1368, None, &mut pool2, &stats).unwrap();
        assert_eq!(outcome2.record_count, 1);
    }

    #[test]
    fn filter_idempotence_keep_all_matches_unfiltered() {
        let recs: Vec<Vec<u8>> = (0..5).map(|_| record(96, 0)).collect();
        let window = concat(&recs);

        let mut pool_a = IovecPool::new();
        let stats_a = StreamStats::default();
        let out_a = walk(&window, 0, window.len(), 1368, None, &mut pool_a, &stats_a).unwrap();

        let mut pool_b = IovecPool::new();
        let stats_b = StreamStats::default();
        let filter = KeepAll;
        let out_b = walk(
            &window,
            0,
            window.len(),
            1368,
            Some(&filter),
            &mut pool_b,
            &stats_b,
        )
        .unwrap();

        assert_eq!(out_a.record_count, out_b.record_count);
        assert_eq!(out_a.new_bottom, out_b.new_bottom);
        assert_eq!(pool_a.filled(), pool_b.filled());
    }

    /// Drops records at fixed positions in the stream, regardless of content.
    struct DropPositions(std::sync::atomic::AtomicUsize, Vec<usize>);

    impl RecordFilter for DropPositions {
        fn apply(&self, _record: &[u8]) -> std::result::Result<Decision, String> {
            let idx = self.0.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            let decision = if self.1.contains(&idx) {
                Decision::Drop
            } else {
                Decision::Keep
            };
            Ok(decision)
        }
    }

    #[test]
    fn filter_splits_mid_batch_into_two_iovecs() {
        // S6: 5 kept, 2 dropped, 3 kept, all within budget -> one datagram,
        // two iovecs, record_count 8 (drops don't count toward it).
        let recs: Vec<Vec<u8>> = (0..10).map(|_| record(96, 0)).collect();
        let window = concat(&recs);
        let filter = DropPositions(std::sync::atomic::AtomicUsize::new(0), vec![5, 6]);
        let mut pool = IovecPool::new();
        let stats = StreamStats::default();
        let outcome = walk(
            &window,
            0,
            window.len(),
            1368,
            Some(&filter),
            &mut pool,
            &stats,
        )
        .unwrap();

        assert_eq!(outcome.record_count, 8);
        assert_eq!(outcome.new_bottom, window.len());
        assert_eq!(pool.filled().len(), 2);
        assert_eq!(pool.filled()[0], Iovec { base: 0, len: 500 });
        assert_eq!(
            pool.filled()[1],
            Iovec {
                base: 700,
                len: 300
            }
        );
    }

    #[test]
    fn filter_sees_record_body_with_header_stripped() {
        // A record whose raw bytes (header included) would read as IP
        // version 0 must still classify correctly once the walker strips
        // the 4-byte framing header before handing the body to the filter.
        let mut body = vec![0u8; 20];
        body[0] = 0x45; // version 4, IHL 5
        body[16..20].copy_from_slice(&[10, 0, 0, 1]);
        let rlen = (RECORD_HEADER_LEN + body.len()) as u16;
        let mut rec = Vec::new();
        rec.extend_from_slice(&rlen.to_be_bytes());
        rec.extend_from_slice(&0u16.to_be_bytes());
        rec.extend_from_slice(&body);

        let window = rec.clone();
        let filter = crate::filter::DarknetFilter::new(10, Default::default());
        let mut pool = IovecPool::new();
        let stats = StreamStats::default();
        let outcome = walk(
            &window,
            0,
            window.len(),
            1368,
            Some(&filter),
            &mut pool,
            &stats,
        )
        .unwrap();

        assert_eq!(outcome.record_count, 1);
        assert_eq!(pool.filled().len(), 1);
        assert_eq!(
            pool.filled()[0],
            Iovec {
                base: 0,
                len: rec.len()
            }
        );
    }
}
