//! Per-stream counters (§3) and the periodic stats dumper (A5).
//!
//! Counters are plain atomics rather than a mutex-guarded struct: the
//! dumper reads them from a different thread than the worker that writes
//! them, and they are monitoring data rather than a synchronization point,
//! so `Relaxed` ordering is sufficient (§5).

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::control::ControlFlags;

#[derive(Debug, Default)]
pub struct StreamStats {
    pub walked_buffers: AtomicU64,
    pub walked_records: AtomicU64,
    pub walked_bytes: AtomicU64,
    pub walked_wbytes: AtomicU64,
    pub tx_datagrams: AtomicU64,
    pub tx_records: AtomicU64,
    pub tx_bytes: AtomicU64,
    pub tx_wbytes: AtomicU64,
    pub dropped_records: AtomicU64,
    pub truncated_records: AtomicU64,
}

impl StreamStats {
    /// Called once per kept record (§4.2 decision: unfiltered semantics are
    /// preserved conservatively -- count only records that made it into an
    /// iovec, whether or not a filter is installed).
    pub fn record_walked(&self, bytes: u64, wire_bytes: u64) {
        self.walked_records.fetch_add(1, Ordering::Relaxed);
        self.walked_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.walked_wbytes.fetch_add(wire_bytes, Ordering::Relaxed);
    }

    pub fn record_buffer_walked(&self) {
        self.walked_buffers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_loss(&self) {
        self.dropped_records.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_truncated(&self) {
        self.truncated_records.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transmitted(&self, records: u64, bytes: u64, wire_bytes: u64) {
        self.tx_datagrams.fetch_add(1, Ordering::Relaxed);
        self.tx_records.fetch_add(records, Ordering::Relaxed);
        self.tx_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.tx_wbytes.fetch_add(wire_bytes, Ordering::Relaxed);
    }

    fn snapshot_lines(&self, label: &str) -> Vec<String> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        macro_rules! line {
            ($field:ident) => {
                format!(
                    "{} {} {} {}",
                    now,
                    label,
                    stringify!($field),
                    self.$field.load(Ordering::Relaxed)
                )
            };
        }
        vec![
            line!(walked_buffers),
            line!(walked_records),
            line!(walked_bytes),
            line!(walked_wbytes),
            line!(tx_datagrams),
            line!(tx_records),
            line!(tx_bytes),
            line!(tx_wbytes),
            line!(dropped_records),
            line!(truncated_records),
        ]
    }
}

/// One named stream's stats, shared read-only with the dumper thread.
pub struct NamedStats {
    pub label: String,
    pub stats: Arc<StreamStats>,
}

/// Spawns the stats dumper worker (A5): every `interval` seconds, appends a
/// timestamped snapshot of every stream's counters to a file under `dir`.
/// A no-op if `interval` is zero, matching `statinterval = 0` disabling the
/// dumper entirely (§4.10).
pub fn spawn_dumper(
    streams: Vec<NamedStats>,
    dir: PathBuf,
    interval: u64,
    flags: ControlFlags,
) -> Option<thread::JoinHandle<()>> {
    if interval == 0 {
        return None;
    }

    Some(
        thread::Builder::new()
            .name("stats-dumper".into())
            .spawn(move || {
                let path = dir.join("telescope-multiplexer.stats");
                while !flags.is_halted() {
                    thread::sleep(Duration::from_secs(interval));
                    if flags.is_halted() {
                        break;
                    }
                    let mut lines = Vec::new();
                    for s in &streams {
                        lines.extend(s.stats.snapshot_lines(&s.label));
                    }
                    if let Err(e) = append_lines(&path, &lines) {
                        log::warn!("failed to dump stats to {}: {}", path.display(), e);
                    }
                }
            })
            .expect("failed to spawn stats-dumper thread"),
    )
}

fn append_lines(path: &std::path::Path, lines: &[String]) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    for line in lines {
        writeln!(file, "{}", line)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn counters_accumulate() {
        let stats = StreamStats::default();
        stats.record_walked(100, 80);
        stats.record_walked(50, 40);
        stats.record_loss();
        stats.record_transmitted(2, 150, 120);

        assert_eq!(stats.walked_records.load(Ordering::Relaxed), 2);
        assert_eq!(stats.walked_bytes.load(Ordering::Relaxed), 150);
        assert_eq!(stats.dropped_records.load(Ordering::Relaxed), 1);
        assert_eq!(stats.tx_datagrams.load(Ordering::Relaxed), 1);
        assert_eq!(stats.tx_records.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn dumper_disabled_when_interval_zero() {
        let stats = vec![NamedStats {
            label: "stream0".to_string(),
            stats: Arc::new(StreamStats::default()),
        }];
        let handle = spawn_dumper(stats, PathBuf::from("/tmp"), 0, ControlFlags::new());
        assert!(handle.is_none());
    }

    #[test]
    fn dumper_writes_a_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let stats = Arc::new(StreamStats::default());
        stats.record_walked(10, 6);
        let flags = ControlFlags::new();
        let handle = spawn_dumper(
            vec![NamedStats {
                label: "stream0".to_string(),
                stats: stats.clone(),
            }],
            dir.path().to_path_buf(),
            1,
            flags.clone(),
        )
        .unwrap();

        thread::sleep(Duration::from_millis(1200));
        flags.halt();
        handle.join().unwrap();

        let contents =
            std::fs::read_to_string(dir.path().join("telescope-multiplexer.stats")).unwrap();
        assert!(contents.contains("walked_records 1"));
    }
}
