//! Stream orchestrator (C5): owns the process's worker threads. One thread
//! per capture stream plus one beacon thread, all sharing a
//! [`ControlFlags`] handle so a signal reaches every worker without a
//! broadcast channel.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use rand::Rng;

use crate::config::Config;
use crate::control::ControlFlags;
use crate::filter::{DarknetFilter, KeepAll, RecordFilter};
use crate::publish::{BeaconState, EncapState, Sink, BATCH_SIZE, BEACON_FREQ_MS, PORT_INCR};
use crate::record::{walk, IovecPool};
use crate::ring::{CaptureRing, MmapRing, POLL_MAXWAIT_US, POLL_MINDATA};
use crate::stats::StreamStats;

/// Epoch this system measures `global_start` from (2017-11-01T00:00:00Z),
/// matching the original design's timebase.
pub const TELESCOPE_EPOCH: i64 = 1_509_494_400;

/// Milliseconds since [`TELESCOPE_EPOCH`], computed with pure integer
/// arithmetic (§9 decision: the original's `(tv_sec - EPOCH) * 1000 +
/// tv_usec / 1000.0` mixed float math was a bug, not a feature -- this
/// crate never lets a sub-millisecond float enter the timebase).
pub fn global_start_ms(now: SystemTime) -> u64 {
    let since_epoch = now
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default();
    let secs = since_epoch.as_secs() as i64 - TELESCOPE_EPOCH;
    let millis = since_epoch.subsec_millis() as u64;
    (secs.max(0) as u64) * 1000 + millis
}

/// Static parameters for one capture stream, resolved once at startup.
#[derive(Debug, Clone)]
pub struct StreamParams {
    pub stream_index: u16,
    pub color: u8,
    pub ring_capacity: usize,
}

fn export_port(first_port: u16, stream_index: u16) -> u16 {
    first_port.wrapping_add((stream_index / 2).wrapping_mul(PORT_INCR))
}

fn run_stream(
    params: StreamParams,
    config: Config,
    first_port: u16,
    filter: Arc<dyn RecordFilter>,
    stats: Arc<StreamStats>,
    flags: ControlFlags,
) {
    let ring = match MmapRing::new(params.ring_capacity) {
        Ok(r) => r,
        Err(e) => {
            log::error!(
                "stream {}: failed to open capture ring: {}",
                params.stream_index,
                e
            );
            flags.halt();
            return;
        }
    };
    let mut cap = CaptureRing::new(ring);

    let sink = Sink {
        color: params.color,
        monitorid: config.monitorid,
        export_port: export_port(first_port, params.stream_index),
        group: config.mcastaddr,
        source: config.srcaddr,
        mtu: config.mtu,
    };
    let mut publisher = match EncapState::init(&sink, params.stream_index) {
        Ok(p) => p,
        Err(e) => {
            log::error!(
                "stream {}: failed to open publisher: {}",
                params.stream_index,
                e
            );
            flags.halt();
            return;
        }
    };

    let mut pool = IovecPool::new();
    let budget = publisher.budget();
    let mut batch = 0u16;

    while !flags.is_halted() {
        if flags.is_paused() {
            thread::sleep(Duration::from_millis(10));
            continue;
        }

        let (bottom, top) = cap.poll_window(POLL_MINDATA, Duration::from_micros(POLL_MAXWAIT_US));
        if top == bottom {
            continue;
        }

        let window = cap.window_bytes().to_vec();
        let outcome = match walk(
            &window,
            bottom,
            top,
            budget,
            Some(filter.as_ref()),
            &mut pool,
            &stats,
        ) {
            Ok(o) => o,
            Err(e) => {
                log::error!("stream {}: walker error: {}", params.stream_index, e);
                flags.halt();
                break;
            }
        };

        if let Some(lctr) = outcome.loss_detected {
            log::error!(
                "stream {}: hardware reported loss (lctr={}), halting",
                params.stream_index,
                lctr
            );
            flags.halt();
            break;
        }

        stats.record_buffer_walked();

        if outcome.record_count > 0 {
            if let Err(e) = publisher.push(&window, pool.filled(), outcome.record_count, &stats) {
                log::error!("stream {}: publish failed: {}", params.stream_index, e);
                flags.halt();
                break;
            }
            batch += 1;
        }

        cap.release(outcome.new_bottom);

        if batch >= BATCH_SIZE {
            batch = 0;
        }
    }
}

fn run_beacon(
    source: Ipv4Addr,
    group: Ipv4Addr,
    port: u16,
    monitorid: u16,
    streams: Vec<(u16, u16)>,
    flags: ControlFlags,
) {
    let mut beacon = match BeaconState::init(source, group, port, monitorid) {
        Ok(b) => b,
        Err(e) => {
            log::error!("failed to open beacon socket: {}", e);
            flags.halt();
            return;
        }
    };

    while !flags.is_halted() {
        if let Err(e) = beacon.push(&streams) {
            log::warn!("beacon send failed: {}", e);
        }
        thread::sleep(Duration::from_millis(BEACON_FREQ_MS));
    }
}

/// Owns every worker thread for the process's lifetime; `join` blocks until
/// all of them have observed `ControlFlags::is_halted` and exited.
pub struct Orchestrator {
    handles: Vec<JoinHandle<()>>,
}

impl Orchestrator {
    /// Spawns one worker per entry in `streams` plus a beacon thread, wiring
    /// each to `filter`/`flags` and a fresh [`StreamStats`]. Returns the
    /// orchestrator and the per-stream stats handles for the caller to wire
    /// into the stats dumper (A5).
    pub fn spawn(
        config: Config,
        streams: Vec<StreamParams>,
        flags: ControlFlags,
    ) -> (Self, Vec<(String, Arc<StreamStats>)>) {
        let filter: Arc<dyn RecordFilter> = match (&config.filterfile, config.darknetoctet) {
            (None, -1) => Arc::new(KeepAll),
            (filterfile, octet) => {
                let excluded = filterfile
                    .as_ref()
                    .map(DarknetFilter::load_exclusion_file)
                    .transpose()
                    .unwrap_or_else(|e| {
                        log::warn!("failed to load exclusion file: {}", e);
                        None
                    })
                    .unwrap_or_default();
                Arc::new(DarknetFilter::new(octet, excluded))
            }
        };

        let first_port: u16 = rand::thread_rng().gen_range(10_000..60_000);
        let mut handles = Vec::with_capacity(streams.len() + 1);
        let mut named_stats = Vec::with_capacity(streams.len());
        let mut active_ports = Vec::with_capacity(streams.len());

        for params in streams {
            let stats = Arc::new(StreamStats::default());
            named_stats.push((format!("stream{}", params.stream_index), stats.clone()));
            active_ports.push((
                params.stream_index,
                export_port(first_port, params.stream_index),
            ));

            let cfg = config.clone();
            let filter = filter.clone();
            let flags = flags.clone();
            let handle = thread::Builder::new()
                .name(format!("stream-{}", params.stream_index))
                .spawn(move || run_stream(params, cfg, first_port, filter, stats, flags))
                .expect("failed to spawn stream worker");
            handles.push(handle);
        }

        let beacon_flags = flags.clone();
        let source = config.srcaddr;
        let group = config.mcastaddr;
        let port = config.mcastport;
        let monitorid = config.monitorid;
        handles.push(
            thread::Builder::new()
                .name("beacon".into())
                .spawn(move || {
                    run_beacon(source, group, port, monitorid, active_ports, beacon_flags)
                })
                .expect("failed to spawn beacon worker"),
        );

        (Orchestrator { handles }, named_stats)
    }

    pub fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.join() {
                log::error!("worker panicked: {:?}", e);
            }
        }
    }
}
