//! Process-wide pause/halt control plane.
//!
//! The original multiplexer used two `volatile int` globals flipped from
//! signal handlers and polled in every hot loop. Here that becomes one small
//! `Arc`-able handle of atomic booleans, created once at startup and handed
//! to every worker and to the signal-handling thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared handle to the process-wide control plane. Cheap to clone; every
/// clone observes the same underlying flags.
#[derive(Clone)]
pub struct ControlFlags {
    halted: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
}

impl ControlFlags {
    pub fn new() -> Self {
        ControlFlags {
            halted: Arc::new(AtomicBool::new(false)),
            paused: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Write-once: once set, stays set for the life of the process.
    pub fn halt(&self) {
        self.halted.store(true, Ordering::Relaxed);
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Relaxed)
    }

    pub fn toggle_pause(&self) {
        let was = self.paused.load(Ordering::Relaxed);
        self.paused.store(!was, Ordering::Relaxed);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }
}

impl Default for ControlFlags {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
pub mod signals {
    //! `SIGINT`/`SIGTERM` halt the program; `SIGHUP` toggles pause. Installed
    //! via a dedicated background thread blocked in `sigwait`, rather than a
    //! traditional `sigaction` handler, so the control-plane update never
    //! races a signal handler against allocator or logging internals.

    use super::ControlFlags;
    use nix::sys::signal::{SigSet, Signal};
    use std::thread;

    pub fn install(flags: ControlFlags) {
        let mut mask = SigSet::empty();
        mask.add(Signal::SIGINT);
        mask.add(Signal::SIGTERM);
        mask.add(Signal::SIGHUP);
        mask.thread_block()
            .expect("failed to block signals on main thread");

        thread::Builder::new()
            .name("signal-wiring".into())
            .spawn(move || loop {
                match mask.wait() {
                    Ok(Signal::SIGINT) | Ok(Signal::SIGTERM) => {
                        log::info!("received halt signal, shutting down");
                        flags.halt();
                    }
                    Ok(Signal::SIGHUP) => {
                        log::info!("received SIGHUP, toggling pause");
                        flags.toggle_pause();
                    }
                    Ok(other) => {
                        log::debug!("ignoring unexpected signal {:?}", other);
                    }
                    Err(e) => {
                        log::warn!("sigwait failed: {}", e);
                    }
                }
            })
            .expect("failed to spawn signal-wiring thread");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn halt_is_monotonic() {
        let flags = ControlFlags::new();
        assert!(!flags.is_halted());
        flags.halt();
        assert!(flags.is_halted());
        flags.halt();
        assert!(flags.is_halted());
    }

    #[test]
    fn pause_toggles() {
        let flags = ControlFlags::new();
        assert!(!flags.is_paused());
        flags.toggle_pause();
        assert!(flags.is_paused());
        flags.toggle_pause();
        assert!(!flags.is_paused());
    }

    #[test]
    fn clones_share_state() {
        let flags = ControlFlags::new();
        let other = flags.clone();
        other.halt();
        assert!(flags.is_halted());
    }
}
