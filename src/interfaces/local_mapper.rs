//! Stop/ack handshake with the local mapping thread.
//!
//! Loop correction and merging must not race with keyframe insertion, so
//! the worker raises a stop request, waits for the mapper to acknowledge,
//! and releases it when the map mutation is done. The mapper polls this
//! struct from its own loop.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Shared control block between loop closing and local mapping.
#[derive(Debug, Default)]
pub struct MapperControl {
    stop_requested: AtomicBool,
    stopped: AtomicBool,
    finished: AtomicBool,
    /// Number of keyframes still queued in the mapper.
    queued: AtomicUsize,
    /// Lowered while a visual-inertial BA pass still has to settle.
    done_viba: AtomicBool,
}

impl MapperControl {
    pub fn new() -> Self {
        Self {
            stop_requested: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            queued: AtomicUsize::new(0),
            done_viba: AtomicBool::new(true),
        }
    }

    // ── Called by loop closing ───────────────────────────────────────────

    /// Ask the mapper to pause after its current keyframe.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Ask the mapper to flush its keyframe queue into the map.
    ///
    /// The queue counter is maintained by the mapper; a stopped mapper has
    /// already drained it, so this returns once the counter reads zero.
    pub fn empty_queue(&self) {
        while self.queued.load(Ordering::SeqCst) > 0 && !self.is_stopped() {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }

    /// Release the mapper after a correction.
    pub fn release(&self) {
        self.stop_requested.store(false, Ordering::SeqCst);
        self.stopped.store(false, Ordering::SeqCst);
    }

    pub fn set_done_viba(&self, done: bool) {
        self.done_viba.store(done, Ordering::SeqCst);
    }

    // ── Called by the local mapper ───────────────────────────────────────

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Acknowledge a stop request.
    pub fn acknowledge_stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn set_finished(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }

    pub fn set_queued(&self, n: usize) {
        self.queued.store(n, Ordering::SeqCst);
    }

    pub fn is_done_viba(&self) -> bool {
        self.done_viba.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_handshake() {
        let ctl = MapperControl::new();
        assert!(!ctl.is_stopped());

        ctl.request_stop();
        assert!(ctl.stop_requested());
        ctl.acknowledge_stop();
        assert!(ctl.is_stopped());

        ctl.release();
        assert!(!ctl.stop_requested());
        assert!(!ctl.is_stopped());
    }

    #[test]
    fn test_empty_queue_returns_when_stopped() {
        let ctl = MapperControl::new();
        ctl.set_queued(3);
        ctl.acknowledge_stop();
        // Queue is non-empty but the mapper is stopped, so this must not
        // spin forever.
        ctl.empty_queue();
    }
}
