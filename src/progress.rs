//! Throttled progress reporting and cooperative abort (C7, spec 4.7).
//!
//! The teacher's tools print `"Progress: {}%"` to stdout whenever the
//! whole-number percentage changes (see `raster_summary_stats.rs`'s
//! `old_progress` pattern), gated on a verbose flag read from
//! `Configs`. `raster_math` is a library, so the sink is a trait the
//! host implements instead of a hard-coded `println!`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Receives progress percentage updates. Implement this to drive a CLI
/// progress bar, a GUI widget, or a channel back to a host application.
pub trait ProgressSink {
    fn set_percent(&mut self, percent: usize);
}

/// A `ProgressSink` that discards every update; the default when the
/// caller doesn't care to observe progress.
pub struct NullProgressSink;

impl ProgressSink for NullProgressSink {
    fn set_percent(&mut self, _percent: usize) {}
}

/// The throttle/abort bookkeeping the evaluator consults every outer row.
///
/// `aborted` is the single externally-written word the spec calls out:
/// some other part of the host sets it (typically from another thread,
/// e.g. in response to a user cancelling a dialog); the evaluator only
/// ever polls it, synchronously, at outer-row boundaries.
pub struct RasterMathProgress {
    total_work: u64,
    previous_work: u64,
    previous_reported_work: u64,
    aborted: Arc<AtomicBool>,
}

/// Work units are reported at most this often, tuned so a million-cell
/// image yields roughly 50 ticks end to end (spec sections 4.7 and 8).
const REPORT_THRESHOLD: u64 = 2_000_000;

impl RasterMathProgress {
    pub fn new(total_work: u64) -> RasterMathProgress {
        RasterMathProgress {
            total_work,
            previous_work: 0,
            previous_reported_work: 0,
            aborted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A cloneable handle the host can use to request cancellation from
    /// anywhere, independent of the evaluator's own borrow.
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.aborted)
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Advance completed work by `delta`, reporting to `sink` only when
    /// the throttle rule is satisfied; returns whether abort was
    /// requested so the caller can unwind.
    pub fn add_work_completed(&mut self, delta: u64, sink: &mut dyn ProgressSink) -> bool {
        self.set_work_completed(self.previous_work + delta, sink)
    }

    fn set_work_completed(&mut self, work: u64, sink: &mut dyn ProgressSink) -> bool {
        let work = work.min(self.total_work);
        if work >= self.previous_reported_work + REPORT_THRESHOLD || work == self.total_work {
            let percent = if self.total_work == 0 {
                100
            } else {
                ((100 * work) / self.total_work) as usize
            };
            sink.set_percent(percent);
            self.previous_reported_work = work;
        }
        self.previous_work = work;
        self.is_aborted()
    }
}
