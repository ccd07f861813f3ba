use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Lock-free counters shared by the source tasks and the main loop,
/// reported by the periodic debug tick. Values are cumulative.
pub struct Stats {
    dnstap_frames: AtomicU64,
    dnstap_decode_errors: AtomicU64,
    dnstap_skipped: AtomicU64,
    pb_frames: AtomicU64,
    pb_decode_errors: AtomicU64,
    pb_list_decode_errors: AtomicU64,
    pb_dropped: AtomicU64,
    /// Per-message debug samples still allowed; bounded so debug logging
    /// cannot flood under wire-speed traffic.
    debug_samples: AtomicI64,
}

/// Point-in-time view of all counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub dnstap_frames: u64,
    pub dnstap_decode_errors: u64,
    pub dnstap_skipped: u64,
    pub pb_frames: u64,
    pub pb_decode_errors: u64,
    pub pb_list_decode_errors: u64,
    pub pb_dropped: u64,
}

const DEBUG_SAMPLE_BUDGET: i64 = 25;

impl Stats {
    pub fn new() -> Self {
        Self {
            dnstap_frames: AtomicU64::new(0),
            dnstap_decode_errors: AtomicU64::new(0),
            dnstap_skipped: AtomicU64::new(0),
            pb_frames: AtomicU64::new(0),
            pb_decode_errors: AtomicU64::new(0),
            pb_list_decode_errors: AtomicU64::new(0),
            pb_dropped: AtomicU64::new(0),
            debug_samples: AtomicI64::new(DEBUG_SAMPLE_BUDGET),
        }
    }

    pub fn record_dnstap_frame(&self) {
        self.dnstap_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dnstap_decode_error(&self) {
        self.dnstap_decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dnstap_skipped(&self) {
        self.dnstap_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pb_frame(&self) {
        self.pb_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pb_decode_error(&self) {
        self.pb_decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pb_list_decode_error(&self) {
        self.pb_list_decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pb_dropped(&self) {
        self.pb_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Consumes one debug sample slot; false once the budget is exhausted.
    pub fn take_debug_sample(&self) -> bool {
        self.debug_samples.fetch_sub(1, Ordering::Relaxed) > 0
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            dnstap_frames: self.dnstap_frames.load(Ordering::Relaxed),
            dnstap_decode_errors: self.dnstap_decode_errors.load(Ordering::Relaxed),
            dnstap_skipped: self.dnstap_skipped.load(Ordering::Relaxed),
            pb_frames: self.pb_frames.load(Ordering::Relaxed),
            pb_decode_errors: self.pb_decode_errors.load(Ordering::Relaxed),
            pb_list_decode_errors: self.pb_list_decode_errors.load(Ordering::Relaxed),
            pb_dropped: self.pb_dropped.load(Ordering::Relaxed),
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}
