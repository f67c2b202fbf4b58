use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters for trigger forwarding telemetry.
///
/// Triggers can race the connection lifecycle, so the counters are updated
/// from posted tasks without touching the producer lock.
#[derive(Debug, Default)]
pub struct TriggerStats {
    requested: AtomicU64,
    dropped: AtomicU64,
}

impl TriggerStats {
    /// Create zeroed trigger counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one trigger activation request.
    pub fn record_requested(&self) {
        self.requested.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one trigger dropped because the producer was disconnected.
    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Total trigger activation requests so far.
    pub fn requested(&self) -> u64 {
        self.requested.load(Ordering::Relaxed)
    }

    /// Total triggers dropped so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
