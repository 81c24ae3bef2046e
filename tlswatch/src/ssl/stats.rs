use std::sync::atomic::{AtomicU64, Ordering};

use super::store::{AttachState, ProcessStore};

/// Engine counters, readable from any thread.
///
/// Monotonic counters are bumped as things happen; the gauges are
/// republished by the worker after every drain.
#[derive(Debug, Default)]
pub struct TracerStats {
    resolutions: AtomicU64,
    attach_rejected: AtomicU64,
    unsupported_libraries: AtomicU64,
    leaked_probes: AtomicU64,
    dropped_events: AtomicU64,

    tracked: AtomicU64,
    attached: AtomicU64,
    pending: AtomicU64,
    cache_entries: AtomicU64,
    installed_probes: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub resolutions: u64,
    pub attach_rejected: u64,
    pub unsupported_libraries: u64,
    pub leaked_probes: u64,
    pub dropped_events: u64,
    pub tracked: u64,
    pub attached: u64,
    pub pending: u64,
    pub cache_entries: u64,
    pub installed_probes: u64,
}

impl TracerStats {
    pub fn record_resolution(&self) {
        self.resolutions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_attach_rejected(&self) {
        self.attach_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unsupported(&self) {
        self.unsupported_libraries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_leaked(&self, probes: u64) {
        self.leaked_probes.fetch_add(probes, Ordering::Relaxed);
    }

    pub fn set_dropped(&self, dropped: u64) {
        self.dropped_events.store(dropped, Ordering::Relaxed);
    }

    pub fn publish(&self, store: &ProcessStore) {
        let count = |state| store.records().filter(|r| r.state == state).count() as u64;
        self.tracked.store(store.len() as u64, Ordering::Relaxed);
        self.attached.store(count(AttachState::Attached), Ordering::Relaxed);
        self.pending.store(count(AttachState::Pending), Ordering::Relaxed);
        self.cache_entries
            .store(store.cache_len() as u64, Ordering::Relaxed);
        self.installed_probes
            .store(store.installed_probes() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            resolutions: self.resolutions.load(Ordering::Relaxed),
            attach_rejected: self.attach_rejected.load(Ordering::Relaxed),
            unsupported_libraries: self.unsupported_libraries.load(Ordering::Relaxed),
            leaked_probes: self.leaked_probes.load(Ordering::Relaxed),
            dropped_events: self.dropped_events.load(Ordering::Relaxed),
            tracked: self.tracked.load(Ordering::Relaxed),
            attached: self.attached.load(Ordering::Relaxed),
            pending: self.pending.load(Ordering::Relaxed),
            cache_entries: self.cache_entries.load(Ordering::Relaxed),
            installed_probes: self.installed_probes.load(Ordering::Relaxed),
        }
    }
}
