use std::{collections::HashMap, time::Instant};

use super::symbols::{LibraryImage, LibraryKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttachState {
    /// Tracked, waiting for the enable switch (or mid-attach).
    Pending,
    Attached,
    /// Library build is not one we can probe. Not retried for this record.
    Unsupported,
    Failed,
    /// Terminal; the record is being dropped.
    Detached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCause {
    /// Resolution could not read the image consistently; retry is allowed.
    Transient,
    /// The kernel refused a probe.
    Rejected,
}

/// Opaque handle for one installed kernel probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProbeId(pub u64);

#[derive(Debug, Clone)]
pub struct ProcessRecord {
    pub pid: u32,
    /// Kernel start time in clock ticks; tells incarnations of a pid apart.
    pub start_time: u64,
    pub comm: String,
    /// Also the key into the symbol cache while `Attached`.
    pub library: LibraryImage,
    pub state: AttachState,
    pub failure: Option<FailureCause>,
    pub attempts: u32,
    pub last_attempt: Option<Instant>,
}

impl ProcessRecord {
    pub fn new(pid: u32, start_time: u64, comm: String, library: LibraryImage) -> Self {
        Self {
            pid,
            start_time,
            comm,
            library,
            state: AttachState::Pending,
            failure: None,
            attempts: 0,
            last_attempt: None,
        }
    }

    pub fn key(&self) -> &LibraryKey {
        &self.library.key
    }
}

/// Installed probes for one library build. Lives exactly as long as some
/// attached record references it.
#[derive(Debug)]
pub struct SymbolCacheEntry {
    pub refcount: usize,
    pub probes: Vec<ProbeId>,
}

/// Per-pid records plus the per-library symbol cache.
///
/// Owned by the event worker; nothing here synchronizes.
#[derive(Debug, Default)]
pub struct ProcessStore {
    records: HashMap<u32, ProcessRecord>,
    cache: HashMap<LibraryKey, SymbolCacheEntry>,
}

impl ProcessStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fresh record. Callers release any live record for the pid
    /// first, so its cache reference is never lost.
    pub fn insert(&mut self, record: ProcessRecord) {
        let stale = self.records.insert(record.pid, record);
        debug_assert!(stale.is_none_or(|r| r.state == AttachState::Detached));
    }

    pub fn get(&self, pid: u32) -> Option<&ProcessRecord> {
        self.records.get(&pid)
    }

    pub fn get_mut(&mut self, pid: u32) -> Option<&mut ProcessRecord> {
        self.records.get_mut(&pid)
    }

    pub fn remove(&mut self, pid: u32) -> Option<ProcessRecord> {
        self.records.remove(&pid)
    }

    /// Whether any record still uses the library build `key`.
    pub fn references(&self, key: &LibraryKey) -> bool {
        self.records.values().any(|r| r.key() == key)
    }

    pub fn pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.records.keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    pub fn pids_in_state(&self, state: AttachState) -> Vec<u32> {
        let mut pids: Vec<u32> = self
            .records
            .values()
            .filter(|r| r.state == state)
            .map(|r| r.pid)
            .collect();
        pids.sort_unstable();
        pids
    }

    pub fn records(&self) -> impl Iterator<Item = &ProcessRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Take another reference on a cached library, if present.
    pub fn acquire(&mut self, key: &LibraryKey) -> Option<usize> {
        let entry = self.cache.get_mut(key)?;
        entry.refcount += 1;
        Some(entry.refcount)
    }

    /// Cache a freshly attached library with its first reference.
    pub fn insert_cache_entry(&mut self, key: LibraryKey, probes: Vec<ProbeId>) {
        self.cache.insert(
            key,
            SymbolCacheEntry {
                refcount: 1,
                probes,
            },
        );
    }

    /// Drop one reference. Returns the evicted entry when it was the last.
    pub fn release(&mut self, key: &LibraryKey) -> Option<SymbolCacheEntry> {
        let entry = self.cache.get_mut(key)?;
        entry.refcount = entry.refcount.saturating_sub(1);
        if entry.refcount == 0 {
            self.cache.remove(key)
        } else {
            None
        }
    }

    pub fn cache_entry(&self, key: &LibraryKey) -> Option<&SymbolCacheEntry> {
        self.cache.get(key)
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn installed_probes(&self) -> usize {
        self.cache.values().map(|e| e.probes.len()).sum()
    }
}
