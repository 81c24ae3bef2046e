use std::{collections::HashSet, path::Path, sync::Arc, time::Instant};

use log::{debug, info, warn};

use super::{
    error::{ResolveError, TraceError},
    stats::TracerStats,
    store::{AttachState, FailureCause, ProbeId, ProcessRecord, ProcessStore},
    symbols::{LibraryImage, LibraryKey, ProbeSpec, SSL_PROBES, SslOffsets, SymbolResolver},
};
use crate::telemetry;

/// Kernel side of attachment: place or remove one uprobe.
///
/// Only ever driven from the event worker, so implementations need no
/// locking of their own.
pub trait ProbeBackend {
    fn install(
        &mut self,
        library: &Path,
        probe: &ProbeSpec,
        offset: u64,
    ) -> Result<ProbeId, TraceError>;

    fn remove(&mut self, probe: ProbeId) -> Result<(), TraceError>;
}

/// Drives records through `Pending → {Attached | Unsupported | Failed} → Detached`.
pub struct AttachManager {
    resolver: Box<dyn SymbolResolver + Send>,
    backend: Box<dyn ProbeBackend + Send>,
    /// Library builds judged unsupported while some record still uses them.
    unsupported: HashSet<LibraryKey>,
    stats: Arc<TracerStats>,
}

impl AttachManager {
    pub fn new(
        resolver: Box<dyn SymbolResolver + Send>,
        backend: Box<dyn ProbeBackend + Send>,
        stats: Arc<TracerStats>,
    ) -> Self {
        Self {
            resolver,
            backend,
            unsupported: HashSet::new(),
            stats,
        }
    }

    /// Try to attach a `Pending` (or retryable `Failed`) record.
    /// Returns the record's resulting state.
    pub fn attach(&mut self, store: &mut ProcessStore, pid: u32) -> AttachState {
        let image = match store.get(pid) {
            Some(r) if matches!(r.state, AttachState::Pending | AttachState::Failed) => {
                r.library.clone()
            }
            Some(r) => return r.state,
            None => return AttachState::Detached,
        };

        let outcome = self.attach_library(store, &image);

        let Some(record) = store.get_mut(pid) else {
            return AttachState::Detached;
        };
        record.attempts += 1;
        record.last_attempt = Some(Instant::now());
        match outcome {
            Ok(()) => {
                record.state = AttachState::Attached;
                record.failure = None;
                debug!(
                    "PID {} ({}) attached via {}",
                    pid,
                    record.comm,
                    image.key.path.display()
                );
            }
            Err(TraceError::UnsupportedLibrary { .. }) => {
                record.state = AttachState::Unsupported;
                record.failure = None;
            }
            Err(e @ TraceError::TransientResolution { .. }) => {
                debug!("PID {} attach deferred: {}", pid, e);
                record.state = AttachState::Failed;
                record.failure = Some(FailureCause::Transient);
            }
            Err(e) => {
                warn!("PID {} will not be traced: {}", pid, e);
                record.state = AttachState::Failed;
                record.failure = Some(FailureCause::Rejected);
            }
        }
        record.state
    }

    fn attach_library(
        &mut self,
        store: &mut ProcessStore,
        image: &LibraryImage,
    ) -> Result<(), TraceError> {
        if let Some(refs) = store.acquire(&image.key) {
            debug!(
                "Reusing probes on {} (refcount {})",
                image.key.path.display(),
                refs
            );
            return Ok(());
        }

        if self.unsupported.contains(&image.key) {
            return Err(TraceError::UnsupportedLibrary {
                path: image.key.path.clone(),
                reason: "previously rejected".to_string(),
            });
        }

        self.stats.record_resolution();
        telemetry::record_symbol_resolution(self.resolver.family());
        let verdict = self.resolver.resolve(image).and_then(|offsets| {
            if offsets.is_complete() {
                Ok(offsets)
            } else {
                Err(ResolveError::Unsupported(
                    "required entry points missing".to_string(),
                ))
            }
        });
        let offsets = match verdict {
            Ok(offsets) => offsets,
            Err(ResolveError::Unsupported(reason)) => {
                warn!(
                    "Unsupported {} build {}: {}",
                    self.resolver.family(),
                    image.key.path.display(),
                    reason
                );
                self.unsupported.insert(image.key.clone());
                self.stats.record_unsupported();
                telemetry::record_unsupported_library(&image.key.path.to_string_lossy());
                return Err(TraceError::UnsupportedLibrary {
                    path: image.key.path.clone(),
                    reason,
                });
            }
            Err(e) => return Err(e.into_trace_error(image.key.path.clone())),
        };

        let probes = self.install_all(image, &offsets)?;
        info!(
            "Attached {} SSL probes to {}",
            probes.len(),
            image.key.path.display()
        );
        store.insert_cache_entry(image.key.clone(), probes);
        Ok(())
    }

    /// Install every probe for one library, or none of them.
    fn install_all(
        &mut self,
        image: &LibraryImage,
        offsets: &SslOffsets,
    ) -> Result<Vec<ProbeId>, TraceError> {
        let mut installed = Vec::new();
        for probe in SSL_PROBES {
            let Some(offset) = offsets.get(probe.entry_point) else {
                continue;
            };
            match self.backend.install(&image.host_path, probe, offset) {
                Ok(id) => installed.push(id),
                Err(e) => {
                    self.stats.record_attach_rejected();
                    telemetry::record_attach_rejected(probe.program);
                    self.remove_probes(installed);
                    return Err(e);
                }
            }
        }
        Ok(installed)
    }

    /// Release a record. Probes go away with the last reference to their library.
    pub fn detach(&mut self, store: &mut ProcessStore, pid: u32) -> Option<ProcessRecord> {
        let mut record = store.remove(pid)?;
        match record.state {
            AttachState::Attached => {
                if let Some(entry) = store.release(record.key()) {
                    let removed = self.remove_probes(entry.probes);
                    info!(
                        "Removed {} SSL probes from {} (last user PID {} exited)",
                        removed,
                        record.key().path.display(),
                        pid
                    );
                }
            }
            AttachState::Unsupported if !store.references(record.key()) => {
                // Forgotten with its last user; a later process re-judges it.
                self.unsupported.remove(record.key());
            }
            _ => {}
        }
        record.state = AttachState::Detached;
        Some(record)
    }

    /// Remove probes, returning how many the kernel let go of.
    pub fn remove_probes(&mut self, probes: Vec<ProbeId>) -> usize {
        let mut removed = 0;
        for id in probes {
            match self.backend.remove(id) {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to remove probe {:?}: {}", id, e),
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssl::{
        symbols::EntryPoint,
        testing::{FakeBackend, FakeResolver, library},
    };

    fn manager(resolver: &FakeResolver, backend: &FakeBackend) -> (AttachManager, Arc<TracerStats>) {
        let stats = Arc::new(TracerStats::default());
        (
            AttachManager::new(
                Box::new(resolver.clone()),
                Box::new(backend.clone()),
                stats.clone(),
            ),
            stats,
        )
    }

    fn track(store: &mut ProcessStore, pid: u32, image: LibraryImage) {
        store
            .insert(ProcessRecord::new(pid, 1, "app".into(), image));
    }

    #[test]
    fn test_shared_library_resolves_and_installs_once() {
        let (resolver, backend) = (FakeResolver::default(), FakeBackend::default());
        let (mut mgr, stats) = manager(&resolver, &backend);
        let mut store = ProcessStore::new();
        let lib = library("/usr/lib/libssl.so.3", 1);

        track(&mut store, 10, lib.clone());
        track(&mut store, 11, lib.clone());
        assert_eq!(mgr.attach(&mut store, 10), AttachState::Attached);
        assert_eq!(mgr.attach(&mut store, 11), AttachState::Attached);

        assert_eq!(stats.snapshot().resolutions, 1);
        assert_eq!(store.cache_entry(&lib.key).unwrap().refcount, 2);
        // 3 required entry points, entry + return each
        assert_eq!(backend.installed().len(), 6);
        assert_eq!(backend.install_calls(), 6);
    }

    #[test]
    fn test_last_detach_removes_probes() {
        let (resolver, backend) = (FakeResolver::default(), FakeBackend::default());
        let (mut mgr, _) = manager(&resolver, &backend);
        let mut store = ProcessStore::new();
        let lib = library("/usr/lib/libssl.so.3", 1);

        track(&mut store, 10, lib.clone());
        track(&mut store, 11, lib.clone());
        mgr.attach(&mut store, 10);
        mgr.attach(&mut store, 11);

        let gone = mgr.detach(&mut store, 10).unwrap();
        assert_eq!(gone.state, AttachState::Detached);
        assert_eq!(backend.installed().len(), 6);

        mgr.detach(&mut store, 11).unwrap();
        assert!(backend.installed().is_empty());
        assert!(store.cache_entry(&lib.key).is_none());
    }

    #[test]
    fn test_unsupported_verdict_is_cached_per_library() {
        let (resolver, backend) = (FakeResolver::default(), FakeBackend::default());
        let lib = library("/usr/lib/libssl.so.0.9.8", 3);
        resolver.set_verdict(&lib.key, Err(ResolveError::Unsupported("too old".into())));
        let (mut mgr, stats) = manager(&resolver, &backend);
        let mut store = ProcessStore::new();

        track(&mut store, 20, lib.clone());
        track(&mut store, 21, lib.clone());
        assert_eq!(mgr.attach(&mut store, 20), AttachState::Unsupported);
        assert_eq!(mgr.attach(&mut store, 21), AttachState::Unsupported);

        assert_eq!(resolver.calls(&lib.key), 1);
        assert_eq!(stats.snapshot().unsupported_libraries, 1);
        assert_eq!(backend.install_calls(), 0);
    }

    #[test]
    fn test_unsupported_verdict_forgotten_with_last_user() {
        let (resolver, backend) = (FakeResolver::default(), FakeBackend::default());
        let lib = library("/usr/lib/libssl.so.0.9.8", 3);
        resolver.set_verdict(&lib.key, Err(ResolveError::Unsupported("too old".into())));
        let (mut mgr, _) = manager(&resolver, &backend);
        let mut store = ProcessStore::new();

        track(&mut store, 20, lib.clone());
        track(&mut store, 21, lib.clone());
        mgr.attach(&mut store, 20);
        mgr.attach(&mut store, 21);
        assert_eq!(mgr.unsupported.len(), 1);

        mgr.detach(&mut store, 20);
        assert_eq!(mgr.unsupported.len(), 1);
        mgr.detach(&mut store, 21);
        assert_eq!(mgr.unsupported.len(), 0);

        track(&mut store, 22, lib.clone());
        assert_eq!(mgr.attach(&mut store, 22), AttachState::Unsupported);
        assert_eq!(resolver.calls(&lib.key), 2);
    }

    #[test]
    fn test_incomplete_offsets_are_unsupported() {
        let (resolver, backend) = (FakeResolver::default(), FakeBackend::default());
        let lib = library("/usr/lib/libssl.so.3", 7);
        let mut offsets = SslOffsets::default();
        offsets.insert(EntryPoint::Read, 0x1000);
        offsets.insert(EntryPoint::Write, 0x2000);
        resolver.set_verdict(&lib.key, Ok(offsets));
        let (mut mgr, stats) = manager(&resolver, &backend);
        let mut store = ProcessStore::new();

        track(&mut store, 60, lib);
        assert_eq!(mgr.attach(&mut store, 60), AttachState::Unsupported);
        assert_eq!(backend.install_calls(), 0);
        assert_eq!(stats.snapshot().unsupported_libraries, 1);
    }

    #[test]
    fn test_transient_failure_marks_retryable() {
        let (resolver, backend) = (FakeResolver::default(), FakeBackend::default());
        let lib = library("/usr/lib/libssl.so.3", 4);
        resolver.set_verdict(&lib.key, Err(ResolveError::Transient("vanished".into())));
        let (mut mgr, _) = manager(&resolver, &backend);
        let mut store = ProcessStore::new();

        track(&mut store, 30, lib.clone());
        assert_eq!(mgr.attach(&mut store, 30), AttachState::Failed);
        let record = store.get(30).unwrap();
        assert_eq!(record.failure, Some(FailureCause::Transient));
        assert_eq!(record.attempts, 1);
        assert!(store.cache_entry(&lib.key).is_none());
    }

    #[test]
    fn test_rejected_install_rolls_back() {
        let (resolver, backend) = (FakeResolver::default(), FakeBackend::default());
        backend.reject_program("probe_ssl_do_handshake_exit");
        let (mut mgr, stats) = manager(&resolver, &backend);
        let mut store = ProcessStore::new();
        let lib = library("/usr/lib/libssl.so.3", 5);

        track(&mut store, 40, lib.clone());
        assert_eq!(mgr.attach(&mut store, 40), AttachState::Failed);

        assert_eq!(store.get(40).unwrap().failure, Some(FailureCause::Rejected));
        assert!(backend.installed().is_empty());
        assert!(store.cache_entry(&lib.key).is_none());
        assert_eq!(stats.snapshot().attach_rejected, 1);

        // A failed record holds no reference, so detach touches nothing.
        mgr.detach(&mut store, 40).unwrap();
        assert_eq!(backend.remove_calls(), 5);
    }

    #[test]
    fn test_attach_leaves_settled_records_alone() {
        let (resolver, backend) = (FakeResolver::default(), FakeBackend::default());
        let (mut mgr, stats) = manager(&resolver, &backend);
        let mut store = ProcessStore::new();

        track(&mut store, 50, library("/usr/lib/libssl.so.3", 6));
        mgr.attach(&mut store, 50);
        assert_eq!(mgr.attach(&mut store, 50), AttachState::Attached);
        assert_eq!(store.get(50).unwrap().attempts, 1);
        assert_eq!(stats.snapshot().resolutions, 1);
        assert_eq!(mgr.attach(&mut store, 51), AttachState::Detached);
    }
}
