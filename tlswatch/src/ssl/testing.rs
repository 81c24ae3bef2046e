//! In-memory stand-ins for the kernel, /proc and ELF parsing.
//!
//! Each fake is a cheap handle over shared state so a test can keep one
//! clone for assertions after boxing another into the tracer.

use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use anyhow::Result;

use super::{
    attach::ProbeBackend,
    error::{ResolveError, TraceError},
    store::ProbeId,
    symbols::{EntryPoint, LibraryImage, LibraryKey, ProbeSpec, SslOffsets, SymbolResolver},
};
use crate::probes::discovery::{ProcessImage, ProcessInspector};

pub fn library(path: &str, inode: u64) -> LibraryImage {
    LibraryImage {
        key: LibraryKey {
            path: PathBuf::from(path),
            dev: 8,
            inode,
            size: 4096,
            mtime_ns: 1,
        },
        host_path: PathBuf::from(path),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstalledProbe {
    pub library: PathBuf,
    pub program: &'static str,
    pub offset: u64,
}

#[derive(Default)]
struct BackendState {
    next_id: u64,
    installed: HashMap<ProbeId, InstalledProbe>,
    install_calls: usize,
    remove_calls: usize,
    rejected_programs: HashSet<&'static str>,
}

#[derive(Clone, Default)]
pub struct FakeBackend {
    state: Arc<Mutex<BackendState>>,
}

impl FakeBackend {
    pub fn reject_program(&self, program: &'static str) {
        self.state.lock().unwrap().rejected_programs.insert(program);
    }

    pub fn installed(&self) -> Vec<InstalledProbe> {
        self.state.lock().unwrap().installed.values().cloned().collect()
    }

    pub fn installed_on(&self, library: &str) -> usize {
        self.installed()
            .iter()
            .filter(|p| p.library == Path::new(library))
            .count()
    }

    pub fn install_calls(&self) -> usize {
        self.state.lock().unwrap().install_calls
    }

    pub fn remove_calls(&self) -> usize {
        self.state.lock().unwrap().remove_calls
    }
}

impl ProbeBackend for FakeBackend {
    fn install(
        &mut self,
        library: &Path,
        probe: &ProbeSpec,
        offset: u64,
    ) -> Result<ProbeId, TraceError> {
        let mut state = self.state.lock().unwrap();
        state.install_calls += 1;
        if state.rejected_programs.contains(probe.program) {
            return Err(TraceError::AttachRejected {
                program: probe.program,
                path: library.to_path_buf(),
                offset,
                reason: "EPERM".to_string(),
            });
        }
        let installed = InstalledProbe {
            library: library.to_path_buf(),
            program: probe.program,
            offset,
        };
        assert!(
            !state.installed.values().any(|p| *p == installed),
            "duplicate kernel probe {:?}",
            installed
        );
        state.next_id += 1;
        let id = ProbeId(state.next_id);
        state.installed.insert(id, installed);
        Ok(id)
    }

    fn remove(&mut self, probe: ProbeId) -> Result<(), TraceError> {
        let mut state = self.state.lock().unwrap();
        state.remove_calls += 1;
        state.installed.remove(&probe);
        Ok(())
    }
}

#[derive(Default)]
struct ResolverState {
    verdicts: HashMap<LibraryKey, Result<SslOffsets, ResolveError>>,
    calls: HashMap<LibraryKey, usize>,
}

/// Resolves every library to the three required entry points unless told otherwise.
#[derive(Clone, Default)]
pub struct FakeResolver {
    state: Arc<Mutex<ResolverState>>,
}

impl FakeResolver {
    pub fn set_verdict(&self, key: &LibraryKey, verdict: Result<SslOffsets, ResolveError>) {
        self.state
            .lock()
            .unwrap()
            .verdicts
            .insert(key.clone(), verdict);
    }

    pub fn calls(&self, key: &LibraryKey) -> usize {
        self.state.lock().unwrap().calls.get(key).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.state.lock().unwrap().calls.values().sum()
    }
}

pub fn default_offsets() -> SslOffsets {
    let mut offsets = SslOffsets::default();
    offsets.insert(EntryPoint::Read, 0x1000);
    offsets.insert(EntryPoint::Write, 0x2000);
    offsets.insert(EntryPoint::Handshake, 0x3000);
    offsets
}

impl SymbolResolver for FakeResolver {
    fn family(&self) -> &'static str {
        "fake"
    }

    fn resolve(&self, image: &LibraryImage) -> Result<SslOffsets, ResolveError> {
        let mut state = self.state.lock().unwrap();
        *state.calls.entry(image.key.clone()).or_default() += 1;
        state
            .verdicts
            .get(&image.key)
            .cloned()
            .unwrap_or_else(|| Ok(default_offsets()))
    }
}

#[derive(Clone)]
struct FakeProcess {
    start_time: u64,
    comm: String,
    library: Option<LibraryImage>,
}

#[derive(Clone, Default)]
pub struct FakeInspector {
    processes: Arc<Mutex<HashMap<u32, FakeProcess>>>,
    overrides: Arc<Mutex<Vec<PathBuf>>>,
}

impl FakeInspector {
    pub fn spawn(&self, pid: u32, start_time: u64, comm: &str, library: Option<LibraryImage>) {
        self.processes.lock().unwrap().insert(
            pid,
            FakeProcess {
                start_time,
                comm: comm.to_string(),
                library,
            },
        );
    }

    /// The dynamic loader maps `library` into an already running `pid`.
    pub fn map_library(&self, pid: u32, library: LibraryImage) {
        if let Some(process) = self.processes.lock().unwrap().get_mut(&pid) {
            process.library = Some(library);
        }
    }

    pub fn kill(&self, pid: u32) {
        self.processes.lock().unwrap().remove(&pid);
    }

    pub fn overrides(&self) -> Vec<PathBuf> {
        self.overrides.lock().unwrap().clone()
    }
}

impl ProcessInspector for FakeInspector {
    fn list_pids(&self) -> Result<Vec<u32>> {
        let mut pids: Vec<u32> = self.processes.lock().unwrap().keys().copied().collect();
        pids.sort_unstable();
        Ok(pids)
    }

    fn inspect(&self, pid: u32) -> Result<Option<ProcessImage>, TraceError> {
        let processes = self.processes.lock().unwrap();
        let proc = processes.get(&pid).ok_or(TraceError::RaceLoss { pid })?;
        Ok(proc.library.clone().map(|library| ProcessImage {
            pid,
            start_time: proc.start_time,
            comm: proc.comm.clone(),
            library,
        }))
    }

    fn is_same_incarnation(&self, pid: u32, start_time: u64) -> bool {
        self.processes
            .lock()
            .unwrap()
            .get(&pid)
            .is_some_and(|p| p.start_time == start_time)
    }

    fn set_library_overrides(&mut self, paths: &[PathBuf]) {
        *self.overrides.lock().unwrap() = paths.to_vec();
    }
}
