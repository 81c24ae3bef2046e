use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::debug;
use once_cell::sync::Lazy;
use procfs::{ProcError, process::MMapPath};
use regex::Regex;

use crate::ssl::{
    error::TraceError,
    symbols::{LibraryImage, LibraryKey},
};

/// libssl sonames. libcrypto is never matched: it carries no SSL_* entry points.
static SSL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^libssl\.so(\.[0-9][0-9a-z.]*)?$").unwrap());

/// A live process with a supported TLS library mapped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessImage {
    pub pid: u32,
    pub start_time: u64,
    pub comm: String,
    pub library: LibraryImage,
}

/// Per-pid view of running processes, as the event worker needs it.
pub trait ProcessInspector {
    fn list_pids(&self) -> Result<Vec<u32>>;

    /// `Ok(None)` when the process maps no supported library;
    /// `Err(TraceError::RaceLoss)` when it is already gone.
    fn inspect(&self, pid: u32) -> Result<Option<ProcessImage>, TraceError>;

    /// Whether `pid` is still the process that started at `start_time`.
    /// A reused pid is a different process.
    fn is_same_incarnation(&self, pid: u32, start_time: u64) -> bool;

    /// Extra library files to treat as the supported TLS library.
    fn set_library_overrides(&mut self, _paths: &[PathBuf]) {}
}

/// Decides whether a mapped file is a TLS library we probe.
#[derive(Debug, Clone, Default)]
pub struct LibraryMatcher {
    overrides: Vec<PathBuf>,
}

impl LibraryMatcher {
    pub fn new(overrides: Vec<PathBuf>) -> Self {
        Self { overrides }
    }

    /// Overrides match by full path, or by file name when given bare.
    pub fn matches(&self, path: &Path) -> bool {
        let file_name = path.file_name();
        let overridden = self.overrides.iter().any(|o| {
            if o.components().count() == 1 {
                file_name == Some(o.as_os_str())
            } else {
                o == path
            }
        });

        overridden
            || file_name
                .and_then(|n| n.to_str())
                .map(|n| SSL_PATTERN.is_match(n))
                .unwrap_or(false)
    }
}

/// Resolves a path from a process's namespace to the host filesystem.
/// Handles containerized processes by looking through /proc/<PID>/root.
pub fn resolve_host_path(pid: i32, container_path: &Path) -> PathBuf {
    if container_path.starts_with("/proc") {
        return container_path.to_path_buf();
    }

    let mut root_path = PathBuf::from(format!("/proc/{}/root", pid));
    let relative_path = container_path.strip_prefix("/").unwrap_or(container_path);
    root_path.push(relative_path);

    root_path
}

/// `ProcessInspector` over /proc.
#[derive(Debug, Clone, Default)]
pub struct ProcfsInspector {
    matcher: LibraryMatcher,
}

impl ProcfsInspector {
    pub fn new(overrides: Vec<PathBuf>) -> Self {
        Self {
            matcher: LibraryMatcher::new(overrides),
        }
    }
}

impl ProcessInspector for ProcfsInspector {
    fn list_pids(&self) -> Result<Vec<u32>> {
        let procs = procfs::process::all_processes().context("Failed to read /proc")?;
        Ok(procs.filter_map(|p| p.ok()).map(|p| p.pid as u32).collect())
    }

    fn inspect(&self, pid: u32) -> Result<Option<ProcessImage>, TraceError> {
        let unreadable = |e: ProcError| match e {
            ProcError::NotFound(_) => Err(TraceError::RaceLoss { pid }),
            other => {
                debug!("Cannot inspect PID {}: {}", pid, other);
                Ok(None)
            }
        };

        let process = match procfs::process::Process::new(pid as i32) {
            Ok(p) => p,
            Err(e) => return unreadable(e),
        };
        let stat = match process.stat() {
            Ok(s) => s,
            Err(e) => return unreadable(e),
        };
        let maps = match process.maps() {
            Ok(m) => m,
            Err(e) => return unreadable(e),
        };

        for map in maps {
            let MMapPath::Path(path) = map.pathname else {
                continue;
            };
            if !self.matcher.matches(&path) {
                continue;
            }

            let host_path = resolve_host_path(process.pid, &path);
            let key = LibraryKey::fingerprint(&path, &host_path).map_err(|e| {
                debug!("{} (PID {}) not readable: {}", host_path.display(), pid, e);
                TraceError::RaceLoss { pid }
            })?;
            debug!("Found TLS library {} (PID {})", path.display(), pid);

            return Ok(Some(ProcessImage {
                pid,
                start_time: stat.starttime,
                comm: stat.comm,
                library: LibraryImage { key, host_path },
            }));
        }

        Ok(None)
    }

    fn is_same_incarnation(&self, pid: u32, start_time: u64) -> bool {
        match procfs::process::Process::new(pid as i32).and_then(|p| p.stat()) {
            Ok(stat) => stat.starttime == start_time,
            Err(ProcError::NotFound(_)) => false,
            Err(e) => {
                // Unreadable is not proof of death; keep the record.
                debug!("Cannot stat PID {}: {}", pid, e);
                true
            }
        }
    }

    fn set_library_overrides(&mut self, paths: &[PathBuf]) {
        self.matcher = LibraryMatcher::new(paths.to_vec());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matcher_accepts_libssl_sonames() {
        let m = LibraryMatcher::default();
        assert!(m.matches(Path::new("/usr/lib/x86_64-linux-gnu/libssl.so.3")));
        assert!(m.matches(Path::new("/usr/lib64/libssl.so.1.0.2k")));
        assert!(m.matches(Path::new("/usr/lib/libssl.so")));
        assert!(!m.matches(Path::new("/usr/lib/x86_64-linux-gnu/libcrypto.so.3")));
        assert!(!m.matches(Path::new("/usr/lib/libssl.so.3 (deleted)")));
        assert!(!m.matches(Path::new("/usr/lib/libssl3.so")));
    }

    #[test]
    fn test_matcher_overrides() {
        let m = LibraryMatcher::new(vec![
            PathBuf::from("/opt/app/lib/libvendortls.so"),
            PathBuf::from("libboringssl.so"),
        ]);
        assert!(m.matches(Path::new("/opt/app/lib/libvendortls.so")));
        assert!(!m.matches(Path::new("/elsewhere/libvendortls.so")));
        assert!(m.matches(Path::new("/anywhere/libboringssl.so")));
    }

    #[test]
    fn test_resolve_host_path() {
        assert_eq!(
            resolve_host_path(42, Path::new("/usr/lib/libssl.so.3")),
            PathBuf::from("/proc/42/root/usr/lib/libssl.so.3")
        );
        assert_eq!(
            resolve_host_path(42, Path::new("/proc/1/root/lib/libssl.so.3")),
            PathBuf::from("/proc/1/root/lib/libssl.so.3")
        );
    }

    #[test]
    fn test_inspect_missing_pid_is_race_loss() {
        let inspector = ProcfsInspector::default();
        assert!(matches!(
            inspector.inspect(99_999_999),
            Err(TraceError::RaceLoss { pid: 99_999_999 })
        ));
        assert!(!inspector.is_same_incarnation(99_999_999, 0));
    }

    #[test]
    fn test_inspect_self_does_not_fail() {
        let inspector = ProcfsInspector::default();
        let pid = std::process::id();
        assert!(inspector.inspect(pid).is_ok());

        let start_time = procfs::process::Process::myself()
            .and_then(|p| p.stat())
            .unwrap()
            .starttime;
        assert!(inspector.is_same_incarnation(pid, start_time));
        assert!(!inspector.is_same_incarnation(pid, start_time + 1));
        assert!(inspector.list_pids().unwrap().contains(&pid));
    }
}
