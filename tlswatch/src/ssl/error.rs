use std::path::PathBuf;

use thiserror::Error;

/// Outcome classes of the attach pipeline.
///
/// Only `Fatal` and `AlreadyInitialized` ever escape to the agent; the rest
/// are folded into a record's `AttachState` and logged by the worker.
#[derive(Debug, Error)]
pub enum TraceError {
    #[error("unsupported TLS library {path}: {reason}")]
    UnsupportedLibrary { path: PathBuf, reason: String },

    #[error("transient resolution failure for {path}: {reason}")]
    TransientResolution { path: PathBuf, reason: String },

    #[error("kernel rejected probe {program} at {path}+{offset:#x}: {reason}")]
    AttachRejected {
        program: &'static str,
        path: PathBuf,
        offset: u64,
        reason: String,
    },

    #[error("process {pid} went away before it could be traced")]
    RaceLoss { pid: u32 },

    #[error("tracer already initialized in this process")]
    AlreadyInitialized,

    #[error("failed to load kernel instrumentation: {0}")]
    Fatal(String),
}

/// Verdict of a `SymbolResolver` that could not produce offsets.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    /// Not a build we know how to probe. Permanent for that library key.
    #[error("{0}")]
    Unsupported(String),
    /// The image could not be read consistently. Worth retrying.
    #[error("{0}")]
    Transient(String),
}

impl ResolveError {
    pub fn into_trace_error(self, path: PathBuf) -> TraceError {
        match self {
            ResolveError::Unsupported(reason) => TraceError::UnsupportedLibrary { path, reason },
            ResolveError::Transient(reason) => TraceError::TransientResolution { path, reason },
        }
    }
}
