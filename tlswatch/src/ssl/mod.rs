//! Dynamic SSL uprobe attachment.
//!
//! Lifecycle producers only enqueue (`TracerHandle`); a single worker owns
//! the `SslTracer` and performs every discovery, symbol resolution and
//! probe install/remove. See `tracer` for the event flow.

pub mod attach;
pub mod backend;
pub mod error;
pub mod queue;
pub mod sink;
pub mod stats;
pub mod store;
pub mod switch;
pub mod symbols;
pub mod tracer;

#[cfg(test)]
pub(crate) mod testing;

pub use backend::{AyaProbeBackend, init_tracer};
pub use error::TraceError;
pub use sink::{LogSink, PayloadSink};
pub use stats::StatsSnapshot;
pub use store::AttachState;
pub use symbols::OpensslResolver;
pub use tracer::{
    BootstrapConfig, BootstrapReport, ScanFilter, ShutdownReport, SslTracer, TraceAction,
    TracerConfig, TracerHandle,
};
