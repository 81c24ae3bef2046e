//! OpenTelemetry metrics export.
//!
//! Mirrors the engine's attach/detach counters to an OTLP collector.
//! Export is off unless `OTEL_EXPORTER_OTLP_ENDPOINT` is set; every
//! `record_*` helper is a no-op until `init_metrics` succeeds.

use anyhow::{Context, Result};
use log::info;
use opentelemetry::metrics::{Counter, Meter};
use opentelemetry::{KeyValue, global};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const METRIC_EXPORT_INTERVAL_SECS: u64 = 30;

static METRICS: OnceLock<TlsWatchMetrics> = OnceLock::new();

static METER_PROVIDER: OnceLock<SdkMeterProvider> = OnceLock::new();

/// Read by the `tls_active_probes` gauge callback.
static ACTIVE_PROBES: AtomicU64 = AtomicU64::new(0);

/// Note: no _total suffix on counters, Prometheus adds it.
pub struct TlsWatchMetrics {
    pub queue_dropped_events: Counter<u64>,
    pub symbol_resolutions: Counter<u64>,
    pub attach_rejected: Counter<u64>,
    pub unsupported_libraries: Counter<u64>,
    pub leaked_probes: Counter<u64>,
}

impl TlsWatchMetrics {
    fn new(meter: &Meter) -> Self {
        Self {
            queue_dropped_events: meter
                .u64_counter("tls_queue_dropped_events")
                .with_description("Lifecycle events discarded because the queue was full")
                .with_unit("events")
                .build(),
            symbol_resolutions: meter
                .u64_counter("tls_symbol_resolutions")
                .with_description("TLS library images parsed for entry-point offsets")
                .with_unit("resolutions")
                .build(),
            attach_rejected: meter
                .u64_counter("tls_attach_rejected")
                .with_description("Uprobe installs refused by the kernel")
                .with_unit("probes")
                .build(),
            unsupported_libraries: meter
                .u64_counter("tls_unsupported_libraries")
                .with_description("Distinct library builds rejected as unsupported")
                .with_unit("libraries")
                .build(),
            leaked_probes: meter
                .u64_counter("tls_leaked_probes")
                .with_description("Probes still installed when the shutdown budget ran out")
                .with_unit("probes")
                .build(),
        }
    }
}

/// Reads OTEL_EXPORTER_OTLP_ENDPOINT; unset or empty disables export.
fn get_otlp_endpoint() -> Option<String> {
    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok()?;
    if endpoint.is_empty() {
        return None;
    }

    if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
        Some(format!("http://{}", endpoint))
    } else {
        Some(endpoint)
    }
}

/// Initialize the OTLP (gRPC) metrics pipeline. Must run inside a tokio runtime.
pub fn init_metrics() -> Result<()> {
    let endpoint = match get_otlp_endpoint() {
        Some(ep) => ep,
        None => {
            info!("OTEL_EXPORTER_OTLP_ENDPOINT not set. Metrics export disabled.");
            return Ok(());
        }
    };

    info!("OTLP endpoint: {}", endpoint);

    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(&endpoint)
        .with_timeout(Duration::from_secs(10))
        .build()
        .context("Failed to create OTLP metric exporter")?;

    let reader = PeriodicReader::builder(exporter, opentelemetry_sdk::runtime::Tokio)
        .with_interval(Duration::from_secs(METRIC_EXPORT_INTERVAL_SECS))
        .build();

    let resource = Resource::default().merge(&Resource::new(vec![
        KeyValue::new("service.name", "tlswatch"),
        KeyValue::new("telemetry.sdk.language", "rust"),
    ]));

    let provider = SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(resource)
        .build();

    global::set_meter_provider(provider.clone());
    let _ = METER_PROVIDER.set(provider);

    let meter = global::meter("tlswatch");

    let _active_probes_gauge = meter
        .u64_observable_gauge("tls_active_probes")
        .with_description("Uprobes currently installed on TLS libraries")
        .with_unit("probes")
        .with_callback(|observer| {
            observer.observe(ACTIVE_PROBES.load(Ordering::Relaxed), &[]);
        })
        .build();

    let _ = METRICS.set(TlsWatchMetrics::new(&meter));

    info!("OpenTelemetry metrics initialized successfully");
    Ok(())
}

pub fn metrics() -> Option<&'static TlsWatchMetrics> {
    METRICS.get()
}

pub fn record_queue_drops(count: u64) {
    if let Some(m) = metrics() {
        m.queue_dropped_events.add(count, &[]);
    }
}

pub fn record_symbol_resolution(family: &str) {
    if let Some(m) = metrics() {
        m.symbol_resolutions
            .add(1, &[KeyValue::new("family", family.to_string())]);
    }
}

pub fn record_attach_rejected(program: &str) {
    if let Some(m) = metrics() {
        m.attach_rejected
            .add(1, &[KeyValue::new("program", program.to_string())]);
    }
}

pub fn record_unsupported_library(path: &str) {
    if let Some(m) = metrics() {
        m.unsupported_libraries
            .add(1, &[KeyValue::new("library", path.to_string())]);
    }
}

pub fn record_leaked_probes(count: u64) {
    if let Some(m) = metrics() {
        m.leaked_probes.add(count, &[]);
    }
}

pub fn record_active_probes(count: u64) {
    ACTIVE_PROBES.store(count, Ordering::Relaxed);
}

/// Flush pending metrics and shut the provider down.
pub fn shutdown_metrics() {
    if let Some(provider) = METER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            log::warn!("Failed to shutdown MeterProvider: {}", e);
        } else {
            info!("OpenTelemetry metrics shutdown complete");
        }
    }
}
