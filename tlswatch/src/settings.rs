use std::{collections::BTreeSet, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use config::{Config, ConfigError, Environment};
use log::warn;
use regex::Regex;
use serde::Deserialize;

use crate::ssl::{BootstrapConfig, ScanFilter, TracerConfig};

/// Tracer configuration, read from `TRACER__*` environment variables.
#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct TracerSettings {
    pub enabled: Option<bool>,
    pub queue_capacity: Option<usize>,
    pub library_path_overrides: Option<Vec<String>>,
    /// Comma-separated pids the bootstrap scan is limited to.
    pub scan_pids: Option<String>,
    /// Regex on the process name the bootstrap scan is limited to.
    pub scan_comm: Option<String>,
    pub max_concurrent_attach: Option<usize>,
    pub max_resolve_retries: Option<u32>,
    pub retry_backoff_ms: Option<u64>,
    pub shutdown_budget_ms: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    /// How long a freshly exec'd process is watched for its TLS library.
    pub exec_settle_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct Settings {
    pub otel_exporter_otlp_endpoint: Option<String>,
    #[serde(default)]
    pub tracer: TracerSettings,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let s = Config::builder()
            .add_source(
                Environment::default()
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("tracer.library_path_overrides")
                    .try_parsing(true),
            )
            .build()?;

        s.try_deserialize()
    }

    pub fn to_tracer_config(&self) -> Result<TracerConfig> {
        let t = &self.tracer;
        let defaults = TracerConfig::default();

        let bootstrap = BootstrapConfig {
            library_path_overrides: t
                .library_path_overrides
                .iter()
                .flatten()
                .filter(|p| !p.trim().is_empty())
                .map(|p| PathBuf::from(p.trim()))
                .collect(),
            scan_filter: self.scan_filter()?,
            max_concurrent_attach: t
                .max_concurrent_attach
                .unwrap_or(defaults.bootstrap.max_concurrent_attach),
        };

        Ok(TracerConfig {
            enabled: t.enabled.unwrap_or(defaults.enabled),
            queue_capacity: t.queue_capacity.unwrap_or(defaults.queue_capacity),
            bootstrap,
            max_resolve_retries: t
                .max_resolve_retries
                .unwrap_or(defaults.max_resolve_retries),
            retry_backoff: t
                .retry_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_backoff),
            shutdown_budget: t
                .shutdown_budget_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.shutdown_budget),
            poll_interval: t
                .poll_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            exec_settle: t
                .exec_settle_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.exec_settle),
        })
    }

    fn scan_filter(&self) -> Result<ScanFilter> {
        let t = &self.tracer;
        if let Some(pids) = &t.scan_pids {
            if t.scan_comm.is_some() {
                warn!("Both scan_pids and scan_comm set; using scan_pids");
            }
            let pids = pids
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(|p| {
                    p.parse::<u32>()
                        .with_context(|| format!("Invalid pid in TRACER__SCAN_PIDS: {}", p))
                })
                .collect::<Result<BTreeSet<u32>>>()?;
            return Ok(ScanFilter::Pids(pids));
        }
        if let Some(pattern) = &t.scan_comm {
            let re = Regex::new(pattern)
                .with_context(|| format!("Invalid TRACER__SCAN_COMM regex: {}", pattern))?;
            return Ok(ScanFilter::Comm(re));
        }
        Ok(ScanFilter::All)
    }
}
