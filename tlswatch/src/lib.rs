pub mod probes;
pub mod settings;
pub mod ssl;
pub mod telemetry;

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use log::{debug, info, warn};
use tokio::signal::unix::{SignalKind, signal};

use crate::{
    probes::{LifecycleWatch, discovery::ProcfsInspector},
    settings::Settings,
    ssl::{AyaProbeBackend, LogSink, OpensslResolver, SslTracer, TracerConfig, init_tracer},
};

const STATS_LOG_INTERVAL_SECS: u64 = 60;

pub struct TlsWatchEngine {
    pub settings: Settings,
    config: TracerConfig,
    backend: AyaProbeBackend,
}

impl TlsWatchEngine {
    pub fn new(settings: Settings, bytecode: &[u8]) -> Result<Self> {
        bump_memlock_rlimit()?;
        let config = settings
            .to_tracer_config()
            .context("Invalid tracer configuration")?;
        let backend = init_tracer(bytecode).context("Failed to initialize TLS tracer")?;
        Ok(Self {
            settings,
            config,
            backend,
        })
    }

    /// Override the configured initial state of the enable switch.
    pub fn start_disabled(mut self, disabled: bool) -> Self {
        if disabled {
            self.config.enabled = false;
        }
        self
    }

    pub async fn run(self) -> Result<()> {
        if let Err(e) = telemetry::init_metrics() {
            warn!("Failed to initialize metrics: {:#}", e);
        }

        let Self {
            config,
            mut backend,
            ..
        } = self;

        probes::spawn_payload_handler(backend.bpf_mut(), Arc::new(LogSink))?;
        let lifecycle = LifecycleWatch::attach(backend.bpf_mut())?;
        if lifecycle.is_none() {
            warn!("No process lifecycle tracepoints; only already-running processes will be traced");
        }

        let bootstrap = config.bootstrap.clone();
        let mut tracer = SslTracer::new(
            config,
            Box::new(ProcfsInspector::default()),
            Box::new(OpensslResolver),
            Box::new(backend),
        );
        let handle = tracer.handle();
        if let Some(watch) = lifecycle {
            watch.start(handle.clone());
        }

        // Live events queued during the scan are deduplicated by the store.
        let shutdown = probes::shutdown_flag();
        let worker = tokio::task::spawn_blocking(move || {
            if let Err(e) = tracer.collect_ssl_uprobe_syms_from_procfs(&bootstrap) {
                warn!("Bootstrap scan failed; tracing new processes only: {:#}", e);
            }
            tracer.run(shutdown);
            tracer.shutdown()
        });

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigusr1 = signal(SignalKind::user_defined1())?;
        let mut sigusr2 = signal(SignalKind::user_defined2())?;
        let mut stats_tick = tokio::time::interval(Duration::from_secs(STATS_LOG_INTERVAL_SECS));

        info!(
            "TLS tracing active (enabled={}). SIGUSR1 enables, SIGUSR2 disables, Ctrl-C exits.",
            handle.is_tracing_enabled()
        );
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                _ = sigterm.recv() => break,
                _ = sigusr1.recv() => handle.set_tracing_enabled(true),
                _ = sigusr2.recv() => handle.set_tracing_enabled(false),
                _ = stats_tick.tick() => debug!("{:?}", handle.stats()),
            }
        }

        info!("Exiting...");
        probes::request_shutdown();
        handle.wake();
        let report = worker.await.context("Tracer worker panicked")?;
        if report.leaked_probes > 0 {
            warn!(
                "{} probes on {} processes were not removed before exit",
                report.leaked_probes, report.abandoned
            );
        }

        telemetry::shutdown_metrics();
        Ok(())
    }
}

fn bump_memlock_rlimit() -> Result<()> {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        warn!("Failed to increase rlimit");
    }
    Ok(())
}
