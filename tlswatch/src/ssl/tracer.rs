use std::{
    collections::{BTreeSet, HashMap},
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use log::{debug, info, warn};
use regex::Regex;

use super::{
    attach::{AttachManager, ProbeBackend},
    error::TraceError,
    queue::{DEFAULT_QUEUE_CAPACITY, LifecycleAction, LifecycleQueue},
    stats::{StatsSnapshot, TracerStats},
    store::{AttachState, FailureCause, ProcessRecord, ProcessStore},
    switch::TraceSwitch,
    symbols::SymbolResolver,
};
use crate::{probes::discovery::ProcessInspector, telemetry};

/// Direct control over one pid's tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceAction {
    /// Discover the pid's TLS library and track it, attaching if enabled.
    Add,
    /// Release the pid's record and its probe references.
    Remove,
}

impl From<LifecycleAction> for TraceAction {
    fn from(action: LifecycleAction) -> Self {
        match action {
            LifecycleAction::Exec => TraceAction::Add,
            LifecycleAction::Exit => TraceAction::Remove,
        }
    }
}

/// Which running processes the bootstrap scan may pick up.
#[derive(Debug, Clone, Default)]
pub enum ScanFilter {
    #[default]
    All,
    Pids(BTreeSet<u32>),
    Comm(Regex),
}

impl ScanFilter {
    fn admits_pid(&self, pid: u32) -> bool {
        match self {
            ScanFilter::Pids(pids) => pids.contains(&pid),
            _ => true,
        }
    }

    fn admits_comm(&self, comm: &str) -> bool {
        match self {
            ScanFilter::Comm(re) => re.is_match(comm),
            _ => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    pub library_path_overrides: Vec<PathBuf>,
    pub scan_filter: ScanFilter,
    /// Synthesized EXEC events queued before the scan stops to drain them.
    pub max_concurrent_attach: usize,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            library_path_overrides: Vec::new(),
            scan_filter: ScanFilter::All,
            max_concurrent_attach: 64,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TracerConfig {
    /// Initial state of the enable switch.
    pub enabled: bool,
    pub queue_capacity: usize,
    pub bootstrap: BootstrapConfig,
    pub max_resolve_retries: u32,
    pub retry_backoff: Duration,
    pub shutdown_budget: Duration,
    pub poll_interval: Duration,
    /// How long an exec'd process without a TLS library keeps being
    /// re-inspected while its dynamic loader maps libraries.
    pub exec_settle: Duration,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            bootstrap: BootstrapConfig::default(),
            max_resolve_retries: 3,
            retry_backoff: Duration::from_millis(2000),
            shutdown_budget: Duration::from_millis(5000),
            poll_interval: Duration::from_millis(100),
            exec_settle: Duration::from_millis(2000),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BootstrapReport {
    pub scanned: usize,
    /// Processes with a supported library that were queued for attach.
    pub matched: usize,
    pub race_losses: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub discarded_events: usize,
    pub detached: usize,
    /// Records still tracked when the budget ran out.
    pub abandoned: usize,
    pub leaked_probes: usize,
}

/// Cheap, cloneable entry point for producers and control calls.
///
/// Everything here is non-blocking: lifecycle notifications only enqueue.
#[derive(Clone)]
pub struct TracerHandle {
    queue: Arc<LifecycleQueue>,
    switch: Arc<TraceSwitch>,
    stats: Arc<TracerStats>,
}

impl TracerHandle {
    pub fn notify_exec(&self, pid: u32) {
        self.queue.push(pid, LifecycleAction::Exec);
    }

    pub fn notify_exit(&self, pid: u32) {
        self.queue.push(pid, LifecycleAction::Exit);
    }

    pub fn set_tracing_enabled(&self, enabled: bool) {
        if enabled != self.switch.is_enabled() {
            info!(
                "TLS tracing {}",
                if enabled { "enabled" } else { "disabled" }
            );
        }
        self.switch.set(enabled);
        self.queue.wake();
    }

    pub fn is_tracing_enabled(&self) -> bool {
        self.switch.is_enabled()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Report the kernel's running count of lifecycle events it could not
    /// deliver. A rise triggers reconciliation on the next drain.
    pub fn notify_kernel_drops(&self, total: u64) {
        self.queue.note_kernel_drops(total);
    }

    /// Nudge the worker out of its idle wait.
    pub fn wake(&self) {
        self.queue.wake();
    }
}

/// The attach engine. Owned by exactly one worker; all record, cache and
/// kernel-probe mutation happens through `&mut self`.
pub struct SslTracer {
    config: TracerConfig,
    queue: Arc<LifecycleQueue>,
    switch: Arc<TraceSwitch>,
    stats: Arc<TracerStats>,
    store: ProcessStore,
    attach: AttachManager,
    inspector: Box<dyn ProcessInspector + Send>,
    /// Exec'd pids with no TLS library yet, and when to stop looking.
    candidates: HashMap<u32, Instant>,
    seen_drops: u64,
}

impl SslTracer {
    pub fn new(
        config: TracerConfig,
        inspector: Box<dyn ProcessInspector + Send>,
        resolver: Box<dyn SymbolResolver + Send>,
        backend: Box<dyn ProbeBackend + Send>,
    ) -> Self {
        let stats = Arc::new(TracerStats::default());
        let mut inspector = inspector;
        inspector.set_library_overrides(&config.bootstrap.library_path_overrides);

        Self {
            queue: Arc::new(LifecycleQueue::new(config.queue_capacity)),
            switch: Arc::new(TraceSwitch::new(config.enabled)),
            attach: AttachManager::new(resolver, backend, stats.clone()),
            stats,
            store: ProcessStore::new(),
            inspector,
            candidates: HashMap::new(),
            seen_drops: 0,
            config,
        }
    }

    pub fn handle(&self) -> TracerHandle {
        TracerHandle {
            queue: self.queue.clone(),
            switch: self.switch.clone(),
            stats: self.stats.clone(),
        }
    }

    pub fn store(&self) -> &ProcessStore {
        &self.store
    }

    pub fn is_tracing_enabled(&self) -> bool {
        self.switch.is_enabled()
    }

    pub fn set_tracing_enabled(&self, enabled: bool) {
        self.switch.set(enabled);
    }

    /// Apply one action now, bypassing the queue. Returns the pid's state
    /// afterwards, or `None` when it is not tracked.
    pub fn apply_trace_action(&mut self, pid: u32, action: TraceAction) -> Option<AttachState> {
        // A new EXEC or an EXIT restarts or ends the wait for the loader.
        self.candidates.remove(&pid);
        match action {
            TraceAction::Add => self.add(pid),
            TraceAction::Remove => self.remove(pid),
        }
    }

    fn add(&mut self, pid: u32) -> Option<AttachState> {
        let image = match self.inspector.inspect(pid) {
            Ok(Some(image)) => image,
            Ok(None) => {
                // Re-exec into something without a TLS library, or the
                // loader has not mapped it yet.
                self.remove(pid);
                self.watch_candidate(pid);
                return None;
            }
            Err(e @ TraceError::RaceLoss { .. }) => {
                debug!("{}", e);
                self.candidates.remove(&pid);
                self.remove(pid);
                return None;
            }
            Err(e) => {
                warn!("PID {} discovery failed: {}", pid, e);
                return None;
            }
        };
        self.candidates.remove(&pid);

        if let Some(existing) = self.store.get(pid) {
            if existing.start_time == image.start_time && existing.key() == &image.library.key {
                debug!("Duplicate EXEC for PID {} ignored", pid);
                return Some(existing.state);
            }
            debug!(
                "PID {} ({}) replaced by a new image; releasing stale record",
                pid, existing.comm
            );
            self.attach.detach(&mut self.store, pid);
        }

        self.store
            .insert(ProcessRecord::new(pid, image.start_time, image.comm, image.library));

        if !self.switch.is_enabled() {
            debug!("PID {} pending until tracing is enabled", pid);
            return Some(AttachState::Pending);
        }
        Some(self.attach.attach(&mut self.store, pid))
    }

    fn watch_candidate(&mut self, pid: u32) {
        if self.config.exec_settle.is_zero() || self.candidates.contains_key(&pid) {
            return;
        }
        if self.candidates.len() >= self.config.queue_capacity {
            debug!("Too many exec'd PIDs awaiting a TLS library; not watching {}", pid);
            return;
        }
        self.candidates
            .insert(pid, Instant::now() + self.config.exec_settle);
    }

    /// Re-inspect exec'd pids that had no TLS library mapped yet. Each one
    /// is tracked as soon as the library shows up, or forgotten at its deadline.
    fn inspect_candidates(&mut self) {
        if self.candidates.is_empty() {
            return;
        }

        let now = Instant::now();
        let mut pids: Vec<u32> = self.candidates.keys().copied().collect();
        pids.sort_unstable();
        for pid in pids {
            if self.add(pid).is_some() {
                continue;
            }
            if self.candidates.get(&pid).is_some_and(|deadline| now >= *deadline) {
                debug!(
                    "PID {} mapped no TLS library within {:?}",
                    pid, self.config.exec_settle
                );
                self.candidates.remove(&pid);
            }
        }
    }

    fn remove(&mut self, pid: u32) -> Option<AttachState> {
        let record = self.attach.detach(&mut self.store, pid)?;
        debug!("PID {} ({}) released", pid, record.comm);
        Some(record.state)
    }

    /// Drain and fully process the lifecycle queue. Returns the number of
    /// events applied. Must only ever be called from one thread.
    pub fn process_queued_events(&mut self) -> usize {
        if self.switch.take_sweep_request() && self.switch.is_enabled() {
            self.sweep_pending();
        }

        let events = self.queue.drain();
        for event in &events {
            self.apply_trace_action(event.pid, event.action.into());
        }
        self.inspect_candidates();

        let dropped = self.queue.dropped();
        if dropped != self.seen_drops {
            let lost = dropped - self.seen_drops;
            self.seen_drops = dropped;
            warn!(
                "{} lifecycle events lost to overflow; reconciling tracked PIDs",
                lost
            );
            self.stats.set_dropped(dropped);
            telemetry::record_queue_drops(lost);
            self.reconcile();
        }

        self.retry_transient();
        self.publish();
        events.len()
    }

    /// One attach attempt for every record left pending while disabled.
    fn sweep_pending(&mut self) {
        let pending = self.store.pids_in_state(AttachState::Pending);
        if pending.is_empty() {
            return;
        }
        info!("Tracing enabled; attaching {} pending PIDs", pending.len());
        for pid in pending {
            self.attach.attach(&mut self.store, pid);
        }
    }

    /// Release records whose process died while its EXIT may have been
    /// dropped. A reused pid is a different process: its stale record goes
    /// too, and the new one is picked up if it maps a TLS library.
    fn reconcile(&mut self) {
        let tracked: Vec<(u32, u64)> = self
            .store
            .records()
            .map(|r| (r.pid, r.start_time))
            .collect();
        for (pid, start_time) in tracked {
            if self.inspector.is_same_incarnation(pid, start_time) {
                continue;
            }
            debug!("PID {} gone without EXIT", pid);
            self.remove(pid);
            self.add(pid);
        }
    }

    fn retry_transient(&mut self) {
        if !self.switch.is_enabled() {
            return;
        }

        let now = Instant::now();
        let due: Vec<(u32, u64)> = self
            .store
            .records()
            .filter(|r| r.state == AttachState::Failed)
            .filter(|r| r.failure == Some(FailureCause::Transient))
            .filter(|r| r.attempts <= self.config.max_resolve_retries)
            .filter(|r| {
                r.last_attempt
                    .is_none_or(|t| now.duration_since(t) >= self.config.retry_backoff)
            })
            .map(|r| (r.pid, r.start_time))
            .collect();

        for (pid, start_time) in due {
            match self.inspector.inspect(pid) {
                Ok(Some(image)) if image.start_time == start_time => {
                    // A failed record holds no cache reference, so its
                    // library can be swapped for the current build.
                    if let Some(record) = self.store.get_mut(pid) {
                        record.library = image.library;
                    }
                    let state = self.attach.attach(&mut self.store, pid);
                    debug!("PID {} retry -> {:?}", pid, state);
                }
                Ok(Some(_)) => {
                    self.add(pid);
                }
                Ok(None) | Err(TraceError::RaceLoss { .. }) => {
                    self.remove(pid);
                }
                Err(e) => debug!("PID {} retry skipped: {}", pid, e),
            }
        }
    }

    fn publish(&self) {
        self.stats.publish(&self.store);
        telemetry::record_active_probes(self.store.installed_probes() as u64);
    }

    /// Seed the store from processes already running. Synthesized EXEC
    /// events go through the queue like live ones, `max_concurrent_attach`
    /// at a time.
    pub fn collect_ssl_uprobe_syms_from_procfs(
        &mut self,
        config: &BootstrapConfig,
    ) -> Result<BootstrapReport> {
        self.inspector
            .set_library_overrides(&config.library_path_overrides);
        let pids = self
            .inspector
            .list_pids()
            .context("Failed to enumerate running processes")?;

        let batch = config.max_concurrent_attach.max(1);
        let mut report = BootstrapReport::default();
        let mut queued = 0;

        for pid in pids {
            report.scanned += 1;
            if !config.scan_filter.admits_pid(pid) {
                continue;
            }
            match self.inspector.inspect(pid) {
                Ok(Some(image)) if config.scan_filter.admits_comm(&image.comm) => {
                    report.matched += 1;
                    self.queue.push(pid, LifecycleAction::Exec);
                    queued += 1;
                    if queued % batch == 0 {
                        self.process_queued_events();
                    }
                }
                Ok(_) => {}
                Err(TraceError::RaceLoss { .. }) => report.race_losses += 1,
                Err(e) => debug!("Bootstrap skipped PID {}: {}", pid, e),
            }
        }
        self.process_queued_events();

        info!(
            "Bootstrap scanned {} processes, {} with a TLS library",
            report.scanned, report.matched
        );
        Ok(report)
    }

    /// Worker loop: wait for events, process them, repeat until `shutdown`.
    pub fn run(&mut self, shutdown: Arc<AtomicBool>) {
        while !shutdown.load(Ordering::Relaxed) {
            self.queue.wait(self.config.poll_interval);
            self.process_queued_events();
        }
    }

    /// Detach everything within the configured budget.
    pub fn shutdown(self) -> ShutdownReport {
        let budget = self.config.shutdown_budget;
        self.shutdown_within(budget)
    }

    /// Pending events are discarded: every tracked pid is released anyway.
    /// Whatever is still installed when `budget` runs out is left behind
    /// and reported.
    pub fn shutdown_within(mut self, budget: Duration) -> ShutdownReport {
        let deadline = Instant::now() + budget;
        let mut report = ShutdownReport {
            discarded_events: self.queue.drain().len(),
            ..Default::default()
        };

        for pid in self.store.pids() {
            if Instant::now() >= deadline {
                break;
            }
            if self.remove(pid).is_some() {
                report.detached += 1;
            }
        }

        report.abandoned = self.store.len();
        report.leaked_probes = self.store.installed_probes();
        if report.leaked_probes > 0 {
            warn!(
                "Shutdown budget of {:?} exhausted; leaving {} probes on {} libraries",
                budget,
                report.leaked_probes,
                self.store.cache_len()
            );
            self.stats.record_leaked(report.leaked_probes as u64);
            telemetry::record_leaked_probes(report.leaked_probes as u64);
        }
        self.publish();
        info!(
            "TLS tracer stopped: {} detached, {} leaked probes",
            report.detached, report.leaked_probes
        );
        report
    }
}
