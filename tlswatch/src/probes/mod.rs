use std::{
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result};
use aya::{
    Ebpf,
    maps::{MapData, PerCpuArray, RingBuf},
    programs::TracePoint,
};
use log::{debug, info, warn};
use tlswatch_common::{ProcEvent, SslEvent};

use crate::ssl::{PayloadSink, TracerHandle, queue::LifecycleAction};

pub mod discovery;

static SHUTDOWN: once_cell::sync::Lazy<Arc<AtomicBool>> =
    once_cell::sync::Lazy::new(|| Arc::new(AtomicBool::new(false)));

pub fn shutdown_flag() -> Arc<AtomicBool> {
    SHUTDOWN.clone()
}

pub fn request_shutdown() {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

pub struct TracepointConfig<'a> {
    pub program_name: &'a str,
    pub category: &'a str,
    pub name: &'a str,
}

pub const POLL_INTERVAL_MS: u64 = 10;

pub const PROC_EXEC_TRACEPOINT: TracepointConfig<'static> = TracepointConfig {
    program_name: "probe_exec",
    category: "sched",
    name: "sched_process_exec",
};

pub const PROC_EXIT_TRACEPOINT: TracepointConfig<'static> = TracepointConfig {
    program_name: "probe_exit",
    category: "sched",
    name: "sched_process_exit",
};

fn tracepoint_exists(category: &str, name: &str) -> bool {
    const TRACEFS_MOUNT_POINTS: [&str; 2] = ["/sys/kernel/tracing", "/sys/kernel/debug/tracing"];

    TRACEFS_MOUNT_POINTS.iter().any(|base| {
        Path::new(base)
            .join("events")
            .join(category)
            .join(name)
            .exists()
    })
}

pub fn attach_tracepoint(bpf: &mut Ebpf, config: &TracepointConfig) -> Result<bool> {
    if !tracepoint_exists(config.category, config.name) {
        warn!(
            "Tracepoint {}:{} not available; skipping {}",
            config.category, config.name, config.program_name
        );
        return Ok(false);
    }

    info!("Loading program {}", config.program_name);
    let program: &mut TracePoint = bpf
        .program_mut(config.program_name)
        .with_context(|| format!("Failed to find {} program", config.program_name))?
        .try_into()?;
    program.load()?;
    program
        .attach(config.category, config.name)
        .with_context(|| format!("Failed to attach {}", config.name))?;
    Ok(true)
}

pub fn take_ringbuf(bpf: &mut Ebpf, map_name: &str) -> Result<RingBuf<MapData>> {
    let map = bpf
        .take_map(map_name)
        .with_context(|| format!("Failed to get {} map", map_name))?;
    Ok(RingBuf::try_from(map)?)
}

pub fn spawn_ringbuf_handler<T, F>(bpf: &mut Ebpf, map_name: &str, handler: F) -> Result<()>
where
    T: Copy + Send + 'static,
    F: Fn(T) + Send + 'static,
{
    let ring_buf = take_ringbuf(bpf, map_name)?;
    spawn_ringbuf_loop(ring_buf, handler, || {});
    Ok(())
}

/// Poll `ring_buf` on a blocking thread until shutdown, decoding each record
/// as `T`. `after_poll` runs once per pass, after the buffer is emptied.
pub fn spawn_ringbuf_loop<T, F, G>(mut ring_buf: RingBuf<MapData>, handler: F, mut after_poll: G)
where
    T: Copy + Send + 'static,
    F: Fn(T) + Send + 'static,
    G: FnMut() + Send + 'static,
{
    let shutdown = shutdown_flag();

    tokio::task::spawn_blocking(move || {
        while !shutdown.load(Ordering::Relaxed) {
            let mut has_work = false;
            while let Some(item) = ring_buf.next() {
                has_work = true;
                if item.len() >= std::mem::size_of::<T>() {
                    let event = unsafe { (item.as_ptr() as *const T).read_unaligned() };
                    handler(event);
                }
            }
            after_poll();
            if !has_work {
                std::thread::sleep(Duration::from_millis(POLL_INTERVAL_MS));
            }
        }
    });
}

/// Exec/exit tracepoints, attached, with their ring buffer not yet drained.
pub struct LifecycleWatch {
    events: RingBuf<MapData>,
    dropped: Option<PerCpuArray<MapData, u64>>,
}

impl LifecycleWatch {
    /// Attach the sched tracepoints. `None` when neither exists; the tracer
    /// then only covers what the bootstrap scan finds.
    pub fn attach(bpf: &mut Ebpf) -> Result<Option<Self>> {
        let exec = attach_tracepoint(bpf, &PROC_EXEC_TRACEPOINT)?;
        let exit = attach_tracepoint(bpf, &PROC_EXIT_TRACEPOINT)?;
        if !exec && !exit {
            return Ok(None);
        }
        if !exit {
            warn!("No exit notifications; probes are only released on overflow reconciliation");
        }

        let events = take_ringbuf(bpf, "PROC_EVENTS")?;
        let dropped = match take_drop_counter(bpf) {
            Ok(counter) => Some(counter),
            Err(e) => {
                warn!("Kernel-side lifecycle drops will go unnoticed: {:#}", e);
                None
            }
        };
        Ok(Some(Self { events, dropped }))
    }

    /// Start forwarding records into the tracer's lifecycle queue, along
    /// with the kernel's count of records it had no room for.
    pub fn start(self, handle: TracerHandle) {
        let Self { events, dropped } = self;
        let drops = handle.clone();
        spawn_ringbuf_loop(
            events,
            move |event: ProcEvent| dispatch_lifecycle(&handle, event),
            move || {
                if let Some(counter) = &dropped {
                    match read_drop_counter(counter) {
                        Ok(total) => drops.notify_kernel_drops(total),
                        Err(e) => debug!("Failed to read PROC_EVENTS_DROPPED: {}", e),
                    }
                }
            },
        );
    }
}

fn take_drop_counter(bpf: &mut Ebpf) -> Result<PerCpuArray<MapData, u64>> {
    let map = bpf
        .take_map("PROC_EVENTS_DROPPED")
        .context("Failed to get PROC_EVENTS_DROPPED map")?;
    Ok(PerCpuArray::try_from(map)?)
}

/// Sum of the per-CPU slots.
fn read_drop_counter(counter: &PerCpuArray<MapData, u64>) -> Result<u64> {
    let per_cpu = counter.get(&0, 0)?;
    Ok(per_cpu.iter().sum())
}

fn dispatch_lifecycle(handle: &TracerHandle, event: ProcEvent) {
    match LifecycleAction::from_raw(event.action) {
        Some(LifecycleAction::Exec) => handle.notify_exec(event.pid),
        Some(LifecycleAction::Exit) => handle.notify_exit(event.pid),
        None => debug!("Unknown lifecycle action {} for PID {}", event.action, event.pid),
    }
}

/// Hand every intercepted TLS call to `sink`.
pub fn spawn_payload_handler(bpf: &mut Ebpf, sink: Arc<dyn PayloadSink>) -> Result<()> {
    spawn_ringbuf_handler(bpf, "SSL_EVENTS", move |event: SslEvent| sink.consume(&event))
}
