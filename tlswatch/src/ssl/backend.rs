use std::{
    collections::HashMap,
    path::Path,
    sync::atomic::{AtomicBool, Ordering},
};

use aya::{
    Ebpf,
    programs::{UProbe, uprobe::UProbeLinkId},
};
use aya_log::EbpfLogger;
use log::{debug, info, warn};

use super::{
    attach::ProbeBackend,
    error::TraceError,
    store::ProbeId,
    symbols::{ProbeSpec, probe_programs},
};

/// Set by the first `init_tracer` call and never cleared.
static TRACER_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Load the kernel programs and maps. Succeeds at most once per process;
/// every later call is `AlreadyInitialized`, even after a failed load.
pub fn init_tracer(bytecode: &[u8]) -> Result<AyaProbeBackend, TraceError> {
    if TRACER_INITIALIZED.swap(true, Ordering::AcqRel) {
        return Err(TraceError::AlreadyInitialized);
    }

    let mut bpf = Ebpf::load(bytecode).map_err(|e| TraceError::Fatal(e.to_string()))?;
    if let Err(e) = EbpfLogger::init(&mut bpf) {
        warn!("Failed to initialize eBPF logger: {}", e);
    }

    for name in probe_programs() {
        let program: &mut UProbe = bpf
            .program_mut(name)
            .ok_or_else(|| TraceError::Fatal(format!("Failed to find {} program", name)))?
            .try_into()
            .map_err(|e| TraceError::Fatal(format!("{} is not a uprobe: {}", name, e)))?;
        program
            .load()
            .map_err(|e| TraceError::Fatal(format!("Failed to load {}: {}", name, e)))?;
        debug!("Loaded program {}", name);
    }

    info!("TLS tracer kernel programs loaded");
    Ok(AyaProbeBackend {
        bpf,
        links: HashMap::new(),
        next_id: 0,
    })
}

/// `ProbeBackend` over the loaded uprobe programs. Each install is one
/// link on a shared program; removing the link detaches that probe only.
pub struct AyaProbeBackend {
    bpf: Ebpf,
    links: HashMap<ProbeId, (&'static str, UProbeLinkId)>,
    next_id: u64,
}

impl AyaProbeBackend {
    /// For wiring maps and tracepoints before the backend moves to the worker.
    pub fn bpf_mut(&mut self) -> &mut Ebpf {
        &mut self.bpf
    }

    fn uprobe(&mut self, program: &'static str) -> Result<&mut UProbe, String> {
        self.bpf
            .program_mut(program)
            .ok_or_else(|| format!("program {} not loaded", program))?
            .try_into()
            .map_err(|e| format!("{}", e))
    }
}

impl ProbeBackend for AyaProbeBackend {
    fn install(
        &mut self,
        library: &Path,
        probe: &ProbeSpec,
        offset: u64,
    ) -> Result<ProbeId, TraceError> {
        let rejected = |reason: String| TraceError::AttachRejected {
            program: probe.program,
            path: library.to_path_buf(),
            offset,
            reason,
        };

        let link = self
            .uprobe(probe.program)
            .map_err(rejected)?
            .attach(None, offset, library, None)
            .map_err(|e| rejected(e.to_string()))?;

        self.next_id += 1;
        let id = ProbeId(self.next_id);
        self.links.insert(id, (probe.program, link));
        Ok(id)
    }

    fn remove(&mut self, probe: ProbeId) -> Result<(), TraceError> {
        let Some((program, link)) = self.links.remove(&probe) else {
            return Ok(());
        };
        self.uprobe(program)
            .map_err(TraceError::Fatal)?
            .detach(link)
            .map_err(|e| TraceError::Fatal(format!("detach {} failed: {}", program, e)))
    }
}
