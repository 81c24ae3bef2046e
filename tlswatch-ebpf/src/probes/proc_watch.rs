//! Process lifecycle tracepoints.
//!
//! Userspace consumes `PROC_EVENTS` to attach SSL probes when a process
//! execs and to release them when it exits. Programs only reserve and
//! submit; all inspection happens in userspace.

use aya_ebpf::{
    helpers::bpf_get_current_pid_tgid,
    macros::{map, tracepoint},
    maps::{PerCpuArray, RingBuf},
    programs::TracePointContext,
};
use tlswatch_common::{PROC_EXEC, PROC_EXIT, ProcEvent};

pub const PROC_RINGBUF_SIZE: u32 = 256 * 1024; // 256KB

#[map]
pub static PROC_EVENTS: RingBuf = RingBuf::with_byte_size(PROC_RINGBUF_SIZE, 0);

/// Lifecycle events lost to a full `PROC_EVENTS`, per CPU. Userspace sums
/// the slots and reconciles tracked pids when the total moves.
#[map]
pub static PROC_EVENTS_DROPPED: PerCpuArray<u64> = PerCpuArray::with_max_entries(1, 0);

#[inline(always)]
fn submit(pid: u32, action: u32) {
    if let Some(mut slot) = PROC_EVENTS.reserve::<ProcEvent>(0) {
        let event = unsafe { &mut *slot.as_mut_ptr() };
        event.pid = pid;
        event.action = action;
        slot.submit(0);
    } else if let Some(dropped) = PROC_EVENTS_DROPPED.get_ptr_mut(0) {
        unsafe { *dropped += 1 };
    }
}

/// sched_process_exec: the exec'ing thread is the thread-group leader by now.
#[tracepoint]
pub fn probe_exec(_ctx: TracePointContext) -> u32 {
    submit((bpf_get_current_pid_tgid() >> 32) as u32, PROC_EXEC);
    0
}

/// sched_process_exit fires per thread; only the leader's exit ends the process.
#[tracepoint]
pub fn probe_exit(_ctx: TracePointContext) -> u32 {
    let pid_tgid = bpf_get_current_pid_tgid();
    let tgid = (pid_tgid >> 32) as u32;
    let tid = pid_tgid as u32;
    if tgid == tid {
        submit(tgid, PROC_EXIT);
    }
    0
}
