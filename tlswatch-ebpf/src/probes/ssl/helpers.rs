use aya_ebpf::{
    helpers::{
        bpf_get_current_cgroup_id, bpf_get_current_comm, bpf_get_current_pid_tgid,
        bpf_ktime_get_ns, bpf_probe_read_user, bpf_probe_read_user_buf,
    },
    programs::RetProbeContext,
};
use tlswatch_common::{MAX_SSL_BUF_SIZE, SslEvent};

use super::maps::{BUFS, LEN_PTRS, START_NS};

#[inline(always)]
pub fn current_tid() -> u32 {
    bpf_get_current_pid_tgid() as u32
}

/// Per-thread state carried from a uprobe to its matching uretprobe.
pub struct Call;

impl Call {
    #[inline(always)]
    pub fn begin(tid: u32, buf_addr: u64, len_ptr: Option<u64>) {
        let ts = unsafe { bpf_ktime_get_ns() };
        let _ = START_NS.insert(&tid, &ts, 0);
        let _ = BUFS.insert(&tid, &buf_addr, 0);
        if let Some(lp) = len_ptr {
            let _ = LEN_PTRS.insert(&tid, &lp, 0);
        }
    }

    #[inline(always)]
    pub fn lookup(tid: u32) -> (u64, u64, Option<u64>) {
        unsafe {
            let ts = START_NS.get(&tid).copied().unwrap_or(0);
            let buf = BUFS.get(&tid).copied().unwrap_or(0);
            let len_ptr = LEN_PTRS.get(&tid).copied();
            (ts, buf, len_ptr)
        }
    }

    #[inline(always)]
    pub fn end(tid: u32) {
        let _ = START_NS.remove(&tid);
        let _ = BUFS.remove(&tid);
        let _ = LEN_PTRS.remove(&tid);
    }
}

pub trait SslEventExt {
    fn fill(&mut self, ctx: &RetProbeContext, rw: u8, is_handshake: bool) -> Result<(), u32>;
}

impl SslEventExt for SslEvent {
    #[inline(always)]
    fn fill(&mut self, ctx: &RetProbeContext, rw: u8, is_handshake: bool) -> Result<(), u32> {
        let tid = current_tid();
        let (start_ts, buf_addr, len_ptr) = Call::lookup(tid);

        let pid_tgid = bpf_get_current_pid_tgid();
        self.pid = (pid_tgid >> 32) as u32;
        self.tid = pid_tgid as u32;
        self.timestamp = unsafe { bpf_ktime_get_ns() };
        self.cgroup_id = unsafe { bpf_get_current_cgroup_id() };
        self.rw = rw;
        self.is_handshake = is_handshake as u8;
        self.latency_ns = if start_ts > 0 { self.timestamp - start_ts } else { 0 };
        self.comm = bpf_get_current_comm().unwrap_or([0; 16]);

        let ret: i64 = ctx.ret().ok_or(1u32)?;
        if ret <= 0 {
            return Err(1);
        }

        self.len = match len_ptr {
            Some(lp) => {
                let n: usize = unsafe { bpf_probe_read_user(lp as *const usize) }.map_err(|_| 1u32)?;
                n as u32
            }
            None => ret as u32,
        };

        self.buf_filled = 0;
        if buf_addr > 0 {
            let to_read = core::cmp::min(self.len as usize, MAX_SSL_BUF_SIZE);
            unsafe { bpf_probe_read_user_buf(buf_addr as *const u8, &mut self.buf[..to_read]) }
                .map_err(|_| 1u32)?;
            self.buf_filled = 1;
        }

        Ok(())
    }
}
