use log::debug;
use tlswatch_common::{MAX_SSL_BUF_SIZE, SslDirection, SslEvent};

/// Consumer of intercepted plaintext. Called from the ring-buffer thread,
/// so implementations must not block for long.
pub trait PayloadSink: Send + Sync {
    fn consume(&self, event: &SslEvent);
}

/// Default sink: one summary line per call.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl PayloadSink for LogSink {
    fn consume(&self, event: &SslEvent) {
        let direction = SslDirection::from(event.rw);
        if event.is_handshake == 1 {
            debug!(
                "[{}] pid={} tid={} handshake latency={}us",
                comm(event),
                event.pid,
                event.tid,
                event.latency_ns / 1000
            );
            return;
        }

        debug!(
            "[{}] pid={} tid={} {:?} {} bytes ({} captured) latency={}us cgroup={}",
            comm(event),
            event.pid,
            event.tid,
            direction,
            event.len,
            payload(event).len(),
            event.latency_ns / 1000,
            event.cgroup_id
        );
    }
}

pub fn comm(event: &SslEvent) -> String {
    let end = event
        .comm
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(event.comm.len());
    String::from_utf8_lossy(&event.comm[..end]).into_owned()
}

/// The plaintext bytes the kernel managed to copy.
pub fn payload(event: &SslEvent) -> &[u8] {
    if event.buf_filled == 0 {
        return &[];
    }
    let len = (event.len as usize).min(MAX_SSL_BUF_SIZE);
    &event.buf[..len]
}
