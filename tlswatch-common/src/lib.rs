#![no_std]

/// Largest plaintext slice copied out of a single SSL_read/SSL_write call.
pub const MAX_SSL_BUF_SIZE: usize = 4096;

pub const PROC_EXEC: u32 = 1;
pub const PROC_EXIT: u32 = 2;

/// Process lifecycle notification emitted by the sched tracepoints.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct ProcEvent {
    pub pid: u32,
    /// `PROC_EXEC` or `PROC_EXIT`.
    pub action: u32,
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SslDirection {
    Read = 0,
    Write = 1,
    Handshake = 2,
}

impl From<u8> for SslDirection {
    fn from(v: u8) -> Self {
        match v {
            0 => SslDirection::Read,
            1 => SslDirection::Write,
            _ => SslDirection::Handshake,
        }
    }
}

/// One intercepted TLS call, with up to `MAX_SSL_BUF_SIZE` bytes of plaintext.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SslEvent {
    pub pid: u32,
    pub tid: u32,
    pub timestamp: u64,
    pub latency_ns: u64,
    pub cgroup_id: u64,
    /// Bytes actually transferred by the call; may exceed the copied slice.
    pub len: u32,
    pub rw: u8,
    pub is_handshake: u8,
    pub buf_filled: u8,
    pub _pad: u8,
    pub comm: [u8; 16],
    pub buf: [u8; MAX_SSL_BUF_SIZE],
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for ProcEvent {}

#[cfg(feature = "user")]
unsafe impl aya::Pod for SslEvent {}
