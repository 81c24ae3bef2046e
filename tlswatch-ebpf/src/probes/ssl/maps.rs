use aya_ebpf::{
    macros::map,
    maps::{HashMap, RingBuf},
};

pub const MAX_ENTRIES: u32 = 10240;
pub const SSL_RINGBUF_SIZE: u32 = 8 * 1024 * 1024; // 8MB

#[map]
pub static SSL_EVENTS: RingBuf = RingBuf::with_byte_size(SSL_RINGBUF_SIZE, 0);

/// tid -> call start timestamp
#[map]
pub static START_NS: HashMap<u32, u64> = HashMap::with_max_entries(MAX_ENTRIES, 0);

/// tid -> user buffer pointer
#[map]
pub static BUFS: HashMap<u32, u64> = HashMap::with_max_entries(MAX_ENTRIES, 0);

/// tid -> `size_t *` out-param of the `_ex` variants
#[map]
pub static LEN_PTRS: HashMap<u32, u64> = HashMap::with_max_entries(MAX_ENTRIES, 0);
