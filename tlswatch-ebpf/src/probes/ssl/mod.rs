//! OpenSSL uprobes.
//!
//! Userspace attaches these by file offset, once per distinct libssl build.
//!
//! # Program mapping
//! - `probe_ssl_rw_enter` → entry of `SSL_read(ssl, buf, num)` and `SSL_write(ssl, buf, num)`
//! - `probe_ssl_read_exit` / `probe_ssl_write_exit` → returns of the above
//! - `probe_ssl_rw_ex_enter` → entry of `SSL_read_ex` / `SSL_write_ex` (4th arg is `size_t *`)
//! - `probe_ssl_read_ex_exit` / `probe_ssl_write_ex_exit` → returns of the `_ex` variants
//! - `probe_ssl_do_handshake_enter` / `_exit` → `SSL_do_handshake`

use aya_ebpf::{
    macros::{uprobe, uretprobe},
    programs::{ProbeContext, RetProbeContext},
};
use aya_log_ebpf::warn;
use tlswatch_common::{SslDirection, SslEvent};

mod helpers;
pub mod maps;

use helpers::{Call, SslEventExt, current_tid};
use maps::SSL_EVENTS;

#[uprobe]
pub fn probe_ssl_rw_enter(ctx: ProbeContext) -> u32 {
    Call::begin(current_tid(), ctx.arg(1).unwrap_or(0), None);
    0
}

#[uretprobe]
pub fn probe_ssl_read_exit(ctx: RetProbeContext) -> u32 {
    emit(&ctx, SslDirection::Read as u8, false)
}

#[uretprobe]
pub fn probe_ssl_write_exit(ctx: RetProbeContext) -> u32 {
    emit(&ctx, SslDirection::Write as u8, false)
}

#[uprobe]
pub fn probe_ssl_rw_ex_enter(ctx: ProbeContext) -> u32 {
    Call::begin(
        current_tid(),
        ctx.arg(1).unwrap_or(0),
        Some(ctx.arg(3).unwrap_or(0)),
    );
    0
}

#[uretprobe]
pub fn probe_ssl_read_ex_exit(ctx: RetProbeContext) -> u32 {
    emit(&ctx, SslDirection::Read as u8, false)
}

#[uretprobe]
pub fn probe_ssl_write_ex_exit(ctx: RetProbeContext) -> u32 {
    emit(&ctx, SslDirection::Write as u8, false)
}

#[uprobe]
pub fn probe_ssl_do_handshake_enter(_ctx: ProbeContext) -> u32 {
    Call::begin(current_tid(), 0, None);
    0
}

#[uretprobe]
pub fn probe_ssl_do_handshake_exit(ctx: RetProbeContext) -> u32 {
    emit(&ctx, SslDirection::Handshake as u8, true)
}

#[inline(always)]
fn emit(ctx: &RetProbeContext, rw: u8, is_handshake: bool) -> u32 {
    if let Some(mut slot) = SSL_EVENTS.reserve::<SslEvent>(0) {
        let event = unsafe { &mut *slot.as_mut_ptr() };
        if event.fill(ctx, rw, is_handshake).is_ok() {
            slot.submit(0);
        } else {
            slot.discard(0);
        }
    } else {
        warn!(ctx, "SSL_EVENTS full, dropping event");
    }
    Call::end(current_tid());
    0
}
