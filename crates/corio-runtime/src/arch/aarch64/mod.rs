//! aarch64 context switching (AAPCS64)

use std::arch::global_asm;

use super::EntryFn;

/// Callee-saved state of a suspended coroutine: sp, lr, x19-x29, d8-d15.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Context {
    pub sp: u64,       // 0x00
    pub lr: u64,       // 0x08
    pub x: [u64; 11],  // 0x10 x19..x29
    pub d: [u64; 8],   // 0x68 d8..d15
}

global_asm!(
    ".text",
    ".global corio_ctx_swap",
    ".type corio_ctx_swap,%function",
    "corio_ctx_swap:",
    "mov x9, sp",
    "str x9, [x0, #0x00]",
    "str x30, [x0, #0x08]",
    "stp x19, x20, [x0, #0x10]",
    "stp x21, x22, [x0, #0x20]",
    "stp x23, x24, [x0, #0x30]",
    "stp x25, x26, [x0, #0x40]",
    "stp x27, x28, [x0, #0x50]",
    "str x29, [x0, #0x60]",
    "stp d8, d9, [x0, #0x68]",
    "stp d10, d11, [x0, #0x78]",
    "stp d12, d13, [x0, #0x88]",
    "stp d14, d15, [x0, #0x98]",
    "ldr x9, [x1, #0x00]",
    "mov sp, x9",
    "ldr x30, [x1, #0x08]",
    "ldp x19, x20, [x1, #0x10]",
    "ldp x21, x22, [x1, #0x20]",
    "ldp x23, x24, [x1, #0x30]",
    "ldp x25, x26, [x1, #0x40]",
    "ldp x27, x28, [x1, #0x50]",
    "ldr x29, [x1, #0x60]",
    "ldp d8, d9, [x1, #0x68]",
    "ldp d10, d11, [x1, #0x78]",
    "ldp d12, d13, [x1, #0x88]",
    "ldp d14, d15, [x1, #0x98]",
    "ret",
    ".size corio_ctx_swap, .-corio_ctx_swap",
    "",
    ".global corio_ctx_trampoline",
    ".type corio_ctx_trampoline,%function",
    "corio_ctx_trampoline:",
    "mov x0, x20",
    "blr x19",
    "brk #0",
    ".size corio_ctx_trampoline, .-corio_ctx_trampoline",
);

extern "C" {
    fn corio_ctx_swap(from: *mut Context, to: *const Context);
    fn corio_ctx_trampoline();
}

/// Prime `ctx` so the first switch into it runs `entry(arg)` on the stack
/// ending at `stack_top`.
///
/// # Safety
///
/// `stack_top` must be the one-past-the-end address of a writable stack
/// that stays alive for as long as the context can be switched into.
pub unsafe fn init_context(ctx: &mut Context, stack_top: *mut u8, entry: EntryFn, arg: usize) {
    let sp = (stack_top as usize) & !0xF;

    *ctx = Context::default();
    ctx.sp = sp as u64;
    ctx.lr = corio_ctx_trampoline as usize as u64;
    ctx.x[0] = entry as usize as u64; // x19
    ctx.x[1] = arg as u64; // x20
}

/// Save the running context into `from` and resume `to`.
///
/// # Safety
///
/// Both pointers must be valid. `to` must have been filled by a previous
/// `swap_context` or by `init_context`.
#[inline(never)]
pub unsafe fn swap_context(from: *mut Context, to: *const Context) {
    corio_ctx_swap(from, to);
}
