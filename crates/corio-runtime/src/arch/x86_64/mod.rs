//! x86_64 context switching (System V AMD64 ABI)
//!
//! The switch routine and the entry trampoline are plain `global_asm!`
//! functions so they work on any stable toolchain.

use std::arch::global_asm;

use super::EntryFn;

/// Callee-saved state of a suspended coroutine.
///
/// Offsets are hard-coded in the assembly below.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Context {
    pub rsp: u64,   // 0x00
    pub rip: u64,   // 0x08
    pub rbx: u64,   // 0x10
    pub rbp: u64,   // 0x18
    pub r12: u64,   // 0x20
    pub r13: u64,   // 0x28
    pub r14: u64,   // 0x30
    pub r15: u64,   // 0x38
    pub mxcsr: u32, // 0x40
    pub fpucw: u32, // 0x44
}

impl Default for Context {
    fn default() -> Self {
        Self {
            rsp: 0,
            rip: 0,
            rbx: 0,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            mxcsr: 0x1F80,
            fpucw: 0x037F,
        }
    }
}

global_asm!(
    ".text",
    ".global corio_ctx_swap",
    ".type corio_ctx_swap,@function",
    "corio_ctx_swap:",
    // save into *rdi
    "mov [rdi + 0x00], rsp",
    "lea rax, [rip + 2f]",
    "mov [rdi + 0x08], rax",
    "mov [rdi + 0x10], rbx",
    "mov [rdi + 0x18], rbp",
    "mov [rdi + 0x20], r12",
    "mov [rdi + 0x28], r13",
    "mov [rdi + 0x30], r14",
    "mov [rdi + 0x38], r15",
    "stmxcsr [rdi + 0x40]",
    "fnstcw [rdi + 0x44]",
    // load from *rsi
    "mov rsp, [rsi + 0x00]",
    "mov rax, [rsi + 0x08]",
    "mov rbx, [rsi + 0x10]",
    "mov rbp, [rsi + 0x18]",
    "mov r12, [rsi + 0x20]",
    "mov r13, [rsi + 0x28]",
    "mov r14, [rsi + 0x30]",
    "mov r15, [rsi + 0x38]",
    "ldmxcsr [rsi + 0x40]",
    "fldcw [rsi + 0x44]",
    "jmp rax",
    "2:",
    "ret",
    ".size corio_ctx_swap, .-corio_ctx_swap",
    "",
    ".global corio_ctx_trampoline",
    ".type corio_ctx_trampoline,@function",
    "corio_ctx_trampoline:",
    "mov rdi, r13",
    "call r12",
    "ud2",
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
    // The trampoline is entered by `jmp` and immediately `call`s the entry,
    // so rsp must be 16-byte aligned here for the callee to see rsp % 16 == 8.
    let sp = (stack_top as usize) & !0xF;

    *ctx = Context::default();
    ctx.rsp = sp as u64;
    ctx.rip = corio_ctx_trampoline as usize as u64;
    ctx.r12 = entry as usize as u64;
    ctx.r13 = arg as u64;
}

/// Save the running context into `from` and resume `to`.
///
/// Returns when something switches back into `from`.
///
/// # Safety
///
/// Both pointers must be valid. `to` must have been filled by a previous
/// `swap_context` or by `init_context`.
#[inline(never)]
pub unsafe fn swap_context(from: *mut Context, to: *const Context) {
    corio_ctx_swap(from, to);
}
