//! x86_64 context switching
//!
//! Voluntary switches only: a fiber gives up the CPU at a call site, so
//! saving the System V callee-saved set plus a resume address is enough.

use std::arch::naked_asm;

/// Saved register block for a voluntary context switch.
///
/// Field order is load-bearing: the assembly below addresses the block with
/// fixed offsets.
#[repr(C)]
pub(crate) struct Context {
    rsp: u64, // 0x00
    rip: u64, // 0x08
    rbx: u64, // 0x10
    rbp: u64, // 0x18
    r12: u64, // 0x20
    r13: u64, // 0x28
    r14: u64, // 0x30
    r15: u64, // 0x38
}

impl Context {
    pub(crate) const fn new() -> Self {
        Self {
            rsp: 0,
            rip: 0,
            rbx: 0,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
        }
    }
}

/// Prepare `ctx` so that the first switch into it enters `entry` on the
/// given stack.
///
/// # Safety
///
/// `ctx` must point to a valid `Context`. `stack_top` must be the high end
/// of a live mapping large enough for `entry` to run.
pub(crate) unsafe fn init_context(ctx: *mut Context, stack_top: *mut u8, entry: extern "C" fn()) {
    // 16-byte alignment per the System V AMD64 ABI, minus 8 so the
    // trampoline's `call` leaves the callee correctly aligned.
    let sp = (stack_top as usize & !0xF) - 8;

    let ctx = &mut *ctx;
    ctx.rsp = sp as u64;
    ctx.rip = fiber_trampoline as usize as u64;
    ctx.rbx = 0;
    ctx.rbp = 0;
    ctx.r12 = entry as usize as u64;
    ctx.r13 = 0;
    ctx.r14 = 0;
    ctx.r15 = 0;
}

/// First frame on a fresh fiber stack: calls the entry function stashed in
/// r12 by `init_context`.
#[unsafe(naked)]
unsafe extern "C" fn fiber_trampoline() {
    naked_asm!(
        "call r12",
        "call {returned}",
        "ud2",
        returned = sym entry_returned,
    );
}

/// Entry functions finish with a terminal yield and never return here.
extern "C" fn entry_returned() -> ! {
    std::process::abort();
}

/// Save the current execution state into `old` and resume from `new`.
///
/// Returns (to the caller saved in `old`) when something later switches
/// back into `old`.
///
/// # Safety
///
/// Both pointers must reference valid `Context` blocks. `new` must hold
/// either state captured by a previous switch or state prepared by
/// `init_context`, and its stack must still be live.
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn context_switch(_old: *mut Context, _new: *const Context) {
    naked_asm!(
        // Save callee-saved registers to old (RDI)
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Load callee-saved registers from new (RSI)
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        // Jump to the new RIP
        "jmp rax",
        // Resume point for the saved context
        "1:",
        "ret",
    );
}
