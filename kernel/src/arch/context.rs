//! Thread contexts and the low-level context switch.
//!
//! A context is just the saved kernel stack pointer; everything else the
//! thread needs (callee-saved registers, return address) lives in a frame on
//! its own stack, written either by [`context_switch`] when the thread is
//! suspended or by [`Context::prepare`] for a thread that has never run.
//!
//! New threads resume in a trampoline that calls
//! [`crate::task::thread::thread_bootstrap`], which lowers the IPL, runs the
//! thread's entry closure, and exits the thread.

use core::arch::naked_asm;

/// Saved execution state of a suspended kernel thread.
///
/// The page-directory pointer conceptually belongs here as well; the
/// scheduler keeps it alongside the thread and activates it just before the
/// stack switch, which is where a port would reload the page-table base
/// register.
#[repr(C)]
pub struct Context {
    /// Saved kernel stack pointer. Offset 0: the switch assembly stores
    /// through and loads from this field directly.
    sp: usize,
}

impl Context {
    /// An empty context, filled in by the first switch away from the thread.
    pub const fn zeroed() -> Context {
        Context { sp: 0 }
    }

    /// Build the initial context for a thread that has never run.
    ///
    /// Writes a fake switch frame at the top of the thread's stack so that
    /// the first `context_switch` into it "returns" into the trampoline.
    /// `stack_top` is one past the highest usable byte and must be 16-byte
    /// aligned.
    pub fn prepare(stack_top: usize) -> Context {
        assert_eq!(stack_top % 16, 0, "kernel stack top must be 16-byte aligned");

        cfg_if::cfg_if! {
            if #[cfg(target_arch = "x86_64")] {
                // Frame popped by the switch epilogue, lowest address first:
                // r15 r14 r13 r12 rbx rbp, then the return slot.
                const SLOTS: usize = 7;
                let base = stack_top - SLOTS * 8;
                unsafe {
                    let frame = base as *mut usize;
                    for i in 0..SLOTS {
                        frame.add(i).write(0);
                    }
                    frame.add(SLOTS - 1).write(thread_trampoline as usize);
                }
                Context { sp: base }
            } else if #[cfg(target_arch = "aarch64")] {
                // Frame restored by the switch epilogue:
                // x19..x28, x29, x30, d8..d15 — 20 doublewords.
                const SLOTS: usize = 20;
                let base = stack_top - SLOTS * 8;
                unsafe {
                    let frame = base as *mut usize;
                    for i in 0..SLOTS {
                        frame.add(i).write(0);
                    }
                    // x30 (link register) slot: `ret` jumps here.
                    frame.add(11).write(thread_trampoline as usize);
                }
                Context { sp: base }
            } else {
                compile_error!("unsupported architecture for the context switch");
            }
        }
    }
}

/// Switch from the context saved through `old` to the context in `new`.
///
/// Saves callee-saved state on the current stack, stores the stack pointer
/// into `*old`, and resumes `*new`. Returns when some other thread switches
/// back to `*old`.
///
/// # Safety
/// `old` and `new` must point at live [`Context`]s; `new` must hold either a
/// frame written by a prior switch or one built by [`Context::prepare`]; and
/// the stack behind `*old` must stay allocated until the save completes — on
/// a single CPU that holds because nothing else runs before the store to
/// `*old` retires.
#[cfg(target_arch = "x86_64")]
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(old: *mut Context, new: *const Context) {
    naked_asm!(
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov [rdi], rsp",
        "mov rsp, [rsi]",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "ret",
    );
}

/// First code a new thread executes; reached by the final `ret` of
/// [`context_switch`]. The stack pointer sits exactly at the stack top, so
/// the call below produces a conventionally aligned frame.
#[cfg(target_arch = "x86_64")]
#[unsafe(naked)]
extern "C" fn thread_trampoline() {
    naked_asm!(
        "call {bootstrap}",
        "ud2",
        bootstrap = sym crate::task::thread::thread_bootstrap,
    );
}

#[cfg(target_arch = "aarch64")]
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(old: *mut Context, new: *const Context) {
    naked_asm!(
        "sub sp, sp, #160",
        "stp x19, x20, [sp, #0]",
        "stp x21, x22, [sp, #16]",
        "stp x23, x24, [sp, #32]",
        "stp x25, x26, [sp, #48]",
        "stp x27, x28, [sp, #64]",
        "stp x29, x30, [sp, #80]",
        "stp d8,  d9,  [sp, #96]",
        "stp d10, d11, [sp, #112]",
        "stp d12, d13, [sp, #128]",
        "stp d14, d15, [sp, #144]",
        "mov x9, sp",
        "str x9, [x0]",
        "ldr x9, [x1]",
        "mov sp, x9",
        "ldp x19, x20, [sp, #0]",
        "ldp x21, x22, [sp, #16]",
        "ldp x23, x24, [sp, #32]",
        "ldp x25, x26, [sp, #48]",
        "ldp x27, x28, [sp, #64]",
        "ldp x29, x30, [sp, #80]",
        "ldp d8,  d9,  [sp, #96]",
        "ldp d10, d11, [sp, #112]",
        "ldp d12, d13, [sp, #128]",
        "ldp d14, d15, [sp, #144]",
        "add sp, sp, #160",
        "ret",
    );
}

#[cfg(target_arch = "aarch64")]
#[unsafe(naked)]
extern "C" fn thread_trampoline() {
    naked_asm!(
        "bl {bootstrap}",
        "brk #0",
        bootstrap = sym crate::task::thread::thread_bootstrap,
    );
}
