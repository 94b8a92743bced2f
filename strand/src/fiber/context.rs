//! Machine context switching.
//!
//! A [`Context`] is just a saved stack pointer: `strand_switch_context` pushes the
//! callee-saved registers of the running code onto its own stack, stores the resulting stack
//! pointer, loads the target's stack pointer and pops the target's registers back off. A
//! fresh context is a hand-built frame whose return address is the fiber entry point.

use std::arch::global_asm;

#[cfg(not(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64"))))]
compile_error!("strand fibers support linux on x86_64 and aarch64 only");

#[derive(Debug, Default)]
#[repr(C)]
pub(crate) struct Context {
    sp: usize,
}

unsafe extern "C" {
    fn strand_switch_context(save_sp: *mut usize, load_sp: usize);
}

impl Context {
    /// Builds the initial frame on the stack ending at `top` so that the first switch into
    /// this context starts executing `entry`.
    ///
    /// # Safety
    ///
    /// `top` must be the upper end of a writable region of at least a few hundred bytes that
    /// stays mapped for as long as this context can be switched to.
    pub unsafe fn prepare(&mut self, top: *mut u8, entry: extern "C" fn() -> !) {
        let top = top as usize & !15;
        unsafe { self.sp = initial_frame(top, entry as usize) };
    }

    /// Saves the running context into `from` and resumes `to`. Returns when something
    /// switches back into `from`.
    ///
    /// # Safety
    ///
    /// `to` must hold a context saved by a previous switch or built by [`Context::prepare`],
    /// and it must not be running on any thread.
    pub unsafe fn switch(from: *mut Context, to: *const Context) {
        unsafe { strand_switch_context(&raw mut (*from).sp, (*to).sp) }
    }
}

// Frame layout, from the saved stack pointer upwards:
//   [mxcsr:u32 | x87 cw:u16 | pad]  r15 r14 r13 r12 rbx rbp  return-address
#[cfg(target_arch = "x86_64")]
global_asm!(
    ".text",
    ".global strand_switch_context",
    ".type strand_switch_context,@function",
    ".p2align 4",
    "strand_switch_context:",
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "sub rsp, 8",
    "stmxcsr dword ptr [rsp]",
    "fnstcw word ptr [rsp + 4]",
    "mov qword ptr [rdi], rsp",
    "mov rsp, rsi",
    "ldmxcsr dword ptr [rsp]",
    "fldcw word ptr [rsp + 4]",
    "add rsp, 8",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "ret",
    ".size strand_switch_context, . - strand_switch_context",
);

#[cfg(target_arch = "x86_64")]
unsafe fn initial_frame(top: usize, entry: usize) -> usize {
    // Nine words: control state, six registers, the entry address popped by `ret`, and a null
    // return address for `entry` itself. `entry` starts with rsp % 16 == 8 as after a call.
    const DEFAULT_CONTROL: usize = (0x037F << 32) | 0x1F80;

    let sp = top - 9 * 8;
    let frame = sp as *mut usize;
    unsafe {
        frame.write(DEFAULT_CONTROL);
        for slot in 1..7 {
            frame.add(slot).write(0);
        }
        frame.add(7).write(entry);
        frame.add(8).write(0);
    }
    sp
}

// Frame layout (176 bytes): x19..x28, x29, x30, d8..d15, padding.
#[cfg(target_arch = "aarch64")]
global_asm!(
    ".text",
    ".global strand_switch_context",
    ".type strand_switch_context,%function",
    ".p2align 4",
    "strand_switch_context:",
    "sub sp, sp, #176",
    "stp x19, x20, [sp, #0]",
    "stp x21, x22, [sp, #16]",
    "stp x23, x24, [sp, #32]",
    "stp x25, x26, [sp, #48]",
    "stp x27, x28, [sp, #64]",
    "stp x29, x30, [sp, #80]",
    "stp d8, d9, [sp, #96]",
    "stp d10, d11, [sp, #112]",
    "stp d12, d13, [sp, #128]",
    "stp d14, d15, [sp, #144]",
    "mov x9, sp",
    "str x9, [x0]",
    "mov sp, x1",
    "ldp x19, x20, [sp, #0]",
    "ldp x21, x22, [sp, #16]",
    "ldp x23, x24, [sp, #32]",
    "ldp x25, x26, [sp, #48]",
    "ldp x27, x28, [sp, #64]",
    "ldp x29, x30, [sp, #80]",
    "ldp d8, d9, [sp, #96]",
    "ldp d10, d11, [sp, #112]",
    "ldp d12, d13, [sp, #128]",
    "ldp d14, d15, [sp, #144]",
    "add sp, sp, #176",
    "ret",
    ".size strand_switch_context, . - strand_switch_context",
);

#[cfg(target_arch = "aarch64")]
unsafe fn initial_frame(top: usize, entry: usize) -> usize {
    const FRAME_WORDS: usize = 22;
    const X30_SLOT: usize = 11;

    let sp = top - FRAME_WORDS * 8;
    let frame = sp as *mut usize;
    unsafe {
        for slot in 0..FRAME_WORDS {
            frame.add(slot).write(0);
        }
        frame.add(X30_SLOT).write(entry);
    }
    sp
}
