// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Register context, context switch, and thread stacks.
//!
//! This is the only module where raw memory layout matters. Everything
//! above it deals in `Context` values and owned `Stack`s.
//!
//! A context holds the System V callee-saved registers plus the stack
//! pointer. `switch` saves the caller's set into one context and resumes
//! the other; for a thread that has never run, the resumed stack holds
//! the address of `chloros_start_thread`, which aligns the stack and calls
//! the entry function parked in `r12`.

use std::arch::global_asm;
use std::io;
use std::ptr::{self, NonNull};

#[cfg(not(all(target_arch = "x86_64", target_os = "linux")))]
compile_error!("chloros supports x86_64 Linux only (System V context switch and epoll).");

/// Saved registers of a suspended thread. Meaningless while it runs.
///
/// Field order is fixed by the offsets in `chloros_context_switch`.
#[repr(C)]
#[derive(Debug, Default, Clone)]
pub(crate) struct Context {
    rsp: u64,
    r15: u64,
    r14: u64,
    r13: u64,
    r12: u64,
    rbx: u64,
    rbp: u64,
}

global_asm!(
    ".text",
    ".p2align 4",
    ".globl chloros_context_switch",
    ".type chloros_context_switch, @function",
    "chloros_context_switch:",
    "mov [rdi + 0x00], rsp",
    "mov [rdi + 0x08], r15",
    "mov [rdi + 0x10], r14",
    "mov [rdi + 0x18], r13",
    "mov [rdi + 0x20], r12",
    "mov [rdi + 0x28], rbx",
    "mov [rdi + 0x30], rbp",
    "mov rsp, [rsi + 0x00]",
    "mov r15, [rsi + 0x08]",
    "mov r14, [rsi + 0x10]",
    "mov r13, [rsi + 0x18]",
    "mov r12, [rsi + 0x20]",
    "mov rbx, [rsi + 0x28]",
    "mov rbp, [rsi + 0x30]",
    "ret",
    ".size chloros_context_switch, . - chloros_context_switch",
    "",
    ".p2align 4",
    ".globl chloros_start_thread",
    ".type chloros_start_thread, @function",
    "chloros_start_thread:",
    ".cfi_startproc",
    // Nothing below this frame; stops unwinders and backtraces here.
    ".cfi_undefined rip",
    "and rsp, -16",
    "call r12",
    "ud2",
    ".cfi_endproc",
    ".size chloros_start_thread, . - chloros_start_thread",
);

extern "C" {
    fn chloros_context_switch(out: *mut Context, into: *const Context);
    fn chloros_start_thread();
}

/// Entry point for a fresh thread. Runs on the new stack and never returns.
pub(crate) type EntryTrampoline = extern "C" fn() -> !;

impl Context {
    /// Context whose first resumption calls `entry` at the top of `stack`.
    pub fn fresh(stack: &Stack, entry: EntryTrampoline) -> Self {
        let top = stack.top() as usize & !0xF;
        // `ret` in the switch pops this slot; the trampoline realigns.
        let rsp = top - 16;
        // SAFETY: `rsp` lies inside the writable part of `stack`, 16 bytes
        // below its aligned top.
        let trampoline = chloros_start_thread as *const () as usize as u64;
        unsafe { ptr::write(rsp as *mut u64, trampoline) };
        Self {
            rsp: rsp as u64,
            r12: entry as *const () as usize as u64,
            ..Self::default()
        }
    }

    pub fn stack_pointer(&self) -> u64 {
        self.rsp
    }
}

/// Save the running registers into `out` and resume `into`.
///
/// Returns only when some later switch resumes `out`.
///
/// # Safety
/// `out` must be writable and not read by anyone until this thread is
/// resumed. `into` must hold a context captured by an earlier `switch`
/// or built by `Context::fresh` whose stack is still mapped.
pub(crate) unsafe fn switch(out: *mut Context, into: *const Context) {
    chloros_context_switch(out, into);
}

/// Fixed-size thread stack with a `PROT_NONE` guard page below it.
pub(crate) struct Stack {
    base: NonNull<u8>,
    mapped: usize,
    guard: usize,
}

impl Stack {
    /// Map at least `size` usable bytes plus one guard page.
    pub fn new(size: usize) -> io::Result<Self> {
        let page = page_size();
        let usable = size.div_ceil(page) * page;
        let mapped = usable + page;

        // SAFETY: fresh anonymous private mapping, no existing memory touched.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mapped,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: the first page belongs to the mapping created above.
        if unsafe { libc::mprotect(addr, page, libc::PROT_NONE) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::munmap(addr, mapped) };
            return Err(err);
        }

        let base = NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))?;
        Ok(Self {
            base,
            mapped,
            guard: page,
        })
    }

    /// Lowest usable address (just above the guard page).
    pub fn bottom(&self) -> *mut u8 {
        // SAFETY: guard < mapped, stays inside the mapping.
        unsafe { self.base.as_ptr().add(self.guard) }
    }

    /// One past the highest usable address.
    pub fn top(&self) -> *mut u8 {
        // SAFETY: one-past-the-end of the mapping.
        unsafe { self.base.as_ptr().add(self.mapped) }
    }

    pub fn len(&self) -> usize {
        self.mapped - self.guard
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        // SAFETY: unmaps exactly the region mapped in `new`, once.
        unsafe { libc::munmap(self.base.as_ptr().cast(), self.mapped) };
    }
}

impl std::fmt::Debug for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stack")
            .field("bottom", &self.bottom())
            .field("top", &self.top())
            .field("len", &self.len())
            .finish()
    }
}

fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}
