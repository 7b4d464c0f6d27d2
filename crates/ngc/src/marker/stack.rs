//! Stack Scanning - Conservative roots from the mutator stack
//!
//! A collection whose stack state is `MayContainHeapPointers` hands every
//! word between the current stack pointer and the recorded stack start to
//! the conservative marking visitor. Callee-saved registers are spilled into
//! the scanning frame first so references that only live in registers are
//! seen too.
//!
//! ## Platform Support
//!
//! | Platform | Stack pointer | Register spill |
//! |----------|---------------|----------------|
//! | x86_64   | `rsp`         | rbx, rbp, r12-r15 |
//! | aarch64  | `sp`          | x19-x29 |
//! | other    | address of a local | none |

use crate::util::Address;
use std::mem::size_of;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Source of conservative stack roots
pub trait StackScanner: Send + Sync {
    /// Call `f` with every word that may be a heap pointer
    fn iterate_pointers(&self, f: &mut dyn FnMut(Address));
}

/// Scans the native stack of the thread that owns the heap
///
/// The stack grows downwards on every supported target: the scan covers
/// `[current stack pointer, stack_start)`.
#[derive(Debug)]
pub struct NativeStackScanner {
    stack_start: AtomicUsize,
}

impl NativeStackScanner {
    /// Scanner for the calling thread, covering everything the caller
    /// calls after this point
    #[inline(always)]
    pub fn for_current_thread() -> Self {
        Self::new(current_stack_position())
    }

    /// Scanner whose scan ends at `stack_start` (exclusive)
    pub fn new(stack_start: Address) -> Self {
        Self {
            stack_start: AtomicUsize::new(stack_start),
        }
    }

    pub fn stack_start(&self) -> Address {
        self.stack_start.load(Ordering::Relaxed)
    }

    /// Move the scan end, e.g. when the embedder enters a deeper event loop
    pub fn set_stack_start(&self, stack_start: Address) {
        self.stack_start.store(stack_start, Ordering::Relaxed);
    }
}

impl StackScanner for NativeStackScanner {
    #[inline(never)]
    fn iterate_pointers(&self, f: &mut dyn FnMut(Address)) {
        let registers = spill_callee_saved_registers();
        std::hint::black_box(&registers);
        for &word in registers.iter() {
            f(word);
        }

        let top = current_stack_position() & !(size_of::<usize>() - 1);
        let end = self.stack_start();
        if top >= end {
            log::warn!(
                "Stack position {:#x} is not below stack start {:#x}, skipping scan",
                top,
                end
            );
            return;
        }

        let mut slot = top;
        while slot + size_of::<usize>() <= end {
            // SAFETY: [top, end) is the live part of this thread's stack.
            let word = unsafe { std::ptr::read_volatile(slot as *const usize) };
            f(word);
            slot += size_of::<usize>();
        }
    }
}

/// Approximate current stack pointer
#[inline(always)]
#[cfg(target_arch = "x86_64")]
pub fn current_stack_position() -> Address {
    let sp: usize;
    unsafe {
        std::arch::asm!(
            "mov {}, rsp",
            out(reg) sp,
            options(nomem, nostack, preserves_flags)
        );
    }
    sp
}

#[inline(always)]
#[cfg(target_arch = "aarch64")]
pub fn current_stack_position() -> Address {
    let sp: usize;
    unsafe {
        std::arch::asm!(
            "mov {}, sp",
            out(reg) sp,
            options(nomem, nostack, preserves_flags)
        );
    }
    sp
}

#[inline(never)]
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub fn current_stack_position() -> Address {
    let marker = 0usize;
    std::hint::black_box(&marker) as *const usize as Address
}

#[inline(always)]
#[cfg(target_arch = "x86_64")]
fn spill_callee_saved_registers() -> [usize; 6] {
    let mut registers = [0usize; 6];
    unsafe {
        std::arch::asm!(
            "mov [{0}], rbx",
            "mov [{0} + 8], rbp",
            "mov [{0} + 16], r12",
            "mov [{0} + 24], r13",
            "mov [{0} + 32], r14",
            "mov [{0} + 40], r15",
            in(reg) registers.as_mut_ptr(),
            options(nostack, preserves_flags)
        );
    }
    registers
}

#[inline(always)]
#[cfg(target_arch = "aarch64")]
fn spill_callee_saved_registers() -> [usize; 12] {
    let mut registers = [0usize; 12];
    unsafe {
        std::arch::asm!(
            "stp x19, x20, [{0}]",
            "stp x21, x22, [{0}, #16]",
            "stp x23, x24, [{0}, #32]",
            "stp x25, x26, [{0}, #48]",
            "stp x27, x28, [{0}, #64]",
            "str x29, [{0}, #80]",
            in(reg) registers.as_mut_ptr(),
            options(nostack, preserves_flags)
        );
    }
    registers
}

#[inline(always)]
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn spill_callee_saved_registers() -> [usize; 0] {
    []
}
