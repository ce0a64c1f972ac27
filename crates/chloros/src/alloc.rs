// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Global allocator wrapper for preemptive programs.
//!
//! The system allocator takes internal locks. If the timer switched threads
//! while one held such a lock, the next thread to allocate would deadlock
//! the carrier. `PreemptSafe` runs every call inside a critical section, so
//! a tick that lands mid-allocation is deferred until the call returns.
//!
//! ```no_run
//! use chloros::PreemptSafe;
//!
//! #[global_allocator]
//! static ALLOC: PreemptSafe = PreemptSafe::system();
//! ```

use std::alloc::{GlobalAlloc, Layout, System};

use crate::preempt::PreemptGuard;

/// Wraps an allocator so no preemption happens inside it.
#[derive(Debug, Default)]
pub struct PreemptSafe<A = System> {
    inner: A,
}

impl PreemptSafe<System> {
    pub const fn system() -> Self {
        Self { inner: System }
    }
}

impl<A> PreemptSafe<A> {
    pub const fn new(inner: A) -> Self {
        Self { inner }
    }
}

// SAFETY: every call is forwarded unchanged to the wrapped allocator. The
// guard only touches a thread-local pointer and two atomics; it never
// allocates and never unwinds.
unsafe impl<A: GlobalAlloc> GlobalAlloc for PreemptSafe<A> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let _guard = PreemptGuard::new();
        self.inner.alloc(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let _guard = PreemptGuard::new();
        self.inner.dealloc(ptr, layout)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let _guard = PreemptGuard::new();
        self.inner.alloc_zeroed(layout)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let _guard = PreemptGuard::new();
        self.inner.realloc(ptr, layout, new_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        live: AtomicUsize,
    }

    unsafe impl GlobalAlloc for Counting {
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            self.live.fetch_add(1, Ordering::Relaxed);
            System.alloc(layout)
        }

        unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
            self.live.fetch_sub(1, Ordering::Relaxed);
            System.dealloc(ptr, layout)
        }
    }

    #[test]
    fn forwards_to_inner_allocator() {
        let alloc = PreemptSafe::new(Counting {
            live: AtomicUsize::new(0),
        });
        let layout = Layout::from_size_align(64, 16).unwrap();
        unsafe {
            let ptr = alloc.alloc(layout);
            assert!(!ptr.is_null());
            assert_eq!(ptr as usize % 16, 0);
            assert_eq!(alloc.inner.live.load(Ordering::Relaxed), 1);

            let grown = alloc.realloc(ptr, layout, 256);
            assert!(!grown.is_null());

            alloc.dealloc(grown, Layout::from_size_align(256, 16).unwrap());
        }
        assert_eq!(alloc.inner.live.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn zeroed_memory_is_zero() {
        let alloc = PreemptSafe::system();
        let layout = Layout::array::<u64>(32).unwrap();
        unsafe {
            let ptr = alloc.alloc_zeroed(layout) as *mut u64;
            assert!((0..32).all(|i| *ptr.add(i) == 0));
            alloc.dealloc(ptr.cast(), layout);
        }
    }
}
