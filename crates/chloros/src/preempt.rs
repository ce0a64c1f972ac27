// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Timer-driven preemption and the critical-section guard.
//!
//! A repeating `ITIMER_VIRTUAL` timer raises `SIGVTALRM`. The handler asks
//! for a reschedule: if the running thread is inside a critical section it
//! only leaves a pending flag behind, which `preempt_enable` acts on once
//! the depth drops back to zero. Otherwise it enters the same reschedule
//! path a voluntary yield takes.
//!
//! The depth counter and pending flag live in each thread's control block.
//! A thread-local pointer always names the running thread's pair, so the
//! handler reads them without touching any scheduler collection.

use std::cell::Cell;
use std::io;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{compiler_fence, AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use crate::scheduler;

/// Signal used for the preemption timer.
pub const TIMER_SIGNAL: libc::c_int = libc::SIGVTALRM;

/// Per-thread critical-section depth and deferred reschedule flag.
///
/// Atomics only keep the compiler from caching or tearing accesses that a
/// signal handler on the same carrier can interleave with.
#[derive(Debug)]
pub(crate) struct PreemptState {
    depth: AtomicU32,
    pending: AtomicBool,
}

impl PreemptState {
    pub const fn new(depth: u32) -> Self {
        Self {
            depth: AtomicU32::new(depth),
            pending: AtomicBool::new(false),
        }
    }

    pub fn depth(&self) -> u32 {
        self.depth.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Relaxed)
    }
}

thread_local! {
    static ACTIVE: Cell<*const PreemptState> = const { Cell::new(ptr::null()) };
}

/// Point the guard at the thread about to run.
pub(crate) fn set_active(state: &PreemptState) {
    ACTIVE.with(|cell| cell.set(state));
}

fn active() -> Option<&'static PreemptState> {
    let state = ACTIVE.with(Cell::get);
    // SAFETY: ACTIVE always names the running thread's control block, which
    // lives in a stable box and is only reclaimed once it is no longer running.
    unsafe { state.as_ref() }
}

/// Current critical-section depth of the running thread (0 before `init`).
pub(crate) fn depth() -> u32 {
    active().map_or(0, PreemptState::depth)
}

/// Enter a critical section. Nestable; a no-op before `init`.
pub fn preempt_disable() {
    if let Some(state) = active() {
        state.depth.fetch_add(1, Ordering::Relaxed);
        compiler_fence(Ordering::SeqCst);
    }
}

/// Leave a critical section. When the outermost section closes and a timer
/// tick arrived meanwhile, the deferred reschedule happens here.
pub fn preempt_enable() {
    let Some(state) = active() else { return };
    compiler_fence(Ordering::SeqCst);
    let prev = state.depth.fetch_sub(1, Ordering::Relaxed);
    debug_assert!(prev > 0, "preempt_enable without matching preempt_disable");
    if prev == 1 && state.pending.swap(false, Ordering::Relaxed) {
        log::trace!("running deferred preemption");
        scheduler::yield_now();
    }
}

/// Close the section held across a reschedule. Any tick that arrived while
/// switching is dropped: the thread just got its turn.
pub(crate) fn release() {
    let Some(state) = active() else { return };
    compiler_fence(Ordering::SeqCst);
    state.pending.store(false, Ordering::Relaxed);
    state.depth.fetch_sub(1, Ordering::Relaxed);
}

/// Ask for a reschedule on behalf of the timer.
///
/// Returns true if the running thread may be switched out right now.
/// Inside a critical section the request is recorded instead.
pub(crate) fn request_reschedule() -> bool {
    let Some(state) = active() else { return false };
    if state.depth() > 0 {
        state.pending.store(true, Ordering::Relaxed);
        return false;
    }
    true
}

/// RAII critical section: no timer-driven reschedule while it lives.
#[must_use = "the critical section ends when the guard is dropped"]
pub struct PreemptGuard {
    _carrier_bound: PhantomData<*const ()>,
}

impl PreemptGuard {
    pub fn new() -> Self {
        preempt_disable();
        Self {
            _carrier_bound: PhantomData,
        }
    }
}

impl Default for PreemptGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PreemptGuard {
    fn drop(&mut self) {
        preempt_enable();
    }
}

/// Signal set holding the preemption timer signal. Block it with
/// `pthread_sigmask` around code that must not even see the handler run.
pub fn timer_signals() -> libc::sigset_t {
    // SAFETY: sigemptyset fully initializes the set before sigaddset.
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, TIMER_SIGNAL);
        set
    }
}

/// Install the handler and arm the repeating timer.
pub(crate) fn start_timer(interval: Duration) -> io::Result<()> {
    // SAFETY: the sigaction struct is zeroed then filled in; the handler is
    // an `extern "C" fn(c_int)` as SA_SIGINFO is not set.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = on_timer as extern "C" fn(libc::c_int) as libc::sighandler_t;
        action.sa_mask = timer_signals();
        action.sa_flags = libc::SA_RESTART;
        if libc::sigaction(TIMER_SIGNAL, &action, ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
    }

    let period = libc::timeval {
        tv_sec: interval.as_secs() as libc::time_t,
        tv_usec: interval.subsec_micros() as libc::suseconds_t,
    };
    let timer = libc::itimerval {
        it_interval: period,
        it_value: period,
    };
    // SAFETY: plain syscall on a fully initialized struct.
    if unsafe { libc::setitimer(libc::ITIMER_VIRTUAL, &timer, ptr::null_mut()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn unmask_timer() {
    let set = timer_signals();
    // SAFETY: valid set, old mask not requested.
    unsafe { libc::pthread_sigmask(libc::SIG_UNBLOCK, &set, ptr::null_mut()) };
}

extern "C" fn on_timer(_signum: libc::c_int) {
    // SAFETY: errno is thread-local; the location is always valid.
    let saved_errno = unsafe { *libc::__errno_location() };

    if request_reschedule() {
        preempt_disable();
        // The kernel masks the signal while its handler runs. Lift it, or
        // whichever thread we switch into could never be preempted.
        unmask_timer();
        scheduler::reschedule();
        release();
    }

    unsafe { *libc::__errno_location() = saved_errno };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_is_noop_before_init() {
        assert_eq!(depth(), 0);
        let _guard = PreemptGuard::new();
        assert_eq!(depth(), 0);
        assert!(!request_reschedule());
    }

    #[test]
    fn depth_nests_and_unwinds() {
        let state = Box::new(PreemptState::new(0));
        set_active(&state);

        preempt_disable();
        {
            let _inner = PreemptGuard::new();
            assert_eq!(depth(), 2);
        }
        assert_eq!(depth(), 1);
        preempt_enable();
        assert_eq!(depth(), 0);

        ACTIVE.with(|cell| cell.set(ptr::null()));
    }

    #[test]
    fn request_inside_section_is_deferred() {
        let state = Box::new(PreemptState::new(0));
        set_active(&state);

        assert!(request_reschedule());
        preempt_disable();
        assert!(!request_reschedule());
        assert!(state.is_pending());

        // Leaving the section consumes the flag; release clears it too.
        preempt_disable();
        state.pending.store(true, Ordering::Relaxed);
        release();
        assert!(!state.is_pending());
        assert_eq!(state.depth(), 1);

        ACTIVE.with(|cell| cell.set(ptr::null()));
    }

    #[test]
    fn timer_set_contains_only_vtalrm() {
        let set = timer_signals();
        unsafe {
            assert_eq!(libc::sigismember(&set, libc::SIGVTALRM), 1);
            assert_eq!(libc::sigismember(&set, libc::SIGALRM), 0);
        }
    }
}
