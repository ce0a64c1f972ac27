// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Green thread control block.
//!
//! A `Thread` owns its saved registers, its stack, the boxed entry closure
//! until it first runs, and the result slot that a joiner collects. The
//! scheduler owns every `Thread` in a boxed arena so contexts and preempt
//! state keep a stable address while other threads come and go.

use std::any::Any;
use std::fmt;

use crate::context::{Context, EntryTrampoline, Stack};
use crate::preempt::PreemptState;

/// Boxed entry closure. Captures its argument; runs once on the new stack.
pub(crate) type Entry = Box<dyn FnOnce() -> Box<dyn Any>>;

/// What a finished thread leaves behind: its return value, or the panic
/// message if the entry closure unwound.
pub(crate) type ThreadResult = Result<Box<dyn Any>, String>;

/// Identity of a green thread. Assigned at spawn, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(u64);

impl ThreadId {
    /// The thread that called `init`. Runs on the process's original stack.
    pub const BOOTSTRAP: ThreadId = ThreadId(0);

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn from_u64(id: u64) -> Self {
        ThreadId(id)
    }

    pub fn is_bootstrap(self) -> bool {
        self == Self::BOOTSTRAP
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Thread lifecycle states.
///
/// `Ready -> Running -> {Ready | Waiting | Joinable}`, `Waiting -> Ready`,
/// `Joinable -> Zombie`, and a zombie is reclaimed by the next scheduler pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Parked on a descriptor or on a join target.
    Waiting,
    /// Runnable, waiting for its turn.
    Ready,
    /// Executing on the carrier. Exactly one thread at a time.
    Running,
    /// Exited; its result waits for a joiner.
    Joinable,
    /// Result collected; storage is reclaimed at the next scheduler pass.
    Zombie,
}

impl Status {
    /// The thread gave up the carrier and cannot be picked to run.
    pub fn is_blocked(self) -> bool {
        matches!(self, Status::Waiting | Status::Joinable)
    }

    /// Still counted in the active ring.
    pub fn is_runnable(self) -> bool {
        matches!(self, Status::Ready | Status::Running)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Waiting => "waiting",
            Status::Ready => "ready",
            Status::Running => "running",
            Status::Joinable => "joinable",
            Status::Zombie => "zombie",
        };
        f.write_str(name)
    }
}

pub(crate) struct Thread {
    pub id: ThreadId,
    pub status: Status,
    pub context: Context,
    /// `None` for the bootstrap thread.
    pub stack: Option<Stack>,
    pub entry: Option<Entry>,
    /// Filled exactly once, when the thread becomes `Joinable`.
    pub result: Option<ThreadResult>,
    /// At most one thread blocked in `join` on this one.
    pub joiner: Option<ThreadId>,
    pub preempt: PreemptState,
}

impl Thread {
    /// TCB for the caller of `init`, adopted as-is from the running context.
    pub fn bootstrap() -> Box<Self> {
        Box::new(Self {
            id: ThreadId::BOOTSTRAP,
            status: Status::Running,
            context: Context::default(),
            stack: None,
            entry: None,
            result: None,
            joiner: None,
            preempt: PreemptState::new(0),
        })
    }

    /// TCB for a new thread whose first switch lands in `trampoline`.
    ///
    /// It starts with one level of preempt-disable held, exactly as if it
    /// had been suspended inside the scheduler; the trampoline drops it.
    pub fn spawned(id: ThreadId, stack: Stack, entry: Entry, trampoline: EntryTrampoline) -> Box<Self> {
        let context = Context::fresh(&stack, trampoline);
        Box::new(Self {
            id,
            status: Status::Ready,
            context,
            stack: Some(stack),
            entry: Some(entry),
            result: None,
            joiner: None,
            preempt: PreemptState::new(1),
        })
    }

    /// Record the exit value and become `Joinable`.
    pub fn finish(&mut self, result: ThreadResult) {
        debug_assert!(self.result.is_none(), "thread {} finished twice", self.id);
        self.result = Some(result);
        self.status = Status::Joinable;
    }

    /// Hand the exit value to the joiner and become `Zombie`.
    pub fn reap(&mut self) -> Option<ThreadResult> {
        debug_assert_eq!(self.status, Status::Joinable);
        self.status = Status::Zombie;
        self.result.take()
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("status", &self.status)
            .field("stack", &self.stack)
            .field("rsp", &format_args!("{:#x}", self.context.stack_pointer()))
            .field("joiner", &self.joiner)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn never_runs() -> ! {
        unreachable!()
    }

    fn spawned(id: u64) -> Box<Thread> {
        let stack = Stack::new(32 * 1024).unwrap();
        Thread::spawned(
            ThreadId::from_u64(id),
            stack,
            Box::new(|| Box::new(()) as Box<dyn Any>),
            never_runs,
        )
    }

    #[test]
    fn bootstrap_runs_on_borrowed_stack() {
        let t = Thread::bootstrap();
        assert!(t.id.is_bootstrap());
        assert_eq!(t.status, Status::Running);
        assert!(t.stack.is_none());
        assert_eq!(t.preempt.depth(), 0);
    }

    #[test]
    fn spawned_thread_starts_ready_inside_guard() {
        let t = spawned(3);
        assert_eq!(t.status, Status::Ready);
        assert!(t.stack.is_some());
        assert!(t.entry.is_some());
        assert_eq!(t.preempt.depth(), 1);
    }

    #[test]
    fn finish_then_reap() {
        let mut t = spawned(4);
        t.status = Status::Running;
        t.finish(Ok(Box::new(42i64)));
        assert_eq!(t.status, Status::Joinable);

        let value = t.reap().unwrap().unwrap();
        assert_eq!(t.status, Status::Zombie);
        assert_eq!(*value.downcast::<i64>().unwrap(), 42);
        assert!(t.result.is_none());
    }

    #[test]
    fn status_classes() {
        assert!(Status::Waiting.is_blocked());
        assert!(Status::Joinable.is_blocked());
        assert!(!Status::Ready.is_blocked());
        assert!(Status::Running.is_runnable());
        assert!(!Status::Zombie.is_runnable());
        assert_eq!(Status::Joinable.to_string(), "joinable");
    }

    #[test]
    fn debug_shows_identity() {
        let t = spawned(9);
        let text = format!("{t:?}");
        assert!(text.contains("id: ThreadId(9)"));
        assert!(text.contains("status: Ready"));
        assert!(text.contains("rsp: 0x"));
    }
}
