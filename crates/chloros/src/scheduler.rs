// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Single-carrier round-robin scheduler.
//!
//! One `Scheduler` per carrier thread, created by `init` and never torn
//! down. It owns every thread control block, the three scheduler lists,
//! and the reactor. All mutation happens inside a preempt-disabled
//! section, which is the only locking discipline the runtime needs: just
//! one green thread ever runs at a time, and the timer handler backs off
//! whenever the depth is non-zero.
//!
//! `reschedule` is the one place scheduling policy lives. A voluntary
//! yield, a thread parking on I/O or a join, a thread exiting, and a timer
//! tick all go through it.

use std::cell::Cell;
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::ptr;

use crate::config::Config;
use crate::context::{self, Context, EntryTrampoline, Stack};
use crate::error::{Error, JoinError};
use crate::preempt;
use crate::queue::{List, Queues};
use crate::reactor::{Interest, Reactor};
use crate::task::{Entry, Status, Thread, ThreadId, ThreadResult};

thread_local! {
    static SCHEDULER: Cell<*mut Scheduler> = const { Cell::new(ptr::null_mut()) };
}

/// Sizes of the scheduler lists. The running thread counts as active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stats {
    pub active: usize,
    pub waiting: usize,
    pub joinable: usize,
}

/// Outcome of [`Scheduler::park_on`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Park {
    /// Registered and marked `Waiting`.
    Parked,
    /// Another thread is already parked on the descriptor.
    Busy,
    /// epoll cannot watch the descriptor at all.
    Unwatchable,
}

pub(crate) struct Scheduler {
    /// Arena of control blocks. Boxed so contexts never move.
    threads: HashMap<ThreadId, Box<Thread>>,
    queues: Queues,
    current: ThreadId,
    next_id: u64,
    reactor: Reactor,
    config: Config,
}

/// Create this carrier's scheduler and adopt the caller as the bootstrap thread.
pub(crate) fn install(config: Config) -> Result<(), Error> {
    if is_installed() {
        return Err(Error::AlreadyInitialized);
    }
    let reactor = Reactor::new().map_err(Error::Reactor)?;
    let scheduler = Box::leak(Box::new(Scheduler::new(config, reactor)));
    preempt::set_active(&scheduler.thread(ThreadId::BOOTSTRAP).preempt);
    SCHEDULER.with(|cell| cell.set(scheduler));
    Ok(())
}

pub(crate) fn is_installed() -> bool {
    !SCHEDULER.with(Cell::get).is_null()
}

/// Run `f` against this carrier's scheduler. The caller must hold the
/// preempt guard, and must not switch contexts inside `f`.
pub(crate) fn with<R>(f: impl FnOnce(&mut Scheduler) -> R) -> R {
    let ptr = SCHEDULER.with(Cell::get);
    if ptr.is_null() {
        fatal!("green thread runtime used before init() on this thread");
    }
    debug_assert!(preempt::depth() > 0, "scheduler touched outside a critical section");
    // SAFETY: the scheduler is leaked, so the pointer stays valid for the
    // life of the carrier. Exclusivity: only one green thread runs, callers
    // hold the preempt guard so the timer handler cannot re-enter, and no
    // borrow is held across a context switch.
    f(unsafe { &mut *ptr })
}

/// `with`, wrapped in its own critical section.
pub(crate) fn critical<R>(f: impl FnOnce(&mut Scheduler) -> R) -> R {
    preempt::preempt_disable();
    let result = with(f);
    preempt::preempt_enable();
    result
}

/// Voluntary yield. Returns whether another thread ran.
pub(crate) fn yield_now() -> bool {
    preempt::preempt_disable();
    let switched = reschedule();
    preempt::release();
    switched
}

/// Pick the next thread and switch to it. The caller holds the guard.
///
/// Returns false when nothing else could run and the caller kept the
/// carrier. Otherwise returns true once the caller has been resumed.
pub(crate) fn reschedule() -> bool {
    let Some((out, into)) = with(Scheduler::prepare_switch) else {
        return false;
    };
    // SAFETY: both contexts live in boxed control blocks owned by the
    // scheduler; neither can be freed while its thread is current or
    // suspended in here. `into` was saved by a switch or built fresh.
    unsafe { context::switch(out, into) };
    true
}

impl Scheduler {
    fn new(config: Config, reactor: Reactor) -> Self {
        let mut scheduler = Self {
            threads: HashMap::new(),
            queues: Queues::new(),
            current: ThreadId::BOOTSTRAP,
            next_id: 1,
            reactor,
            config,
        };
        scheduler.threads.insert(ThreadId::BOOTSTRAP, Thread::bootstrap());
        scheduler.queues.active.push_front(ThreadId::BOOTSTRAP);
        scheduler
    }

    pub fn current(&self) -> ThreadId {
        self.current
    }

    pub fn status(&self, id: ThreadId) -> Option<Status> {
        self.threads.get(&id).map(|t| t.status)
    }

    pub fn stats(&self) -> Stats {
        Stats {
            active: self.queues.active.len(),
            waiting: self.queues.waiting.len(),
            joinable: self.queues.joinable.len(),
        }
    }

    fn thread(&self, id: ThreadId) -> &Thread {
        match self.threads.get(&id) {
            Some(thread) => thread,
            None => fatal!("scheduler lost track of thread {id}"),
        }
    }

    fn thread_mut(&mut self, id: ThreadId) -> &mut Thread {
        match self.threads.get_mut(&id) {
            Some(thread) => thread,
            None => fatal!("scheduler lost track of thread {id}"),
        }
    }

    /// Build a thread whose first run enters `trampoline`, and make it runnable.
    pub fn spawn_thread(&mut self, entry: Entry, trampoline: EntryTrampoline) -> ThreadId {
        let id = ThreadId::from_u64(self.next_id);
        self.next_id += 1;

        let stack = match Stack::new(self.config.stack_size) {
            Ok(stack) => stack,
            Err(err) => fatal!(
                "cannot allocate a {} byte stack for thread {id}: {err}",
                self.config.stack_size
            ),
        };
        self.threads
            .insert(id, Thread::spawned(id, stack, entry, trampoline));
        self.queues.active.push_front(id);
        id
    }

    /// The running thread's entry closure. `None` after the first call.
    pub fn take_entry(&mut self) -> Option<Entry> {
        let id = self.current;
        self.thread_mut(id).entry.take()
    }

    /// Free every zombie except the running thread. Returns how many went.
    pub fn collect_zombies(&mut self) -> usize {
        let Self {
            threads,
            queues,
            current,
            ..
        } = self;
        let mut freed = 0;
        queues.joinable.retain(|id| {
            let zombie = threads.get(id).is_some_and(|t| t.status == Status::Zombie);
            if !zombie || *id == *current {
                return true;
            }
            threads.remove(id);
            log::debug!("reclaimed thread {id}");
            freed += 1;
            false
        });
        freed
    }

    /// Make a waiting thread runnable again.
    fn wake(&mut self, id: ThreadId) {
        match self.threads.get(&id).map(|t| t.status) {
            // Still linked in active until it is switched out.
            Some(Status::Waiting) if id == self.current => {
                self.thread_mut(id).status = Status::Ready;
            }
            Some(Status::Waiting) => {
                if !self.queues.relocate(id, List::Waiting, List::Active) {
                    fatal!("waiting thread {id} missing from the waiting list");
                }
                self.thread_mut(id).status = Status::Ready;
                log::trace!("woke thread {id}");
            }
            other => log::trace!("ignoring wakeup for thread {id} ({other:?})"),
        }
    }

    fn poll_reactor(&mut self, block: bool) {
        let timeout = if block { -1 } else { 0 };
        let ready = match self.reactor.poll(timeout) {
            Ok(ready) => ready,
            Err(err) => fatal!("epoll_wait failed: {err}"),
        };
        for id in ready {
            log::trace!("readiness event for thread {id}");
            self.wake(id);
        }
    }

    /// First `Ready` thread after `from` in the active ring, wrapping.
    fn next_ready(&self, from: ThreadId) -> Option<ThreadId> {
        self.queues
            .active
            .cycle_after(from)
            .find(|&id| self.thread(id).status == Status::Ready)
    }

    /// Everything `reschedule` does short of the actual register swap.
    fn prepare_switch(&mut self) -> Option<(*mut Context, *const Context)> {
        self.collect_zombies();

        let prev = self.current;
        loop {
            let alone = self.queues.active.len() <= 1;
            let block = alone && self.thread(prev).status.is_blocked();
            if block && self.reactor.is_empty() {
                fatal!("deadlock: every green thread is blocked and no descriptor is registered");
            }
            if block {
                log::trace!("thread {prev} blocked with nothing runnable; waiting on reactor");
            }
            self.poll_reactor(block);

            if let Some(next) = self.next_ready(prev) {
                return Some(self.switch_to(next));
            }

            match self.thread(prev).status {
                Status::Running => return None,
                // Its own descriptor became ready and nobody else wants the carrier.
                Status::Ready => {
                    self.thread_mut(prev).status = Status::Running;
                    return None;
                }
                _ => continue,
            }
        }
    }

    /// Retire `current` to the list its status calls for and install `next`.
    fn switch_to(&mut self, next: ThreadId) -> (*mut Context, *const Context) {
        let prev = self.current;
        match self.thread(prev).status {
            Status::Running => self.thread_mut(prev).status = Status::Ready,
            Status::Ready => {}
            Status::Waiting => {
                self.queues.relocate(prev, List::Active, List::Waiting);
            }
            Status::Joinable => {
                self.queues.relocate(prev, List::Active, List::Joinable);
            }
            Status::Zombie => fatal!("zombie thread {prev} was still running"),
        }

        self.current = next;
        let incoming = self.thread_mut(next);
        debug_assert!(incoming.status.is_runnable(), "switched into a blocked thread");
        incoming.status = Status::Running;
        preempt::set_active(&incoming.preempt);
        log::trace!("switch {prev} -> {next}");

        let out: *mut Context = &mut self.thread_mut(prev).context;
        let into: *const Context = &self.thread(next).context;
        (out, into)
    }

    /// Link the running thread as `target`'s joiner.
    pub fn attach_joiner(&mut self, target: ThreadId) -> Result<(), JoinError> {
        let me = self.current;
        if target == me || target.is_bootstrap() {
            return Err(JoinError::NotJoinable(target));
        }
        if self.queues.locate(target).is_none() {
            return Err(JoinError::NotFound(target));
        }
        let thread = self.thread_mut(target);
        if thread.status == Status::Zombie {
            return Err(JoinError::AlreadyJoined(target));
        }
        if thread.joiner.is_some() {
            return Err(JoinError::JoinerPresent(target));
        }
        thread.joiner = Some(me);
        Ok(())
    }

    /// True once `target` has exited. Otherwise parks the running thread,
    /// to be woken by the target's exit.
    pub fn joinable_or_park(&mut self, target: ThreadId) -> bool {
        if self.thread(target).status == Status::Joinable {
            return true;
        }
        let me = self.current;
        self.thread_mut(me).status = Status::Waiting;
        false
    }

    /// Collect `target`'s result and mark it for reclamation.
    pub fn reap(&mut self, target: ThreadId) -> ThreadResult {
        match self.thread_mut(target).reap() {
            Some(result) => result,
            None => fatal!("joinable thread {target} has no result"),
        }
    }

    /// Store the running thread's result, make it `Joinable`, and wake its joiner.
    pub fn retire_current(&mut self, result: ThreadResult) {
        let me = self.current;
        let thread = self.thread_mut(me);
        thread.finish(result);
        if let Some(joiner) = thread.joiner {
            log::debug!("thread {me} waking joiner {joiner}");
            self.wake(joiner);
        }
    }

    /// Register `fd` for the running thread and mark it `Waiting`.
    /// On any refusal the thread is left running.
    pub fn park_on(&mut self, fd: RawFd, interest: Interest) -> Park {
        let me = self.current;
        match self.reactor.register(fd, interest, me) {
            Ok(()) => {
                self.thread_mut(me).status = Status::Waiting;
                Park::Parked
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Park::Busy,
            Err(err) => {
                log::warn!("thread {me}: could not watch fd {fd} for {interest:?}: {err}");
                Park::Unwatchable
            }
        }
    }

    pub fn unpark(&mut self, fd: RawFd) {
        if let Err(err) = self.reactor.deregister(fd) {
            log::warn!("could not stop watching fd {fd}: {err}");
        }
    }
}
