// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Public lifecycle API: init, spawn, yield, wait, join, exit.
//!
//! Every entry point brackets its scheduler access with the preempt guard,
//! and suspends only through `scheduler::reschedule`.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use crate::config::Config;
use crate::error::{Error, JoinError};
use crate::preempt;
use crate::scheduler::{self, Stats};
use crate::task::{Entry, Status, ThreadId, ThreadResult};

/// Bring up the runtime on the calling OS thread, which becomes thread 0.
///
/// With `preempt` set, a timer periodically switches out threads that do
/// not yield on their own. Such programs should install
/// [`PreemptSafe`](crate::PreemptSafe) as their global allocator.
pub fn init(preempt: bool) -> Result<(), Error> {
    init_with(Config {
        preempt,
        ..Config::default()
    })
}

/// [`init`] with explicit settings.
pub fn init_with(config: Config) -> Result<(), Error> {
    config.validate()?;
    let Config {
        preempt,
        interval,
        stack_size,
    } = config.clone();

    scheduler::install(config)?;
    log::debug!(
        "runtime initialized (preempt: {preempt}, interval: {interval:?}, stack: {stack_size} bytes)"
    );

    if preempt {
        if let Err(err) = preempt::start_timer(interval) {
            fatal!("cannot install the preemption timer: {err}");
        }
    }
    Ok(())
}

/// Start a green thread running `f` and give the scheduler one pass.
///
/// The new thread is not guaranteed to run before this returns. Its return
/// value is collected with [`join`] or [`join_as`].
pub fn spawn<F, T>(f: F) -> ThreadId
where
    F: FnOnce() -> T + 'static,
    T: 'static,
{
    let entry: Entry = Box::new(move || Box::new(f()) as Box<dyn Any>);

    preempt::preempt_disable();
    let id = scheduler::with(|s| s.spawn_thread(entry, thread_main));
    log::debug!("spawned thread {id}");
    scheduler::reschedule();
    preempt::preempt_enable();
    id
}

/// Offer the carrier to the next ready thread.
///
/// Returns false if no other thread was ready, in which case the caller
/// simply continues.
pub fn yield_now() -> bool {
    scheduler::yield_now()
}

/// Yield until a pass finds nothing else to run.
///
/// Threads still parked on a descriptor do not hold this up.
pub fn wait() {
    while yield_now() {}
}

/// Block until thread `id` exits and take its return value.
///
/// At most one thread may join a given target. Joining the caller itself
/// or thread 0 fails, as neither can ever exit under the joiner.
pub fn join(id: ThreadId) -> Result<Box<dyn Any>, JoinError> {
    preempt::preempt_disable();
    let result = join_locked(id);
    preempt::preempt_enable();
    result
}

fn join_locked(id: ThreadId) -> Result<Box<dyn Any>, JoinError> {
    scheduler::with(|s| s.attach_joiner(id))?;
    log::debug!("thread {} joining {id}", scheduler::with(|s| s.current()));

    while !scheduler::with(|s| s.joinable_or_park(id)) {
        scheduler::reschedule();
    }
    scheduler::with(|s| s.reap(id)).map_err(JoinError::Panicked)
}

/// [`join`], downcasting the return value to `T`.
pub fn join_as<T: 'static>(id: ThreadId) -> Result<T, JoinError> {
    join(id)?
        .downcast::<T>()
        .map(|value| *value)
        .map_err(|_| JoinError::TypeMismatch(id))
}

/// Finish the calling thread with `value` as its return value.
///
/// From thread 0 this ends the whole process with status 0, whatever the
/// other threads are doing. Locals of the exiting thread are not dropped.
pub fn exit<T: 'static>(value: T) -> ! {
    let result: ThreadResult = Ok(Box::new(value));

    preempt::preempt_disable();
    if scheduler::with(|s| s.current()).is_bootstrap() {
        let freed = scheduler::with(|s| s.collect_zombies());
        log::debug!("thread 0 exiting, process ends ({freed} zombies reclaimed)");
        std::process::exit(0);
    }
    retire(result)
}

/// Thread running right now.
pub fn current() -> ThreadId {
    scheduler::critical(|s| s.current())
}

/// Lifecycle state of `id`, or `None` once it has been reclaimed.
pub fn status(id: ThreadId) -> Option<Status> {
    scheduler::critical(|s| s.status(id))
}

pub fn stats() -> Stats {
    scheduler::critical(|s| s.stats())
}

/// Hand the carrier away for good. The caller holds the guard.
fn retire(result: ThreadResult) -> ! {
    let me = scheduler::with(|s| s.current());
    match &result {
        Ok(_) => log::debug!("thread {me} exiting"),
        Err(msg) => log::debug!("thread {me} exiting after panic: {msg}"),
    }
    scheduler::with(|s| s.retire_current(result));
    scheduler::reschedule();
    fatal!("exited thread {me} was resumed");
}

/// First code every spawned thread runs, entered by the initial switch.
extern "C" fn thread_main() -> ! {
    // Drop the guard the scheduler held while switching in.
    preempt::release();

    let Some(entry) = scheduler::critical(|s| s.take_entry()) else {
        fatal!("thread started without an entry function");
    };
    let result =
        panic::catch_unwind(AssertUnwindSafe(entry)).map_err(|payload| panic_message(&*payload));

    preempt::preempt_disable();
    retire(result)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MIN_STACK_SIZE;

    #[test]
    fn panic_payloads_become_messages() {
        let literal: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*literal), "boom");
        let formatted: Box<dyn Any + Send> = Box::new(format!("code {}", 7));
        assert_eq!(panic_message(&*formatted), "code 7");
        let other: Box<dyn Any + Send> = Box::new(3u8);
        assert_eq!(panic_message(&*other), "unknown panic");
    }

    #[test]
    fn bad_config_leaves_runtime_uninstalled() {
        let err = init_with(Config::default().with_stack_size(MIN_STACK_SIZE - 1)).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
        assert!(!scheduler::is_installed());
        init(false).unwrap();
        assert!(scheduler::is_installed());
    }

    #[test]
    fn spawn_then_join_on_small_stacks() {
        init_with(Config::default().with_stack_size(4 * MIN_STACK_SIZE)).unwrap();
        let id = spawn(|| (1..=4u32).product::<u32>());
        assert_eq!(join_as::<u32>(id).unwrap(), 24);
        assert!(matches!(join(id), Err(JoinError::AlreadyJoined(_)) | Err(JoinError::NotFound(_))));
    }
}
