// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Chloros: green threads on a single carrier.
//!
//! The OS thread that calls [`init`] becomes thread 0 and hosts every green
//! thread spawned afterwards. Threads switch at explicit yields, at blocking
//! I/O through [`read`], [`write`] and [`accept`], while joining, and, with
//! preemption enabled, whenever the virtual-time timer fires outside a
//! critical section.
//!
//! Components:
//! - context: register save/restore and guard-paged stacks
//! - task/queue: control blocks and the active, waiting and joinable lists
//! - scheduler: round-robin yield, zombie collection
//! - preempt: SIGVTALRM timer and the nestable critical-section guard
//! - reactor/io: epoll readiness behind blocking-style wrappers
//!
//! x86_64 Linux only.
//!
//! ```no_run
//! chloros::init(false).unwrap();
//! let id = chloros::spawn(|| 21 * 2);
//! assert_eq!(chloros::join_as::<i32>(id).unwrap(), 42);
//! ```

/// Log and abort. For states the runtime cannot unwind out of.
macro_rules! fatal {
    ($($arg:tt)*) => {{
        log::error!($($arg)*);
        eprintln!("chloros: fatal: {}", format_args!($($arg)*));
        std::process::abort()
    }};
}

pub mod alloc;
pub mod config;
mod context;
pub mod error;
mod handle;
pub mod io;
pub mod preempt;
mod queue;
mod reactor;
mod scheduler;
mod task;

pub use alloc::PreemptSafe;
pub use config::Config;
pub use error::{Error, JoinError};
pub use handle::{
    current, exit, init, init_with, join, join_as, spawn, stats, status, wait, yield_now,
};
pub use io::{accept, read, write};
pub use preempt::{preempt_disable, preempt_enable, timer_signals, PreemptGuard};
pub use scheduler::Stats;
pub use task::{Status, ThreadId};
