// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime and join errors.

use std::io;

use thiserror::Error;

use crate::task::ThreadId;

/// Failure to bring the runtime up on the calling carrier.
#[derive(Debug, Error)]
pub enum Error {
    /// `init` was already called on this carrier thread.
    #[error("green thread runtime already initialized on this thread")]
    AlreadyInitialized,

    #[error("invalid runtime configuration: {0}")]
    InvalidConfig(String),

    /// The epoll instance could not be created.
    #[error("failed to create readiness reactor: {0}")]
    Reactor(#[source] io::Error),
}

/// Why a `join` call did not produce the target's return value.
#[derive(Debug, Error)]
pub enum JoinError {
    /// No live thread carries this id.
    #[error("no thread with id {0}")]
    NotFound(ThreadId),

    /// The caller itself, or the bootstrap thread, which never becomes joinable.
    #[error("thread {0} can never be joined by the caller")]
    NotJoinable(ThreadId),

    /// The return value was already collected by an earlier join.
    #[error("thread {0} was already joined")]
    AlreadyJoined(ThreadId),

    /// Another thread is already blocked joining the target.
    #[error("thread {0} already has a joiner")]
    JoinerPresent(ThreadId),

    /// The target's entry function panicked. The thread is still reaped.
    #[error("thread panicked: {0}")]
    Panicked(String),

    /// `join_as` asked for a different type than the thread returned.
    #[error("thread {0} returned a value of a different type")]
    TypeMismatch(ThreadId),
}
