// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Scheduler lists.
//!
//! Three disjoint rings of thread ids: active (ready or running), waiting
//! (parked on I/O or a join), joinable (exited, waiting to be joined or
//! reclaimed). Threads live in the scheduler's arena; lists only hold ids,
//! so unlinking a thread never leaves a dangling neighbour pointer.
use std::collections::VecDeque;

use crate::task::ThreadId;

/// Ordered ring of thread ids. New members go to the front.
#[derive(Debug)]
pub(crate) struct ThreadList {
    ring: VecDeque<ThreadId>,
}

impl ThreadList {
    pub fn new() -> Self {
        Self {
            ring: VecDeque::new(),
        }
    }

    pub fn push_front(&mut self, id: ThreadId) {
        debug_assert!(!self.contains(id), "thread {id} linked twice");
        self.ring.push_front(id);
    }

    /// Unlink `id`. Returns false if it was not a member.
    pub fn remove(&mut self, id: ThreadId) -> bool {
        match self.ring.iter().position(|&t| t == id) {
            Some(pos) => {
                self.ring.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: ThreadId) -> bool {
        self.ring.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = ThreadId> + '_ {
        self.ring.iter().copied()
    }

    /// Every other member, starting just after `id` and wrapping around.
    /// If `id` is not a member, yields the whole ring from the front.
    pub fn cycle_after(&self, id: ThreadId) -> impl Iterator<Item = ThreadId> + '_ {
        let len = self.ring.len();
        let (start, count) = match self.ring.iter().position(|&t| t == id) {
            Some(pos) => (pos + 1, len.saturating_sub(1)),
            None => (0, len),
        };
        (0..count).map(move |i| self.ring[(start + i) % len])
    }

    pub fn retain(&mut self, keep: impl FnMut(&ThreadId) -> bool) {
        self.ring.retain(keep);
    }
}

/// Which list a thread is linked into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum List {
    Active,
    Waiting,
    Joinable,
}

#[derive(Debug)]
pub(crate) struct Queues {
    pub active: ThreadList,
    pub waiting: ThreadList,
    pub joinable: ThreadList,
}

impl Queues {
    pub fn new() -> Self {
        Self {
            active: ThreadList::new(),
            waiting: ThreadList::new(),
            joinable: ThreadList::new(),
        }
    }

    pub fn list_mut(&mut self, list: List) -> &mut ThreadList {
        match list {
            List::Active => &mut self.active,
            List::Waiting => &mut self.waiting,
            List::Joinable => &mut self.joinable,
        }
    }

    /// Find `id`, searching active, then waiting, then joinable.
    pub fn locate(&self, id: ThreadId) -> Option<List> {
        if self.active.contains(id) {
            Some(List::Active)
        } else if self.waiting.contains(id) {
            Some(List::Waiting)
        } else if self.joinable.contains(id) {
            Some(List::Joinable)
        } else {
            None
        }
    }

    /// Unlink `id` from `from` and push it onto the front of `to`.
    /// Returns false (and changes nothing) if it was not in `from`.
    pub fn relocate(&mut self, id: ThreadId, from: List, to: List) -> bool {
        if !self.list_mut(from).remove(id) {
            return false;
        }
        self.list_mut(to).push_front(id);
        true
    }
}
