// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Thread coordination building blocks: event-flag groups, bounded FIFOs and deadlines.

use std::{
    collections::VecDeque,
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

/// Locks a mutex, recovering the guard if a previous holder panicked.
///
/// All state guarded in this crate stays consistent between statements, so a
/// poisoned lock carries no torn data.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Group of 32 event bits a thread can block on.
#[derive(Default)]
pub(crate) struct EventFlags {
    bits: Mutex<u32>,
    cond: Condvar,
}

impl EventFlags {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set(&self, mask: u32) {
        let mut bits = lock(&self.bits);
        *bits |= mask;
        self.cond.notify_all();
    }

    pub(crate) fn clear(&self, mask: u32) {
        *lock(&self.bits) &= !mask;
    }

    pub(crate) fn is_set(&self, mask: u32) -> bool {
        *lock(&self.bits) & mask == mask
    }

    /// Waits until any bit of `mask` is set.
    ///
    /// Returns the matched bits, or `None` if `timeout` elapsed first. A `None`
    /// timeout waits forever. With `consume` the matched bits are cleared.
    pub(crate) fn wait_any(
        &self,
        mask: u32,
        timeout: Option<Duration>,
        consume: bool,
    ) -> Option<u32> {
        let deadline = timeout.map(Deadline::after);
        let mut bits = lock(&self.bits);
        loop {
            let matched = *bits & mask;
            if matched != 0 {
                if consume {
                    *bits &= !matched;
                }
                return Some(matched);
            }
            match deadline {
                None => {
                    bits = self.cond.wait(bits).unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let remaining = deadline.remaining();
                    if remaining.is_zero() {
                        return None;
                    }
                    bits = self
                        .cond
                        .wait_timeout(bits, remaining)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
    }
}

/// Bounded FIFO with blocking reads, the in-process stand-in for a byte pipe.
///
/// Writers never block: a push into a full pipe hands the element back.
pub(crate) struct Pipe<T> {
    items: Mutex<VecDeque<T>>,
    cond: Condvar,
    capacity: usize,
}

impl<T> Pipe<T> {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            cond: Condvar::new(),
            capacity,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.items).len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        lock(&self.items).is_empty()
    }

    pub(crate) fn push_back(&self, item: T) -> core::result::Result<(), T> {
        let mut items = lock(&self.items);
        if items.len() >= self.capacity {
            return Err(item);
        }
        items.push_back(item);
        self.cond.notify_one();
        Ok(())
    }

    pub(crate) fn push_front(&self, item: T) -> core::result::Result<(), T> {
        let mut items = lock(&self.items);
        if items.len() >= self.capacity {
            return Err(item);
        }
        items.push_front(item);
        self.cond.notify_one();
        Ok(())
    }

    /// Pops the head element, waiting up to `timeout` for one to arrive.
    ///
    /// A zero timeout never blocks.
    pub(crate) fn pop_front(&self, timeout: Duration) -> Option<T> {
        let deadline = Deadline::after(timeout);
        let mut items = lock(&self.items);
        loop {
            if let Some(item) = items.pop_front() {
                return Some(item);
            }
            let remaining = deadline.remaining();
            if remaining.is_zero() {
                return None;
            }
            items = self
                .cond
                .wait_timeout(items, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Inspects the head element without removing it.
    pub(crate) fn peek_with<R>(&self, f: impl FnOnce(Option<&T>) -> R) -> R {
        f(lock(&self.items).front())
    }

    /// Counts the elements matching `predicate`.
    pub(crate) fn count_where(&self, predicate: impl Fn(&T) -> bool) -> usize {
        lock(&self.items).iter().filter(|item| predicate(item)).count()
    }

    /// Removes every element, preserving FIFO order in the returned vector.
    pub(crate) fn drain(&self) -> Vec<T> {
        lock(&self.items).drain(..).collect()
    }
}

/// Wall-clock deadline used by every bounded retry loop.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline(Instant);

impl Deadline {
    pub(crate) fn after(timeout: Duration) -> Self {
        Self(Instant::now() + timeout)
    }

    pub(crate) fn remaining(&self) -> Duration {
        self.0.saturating_duration_since(Instant::now())
    }

    pub(crate) fn expired(&self) -> bool {
        Instant::now() >= self.0
    }
}
