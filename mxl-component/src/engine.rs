// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Command queue and wake-up signals of a component.
//!
//! Commands are queued by any thread and dispatched one at a time by whoever drives
//! the component: its worker thread in active mode, the caller in passive mode. Data
//! processing runs on that same thread and polls [`CommandEngine::is_command_pending`]
//! between units of work, so a queued command is never starved by a busy data path.

pub mod command;
pub mod state;

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use crate::{
    Error, Result,
    engine::{
        command::Command,
        state::{Lifecycle, State},
    },
    sync::{EventFlags, lock},
};

/// A command was queued.
pub(crate) const SIGNAL_COMMAND: u32 = 1 << 0;
/// A port may have buffers to process.
pub(crate) const SIGNAL_DATA: u32 = 1 << 1;
/// The worker thread must exit.
pub(crate) const SIGNAL_EXIT: u32 = 1 << 2;

#[derive(Default)]
struct Queue {
    waiting: VecDeque<Command>,
    /// Taken by `next` and not yet marked done.
    dispatching: Option<Command>,
}

pub(crate) struct CommandEngine {
    queue: Mutex<Queue>,
    pending: AtomicUsize,
    pub(crate) signals: Arc<EventFlags>,
    pub(crate) lifecycle: Arc<Lifecycle>,
}

impl CommandEngine {
    pub(crate) fn new() -> Self {
        Self {
            queue: Mutex::new(Queue::default()),
            pending: AtomicUsize::new(0),
            signals: Arc::new(EventFlags::new()),
            lifecycle: Arc::new(Lifecycle::default()),
        }
    }

    /// Queues a command without waiting for it to run.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the component is `Invalid` and the command
    /// is anything but a transition to `Loaded`.
    pub(crate) fn submit(&self, command: Command) -> Result<()> {
        if self.lifecycle.current() == State::Invalid
            && command != Command::StateSet(State::Loaded)
        {
            return Err(Error::InvalidState);
        }
        let mut queue = lock(&self.queue);
        queue.waiting.push_back(command);
        self.pending.fetch_add(1, Ordering::AcqRel);
        drop(queue);
        self.signals.set(SIGNAL_COMMAND);
        Ok(())
    }

    /// Takes the oldest queued command; it counts as queued until [`Self::done`].
    pub(crate) fn next(&self) -> Option<Command> {
        let mut queue = lock(&self.queue);
        let command = queue.waiting.pop_front()?;
        queue.dispatching = Some(command.clone());
        self.pending.fetch_sub(1, Ordering::AcqRel);
        Some(command)
    }

    /// The command returned by the last [`Self::next`] finished.
    pub(crate) fn done(&self) {
        lock(&self.queue).dispatching = None;
    }

    /// Returns `true` if a queued or dispatching command matches `predicate`.
    pub(crate) fn is_queued(&self, predicate: impl Fn(&Command) -> bool) -> bool {
        let queue = lock(&self.queue);
        queue.dispatching.iter().chain(queue.waiting.iter()).any(predicate)
    }

    pub(crate) fn is_command_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire) > 0
    }

    /// Blocks until a command, data or exit signal arrives, or `timeout` elapses.
    pub(crate) fn wait(&self, timeout: Duration) -> u32 {
        self.signals
            .wait_any(SIGNAL_COMMAND | SIGNAL_DATA | SIGNAL_EXIT, Some(timeout), true)
            .unwrap_or(0)
    }

    pub(crate) fn wake(&self, signal: u32) {
        self.signals.set(signal);
    }
}
