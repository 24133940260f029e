// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Events reported by components to their client.

use std::{
    sync::{Condvar, Mutex, PoisonError},
    time::Duration,
};

use uuid::Uuid;

use crate::{
    BufferFlags, BufferHeader, Command, Error, Mark,
    sync::{Deadline, lock},
};

/// Asynchronous notification from a component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A queued command finished successfully.
    CmdComplete(Command),
    /// A command or the data path failed.
    Error(Error),
    /// A marked buffer reached the component its mark targets.
    MarkReached { port: u32, mark: Mark },
    /// A buffer carrying notable flags (end of stream) left the component.
    BufferFlag { port: u32, flags: BufferFlags },
    /// The definition of a disabled port changed while the component was running.
    PortSettingsChanged(u32),
}

/// Client callbacks.
///
/// Called from the component's worker thread in active mode and from the caller's
/// own thread in passive mode. Implementations must not call back into the
/// component synchronously from `notify` in passive mode.
pub trait EventHandler: Send + Sync {
    fn notify(&self, component: Uuid, event: Event);

    /// An input buffer handed in with `empty_this_buffer` was consumed.
    fn empty_buffer_done(&self, component: Uuid, port: u32, header: BufferHeader) {
        let _ = (component, port, header);
    }

    /// An output buffer handed in with `fill_this_buffer` was filled.
    fn fill_buffer_done(&self, component: Uuid, port: u32, header: BufferHeader) {
        let _ = (component, port, header);
    }
}

/// Handler that only logs.
#[derive(Debug, Default)]
pub struct NullEventHandler;

impl EventHandler for NullEventHandler {
    fn notify(&self, component: Uuid, event: Event) {
        tracing::debug!("Component {} event: {:?}", component, event);
    }
}

/// A buffer given back to the client.
#[derive(Debug, Clone)]
pub struct ReturnedBuffer {
    pub component: Uuid,
    pub port: u32,
    pub header: BufferHeader,
}

#[derive(Default)]
struct Recorded {
    events: Vec<(Uuid, Event)>,
    returned: Vec<ReturnedBuffer>,
}

/// Handler that records everything and lets callers wait for it.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use mxl_component::{Event, EventHandler, EventRecorder};
/// use uuid::Uuid;
///
/// let recorder = EventRecorder::new();
/// recorder.notify(Uuid::nil(), Event::PortSettingsChanged(1));
/// let event = recorder.wait_for(Duration::from_millis(10), |_, e| {
///     matches!(e, Event::PortSettingsChanged(_))
/// });
/// assert_eq!(event, Some(Event::PortSettingsChanged(1)));
/// ```
#[derive(Default)]
pub struct EventRecorder {
    recorded: Mutex<Recorded>,
    cond: Condvar,
}

impl EventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(Uuid, Event)> {
        lock(&self.recorded).events.clone()
    }

    /// Events reported by one component, in order.
    pub fn events_of(&self, component: Uuid) -> Vec<Event> {
        lock(&self.recorded)
            .events
            .iter()
            .filter(|(source, _)| *source == component)
            .map(|(_, event)| event.clone())
            .collect()
    }

    /// Counts recorded events matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&Uuid, &Event) -> bool) -> usize {
        lock(&self.recorded)
            .events
            .iter()
            .filter(|(source, event)| predicate(source, event))
            .count()
    }

    /// Returns the first recorded event matching `predicate`, waiting up to `timeout`.
    pub fn wait_for(
        &self,
        timeout: Duration,
        predicate: impl Fn(&Uuid, &Event) -> bool,
    ) -> Option<Event> {
        self.wait_until(timeout, |recorded| {
            recorded
                .events
                .iter()
                .find(|(source, event)| predicate(source, event))
                .map(|(_, event)| event.clone())
        })
    }

    /// Waits until `count` events match `predicate`.
    pub fn wait_for_count(
        &self,
        timeout: Duration,
        count: usize,
        predicate: impl Fn(&Uuid, &Event) -> bool,
    ) -> bool {
        self.wait_until(timeout, |recorded| {
            let matched = recorded
                .events
                .iter()
                .filter(|(source, event)| predicate(source, event))
                .count();
            (matched >= count).then_some(())
        })
        .is_some()
    }

    /// Takes the buffers returned so far.
    pub fn take_returned(&self) -> Vec<ReturnedBuffer> {
        std::mem::take(&mut lock(&self.recorded).returned)
    }

    /// Waits until at least `count` buffers were returned, then takes them all.
    pub fn wait_returned(&self, timeout: Duration, count: usize) -> Vec<ReturnedBuffer> {
        self.wait_until(timeout, |recorded| {
            (recorded.returned.len() >= count).then_some(())
        });
        self.take_returned()
    }

    pub fn clear(&self) {
        let mut recorded = lock(&self.recorded);
        recorded.events.clear();
        recorded.returned.clear();
    }

    fn wait_until<R>(
        &self,
        timeout: Duration,
        check: impl Fn(&Recorded) -> Option<R>,
    ) -> Option<R> {
        let deadline = Deadline::after(timeout);
        let mut recorded = lock(&self.recorded);
        loop {
            if let Some(found) = check(&recorded) {
                return Some(found);
            }
            let remaining = deadline.remaining();
            if remaining.is_zero() {
                return None;
            }
            recorded = self
                .cond
                .wait_timeout(recorded, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn push_returned(&self, returned: ReturnedBuffer) {
        lock(&self.recorded).returned.push(returned);
        self.cond.notify_all();
    }
}

impl EventHandler for EventRecorder {
    fn notify(&self, component: Uuid, event: Event) {
        tracing::debug!("Component {} event: {:?}", component, event);
        lock(&self.recorded).events.push((component, event));
        self.cond.notify_all();
    }

    fn empty_buffer_done(&self, component: Uuid, port: u32, header: BufferHeader) {
        self.push_returned(ReturnedBuffer {
            component,
            port,
            header,
        });
    }

    fn fill_buffer_done(&self, component: Uuid, port: u32, header: BufferHeader) {
        self.push_returned(ReturnedBuffer {
            component,
            port,
            header,
        });
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;
    use crate::{State, engine::command::PortSelector};

    #[test]
    fn waits_for_events_from_other_threads() {
        let recorder = Arc::new(EventRecorder::new());
        let id = Uuid::new_v4();
        let sender = {
            let recorder = recorder.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                recorder.notify(id, Event::CmdComplete(Command::StateSet(State::Idle)));
                recorder.notify(id, Event::CmdComplete(Command::Flush(PortSelector::Port(0))));
            })
        };
        assert!(recorder.wait_for_count(Duration::from_secs(5), 2, |source, event| {
            *source == id && matches!(event, Event::CmdComplete(_))
        }));
        sender.join().unwrap();
        assert_eq!(recorder.events_of(id).len(), 2);
        assert!(
            recorder
                .wait_for(Duration::ZERO, |_, e| matches!(e, Event::Error(_)))
                .is_none()
        );
    }
}
