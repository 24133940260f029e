// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Component lifecycle states and the legal transitions between them.

use std::sync::Mutex;

use crate::{Error, Result, sync::lock};

/// Lifecycle state of a component.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum State {
    /// Created, ports closed, no buffers.
    #[default]
    Loaded,
    /// Ports open and populated, no data processing.
    Idle,
    /// Processing data.
    Executing,
    /// Ports open, data processing suspended.
    Paused,
    /// Unrecoverable failure; only a transition to `Loaded` is accepted.
    Invalid,
}

impl State {
    /// Checks that `self -> to` is an edge of the lifecycle graph.
    ///
    /// # Errors
    ///
    /// - [`Error::SameState`] if `to == self`
    /// - [`Error::IncorrectStateTransition`] for any other illegal edge
    pub fn check_transition(self, to: State) -> Result<()> {
        use State::*;
        if self == to {
            return Err(Error::SameState);
        }
        let legal = matches!(
            (self, to),
            (Loaded, Idle)
                | (Idle, Loaded)
                | (Idle, Executing)
                | (Idle, Paused)
                | (Executing, Idle)
                | (Executing, Paused)
                | (Paused, Idle)
                | (Paused, Executing)
                | (Invalid, Loaded)
        );
        if legal {
            Ok(())
        } else {
            Err(Error::IncorrectStateTransition { from: self, to })
        }
    }

    /// Ports are open in this state.
    pub fn has_open_ports(self) -> bool {
        matches!(self, State::Idle | State::Executing | State::Paused)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct StateInfo {
    current: State,
    pending: Option<State>,
}

/// Current state plus the target of the transition in flight, if any.
#[derive(Debug, Default)]
pub(crate) struct Lifecycle {
    info: Mutex<StateInfo>,
}

impl Lifecycle {
    pub(crate) fn current(&self) -> State {
        lock(&self.info).current
    }

    pub(crate) fn pending(&self) -> Option<State> {
        lock(&self.info).pending
    }

    pub(crate) fn snapshot(&self) -> (State, Option<State>) {
        let info = lock(&self.info);
        (info.current, info.pending)
    }

    pub(crate) fn begin(&self, target: State) {
        lock(&self.info).pending = Some(target);
    }

    pub(crate) fn complete(&self, state: State) {
        let mut info = lock(&self.info);
        info.current = state;
        info.pending = None;
    }

    pub(crate) fn abort(&self) {
        lock(&self.info).pending = None;
    }

    /// The component is leaving the data-processing states.
    pub(crate) fn is_stopping(&self) -> bool {
        let info = lock(&self.info);
        matches!(info.pending, Some(State::Idle | State::Loaded)) || info.current == State::Invalid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_graph() {
        use State::*;
        let all = [Loaded, Idle, Executing, Paused, Invalid];
        let legal: Vec<(State, State)> = all
            .iter()
            .flat_map(|from| all.iter().map(move |to| (*from, *to)))
            .filter(|(from, to)| from.check_transition(*to).is_ok())
            .collect();
        assert_eq!(legal.len(), 9);
        assert_eq!(Loaded.check_transition(Loaded), Err(Error::SameState));
        assert_eq!(
            Loaded.check_transition(Executing),
            Err(Error::IncorrectStateTransition {
                from: Loaded,
                to: Executing
            })
        );
        assert!(Invalid.check_transition(Idle).is_err());
    }

    #[test]
    fn pending_target_is_tracked_separately() {
        let lifecycle = Lifecycle::default();
        lifecycle.begin(State::Idle);
        assert_eq!(lifecycle.snapshot(), (State::Loaded, Some(State::Idle)));
        assert!(lifecycle.is_stopping());
        lifecycle.complete(State::Idle);
        assert_eq!(lifecycle.snapshot(), (State::Idle, None));
        lifecycle.begin(State::Executing);
        assert!(!lifecycle.is_stopping());
        lifecycle.abort();
        assert_eq!(lifecycle.current(), State::Idle);
        assert_eq!(lifecycle.pending(), None);
    }
}
