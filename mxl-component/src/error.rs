// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Error types for component, port and buffer-exchange operations.
//!
//! Every fallible call in this crate returns [`Result`]. Errors are `Clone` so the
//! command path can hand them to the client inside [`crate::Event::Error`].

use crate::{State, processing::ProcessStatus};

/// Convenience result type using [`Error`] as the error variant.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors that can occur while driving components and moving buffers between ports.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The operation is not legal in the component's current lifecycle state.
    #[error("Invalid state")]
    InvalidState,

    /// A state change was requested towards the state the component is already in.
    #[error("Component is already in the requested state")]
    SameState,

    /// The requested state change is not part of the lifecycle graph.
    #[error("Incorrect state transition from {from:?} to {to:?}")]
    IncorrectStateTransition {
        /// Current state.
        from: State,
        /// Requested state.
        to: State,
    },

    /// The port (or its tunnel peer) cannot accept buffers right now.
    ///
    /// Returned by the buffer entry points when the receiving component has not
    /// reached a state where it processes data. Tunnel strategies react to it with
    /// backpressure instead of failing.
    #[error("Port is not accepting buffers in the current state")]
    NotReady,

    /// An allocation failed.
    #[error("Insufficient resources")]
    InsufficientResources,

    /// A request was malformed (bad port index, wrong direction, invalid config...).
    #[error("Bad parameter: {0}")]
    BadParameter(String),

    /// Catch-all for failures that have no more specific classification.
    #[error("Undefined error: {0}")]
    Undefined(String),

    /// A peer-dependent operation did not complete within its retry budget.
    #[error("Tunnel peer unresponsive")]
    PeerUnresponsive,

    /// An out-of-band attribute sits at the head of the port queue.
    ///
    /// Not a failure: the caller must fetch it with
    /// [`crate::ExchangeControl::GetAttribute`] before dequeuing buffers again.
    #[error("Attribute pending")]
    AttributePending,

    /// A versioned structure crossed a boundary with an unexpected version.
    #[error("Version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Version this build understands.
        expected: u32,
        /// Version that was presented.
        found: u32,
    },

    /// A blocking wait ran out of time.
    #[error("Timeout")]
    Timeout,

    /// A buffer was freed from an enabled port outside of a teardown.
    #[error("Port {0} unpopulated")]
    PortUnpopulated(u32),

    /// The processing engine reported an unrecoverable failure.
    #[error("Processing engine failure: {0}")]
    Engine(String),

    /// A generic error for failures not covered by the other variants.
    #[error("Other error: {0}")]
    Other(String),
}

impl Error {
    /// Converts a processing engine status into a [`Result`].
    ///
    /// Recoverable statuses are mapped to `Ok(())` after being logged; the data
    /// path keeps running. Fatal statuses become [`Error::Engine`].
    pub fn from_process_status(status: ProcessStatus) -> Result<()> {
        match status {
            ProcessStatus::Ok => Ok(()),
            ProcessStatus::Recoverable(reason) => {
                tracing::warn!("Processing engine reported a recoverable error: {}", reason);
                Ok(())
            }
            ProcessStatus::Fatal(reason) => Err(Error::Engine(reason)),
        }
    }

    /// Returns `true` for errors that signal a peer which is not (yet) accepting buffers.
    pub fn is_not_ready(&self) -> bool {
        matches!(self, Error::NotReady)
    }
}
