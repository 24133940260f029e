// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Call boundary to the algorithm a component runs.
//!
//! The component owns buffer movement; a [`ProcessingEngine`] only sees one set of
//! buffers per cycle (one per active port) and tells the component what to do with
//! them through [`ProcessArgs`].

use crate::{BufferHeader, exchange::Attribute};

/// Outcome of a processing-engine call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessStatus {
    Ok,
    /// The cycle failed but the engine can carry on; logged and ignored.
    Recoverable(String),
    /// The engine cannot continue; the component goes `Invalid`.
    Fatal(String),
}

/// Notifications delivered to the engine outside of data cycles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineControl {
    Start,
    Stop,
    /// The given port was flushed.
    Flush(u32),
    /// An attribute reached the head of an input port.
    Attribute { port: u32, attribute: Attribute },
}

/// What to do with an output buffer after a cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputAction {
    /// Send the buffer downstream.
    #[default]
    Send,
    /// Keep the buffer for the next cycle without sending it.
    Reuse,
    /// Send the buffer and keep a duplicate until `release_retained` is set.
    SendAndRetain,
}

/// Per-cycle arguments exchanged with the engine.
#[derive(Debug, Clone, Default)]
pub struct ProcessArgs {
    /// Port index of each entry of the `inputs` slice.
    pub input_ports: Vec<u32>,
    /// Port index of each entry of the `outputs` slice.
    pub output_ports: Vec<u32>,
    /// Set to `false` to get an input buffer again in the next cycle.
    pub inputs_consumed: Vec<bool>,
    pub outputs: Vec<OutputAction>,
    /// Release every duplicate retained in earlier cycles.
    pub release_retained: bool,
    /// Attributes to forward through output ports, as `(port, attribute)`.
    pub attributes: Vec<(u32, Attribute)>,
}

impl ProcessArgs {
    pub(crate) fn new(input_ports: Vec<u32>, output_ports: Vec<u32>) -> Self {
        Self {
            inputs_consumed: vec![true; input_ports.len()],
            outputs: vec![OutputAction::Send; output_ports.len()],
            input_ports,
            output_ports,
            release_retained: false,
            attributes: Vec::new(),
        }
    }
}

/// The algorithm run by a component.
///
/// Created by the caller and handed to [`crate::Domain::create_component`]; dropped
/// with the component.
pub trait ProcessingEngine: Send {
    fn control(&mut self, control: EngineControl) -> ProcessStatus {
        let _ = control;
        ProcessStatus::Ok
    }

    /// Runs one cycle over one buffer per active input and output port.
    fn process(
        &mut self,
        inputs: &mut [BufferHeader],
        outputs: &mut [BufferHeader],
        args: &mut ProcessArgs,
    ) -> ProcessStatus;
}
