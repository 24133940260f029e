// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Processing engine of passthrough.

use mxl_component::{
    BufferFlags, BufferHeader, EngineControl, OutputAction, ProcessArgs, ProcessStatus,
    ProcessingEngine,
};
use tracing::{debug, trace};

use crate::passthrough::{
    OUTPUT_PORT,
    state::{Settings, State},
};

pub struct Passthrough {
    settings: Settings,
    state: State,
}

impl Passthrough {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            state: State::default(),
        }
    }

    /// Chooses how the output of this cycle is sent.
    fn output_action(&mut self, eos: bool, args: &mut ProcessArgs) -> OutputAction {
        let depth = self.settings.retain_depth;
        if depth == 0 {
            return OutputAction::Send;
        }
        if eos || self.state.held >= depth {
            args.release_retained = true;
            self.state.held = 0;
            return OutputAction::Send;
        }
        self.state.held += 1;
        OutputAction::SendAndRetain
    }
}

impl ProcessingEngine for Passthrough {
    fn control(&mut self, control: EngineControl) -> ProcessStatus {
        match control {
            EngineControl::Stop => {
                debug!(
                    "{} stopped after {} frames ({} bytes)",
                    self.settings.name, self.state.frames, self.state.bytes
                );
                self.state = State::default();
            }
            EngineControl::Flush(port) if port == OUTPUT_PORT => self.state.held = 0,
            EngineControl::Attribute { port, attribute } => {
                trace!("{} got attribute {} on port {}", self.settings.name, attribute.id, port);
                self.state.pending_attributes.push(attribute);
            }
            EngineControl::Start | EngineControl::Flush(_) => {}
        }
        ProcessStatus::Ok
    }

    fn process(
        &mut self,
        inputs: &mut [BufferHeader],
        outputs: &mut [BufferHeader],
        args: &mut ProcessArgs,
    ) -> ProcessStatus {
        let (Some(input), Some(output)) = (inputs.first(), outputs.first_mut()) else {
            return ProcessStatus::Fatal("passthrough needs one input and one output".to_string());
        };
        let payload = input.payload();
        if let Err(e) = output.write_payload(&payload) {
            return ProcessStatus::Fatal(e.to_string());
        }
        output.timestamp = input.timestamp;
        output.flags = input.flags;

        args.attributes.extend(
            self.state
                .pending_attributes
                .drain(..)
                .map(|attribute| (OUTPUT_PORT, attribute)),
        );
        let eos = input.flags.contains(BufferFlags::EOS);
        let action = self.output_action(eos, args);
        args.outputs[0] = action;

        self.state.frames += 1;
        self.state.bytes += payload.len() as u64;
        ProcessStatus::Ok
    }
}
