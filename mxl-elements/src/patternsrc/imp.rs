// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Processing engine of patternsrc.

use mxl_component::{
    BufferFlags, BufferHeader, EngineControl, OutputAction, ProcessArgs, ProcessStatus,
    ProcessingEngine,
};
use tracing::{debug, info, trace};

use crate::patternsrc::state::{Settings, State};

pub struct PatternSrc {
    settings: Settings,
    state: State,
}

impl PatternSrc {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            state: State::default(),
        }
    }

    fn is_last(&self, index: u64) -> bool {
        self.settings.frames.is_some_and(|frames| index + 1 >= frames)
    }
}

impl ProcessingEngine for PatternSrc {
    fn control(&mut self, control: EngineControl) -> ProcessStatus {
        match control {
            EngineControl::Start => {
                debug!("{} starts at frame {}", self.settings.name, self.state.frame_index);
            }
            EngineControl::Stop => {
                info!(
                    "{} stopped after {} frames",
                    self.settings.name, self.state.frame_index
                );
                self.state.reset();
            }
            EngineControl::Flush(_) | EngineControl::Attribute { .. } => {}
        }
        ProcessStatus::Ok
    }

    fn process(
        &mut self,
        _inputs: &mut [BufferHeader],
        outputs: &mut [BufferHeader],
        args: &mut ProcessArgs,
    ) -> ProcessStatus {
        let Some(output) = outputs.first_mut() else {
            return ProcessStatus::Fatal("patternsrc has no output buffer".to_string());
        };
        if self.state.eos_sent || self.settings.frames == Some(0) {
            args.outputs[0] = OutputAction::Reuse;
            return ProcessStatus::Ok;
        }

        let index = self.state.frame_index;
        let len = self.settings.frame_size.min(output.alloc_len);
        let pattern = self.settings.pattern;
        let len = output.data().write(|bytes| {
            let len = len.min(bytes.len());
            pattern.fill(index, &mut bytes[..len]);
            len
        });
        output.offset = 0;
        output.filled_len = len;
        output.timestamp = State::timestamp(index, self.settings.frame_rate);
        if self.is_last(index) {
            output.flags |= BufferFlags::EOS;
            self.state.eos_sent = true;
            info!("{} sends end of stream with frame {}", self.settings.name, index);
        }
        trace!("{} produced frame {} ({} bytes)", self.settings.name, index, len);
        self.state.frame_index += 1;
        ProcessStatus::Ok
    }
}
