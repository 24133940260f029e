// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Processing engine of checksink.

use mxl_component::{
    BufferFlags, BufferHeader, EngineControl, ProcessArgs, ProcessStatus, ProcessingEngine,
};
use tracing::{debug, info};

use crate::checksink::state::StatsHandle;

pub struct CheckSink {
    name: String,
    stats: StatsHandle,
}

impl CheckSink {
    pub fn new(name: String, stats: StatsHandle) -> Self {
        Self { name, stats }
    }
}

impl ProcessingEngine for CheckSink {
    fn control(&mut self, control: EngineControl) -> ProcessStatus {
        match control {
            EngineControl::Attribute { port, attribute } => {
                debug!("{} got attribute {} on port {}", self.name, attribute.id, port);
                self.stats.update(|stats| stats.attributes += 1);
            }
            EngineControl::Flush(_) => self.stats.update(|stats| stats.flushes += 1),
            EngineControl::Start | EngineControl::Stop => {}
        }
        ProcessStatus::Ok
    }

    fn process(
        &mut self,
        inputs: &mut [BufferHeader],
        _outputs: &mut [BufferHeader],
        _args: &mut ProcessArgs,
    ) -> ProcessStatus {
        let Some(input) = inputs.first() else {
            return ProcessStatus::Fatal("checksink has no input buffer".to_string());
        };
        let payload = input.payload();
        let stats = self.stats.update(|stats| {
            stats.record(&payload, input.timestamp, input.flags);
            stats.clone()
        });
        if input.flags.contains(BufferFlags::EOS) {
            info!(
                "{} reached end of stream: {} frames, checksum {:016x}",
                self.name, stats.frames, stats.checksum
            );
        }
        ProcessStatus::Ok
    }
}
