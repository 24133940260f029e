// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Checksum sink.
//!
//! `checksink` consumes every frame arriving on its input port and folds the payload
//! into a running FNV-1a checksum. Frame and byte counts, the timestamp range, frames
//! arriving out of order, attributes, flushes and end of stream are tracked in
//! [`Stats`], readable at any time through the [`StatsHandle`] returned by [`create`].

use std::sync::Arc;

use mxl_component::{Component, ComponentConfig, Direction, Domain, EventHandler, Result};

/// Processing engine implementation.
mod imp;

/// Settings, statistics and the checksum function.
mod state;

pub use imp::CheckSink;
pub use state::{FNV_OFFSET, Settings, Stats, StatsHandle, fnv1a};

/// Index of the input port.
pub const INPUT_PORT: u32 = 0;

/// Creates a checksink component in `Loaded` state.
pub fn create(
    domain: &Domain,
    settings: &Settings,
    handler: Arc<dyn EventHandler>,
) -> Result<(Component, StatsHandle)> {
    let config = ComponentConfig::new(settings.name.clone(), settings.mode).with_port(
        crate::port_config(
            INPUT_PORT,
            Direction::Input,
            settings.buffer_count,
            settings.buffer_size,
            settings.exchange,
        ),
    );
    let stats = StatsHandle::default();
    let engine = CheckSink::new(settings.name.clone(), stats.clone());
    let component = domain.create_component(config, Box::new(engine), handler)?;
    Ok((component, stats))
}
