// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Frame-copying filter.
//!
//! `passthrough` copies each input frame, with its timestamp and flags, into an output
//! buffer. Attributes arriving on the input are forwarded through the output with the
//! next frame.
//!
//! ## Retain Mode
//! With [`Settings::retain_depth`] above zero the filter keeps up to that many sent
//! frames as references, the way a decoder holds reference pictures. The slots of
//! retained frames only return to the pool once the batch is released, which happens
//! when the depth is reached, at end of stream, and on flush or stop.

use std::sync::Arc;

use mxl_component::{Component, ComponentConfig, Direction, Domain, EventHandler, Result};

/// Processing engine implementation.
mod imp;

/// Settings and counters.
mod state;

pub use imp::Passthrough;
pub use state::Settings;

/// Index of the input port.
pub const INPUT_PORT: u32 = 0;

/// Index of the output port.
pub const OUTPUT_PORT: u32 = 1;

/// Creates a passthrough component in `Loaded` state.
pub fn create(
    domain: &Domain,
    settings: &Settings,
    handler: Arc<dyn EventHandler>,
) -> Result<Component> {
    let config = ComponentConfig::new(settings.name.clone(), settings.mode)
        .with_port(crate::port_config(
            INPUT_PORT,
            Direction::Input,
            settings.buffer_count,
            settings.buffer_size,
            settings.exchange,
        ))
        .with_port(crate::port_config(
            OUTPUT_PORT,
            Direction::Output,
            settings.buffer_count,
            settings.buffer_size,
            settings.exchange,
        ));
    domain.create_component(config, Box::new(Passthrough::new(settings.clone())), handler)
}
