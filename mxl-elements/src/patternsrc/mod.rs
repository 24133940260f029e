// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Test-pattern source.
//!
//! `patternsrc` has a single output port and no input. Every data cycle fills one
//! output buffer with the configured [`Pattern`] and stamps it with the presentation
//! time derived from the frame rate. With [`Settings::frames`] set, the last frame
//! carries the end-of-stream flag and the source stops producing until it is stopped
//! and started again.

use std::sync::Arc;

use mxl_component::{Component, ComponentConfig, Direction, Domain, EventHandler, Result};

/// Processing engine implementation.
mod imp;

/// Settings and stream position.
mod state;

pub use imp::PatternSrc;
pub use state::{Pattern, Rational, Settings};

/// Index of the output port.
pub const OUTPUT_PORT: u32 = 1;

/// Creates a patternsrc component in `Loaded` state.
pub fn create(
    domain: &Domain,
    settings: &Settings,
    handler: Arc<dyn EventHandler>,
) -> Result<Component> {
    let config = ComponentConfig::new(settings.name.clone(), settings.mode).with_port(
        crate::port_config(
            OUTPUT_PORT,
            Direction::Output,
            settings.buffer_count,
            settings.frame_size,
            settings.exchange,
        ),
    );
    domain.create_component(config, Box::new(PatternSrc::new(settings.clone())), handler)
}
