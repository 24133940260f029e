// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Ready-made components for MXL pipelines.
//!
//! This crate provides three components built on [`mxl_component`]:
//!
//! - **patternsrc**: a source producing test-pattern frames at a nominal frame rate,
//!   optionally ending the stream after a number of frames
//! - **passthrough**: a filter copying every input frame to its output, optionally
//!   holding sent frames as references
//! - **checksink**: a sink computing a running FNV-1a checksum and frame statistics
//!
//! ## Port Layout
//! Every element uses port `0` for its input and port `1` for its output, so a
//! pipeline is wired with `tunnel(&upstream, 1, &downstream, 0)`.
//!
//! ## Example Pipeline
//! ```
//! use std::sync::Arc;
//! use mxl_component::{Command, Domain, EventRecorder, State, tunnel};
//! use mxl_elements::{checksink, patternsrc};
//!
//! # fn main() -> Result<(), mxl_component::Error> {
//! let domain = Domain::new();
//! let events = Arc::new(EventRecorder::new());
//! let source = patternsrc::create(
//!     &domain,
//!     &patternsrc::Settings { frames: Some(3), ..Default::default() },
//!     events.clone(),
//! )?;
//! let (sink, stats) = checksink::create(&domain, &checksink::Settings::default(), events)?;
//! tunnel(&source, patternsrc::OUTPUT_PORT, &sink, checksink::INPUT_PORT)?;
//!
//! for component in [&source, &sink] {
//!     component.send_command(Command::StateSet(State::Idle))?;
//!     component.process_pending()?;
//! }
//! for component in [&source, &sink] {
//!     component.send_command(Command::StateSet(State::Executing))?;
//!     component.process_pending()?;
//! }
//! while !stats.snapshot().eos {
//!     source.process_data()?;
//!     sink.process_data()?;
//! }
//! assert_eq!(stats.snapshot().frames, 3);
//!
//! for component in [&sink, &source] {
//!     component.send_command(Command::StateSet(State::Idle))?;
//!     component.process_pending()?;
//! }
//! for component in [&source, &sink] {
//!     component.send_command(Command::StateSet(State::Loaded))?;
//!     component.process_pending()?;
//! }
//! # Ok(())
//! # }
//! ```

use mxl_component::{Direction, ExchangeKind, PortConfig};

/// Checksum sink element.
pub mod checksink;

/// Frame-copying filter element.
pub mod passthrough;

/// Test-pattern source element.
pub mod patternsrc;

/// Builds the configuration of an element port.
pub(crate) fn port_config(
    index: u32,
    direction: Direction,
    buffer_count: u32,
    buffer_size: usize,
    exchange: ExchangeKind,
) -> PortConfig {
    let mut port = PortConfig::new(index, direction, buffer_count, buffer_size);
    port.tunnel_exchange = exchange;
    port
}
