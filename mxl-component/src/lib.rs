// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! # MXL Component
//!
//! Component framework for in-process media pipelines: lifecycle and command
//! sequencing for processing components, and the buffer-exchange protocols that move
//! buffers between tunneled ports.
//!
//! ## Overview
//!
//! A [`Component`] wraps a [`ProcessingEngine`] (the codec, source or sink algorithm)
//! behind a uniform interface. Its ports exchange [`BufferHeader`]s either with the
//! client or with a tunneled peer component.
//!
//! ### Key Concepts
//!
//! - **Domain**: context owning the allocator and named segments ([`Domain`])
//! - **Component**: state machine `Loaded -> Idle -> Executing/Paused -> Idle -> Loaded`
//!   driven by queued [`Command`]s, reporting [`Event`]s to an [`EventHandler`]
//! - **Port**: input or output endpoint with a negotiated [`PortDefinition`]
//! - **Buffer exchange**: per-port strategy implementing [`BufferExchange`]
//! - **Tunnel**: direct link between an output and an input port ([`tunnel`])
//!
//! ### Exchange Strategies
//!
//! - [`ExchangeKind::Direct`]: buffers come from the client and go back through its
//!   callbacks
//! - [`ExchangeKind::StdTunnel`]: the supplier port allocates a shared pool; buffers the
//!   peer cannot accept yet are parked in a wait pipe and retried
//! - [`ExchangeKind::RingQueue`]: zero-copy hand-off through a lock-free frame ring
//!
//! ## Architecture
//!
//! ```text
//! ┌────────┐
//! │ Domain │  (allocator, named segments)
//! └───┬────┘
//!     │
//!     ├─► Component ──► CommandEngine (queue, state machine, signals)
//!     │             └─► Port ──► BufferExchange (Direct | StdTunnel | RingQueue)
//!     │
//!     └─► Component ◄── tunnel ──► Component
//! ```
//!
//! ## Examples
//!
//! ### Driving a passive sink by hand
//!
//! ```
//! use std::sync::Arc;
//! use mxl_component::{
//!     BufferHeader, Command, ComponentConfig, Direction, Domain, EventRecorder,
//!     ExecutionMode, PortConfig, ProcessArgs, ProcessStatus, ProcessingEngine, State,
//! };
//!
//! struct Sink;
//!
//! impl ProcessingEngine for Sink {
//!     fn process(
//!         &mut self,
//!         inputs: &mut [BufferHeader],
//!         _outputs: &mut [BufferHeader],
//!         _args: &mut ProcessArgs,
//!     ) -> ProcessStatus {
//!         println!("received {} bytes", inputs[0].filled_len);
//!         ProcessStatus::Ok
//!     }
//! }
//!
//! # fn main() -> Result<(), mxl_component::Error> {
//! let domain = Domain::new();
//! let events = Arc::new(EventRecorder::new());
//! let sink = domain.create_component(
//!     ComponentConfig::new("sink", ExecutionMode::Passive)
//!         .with_port(PortConfig::new(0, Direction::Input, 1, 64)),
//!     Box::new(Sink),
//!     events.clone(),
//! )?;
//!
//! sink.send_command(Command::StateSet(State::Idle))?;
//! let mut buffer = sink.allocate_buffer(0, 64)?;
//! sink.process_pending()?;
//! sink.send_command(Command::StateSet(State::Executing))?;
//! sink.process_pending()?;
//! assert_eq!(sink.state(), State::Executing);
//!
//! buffer.write_payload(b"hello")?;
//! sink.empty_this_buffer(0, buffer)?;
//! assert_eq!(sink.process_data()?, 1);
//! let returned = events.take_returned();
//! assert_eq!(returned.len(), 1);
//! # Ok(())
//! # }
//! ```
//!
//! ## Thread Safety
//!
//! - [`Component`] is `Send + Sync`; commands and buffers may be handed in from any thread
//! - Commands and data cycles of one component never run concurrently: the worker
//!   thread (active mode) or the caller (passive mode) runs both, and the data loop
//!   yields whenever [`Component::is_command_pending`] reports a queued command
//! - Event callbacks run on the thread driving the component

mod allocator;
mod component;
mod domain;
mod engine;
mod error;
mod event;
mod port;
mod processing;
mod sync;

pub mod buffer;
pub mod config;
pub mod exchange;
pub mod ring;

pub use allocator::{Allocator, Heap, HeapAllocator};
pub use buffer::{
    data::{BufferData, Memory},
    header::{BufferFlags, BufferHeader, Mark, SlotId},
};
pub use component::{Component, tunnel::tunnel};
pub use config::{
    CONFIG_VERSION, ComponentConfig, ExecutionMode, PortConfig, PortDefinition,
    SupplierPreference, Timeouts,
};
pub use domain::Domain;
pub use engine::{command::Command, command::PortSelector, state::State};
pub use error::{Error, Result};
pub use event::{Event, EventHandler, EventRecorder, NullEventHandler, ReturnedBuffer};
pub use exchange::{
    Attribute, BufferExchange, ExchangeControl, ExchangeKind, ExchangeMode, OpenParams,
    UtilReply, UtilRequest,
};
pub use port::{Direction, TunnelRole};
pub use processing::{
    EngineControl, OutputAction, ProcessArgs, ProcessStatus, ProcessingEngine,
};
