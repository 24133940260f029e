// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Buffer entry points, called by the client or by a tunneled peer.

use std::sync::atomic::Ordering;

use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::{
    BufferData, BufferHeader, Command, Error, Event, Result, State,
    buffer::header::SlotId,
    config::PortDefinition,
    exchange::{Attribute, ExchangeControl, TunnelPeer},
    port::{Direction, Port, PortTransition, TunnelRole},
};

use super::inner::ComponentCore;

impl ComponentCore {
    fn require_direction(&self, port: &Port, direction: Direction) -> Result<()> {
        if port.direction == direction {
            Ok(())
        } else {
            Err(Error::BadParameter(format!(
                "Port {} of {} is not an {:?} port.",
                port.index, self.config.name, direction
            )))
        }
    }

    fn require_untunneled(&self, port: &Port) -> Result<()> {
        match port.role() {
            TunnelRole::NotTunneled => Ok(()),
            role => Err(Error::BadParameter(format!(
                "Port {} is tunneled ({:?}); its buffers are managed by the tunnel.",
                port.index, role
            ))),
        }
    }

    /// Registers a client buffer on a non-tunneled port.
    pub(crate) fn use_client_buffer(&self, index: u32, data: BufferData) -> Result<BufferHeader> {
        let port = self.port(index)?;
        self.require_untunneled(port)?;
        if !self.may_populate(port) {
            return Err(Error::InvalidState);
        }
        let definition = port.definition();
        if port.buffers.len() >= definition.buffer_count as usize {
            return Err(Error::BadParameter(format!(
                "Port {} already holds its {} buffers.",
                index, definition.buffer_count
            )));
        }
        if data.len() < definition.buffer_size {
            return Err(Error::BadParameter(format!(
                "Buffer of {} bytes is smaller than the port buffer size {}.",
                data.len(),
                definition.buffer_size
            )));
        }
        let output = port.direction == Direction::Output;
        let header = port
            .buffers
            .push(|slot| BufferHeader::new(data, slot, index, index, output));
        port.update_population();
        trace!("Port {} registered client buffer {}.", index, header.slot().index());
        Ok(header)
    }

    /// Allocates a buffer from the domain allocator and registers it.
    pub(crate) fn allocate_client_buffer(&self, index: u32, size: usize) -> Result<BufferHeader> {
        let port = self.port(index)?;
        let definition = port.definition();
        let size = size.max(definition.buffer_size);
        let memory = self
            .allocator
            .alloc(size, definition.alignment.max(1), port.config.heap)
            .ok_or(Error::InsufficientResources)?;
        let data = BufferData::from_memory(memory);
        match self.use_client_buffer(index, data.clone()) {
            Ok(header) => Ok(header),
            Err(e) => {
                if let Some(memory) = data.into_memory() {
                    self.allocator.free(memory);
                }
                Err(e)
            }
        }
    }

    /// The component is expected to lose the buffers of `port` right now.
    fn expects_depopulation(&self, port: &Port) -> bool {
        let (current, pending) = self.engine.lifecycle.snapshot();
        current == State::Loaded
            || current == State::Invalid
            || pending == Some(State::Loaded)
            || !port.is_enabled()
            || port.transition() == PortTransition::Disabling
            || self.teardown.load(Ordering::Acquire)
            || self.engine.is_queued(|command| match command {
                Command::StateSet(State::Loaded) => true,
                Command::PortDisable(selector) => selector.matches(port.index),
                _ => false,
            })
    }

    /// Unregisters a client buffer and returns its memory to the allocator.
    pub(crate) fn free_client_buffer(&self, index: u32, header: BufferHeader) -> Result<()> {
        let port = self.port(index)?;
        self.require_untunneled(port)?;
        let removed = port.buffers.remove(header.slot()).ok_or_else(|| {
            Error::BadParameter(format!(
                "Slot {} is not registered on port {}.",
                header.slot().index(),
                index
            ))
        })?;
        drop(removed);
        port.update_population();
        if !self.expects_depopulation(port) {
            warn!("Buffer freed from enabled port {} of {}.", index, self.config.name);
            self.emit(Event::Error(Error::PortUnpopulated(index)));
        }
        if let Some(memory) = header.into_data().into_memory() {
            self.allocator.free(memory);
        }
        Ok(())
    }

    fn queue_from_outside(&self, port: &Port, header: BufferHeader) -> Result<()> {
        let exchange = self.accepting_exchange(port)?;
        let canonical = port.buffers.commit(&header)?;
        exchange.queue(canonical)?;
        self.wake_data();
        Ok(())
    }

    /// Takes a filled buffer on an input port.
    pub(crate) fn empty_buffer(&self, index: u32, header: BufferHeader) -> Result<()> {
        let port = self.port(index)?;
        self.require_direction(port, Direction::Input)?;
        self.queue_from_outside(port, header)
    }

    /// Takes an empty buffer on an output port.
    pub(crate) fn fill_buffer(&self, index: u32, header: BufferHeader) -> Result<()> {
        let port = self.port(index)?;
        self.require_direction(port, Direction::Output)?;
        self.queue_from_outside(port, header)
    }

    /// Queues out-of-band data in front of the next buffers of an input port.
    pub(crate) fn add_attribute(&self, index: u32, attribute: Attribute) -> Result<()> {
        let port = self.port(index)?;
        self.require_direction(port, Direction::Input)?;
        port.require_exchange()?
            .control(ExchangeControl::SetAttribute(attribute))
            .map(|_| ())
    }

    pub(crate) fn set_definition(&self, index: u32, definition: PortDefinition) -> Result<()> {
        let port = self.port(index)?;
        definition.validate()?;
        let (current, pending) = self.engine.lifecycle.snapshot();
        let loaded = current == State::Loaded && pending.is_none();
        if !loaded && (port.is_enabled() || port.transition() != PortTransition::None) {
            return Err(Error::InvalidState);
        }
        port.set_definition(definition);
        if !loaded {
            self.emit(Event::PortSettingsChanged(index));
        }
        Ok(())
    }
}

impl TunnelPeer for ComponentCore {
    fn id(&self) -> Uuid {
        self.id
    }

    fn port_definition(&self, port: u32) -> Result<PortDefinition> {
        Ok(self.port(port)?.definition())
    }

    fn use_buffer(&self, index: u32, header: BufferHeader) -> Result<()> {
        let port = self.port(index)?;
        if !self.may_populate(port) {
            return Err(Error::InvalidState);
        }
        let slot = header.slot();
        let (input, output) = (header.input_port_index, header.output_port_index);
        let local = BufferHeader::new(
            header.into_data(),
            slot,
            input,
            output,
            port.direction == Direction::Output,
        );
        port.buffers.insert(local)?;
        port.update_population();
        Ok(())
    }

    fn free_buffer(&self, index: u32, slot: SlotId) -> Result<()> {
        let port = self.port(index)?;
        if port.buffers.remove(slot).is_none() {
            debug!("Peer freed unknown slot {} of port {}.", slot.index(), index);
        }
        port.update_population();
        Ok(())
    }

    fn empty_this_buffer(&self, port: u32, header: BufferHeader) -> Result<()> {
        self.empty_buffer(port, header)
    }

    fn fill_this_buffer(&self, port: u32, header: BufferHeader) -> Result<()> {
        self.fill_buffer(port, header)
    }

    fn queue_attribute(&self, port: u32, attribute: Attribute) -> Result<()> {
        self.add_attribute(port, attribute)
    }

    fn announce_ring(&self, index: u32, name: &str) -> Result<()> {
        let port = self.port(index)?;
        self.require_direction(port, Direction::Input)?;
        port.publish_ring(name.to_string());
        Ok(())
    }
}
