// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Client-facing exchange for ports that are not tunneled.
//!
//! The client registers the buffers (`use_buffer`/`allocate_buffer`), hands them in
//! with `empty_this_buffer`/`fill_this_buffer` and gets them back through its
//! [`crate::EventHandler`] callbacks.

use std::time::Duration;

use tracing::{debug, warn};

use crate::{
    BufferHeader, Error, Result,
    buffer::header::DupRelease,
    exchange::{
        ActiveQueue, Attribute, BufferExchange, ExchangeContext, ExchangeControl, ExchangeKind,
        OpenParams, UtilReply, UtilRequest, duplicate, release_output, util_for,
    },
    port::{Direction, PORT_POPULATED, PORT_UNPOPULATED},
};

pub struct Direct {
    ctx: ExchangeContext,
    active: ActiveQueue,
}

impl Direct {
    pub(crate) fn new(ctx: ExchangeContext) -> Self {
        let count = ctx.port.definition().buffer_count as usize;
        Self {
            active: ActiveQueue::for_buffers(count),
            ctx,
        }
    }

    fn give_back(&self, header: BufferHeader) {
        let (component, port) = (self.ctx.component, self.ctx.port.index);
        match self.ctx.port.direction {
            Direction::Input => self.ctx.client.empty_buffer_done(component, port, header),
            Direction::Output => self.ctx.client.fill_buffer_done(component, port, header),
        }
    }
}

impl BufferExchange for Direct {
    fn kind(&self) -> ExchangeKind {
        ExchangeKind::Direct
    }

    fn open(&self, _params: OpenParams) -> Result<()> {
        self.ctx
            .port
            .events
            .wait_any(PORT_POPULATED, Some(self.ctx.timeouts.populate()), false)
            .map(|_| ())
            .ok_or(Error::PortUnpopulated(self.ctx.port.index))
    }

    fn close(&self) -> Result<()> {
        for slot in self.active.drain_buffers() {
            debug!("Slot {} was still queued at close.", slot.index());
        }
        self.ctx
            .port
            .events
            .wait_any(PORT_UNPOPULATED, Some(self.ctx.timeouts.populate()), false)
            .map(|_| ())
            .ok_or_else(|| {
                warn!(
                    "Client still holds {} buffers of port {}.",
                    self.ctx.port.buffers.len(),
                    self.ctx.port.index
                );
                Error::Timeout
            })
    }

    fn queue(&self, header: BufferHeader) -> Result<()> {
        if self.ctx.is_output() && release_output(&self.ctx.port, &header)? == DupRelease::Held {
            return Ok(());
        }
        self.active.push_back(header.slot())?;
        self.ctx.wake_data();
        Ok(())
    }

    fn dequeue(&self, timeout: Duration) -> Result<Option<BufferHeader>> {
        if self.ctx.port.is_flushing() {
            return Ok(None);
        }
        let Some(slot) = self.active.pop(timeout)? else {
            return Ok(None);
        };
        let mut header = self.ctx.port.buffers.get(slot)?;
        if self.ctx.is_output() {
            header.clear();
        }
        Ok(Some(header))
    }

    fn send(&self, header: BufferHeader) -> Result<()> {
        if self.ctx.port.is_flushing() {
            return self.cancel(header);
        }
        let canonical = self.ctx.port.buffers.commit(&header)?;
        self.give_back(canonical);
        Ok(())
    }

    fn cancel(&self, header: BufferHeader) -> Result<()> {
        let slot = self.ctx.port.buffers.commit(&header)?.slot();
        if self.ctx.is_output() && release_output(&self.ctx.port, &header)? == DupRelease::Held {
            return Ok(());
        }
        self.active.push_front(slot)
    }

    fn dup(&self, header: &BufferHeader) -> Result<BufferHeader> {
        duplicate(&self.ctx.port, header)
    }

    fn control(&self, control: ExchangeControl) -> Result<Option<Attribute>> {
        match control {
            ExchangeControl::Start => Ok(None),
            ExchangeControl::Stop | ExchangeControl::Flush => {
                for slot in self.active.drain_buffers() {
                    // The client may free queued buffers ahead of a disable.
                    let Ok(mut header) = self.ctx.port.buffers.get(slot) else {
                        debug!("Slot {} was freed while queued.", slot.index());
                        continue;
                    };
                    if self.ctx.is_output() {
                        header.clear();
                        self.ctx.port.buffers.commit(&header)?;
                    }
                    self.give_back(header);
                }
                Ok(None)
            }
            ExchangeControl::SetAttribute(attribute) => match self.ctx.port.direction {
                Direction::Input => {
                    self.active.push_attribute(attribute)?;
                    self.ctx.wake_data();
                    Ok(None)
                }
                Direction::Output => Err(Error::BadParameter(format!(
                    "Output port {} has no peer to forward attributes to.",
                    self.ctx.port.index
                ))),
            },
            ExchangeControl::GetAttribute => Ok(self.active.take_attribute()),
        }
    }

    fn util(&self, request: UtilRequest) -> Result<UtilReply> {
        util_for(&self.ctx.port.definition(), request)
    }

    fn get_count(&self) -> usize {
        self.active.buffer_count()
    }

    fn deinit(&self) {
        self.active.drain_buffers();
    }
}
