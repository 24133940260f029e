// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Zero-copy tunnel over a [`FrameQueue`].
//!
//! The output port supplies: on open it creates a ring of twice the negotiated buffer
//! count (a frame can be held by a duplicate while its successor is produced), then
//! publishes the ring name to the peer input port, which opens the same ring. Writers
//! allocate and publish slots, readers take and release them. The reader's data path
//! is woken by the ring's put notifier, the writer's by its release notifier.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    BufferHeader, Error, Result,
    buffer::header::SlotId,
    engine::SIGNAL_DATA,
    exchange::{
        Attribute, BufferExchange, ExchangeContext, ExchangeControl, ExchangeKind, OpenParams,
        UtilReply, UtilRequest, util_for,
    },
    port::{PORT_DOORBELL, PORT_RING_HANDOFF, TunnelLink, TunnelRole},
    ring::{FrameMeta, FrameQueue, Notifier},
    sync::{Deadline, lock},
};

pub struct RingQueue {
    ctx: ExchangeContext,
    link: TunnelLink,
    writer: bool,
    queue: Mutex<Option<Arc<FrameQueue>>>,
    /// Slots handed back with `cancel`, served before the ring.
    stash: Mutex<VecDeque<SlotId>>,
    attributes: Mutex<VecDeque<Attribute>>,
}

impl RingQueue {
    pub(crate) fn new(ctx: ExchangeContext) -> Result<Self> {
        let link = ctx.link()?;
        let writer = ctx.is_output();
        let expected = if writer {
            TunnelRole::Supplier
        } else {
            TunnelRole::NonSupplier
        };
        if link.role != expected {
            return Err(Error::BadParameter(format!(
                "Ring-queue tunnels are supplied by the output port (port {} is {:?}).",
                ctx.port.index, link.role
            )));
        }
        Ok(Self {
            ctx,
            link,
            writer,
            queue: Mutex::new(None),
            stash: Mutex::new(VecDeque::new()),
            attributes: Mutex::new(VecDeque::new()),
        })
    }

    /// Name of the ring this port is attached to, once open.
    pub fn ring_name(&self) -> Option<String> {
        lock(&self.queue).as_ref().map(|q| q.name().to_string())
    }

    fn ring(&self) -> Result<Arc<FrameQueue>> {
        lock(&self.queue).clone().ok_or(Error::InvalidState)
    }

    fn doorbell(&self) -> Notifier {
        let port = self.ctx.port.clone();
        let signals = self.ctx.signals.clone();
        Arc::new(move || {
            port.events.set(PORT_DOORBELL);
            signals.set(SIGNAL_DATA);
        })
    }

    fn register_slots(&self, ring: &FrameQueue) -> Result<()> {
        let (input_index, output_index) = if self.writer {
            (self.link.port, self.ctx.port.index)
        } else {
            (self.ctx.port.index, self.link.port)
        };
        for slot in 0..ring.capacity() as u32 {
            let header = BufferHeader::new(
                ring.payload(slot)?,
                SlotId(slot),
                input_index,
                output_index,
                self.writer,
            );
            self.ctx.port.buffers.insert(header)?;
        }
        self.ctx.port.update_population();
        Ok(())
    }

    fn unregister_slots(&self) {
        for slot in self.ctx.port.buffers.slots() {
            self.ctx.port.buffers.remove(slot);
        }
        self.ctx.port.update_population();
    }

    fn open_writer(&self, params: &OpenParams) -> Result<()> {
        let peer = self.link.peer()?;
        let local = self.ctx.port.definition();
        let remote = peer.port_definition(self.link.port)?;
        let count = local.buffer_count.max(remote.buffer_count) as usize;
        let size = local
            .buffer_size
            .max(remote.buffer_size)
            .max(params.buffer_size);
        let alignment = local.alignment.max(remote.alignment);
        let name = format!("mxl-ring-{}", Uuid::new_v4());

        let ring = FrameQueue::create(
            &self.ctx.segments,
            &name,
            count * 2,
            size,
            alignment,
            self.ctx.port.config.heap,
            &self.ctx.allocator,
        )?;
        if let Err(e) = self
            .register_slots(&ring)
            .and_then(|_| peer.announce_ring(self.link.port, &name))
        {
            self.unregister_slots();
            if let Err(delete) = FrameQueue::delete(&self.ctx.segments, &name) {
                warn!("Dropping ring {} after a failed open: {}", name, delete);
            }
            return Err(e);
        }
        ring.set_release_notifier(Some(self.doorbell()));
        debug!("Port {} writes ring {}.", self.ctx.port.index, name);
        *lock(&self.queue) = Some(ring);
        Ok(())
    }

    fn open_reader(&self) -> Result<()> {
        if self
            .ctx
            .port
            .events
            .wait_any(PORT_RING_HANDOFF, Some(self.ctx.timeouts.populate()), false)
            .is_none()
        {
            warn!("Port {} never received a ring name.", self.ctx.port.index);
            return Err(Error::PeerUnresponsive);
        }
        let name = self.ctx.port.take_ring_name().ok_or(Error::PeerUnresponsive)?;
        let ring = FrameQueue::open(&self.ctx.segments, &name)?;
        self.register_slots(&ring)?;
        ring.set_notifier(Some(self.doorbell()));
        debug!("Port {} reads ring {}.", self.ctx.port.index, name);
        *lock(&self.queue) = Some(ring);
        self.ctx.wake_data();
        Ok(())
    }

    fn take_next(&self, ring: &FrameQueue) -> Result<Option<BufferHeader>> {
        if let Some(slot) = lock(&self.stash).pop_front() {
            return self.ctx.port.buffers.get(slot).map(Some);
        }
        if self.writer {
            let Some(slot) = ring.alloc() else {
                return Ok(None);
            };
            let mut header = self.ctx.port.buffers.get(SlotId(slot))?;
            header.clear();
            return Ok(Some(header));
        }
        let Some(frame) = ring.get()? else {
            return Ok(None);
        };
        let mut header = self.ctx.port.buffers.get(SlotId(frame.slot))?;
        frame.meta.apply(&mut header);
        header.mark = frame.mark;
        self.ctx.port.buffers.commit(&header).map(Some)
    }

    fn release_local(&self, ring: &FrameQueue) -> Result<()> {
        let mut first_error = None;
        let stashed: Vec<SlotId> = lock(&self.stash).drain(..).collect();
        for slot in stashed {
            if let Err(e) = ring.release(slot.0) {
                first_error.get_or_insert(e);
            }
        }
        if !self.writer {
            loop {
                match ring.get() {
                    Ok(Some(frame)) => {
                        if let Err(e) = ring.release(frame.slot) {
                            first_error.get_or_insert(e);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        first_error.get_or_insert(e);
                    }
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn wait_all_free(&self, ring: &FrameQueue) -> Result<()> {
        let deadline = Deadline::after(self.ctx.timeouts.flush());
        while ring.free_count() < ring.capacity() {
            let remaining = deadline.remaining();
            if remaining.is_zero() {
                warn!(
                    "Ring {} still has {} slots in use.",
                    ring.name(),
                    ring.capacity() - ring.free_count()
                );
                return Err(Error::PeerUnresponsive);
            }
            let poll = self.ctx.timeouts.retry_interval().max(Duration::from_millis(1));
            self.ctx
                .port
                .events
                .wait_any(PORT_DOORBELL, Some(remaining.min(poll)), true);
        }
        Ok(())
    }
}

impl BufferExchange for RingQueue {
    fn kind(&self) -> ExchangeKind {
        ExchangeKind::RingQueue
    }

    fn open(&self, params: OpenParams) -> Result<()> {
        if self.writer {
            self.open_writer(&params)
        } else {
            self.open_reader()
        }
    }

    fn close(&self) -> Result<()> {
        let Some(ring) = lock(&self.queue).take() else {
            return Ok(());
        };
        let mut first_error = self.release_local(&ring).err();
        if self.writer {
            if let Err(e) = self.wait_all_free(&ring) {
                first_error.get_or_insert(e);
            }
            ring.set_release_notifier(None);
            if let Err(e) = FrameQueue::delete(&self.ctx.segments, ring.name()) {
                first_error.get_or_insert(e);
            }
        } else {
            ring.set_notifier(None);
        }
        self.unregister_slots();
        first_error.map_or(Ok(()), Err)
    }

    fn queue(&self, header: BufferHeader) -> Result<()> {
        if self.writer || header.is_duplicate() {
            return self.ring()?.release(header.slot().0);
        }
        lock(&self.stash).push_back(header.slot());
        self.ctx.wake_data();
        Ok(())
    }

    fn dequeue(&self, timeout: Duration) -> Result<Option<BufferHeader>> {
        if self.ctx.port.is_flushing() {
            return Ok(None);
        }
        if !lock(&self.attributes).is_empty() {
            return Err(Error::AttributePending);
        }
        let ring = self.ring()?;
        let deadline = Deadline::after(timeout);
        loop {
            if let Some(header) = self.take_next(&ring)? {
                return Ok(Some(header));
            }
            let remaining = deadline.remaining();
            if remaining.is_zero() {
                return Ok(None);
            }
            self.ctx
                .port
                .events
                .wait_any(PORT_DOORBELL, Some(remaining), true);
        }
    }

    fn send(&self, header: BufferHeader) -> Result<()> {
        if self.ctx.port.is_flushing() {
            return self.cancel(header);
        }
        let ring = self.ring()?;
        let slot = header.slot().0;
        if self.writer && !header.is_duplicate() {
            self.ctx.port.buffers.commit(&header)?;
            ring.put(slot, &FrameMeta::from_header(&header), header.mark)
        } else {
            ring.release(slot)
        }
    }

    fn cancel(&self, header: BufferHeader) -> Result<()> {
        if header.is_duplicate() {
            return self.ring()?.release(header.slot().0);
        }
        self.ctx.port.buffers.commit(&header)?;
        lock(&self.stash).push_front(header.slot());
        Ok(())
    }

    fn dup(&self, header: &BufferHeader) -> Result<BufferHeader> {
        let references = self.ring()?.dup(header.slot().0)?;
        debug!(
            "Ring slot {} of port {} now has {} references.",
            header.slot().index(),
            self.ctx.port.index,
            references
        );
        Ok(header.duplicate_of())
    }

    fn control(&self, control: ExchangeControl) -> Result<Option<Attribute>> {
        match control {
            ExchangeControl::Start => Ok(None),
            ExchangeControl::Stop | ExchangeControl::Flush => {
                let ring = lock(&self.queue).clone();
                match ring {
                    Some(ring) => self.release_local(&ring).map(|_| None),
                    None => Ok(None),
                }
            }
            ExchangeControl::SetAttribute(attribute) => {
                if self.writer {
                    self.link.peer()?.queue_attribute(self.link.port, attribute)?;
                } else {
                    lock(&self.attributes).push_back(attribute);
                    self.ctx.wake_data();
                }
                Ok(None)
            }
            ExchangeControl::GetAttribute => Ok(lock(&self.attributes).pop_front()),
        }
    }

    fn util(&self, request: UtilRequest) -> Result<UtilReply> {
        util_for(&self.ctx.port.definition(), request)
    }

    fn get_count(&self) -> usize {
        let stashed = lock(&self.stash).len();
        match lock(&self.queue).as_ref() {
            Some(ring) if self.writer => ring.free_count() + stashed,
            Some(ring) => ring.ready_count() + stashed,
            None => stashed,
        }
    }

    fn deinit(&self) {
        lock(&self.stash).clear();
        lock(&self.attributes).clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        BufferFlags,
        config::PortConfig,
        exchange::{
            ExchangeMode,
            testing::{MockPeer, PeerCall, context, tunneled_context},
        },
        port::{Direction, Port, TunnelLink},
    };

    fn params(mode: ExchangeMode) -> OpenParams {
        OpenParams {
            mode,
            cached: true,
            buffer_size: 0,
        }
    }

    /// Opens a writer against a mock peer, then a reader sharing the writer's registry.
    fn pair() -> (RingQueue, RingQueue, Arc<MockPeer>) {
        let peer = MockPeer::new(PortConfig::new(0, Direction::Input, 2, 32).definition);
        let writer_ctx = tunneled_context(
            PortConfig::new(1, Direction::Output, 2, 32),
            &peer,
            TunnelRole::Supplier,
            ExchangeKind::RingQueue,
        );
        let writer = RingQueue::new(writer_ctx.clone()).unwrap();
        writer.open(params(ExchangeMode::Writer)).unwrap();
        let name = match peer.calls().last() {
            Some(PeerCall::Ring(name)) => name.clone(),
            other => panic!("ring not announced: {other:?}"),
        };

        let reader_port = Arc::new(Port::new(PortConfig::new(0, Direction::Input, 2, 32)));
        let peer_dyn: Arc<dyn crate::exchange::TunnelPeer> = peer.clone();
        reader_port.set_tunnel(Some(TunnelLink {
            peer: Arc::downgrade(&peer_dyn),
            port: 1,
            role: TunnelRole::NonSupplier,
            kind: ExchangeKind::RingQueue,
        }));
        reader_port.publish_ring(name);
        let mut reader_ctx = context(reader_port);
        reader_ctx.segments = writer_ctx.segments.clone();
        let reader = RingQueue::new(reader_ctx).unwrap();
        reader.open(params(ExchangeMode::Reader)).unwrap();
        (writer, reader, peer)
    }

    #[test]
    fn ring_holds_twice_the_negotiated_count() {
        let (writer, reader, _peer) = pair();
        assert_eq!(writer.get_count(), 4);
        assert_eq!(reader.get_count(), 0);
        assert_eq!(writer.ctx.port.buffers.len(), 4);
        assert!(reader.ctx.port.is_populated());
    }

    #[test]
    fn frames_reach_the_reader_without_copies() {
        let (writer, reader, _peer) = pair();
        let mut header = writer.dequeue(Duration::ZERO).unwrap().unwrap();
        header.write_payload(b"zero-copy").unwrap();
        header.timestamp = 40;
        header.flags = BufferFlags::EOS;
        let storage = header.data().clone();
        reader.ctx.signals.clear(SIGNAL_DATA);
        writer.send(header).unwrap();
        assert!(reader.ctx.signals.is_set(SIGNAL_DATA));

        let received = reader.dequeue(Duration::from_millis(50)).unwrap().unwrap();
        assert!(received.data().same_storage(&storage));
        assert_eq!(received.payload(), b"zero-copy");
        assert_eq!((received.timestamp, received.flags), (40, BufferFlags::EOS));

        reader.send(received).unwrap();
        assert_eq!(writer.get_count(), 4);
    }

    #[test]
    fn duplicate_keeps_slot_until_both_released() {
        let (writer, reader, _peer) = pair();
        let header = writer.dequeue(Duration::ZERO).unwrap().unwrap();
        writer.send(header).unwrap();
        let received = reader.dequeue(Duration::ZERO).unwrap().unwrap();
        let dup = reader.dup(&received).unwrap();
        reader.send(received).unwrap();
        assert_eq!(writer.get_count(), 3);
        reader.send(dup).unwrap();
        assert_eq!(writer.get_count(), 4);
    }

    #[test]
    fn writer_blocks_until_a_slot_is_released() {
        let (writer, reader, _peer) = pair();
        for _ in 0..4 {
            let header = writer.dequeue(Duration::ZERO).unwrap().unwrap();
            writer.send(header).unwrap();
        }
        assert!(writer.dequeue(Duration::from_millis(5)).unwrap().is_none());
        let frame = reader.dequeue(Duration::ZERO).unwrap().unwrap();
        reader.send(frame).unwrap();
        assert!(writer.dequeue(Duration::ZERO).unwrap().is_some());
    }

    #[test]
    fn cancel_then_dequeue_yields_same_frame() {
        let (writer, reader, _peer) = pair();
        let mut header = writer.dequeue(Duration::ZERO).unwrap().unwrap();
        header.write_payload(&[7; 8]).unwrap();
        writer.send(header).unwrap();
        let first = reader.dequeue(Duration::ZERO).unwrap().unwrap();
        let slot = first.slot();
        reader.cancel(first).unwrap();
        let again = reader.dequeue(Duration::ZERO).unwrap().unwrap();
        assert_eq!(again.slot(), slot);
        assert_eq!(again.payload(), vec![7; 8]);
    }

    #[test]
    fn close_releases_everything_and_deletes_the_ring() {
        let (writer, reader, _peer) = pair();
        let header = writer.dequeue(Duration::ZERO).unwrap().unwrap();
        writer.send(header).unwrap();
        let name = writer.ring_name().unwrap();

        reader.close().unwrap();
        writer.close().unwrap();
        assert!(writer.ctx.segments.open_queue(&name).is_err());
        assert!(writer.ctx.port.buffers.is_empty());
        assert!(reader.ctx.port.buffers.is_empty());
    }

    #[test]
    fn input_port_cannot_supply_a_ring() {
        let peer = MockPeer::new(PortConfig::new(1, Direction::Output, 2, 32).definition);
        let ctx = tunneled_context(
            PortConfig::new(0, Direction::Input, 2, 32),
            &peer,
            TunnelRole::Supplier,
            ExchangeKind::RingQueue,
        );
        assert!(matches!(RingQueue::new(ctx), Err(Error::BadParameter(_))));
    }
}
