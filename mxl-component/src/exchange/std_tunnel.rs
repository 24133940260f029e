// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Shared-pool tunnel with wait-pipe backpressure.
//!
//! The supplier port allocates one contiguous block holding
//! `max(local, peer)` buffers and registers every slot with the peer. Buffers then
//! bounce between the two ports through their entry points. When the peer is not in a
//! state to accept a buffer, the supplier parks it in its wait pipe and retries on the
//! next send, dequeue or flush instead of failing.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use tracing::{debug, error, trace, warn};

use crate::{
    BufferHeader, Error, Result,
    buffer::{
        data::{BufferData, Memory},
        header::{DupRelease, SlotId},
    },
    exchange::{
        ActiveQueue, Attribute, BufferExchange, ExchangeContext, ExchangeControl, ExchangeKind,
        OpenParams, TunnelPeer, UtilReply, UtilRequest, duplicate, release_output, util_for,
    },
    port::{Direction, PORT_POPULATED, PORT_UNPOPULATED, TunnelLink, TunnelRole},
    sync::{Deadline, Pipe, lock},
};

pub struct StdTunnel {
    ctx: ExchangeContext,
    link: TunnelLink,
    active: ActiveQueue,
    wait: Pipe<SlotId>,
    /// References the peer holds per slot (supplier only).
    delivered: Mutex<HashMap<SlotId, usize>>,
    pool: Mutex<Option<Arc<Mutex<Memory>>>>,
}

impl StdTunnel {
    pub(crate) fn new(ctx: ExchangeContext) -> Result<Self> {
        let link = ctx.link()?;
        let mut count = ctx.port.definition().buffer_count as usize;
        if link.role == TunnelRole::Supplier {
            let remote = link.peer()?.port_definition(link.port)?;
            count = count.max(remote.buffer_count as usize);
        }
        Ok(Self {
            active: ActiveQueue::for_buffers(count),
            wait: Pipe::with_capacity(count),
            delivered: Mutex::new(HashMap::new()),
            pool: Mutex::new(None),
            link,
            ctx,
        })
    }

    fn is_supplier(&self) -> bool {
        self.link.role == TunnelRole::Supplier
    }

    /// Number of buffers parked because the peer was not ready.
    pub fn waiting(&self) -> usize {
        self.wait.len()
    }

    /// Number of buffers currently held by the peer.
    pub fn outstanding(&self) -> usize {
        lock(&self.delivered).values().sum()
    }

    fn port_indexes(&self) -> (u32, u32) {
        match self.ctx.port.direction {
            Direction::Output => (self.link.port, self.ctx.port.index),
            Direction::Input => (self.ctx.port.index, self.link.port),
        }
    }

    fn allocate_pool(&self, params: &OpenParams) -> Result<()> {
        let peer = self.link.peer()?;
        let local = self.ctx.port.definition();
        let remote = peer.port_definition(self.link.port)?;
        let count = local.buffer_count.max(remote.buffer_count) as usize;
        let size = local
            .buffer_size
            .max(remote.buffer_size)
            .max(params.buffer_size);
        let alignment = local.alignment.max(remote.alignment).max(1);
        let stride = size.next_multiple_of(alignment);
        let total = stride
            .checked_mul(count)
            .ok_or(Error::InsufficientResources)?;

        let memory = self
            .ctx
            .allocator
            .alloc(total, alignment, self.ctx.port.config.heap)
            .ok_or(Error::InsufficientResources)?;
        let (block, windows) =
            BufferData::carve(memory, count, stride, size).ok_or(Error::InsufficientResources)?;
        *lock(&self.pool) = Some(block);

        let (input_index, output_index) = self.port_indexes();
        let output = self.ctx.is_output();
        for window in windows {
            let header = self.ctx.port.buffers.push(move |slot| {
                BufferHeader::new(window, slot, input_index, output_index, output)
            });
            let slot = header.slot();
            if let Err(e) = peer.use_buffer(self.link.port, header) {
                error!(
                    "Peer refused buffer slot {} of port {}: {}",
                    slot.index(),
                    self.ctx.port.index,
                    e
                );
                if let Err(release) = self.release_pool(Some(&peer)) {
                    warn!("Pool release after failed open reported: {}", release);
                }
                return Err(e);
            }
            if output {
                self.active.push_back(slot)?;
            }
        }
        self.ctx.port.update_population();
        debug!(
            "Port {} supplies {} buffers of {} bytes (stride {}).",
            self.ctx.port.index, count, size, stride
        );
        Ok(())
    }

    /// Unregisters every slot from the peer and returns the pool to the allocator.
    fn release_pool(&self, peer: Option<&Arc<dyn TunnelPeer>>) -> Result<()> {
        let mut first_error = None;
        for slot in self.ctx.port.buffers.slots() {
            if let Some(peer) = peer {
                if let Err(e) = peer.free_buffer(self.link.port, slot) {
                    warn!("Peer failed to free slot {}: {}", slot.index(), e);
                    first_error.get_or_insert(e);
                }
            }
            self.ctx.port.buffers.remove(slot);
        }
        self.active.drain_buffers();
        self.wait.drain();
        lock(&self.delivered).clear();
        self.ctx.port.update_population();

        if let Some(block) = lock(&self.pool).take() {
            match Arc::try_unwrap(block) {
                Ok(memory) => self
                    .ctx
                    .allocator
                    .free(memory.into_inner().unwrap_or_else(|e| e.into_inner())),
                Err(_) => warn!(
                    "Buffer pool of port {} is still referenced, it will be freed by its last user.",
                    self.ctx.port.index
                ),
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Hands the canonical buffer at `slot` to the peer.
    fn deliver(&self, slot: SlotId) -> Result<()> {
        let header = self.ctx.port.buffers.get(slot)?;
        let peer = self.link.peer()?;
        let supplier = self.is_supplier();
        if supplier {
            *lock(&self.delivered).entry(slot).or_default() += 1;
        }
        let result = match self.ctx.port.direction {
            Direction::Output => peer.empty_this_buffer(self.link.port, header),
            Direction::Input => peer.fill_this_buffer(self.link.port, header),
        };
        if result.is_err() && supplier {
            self.returned(slot);
        }
        result
    }

    /// Drops one peer reference on `slot`.
    fn returned(&self, slot: SlotId) {
        let mut delivered = lock(&self.delivered);
        if let Some(count) = delivered.get_mut(&slot) {
            *count -= 1;
            if *count == 0 {
                delivered.remove(&slot);
            }
        }
    }

    fn park(&self, slot: SlotId) -> Result<()> {
        self.wait.push_back(slot).map_err(|slot| {
            Error::Other(format!("Wait pipe overflow on slot {}.", slot.index()))
        })
    }

    /// Delivers parked buffers until the peer rejects one.
    ///
    /// Returns `true` once the wait pipe is empty.
    fn drain_wait_once(&self) -> Result<bool> {
        while let Some(slot) = self.wait.pop_front(Duration::ZERO) {
            if let Err(e) = self.deliver(slot) {
                if self.wait.push_front(slot).is_err() {
                    error!("Slot {} lost while requeuing it.", slot.index());
                }
                return if e.is_not_ready() { Ok(false) } else { Err(e) };
            }
        }
        Ok(true)
    }

    /// Drains the wait pipe, retrying until the send deadline.
    ///
    /// Gives up early, leaving the remaining buffers parked, when the component
    /// starts moving to `Idle` or the port starts disabling or flushing.
    fn drain_wait_until_deadline(&self) -> Result<()> {
        let deadline = Deadline::after(self.ctx.timeouts.send_retry());
        loop {
            if self.drain_wait_once()? {
                return Ok(());
            }
            if self.ctx.stop_requested() {
                debug!(
                    "Port {} stops retrying, {} buffers stay parked.",
                    self.ctx.port.index,
                    self.wait.len()
                );
                return Ok(());
            }
            if deadline.expired() {
                warn!(
                    "Peer of port {} did not accept {} parked buffers in time.",
                    self.ctx.port.index,
                    self.wait.len()
                );
                return Err(Error::PeerUnresponsive);
            }
            thread::sleep(self.ctx.timeouts.retry_interval().min(deadline.remaining()));
        }
    }

    fn send_as_supplier(&self, slot: SlotId) -> Result<()> {
        if self.wait.is_empty() {
            return match self.deliver(slot) {
                Err(Error::NotReady) => {
                    trace!("Peer not ready, parking slot {}.", slot.index());
                    self.park(slot)
                }
                other => other,
            };
        }
        let stalled = self.wait.len() + 1 >= self.wait.capacity();
        self.park(slot)?;
        if stalled {
            self.drain_wait_until_deadline()
        } else {
            self.drain_wait_once().map(|_| ())
        }
    }

    fn send_with_retry(&self, slot: SlotId) -> Result<()> {
        let deadline = Deadline::after(self.ctx.timeouts.send_retry());
        loop {
            match self.deliver(slot) {
                Err(Error::NotReady) if !deadline.expired() => {
                    thread::sleep(self.ctx.timeouts.retry_interval().min(deadline.remaining()));
                }
                Err(Error::NotReady) => return Err(Error::PeerUnresponsive),
                other => return other,
            }
        }
    }

    fn wait_outstanding(&self, timeout: Duration) -> Result<()> {
        let deadline = Deadline::after(timeout);
        loop {
            let outstanding = self.outstanding();
            if outstanding == 0 {
                return Ok(());
            }
            if deadline.expired() {
                warn!(
                    "Peer of port {} still holds {} buffers.",
                    self.ctx.port.index, outstanding
                );
                return Err(Error::PeerUnresponsive);
            }
            thread::sleep(self.ctx.timeouts.retry_interval().min(deadline.remaining()));
        }
    }

    /// Hands every idle buffer of an input supplier to the peer output.
    fn prime_peer(&self) -> Result<()> {
        let idle = self.active.drain_buffers().len() + self.wait.drain().len();
        let held = lock(&self.delivered).clone();
        for slot in self.ctx.port.buffers.slots() {
            if !held.contains_key(&slot) {
                self.send_as_supplier(slot)?;
            }
        }
        debug!(
            "Port {} primed its peer ({} buffers were idle).",
            self.ctx.port.index, idle
        );
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        if self.is_supplier() && self.ctx.is_output() {
            for slot in self.wait.drain() {
                self.active.push_back(slot)?;
            }
            return self.wait_outstanding(self.ctx.timeouts.flush());
        }
        let mut first_error = None;
        for slot in self.active.drain_buffers() {
            let result = if self.is_supplier() {
                self.send_as_supplier(slot)
            } else {
                self.deliver(slot)
            };
            if let Err(e) = result {
                warn!("Flush of port {} could not return a buffer: {}", self.ctx.port.index, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl BufferExchange for StdTunnel {
    fn kind(&self) -> ExchangeKind {
        ExchangeKind::StdTunnel
    }

    fn open(&self, params: OpenParams) -> Result<()> {
        if self.is_supplier() {
            return self.allocate_pool(&params);
        }
        match self.ctx.port.events.wait_any(
            PORT_POPULATED,
            Some(self.ctx.timeouts.populate()),
            false,
        ) {
            Some(_) => Ok(()),
            None => {
                warn!(
                    "Port {} was not populated by its supplier in time.",
                    self.ctx.port.index
                );
                Err(Error::PeerUnresponsive)
            }
        }
    }

    fn close(&self) -> Result<()> {
        if self.is_supplier() {
            let mut first_error = self.wait_outstanding(self.ctx.timeouts.flush()).err();
            let peer = self.link.peer();
            let released = match &peer {
                Ok(peer) => self.release_pool(Some(peer)),
                Err(_) => self.release_pool(None),
            };
            if let Err(e) = peer.and(released) {
                first_error.get_or_insert(e);
            }
            return first_error.map_or(Ok(()), Err);
        }
        self.active.drain_buffers();
        match self.ctx.port.events.wait_any(
            PORT_UNPOPULATED,
            Some(self.ctx.timeouts.populate()),
            false,
        ) {
            Some(_) => Ok(()),
            None => Err(Error::PeerUnresponsive),
        }
    }

    fn queue(&self, header: BufferHeader) -> Result<()> {
        let slot = header.slot();
        if self.is_supplier() && !header.is_duplicate() {
            self.returned(slot);
        }
        if self.ctx.is_output() && release_output(&self.ctx.port, &header)? == DupRelease::Held {
            return Ok(());
        }
        self.active.push_back(slot)?;
        self.ctx.wake_data();
        Ok(())
    }

    fn dequeue(&self, timeout: Duration) -> Result<Option<BufferHeader>> {
        if self.ctx.port.is_flushing() {
            return Ok(None);
        }
        if self.is_supplier() && !self.wait.is_empty() {
            if let Err(e) = self.drain_wait_once() {
                warn!("Retrying parked buffers failed: {}", e);
            }
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
        let slot = self.ctx.port.buffers.commit(&header)?.slot();
        if self.is_supplier() {
            self.send_as_supplier(slot)
        } else {
            self.send_with_retry(slot)
        }
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
            ExchangeControl::Start => {
                if self.is_supplier() && !self.ctx.is_output() {
                    self.prime_peer()?;
                } else if self.is_supplier() {
                    self.drain_wait_once()?;
                }
                Ok(None)
            }
            ExchangeControl::Stop | ExchangeControl::Flush => self.flush().map(|_| None),
            ExchangeControl::SetAttribute(attribute) => {
                match self.ctx.port.direction {
                    Direction::Input => {
                        self.active.push_attribute(attribute)?;
                        self.ctx.wake_data();
                    }
                    Direction::Output => self.link.peer()?.queue_attribute(self.link.port, attribute)?,
                }
                Ok(None)
            }
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
        self.wait.drain();
        lock(&self.delivered).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        buffer::header::BufferFlags,
        config::PortConfig,
        exchange::{
            ExchangeMode,
            testing::{MockPeer, PeerCall, tunneled_context},
        },
    };

    fn output_supplier(count: u32, peer_count: u32) -> (StdTunnel, Arc<MockPeer>) {
        let config = PortConfig::new(1, Direction::Output, count, 64);
        let peer = MockPeer::new(PortConfig::new(0, Direction::Input, peer_count, 32).definition);
        let ctx = tunneled_context(config, &peer, TunnelRole::Supplier, ExchangeKind::StdTunnel);
        let tunnel = StdTunnel::new(ctx).unwrap();
        tunnel
            .open(OpenParams {
                mode: ExchangeMode::Writer,
                cached: true,
                buffer_size: 0,
            })
            .unwrap();
        (tunnel, peer)
    }

    fn fill(tunnel: &StdTunnel, byte: u8) -> BufferHeader {
        let mut header = tunnel.dequeue(Duration::ZERO).unwrap().unwrap();
        header.write_payload(&[byte; 4]).unwrap();
        header
    }

    #[test]
    fn supplier_pool_takes_the_larger_count() {
        let (tunnel, peer) = output_supplier(4, 6);
        assert_eq!(tunnel.get_count(), 6);
        let registered = peer
            .calls()
            .iter()
            .filter(|c| matches!(c, PeerCall::UseBuffer(_)))
            .count();
        assert_eq!(registered, 6);
        assert!(tunnel.ctx.port.is_populated());
    }

    #[test]
    fn supplier_dequeues_every_buffer_then_runs_dry() {
        let (tunnel, _peer) = output_supplier(4, 4);
        for _ in 0..4 {
            assert!(tunnel.dequeue(Duration::ZERO).unwrap().is_some());
        }
        assert!(tunnel.dequeue(Duration::from_millis(5)).unwrap().is_none());
    }

    #[test]
    fn parked_buffers_are_retried_in_order() {
        let (tunnel, peer) = output_supplier(4, 4);
        peer.set_ready(false);
        let first = fill(&tunnel, 1);
        let second = fill(&tunnel, 2);
        tunnel.send(first.clone()).unwrap();
        tunnel.send(second.clone()).unwrap();
        assert_eq!(tunnel.waiting(), 2);
        assert!(peer.delivered().is_empty());

        peer.set_ready(true);
        let third = fill(&tunnel, 3);
        tunnel.send(third.clone()).unwrap();
        assert_eq!(tunnel.waiting(), 0);
        assert_eq!(
            peer.delivered(),
            vec![first.slot(), second.slot(), third.slot()]
        );
        assert_eq!(tunnel.outstanding(), 3);
        let payloads: Vec<Vec<u8>> = crate::sync::lock(&peer.received)
            .iter()
            .map(BufferHeader::payload)
            .collect();
        assert_eq!(payloads, vec![vec![1; 4], vec![2; 4], vec![3; 4]]);
    }

    #[test]
    fn stalled_wait_pipe_reports_unresponsive_peer() {
        let (tunnel, peer) = output_supplier(2, 2);
        peer.set_ready(false);
        let first = fill(&tunnel, 1);
        let second = fill(&tunnel, 2);
        tunnel.send(first).unwrap();
        assert_eq!(tunnel.send(second), Err(Error::PeerUnresponsive));
        assert_eq!(tunnel.waiting(), 2);
    }

    #[test]
    fn flush_recovers_parked_buffers_and_is_idempotent() {
        let (tunnel, peer) = output_supplier(3, 3);
        peer.set_ready(false);
        let header = fill(&tunnel, 9);
        tunnel.send(header).unwrap();
        assert_eq!(tunnel.get_count(), 2);

        tunnel.control(ExchangeControl::Flush).unwrap();
        assert_eq!((tunnel.get_count(), tunnel.waiting(), tunnel.outstanding()), (3, 0, 0));
        tunnel.control(ExchangeControl::Flush).unwrap();
        assert_eq!((tunnel.get_count(), tunnel.waiting(), tunnel.outstanding()), (3, 0, 0));
    }

    #[test]
    fn flush_waits_for_the_peer_and_times_out() {
        let (tunnel, _peer) = output_supplier(2, 2);
        let header = fill(&tunnel, 1);
        tunnel.send(header).unwrap();
        assert_eq!(tunnel.outstanding(), 1);
        assert_eq!(
            tunnel.control(ExchangeControl::Flush),
            Err(Error::PeerUnresponsive)
        );
    }

    #[test]
    fn returned_buffer_goes_back_to_the_active_pipe() {
        let (tunnel, peer) = output_supplier(2, 2);
        let header = fill(&tunnel, 1);
        tunnel.send(header).unwrap();
        let returned = crate::sync::lock(&peer.received).remove(0);
        tunnel.queue(returned).unwrap();
        assert_eq!(tunnel.outstanding(), 0);
        assert_eq!(tunnel.get_count(), 2);
    }

    #[test]
    fn duplicate_holds_buffer_until_last_reference_returns() {
        let (tunnel, peer) = output_supplier(2, 2);
        let mut header = fill(&tunnel, 1);
        header.flags = BufferFlags::EOS;
        let dup = tunnel.dup(&header).unwrap();
        tunnel.send(header).unwrap();

        let returned = crate::sync::lock(&peer.received).remove(0);
        tunnel.queue(returned).unwrap();
        assert_eq!(tunnel.get_count(), 1);

        tunnel.queue(dup).unwrap();
        assert_eq!(tunnel.get_count(), 2);
    }

    #[test]
    fn cancel_round_trip_yields_same_buffer() {
        let (tunnel, _peer) = output_supplier(2, 2);
        let mut header = tunnel.dequeue(Duration::ZERO).unwrap().unwrap();
        header.write_payload(b"abcd").unwrap();
        let slot = header.slot();
        tunnel.cancel(header).unwrap();
        let again = tunnel.dequeue(Duration::ZERO).unwrap().unwrap();
        assert_eq!(again.slot(), slot);
        assert_eq!(again.data().read(|b| b[..4].to_vec()), b"abcd");
    }

    #[test]
    fn duplicate_sent_to_peer_counts_twice() {
        let (tunnel, peer) = output_supplier(2, 2);
        let header = fill(&tunnel, 5);
        let duplicate = tunnel.dup(&header).unwrap();
        tunnel.send(header.clone()).unwrap();
        tunnel.send(duplicate).unwrap();
        assert_eq!(peer.delivered(), vec![header.slot(), header.slot()]);
        assert_eq!(tunnel.outstanding(), 2);

        let returned = tunnel.ctx.port.buffers.get(header.slot()).unwrap();
        tunnel.queue(returned.clone()).unwrap();
        assert_eq!(tunnel.outstanding(), 1);
        assert_eq!(tunnel.get_count(), 1);
        tunnel.queue(returned).unwrap();
        assert_eq!(tunnel.outstanding(), 0);
        assert_eq!(tunnel.get_count(), 2);
    }

    #[test]
    fn close_frees_every_slot_at_the_peer() {
        let (tunnel, peer) = output_supplier(3, 3);
        tunnel.close().unwrap();
        let freed = peer
            .calls()
            .iter()
            .filter(|c| matches!(c, PeerCall::FreeBuffer(_)))
            .count();
        assert_eq!(freed, 3);
        assert!(tunnel.ctx.port.buffers.is_empty());
    }

    #[test]
    fn non_supplier_open_times_out_without_buffers() {
        let config = PortConfig::new(0, Direction::Input, 2, 64);
        let peer = MockPeer::new(PortConfig::new(1, Direction::Output, 2, 64).definition);
        let ctx = tunneled_context(config, &peer, TunnelRole::NonSupplier, ExchangeKind::StdTunnel);
        let tunnel = StdTunnel::new(ctx).unwrap();
        let params = OpenParams {
            mode: ExchangeMode::Reader,
            cached: true,
            buffer_size: 0,
        };
        assert_eq!(tunnel.open(params), Err(Error::PeerUnresponsive));
    }

    #[test]
    fn input_attribute_is_served_before_buffers() {
        let config = PortConfig::new(0, Direction::Input, 2, 64);
        let peer = MockPeer::new(PortConfig::new(1, Direction::Output, 2, 64).definition);
        let ctx = tunneled_context(config, &peer, TunnelRole::NonSupplier, ExchangeKind::StdTunnel);
        let tunnel = StdTunnel::new(ctx).unwrap();
        tunnel
            .control(ExchangeControl::SetAttribute(Attribute {
                id: 7,
                data: vec![0xCC],
            }))
            .unwrap();
        assert!(matches!(
            tunnel.dequeue(Duration::ZERO),
            Err(Error::AttributePending)
        ));
        let attribute = tunnel.control(ExchangeControl::GetAttribute).unwrap();
        assert_eq!(attribute.map(|a| a.id), Some(7));
        assert!(matches!(tunnel.dequeue(Duration::ZERO), Ok(None)));
    }
}
