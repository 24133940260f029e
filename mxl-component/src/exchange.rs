// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Buffer-exchange strategies.
//!
//! A [`BufferExchange`] decides how a port's buffers are sourced and how they travel to
//! whoever sits on the other side of the port: the client ([`direct::Direct`]), a tunneled
//! peer sharing a buffer pool ([`std_tunnel::StdTunnel`]) or a tunneled peer reading a
//! lock-free frame ring ([`ring_queue::RingQueue`]).
//!
//! The strategy is picked from an [`ExchangeKind`] when the port opens; there is no
//! lookup by name.

pub mod direct;
pub mod ring_queue;
pub mod std_tunnel;

use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    Allocator, BufferHeader, Error, EventHandler, Result,
    buffer::header::{DupRelease, SlotId},
    config::{PortDefinition, Timeouts},
    engine::{SIGNAL_DATA, state::Lifecycle},
    port::{Direction, Port, PortTransition, TunnelLink},
    ring::segment::SegmentRegistry,
    sync::{EventFlags, Pipe},
};

use self::{direct::Direct, ring_queue::RingQueue, std_tunnel::StdTunnel};

/// Out-of-band attribute slots a port queue holds on top of its buffers.
const ATTRIBUTE_CAPACITY: usize = 16;

/// Selects the buffer-exchange strategy of a port.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeKind {
    /// Buffers are exchanged with the client through its callbacks.
    Direct,
    /// Shared buffer pool with wait-pipe backpressure.
    StdTunnel,
    /// Zero-copy frame ring over named segments.
    RingQueue,
}

impl ExchangeKind {
    /// Instantiates the strategy for a port.
    pub(crate) fn create(self, ctx: ExchangeContext) -> Result<Arc<dyn BufferExchange>> {
        Ok(match self {
            ExchangeKind::Direct => Arc::new(Direct::new(ctx)),
            ExchangeKind::StdTunnel => Arc::new(StdTunnel::new(ctx)?),
            ExchangeKind::RingQueue => Arc::new(RingQueue::new(ctx)?),
        })
    }
}

/// Whether the port produces (writer) or consumes (reader) frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeMode {
    Reader,
    Writer,
}

impl From<Direction> for ExchangeMode {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::Input => ExchangeMode::Reader,
            Direction::Output => ExchangeMode::Writer,
        }
    }
}

/// Parameters of [`BufferExchange::open`].
#[derive(Debug, Clone, Copy)]
pub struct OpenParams {
    pub mode: ExchangeMode,
    /// Whether payload memory may be CPU cached.
    pub cached: bool,
    /// Minimum payload size requested by the port owner.
    pub buffer_size: usize,
}

/// Opaque out-of-band control data (e.g. codec configuration) travelling ahead of buffers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub id: u32,
    pub data: Vec<u8>,
}

/// Out-of-band requests understood by every strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeControl {
    /// The component starts processing data.
    Start,
    /// The component leaves the executing/paused states.
    Stop,
    /// Return every outstanding buffer to where it came from.
    Flush,
    /// Deliver an attribute: queued locally on inputs, forwarded to the peer on outputs.
    SetAttribute(Attribute),
    /// Take the attribute at the head of the port queue.
    GetAttribute,
}

/// Buffer geometry utilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UtilRequest {
    /// Round `requested` up to the port alignment.
    AlignedBufferSize { requested: usize },
    /// Where extra data may be placed behind `payload_len` bytes of payload.
    ExtraDataLayout { payload_len: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UtilReply {
    Size(usize),
    ExtraData { offset: usize, capacity: usize },
}

/// Strategy moving one port's buffers.
///
/// Every call takes the port as implicit receiver. Implementations rely on the
/// command engine never running a command and the data loop at the same time on
/// the same component; entry points called by a peer only ever `queue`.
pub trait BufferExchange: Send + Sync {
    fn kind(&self) -> ExchangeKind;

    /// Allocates or binds the port's buffers and waits until the port is populated.
    ///
    /// # Errors
    ///
    /// - [`Error::InsufficientResources`] if the pool cannot be allocated
    /// - [`Error::PeerUnresponsive`] if buffers never arrive from the supplier
    fn open(&self, params: OpenParams) -> Result<()>;

    /// Releases the port's share of the pool.
    ///
    /// Every release step runs even if an earlier one failed; the first failure
    /// is returned.
    fn close(&self) -> Result<()>;

    /// Takes back a buffer handed in by the peer or the client.
    fn queue(&self, header: BufferHeader) -> Result<()>;

    /// Returns the next buffer available for local processing.
    ///
    /// Waits up to `timeout`; a zero timeout never blocks. Returns
    /// [`Error::AttributePending`] while an attribute sits at the head of the queue.
    fn dequeue(&self, timeout: Duration) -> Result<Option<BufferHeader>>;

    /// Commits the caller's header onto the canonical one and forwards the buffer.
    fn send(&self, header: BufferHeader) -> Result<()>;

    /// Puts a buffer back so that the next [`Self::dequeue`] yields it again.
    fn cancel(&self, header: BufferHeader) -> Result<()>;

    /// Produces a transient copy sharing the same storage.
    fn dup(&self, header: &BufferHeader) -> Result<BufferHeader>;

    fn control(&self, control: ExchangeControl) -> Result<Option<Attribute>>;

    fn util(&self, request: UtilRequest) -> Result<UtilReply>;

    /// Free buffers for a writer, queued buffers for a reader.
    fn get_count(&self) -> usize;

    /// Drops whatever the strategy still holds.
    fn deinit(&self);
}

/// Everything a strategy needs from the component that owns the port.
#[derive(Clone)]
pub(crate) struct ExchangeContext {
    pub(crate) component: Uuid,
    pub(crate) port: Arc<Port>,
    pub(crate) allocator: Arc<dyn Allocator>,
    pub(crate) segments: Arc<SegmentRegistry>,
    pub(crate) client: Arc<dyn EventHandler>,
    pub(crate) lifecycle: Arc<Lifecycle>,
    pub(crate) signals: Arc<EventFlags>,
    pub(crate) timeouts: Timeouts,
}

impl ExchangeContext {
    pub(crate) fn wake_data(&self) {
        self.signals.set(SIGNAL_DATA);
    }

    /// A transition that must not be stalled by peer backpressure has begun.
    pub(crate) fn stop_requested(&self) -> bool {
        self.lifecycle.is_stopping()
            || self.port.transition() == PortTransition::Disabling
            || self.port.is_flushing()
    }

    pub(crate) fn link(&self) -> Result<TunnelLink> {
        self.port.tunnel().ok_or_else(|| {
            Error::BadParameter(format!("Port {} is not tunneled.", self.port.index))
        })
    }

    pub(crate) fn is_output(&self) -> bool {
        self.port.direction == Direction::Output
    }
}

/// Item of a port queue: a buffer slot or an attribute.
#[derive(Debug)]
pub(crate) enum PipeItem {
    Buffer(SlotId),
    Attribute(Attribute),
}

/// Port queue shared by the pipe-based strategies.
pub(crate) struct ActiveQueue {
    pipe: Pipe<PipeItem>,
}

impl ActiveQueue {
    pub(crate) fn for_buffers(count: usize) -> Self {
        Self {
            pipe: Pipe::with_capacity(count + ATTRIBUTE_CAPACITY),
        }
    }

    pub(crate) fn push_back(&self, slot: SlotId) -> Result<()> {
        self.pipe
            .push_back(PipeItem::Buffer(slot))
            .map_err(|_| Error::Other(format!("Port queue full, slot {} dropped.", slot.index())))
    }

    pub(crate) fn push_front(&self, slot: SlotId) -> Result<()> {
        self.pipe
            .push_front(PipeItem::Buffer(slot))
            .map_err(|_| Error::Other(format!("Port queue full, slot {} dropped.", slot.index())))
    }

    pub(crate) fn push_attribute(&self, attribute: Attribute) -> Result<()> {
        self.pipe
            .push_back(PipeItem::Attribute(attribute))
            .map_err(|_| Error::InsufficientResources)
    }

    /// Pops the next buffer slot, or signals a pending attribute.
    pub(crate) fn pop(&self, timeout: Duration) -> Result<Option<SlotId>> {
        if self
            .pipe
            .peek_with(|head| matches!(head, Some(PipeItem::Attribute(_))))
        {
            return Err(Error::AttributePending);
        }
        match self.pipe.pop_front(timeout) {
            None => Ok(None),
            Some(PipeItem::Buffer(slot)) => Ok(Some(slot)),
            Some(item @ PipeItem::Attribute(_)) => {
                if self.pipe.push_front(item).is_err() {
                    tracing::error!("Attribute lost while requeuing it.");
                }
                Err(Error::AttributePending)
            }
        }
    }

    /// Removes the attribute at the head of the queue, if any.
    pub(crate) fn take_attribute(&self) -> Option<Attribute> {
        if !self
            .pipe
            .peek_with(|head| matches!(head, Some(PipeItem::Attribute(_))))
        {
            return None;
        }
        match self.pipe.pop_front(Duration::ZERO) {
            Some(PipeItem::Attribute(attribute)) => Some(attribute),
            Some(item) => {
                if self.pipe.push_front(item).is_err() {
                    tracing::error!("Buffer lost while requeuing it.");
                }
                None
            }
            None => None,
        }
    }

    pub(crate) fn buffer_count(&self) -> usize {
        self.pipe
            .count_where(|item| matches!(item, PipeItem::Buffer(_)))
    }

    /// Empties the queue, returning the buffer slots in FIFO order.
    pub(crate) fn drain_buffers(&self) -> Vec<SlotId> {
        self.pipe
            .drain()
            .into_iter()
            .filter_map(|item| match item {
                PipeItem::Buffer(slot) => Some(slot),
                PipeItem::Attribute(attribute) => {
                    tracing::debug!("Dropping attribute {} during drain.", attribute.id);
                    None
                }
            })
            .collect()
    }
}

/// Releases one reference on an output buffer.
///
/// Input buffers carry no duplicate counter and always return.
pub(crate) fn release_output(port: &Port, header: &BufferHeader) -> Result<DupRelease> {
    let canonical = port.buffers.get(header.slot())?;
    Ok(canonical
        .dup_counter()
        .map_or(DupRelease::Return, |counter| counter.release()))
}

/// Creates a duplicate of an output buffer and bumps its reference count.
pub(crate) fn duplicate(port: &Port, header: &BufferHeader) -> Result<BufferHeader> {
    let canonical = port.buffers.get(header.slot())?;
    let counter = canonical.dup_counter().ok_or_else(|| {
        Error::BadParameter(format!(
            "Buffers of input port {} cannot be duplicated.",
            port.index
        ))
    })?;
    let references = counter.acquire();
    tracing::trace!(
        "Duplicated slot {} on port {}, {} references.",
        header.slot().index(),
        port.index,
        references
    );
    Ok(header.duplicate_of())
}

/// Buffer geometry computations shared by all strategies.
pub(crate) fn util_for(definition: &PortDefinition, request: UtilRequest) -> Result<UtilReply> {
    let alignment = definition.alignment.max(1);
    match request {
        UtilRequest::AlignedBufferSize { requested } => {
            Ok(UtilReply::Size(requested.next_multiple_of(alignment)))
        }
        UtilRequest::ExtraDataLayout { payload_len } => {
            let offset = payload_len.next_multiple_of(alignment);
            if offset > definition.buffer_size {
                return Err(Error::BadParameter(format!(
                    "Payload of {payload_len} bytes leaves no room for extra data."
                )));
            }
            Ok(UtilReply::ExtraData {
                offset,
                capacity: definition.buffer_size - offset,
            })
        }
    }
}

/// Entry points a tunneled peer component exposes to its partner's strategy.
pub(crate) trait TunnelPeer: Send + Sync {
    fn id(&self) -> Uuid;

    fn port_definition(&self, port: u32) -> Result<PortDefinition>;

    /// Registers a buffer allocated by the supplier at the same slot index.
    fn use_buffer(&self, port: u32, header: BufferHeader) -> Result<()>;

    fn free_buffer(&self, port: u32, slot: SlotId) -> Result<()>;

    /// Hands a filled buffer to an input port.
    ///
    /// Returns [`Error::NotReady`] if the port does not accept buffers right now.
    fn empty_this_buffer(&self, port: u32, header: BufferHeader) -> Result<()>;

    /// Hands an empty buffer to an output port.
    fn fill_this_buffer(&self, port: u32, header: BufferHeader) -> Result<()>;

    fn queue_attribute(&self, port: u32, attribute: Attribute) -> Result<()>;

    /// Publishes the name of the frame ring created by the supplier.
    fn announce_ring(&self, port: u32, name: &str) -> Result<()>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! Fixtures shared by the strategy unit tests.

    use std::sync::{Arc, Mutex, Weak};

    use uuid::Uuid;

    use super::*;
    use crate::{
        HeapAllocator, NullEventHandler,
        buffer::header::SlotId,
        config::PortConfig,
        exchange::ExchangeKind,
        port::{TunnelLink, TunnelRole},
        sync::lock,
    };

    /// What a [`MockPeer`] observed.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) enum PeerCall {
        UseBuffer(SlotId),
        FreeBuffer(SlotId),
        Empty(SlotId),
        Fill(SlotId),
        Attribute(u32),
        Ring(String),
    }

    /// Tunnel peer recording calls; `ready` decides whether buffers are accepted.
    pub(crate) struct MockPeer {
        pub(crate) definition: Mutex<PortDefinition>,
        pub(crate) ready: Mutex<bool>,
        pub(crate) calls: Mutex<Vec<PeerCall>>,
        pub(crate) received: Mutex<Vec<BufferHeader>>,
    }

    impl MockPeer {
        pub(crate) fn new(definition: PortDefinition) -> Arc<Self> {
            Arc::new(Self {
                definition: Mutex::new(definition),
                ready: Mutex::new(true),
                calls: Mutex::new(Vec::new()),
                received: Mutex::new(Vec::new()),
            })
        }

        pub(crate) fn set_ready(&self, ready: bool) {
            *lock(&self.ready) = ready;
        }

        pub(crate) fn calls(&self) -> Vec<PeerCall> {
            lock(&self.calls).clone()
        }

        pub(crate) fn delivered(&self) -> Vec<SlotId> {
            self.calls()
                .into_iter()
                .filter_map(|call| match call {
                    PeerCall::Empty(slot) | PeerCall::Fill(slot) => Some(slot),
                    _ => None,
                })
                .collect()
        }

        fn accept(&self, call: PeerCall, header: BufferHeader) -> Result<()> {
            if !*lock(&self.ready) {
                return Err(Error::NotReady);
            }
            lock(&self.calls).push(call);
            lock(&self.received).push(header);
            Ok(())
        }
    }

    impl TunnelPeer for MockPeer {
        fn id(&self) -> Uuid {
            Uuid::nil()
        }

        fn port_definition(&self, _port: u32) -> Result<PortDefinition> {
            Ok(lock(&self.definition).clone())
        }

        fn use_buffer(&self, _port: u32, header: BufferHeader) -> Result<()> {
            lock(&self.calls).push(PeerCall::UseBuffer(header.slot()));
            Ok(())
        }

        fn free_buffer(&self, _port: u32, slot: SlotId) -> Result<()> {
            lock(&self.calls).push(PeerCall::FreeBuffer(slot));
            Ok(())
        }

        fn empty_this_buffer(&self, _port: u32, header: BufferHeader) -> Result<()> {
            self.accept(PeerCall::Empty(header.slot()), header)
        }

        fn fill_this_buffer(&self, _port: u32, header: BufferHeader) -> Result<()> {
            self.accept(PeerCall::Fill(header.slot()), header)
        }

        fn queue_attribute(&self, _port: u32, attribute: Attribute) -> Result<()> {
            lock(&self.calls).push(PeerCall::Attribute(attribute.id));
            Ok(())
        }

        fn announce_ring(&self, _port: u32, name: &str) -> Result<()> {
            lock(&self.calls).push(PeerCall::Ring(name.to_string()));
            Ok(())
        }
    }

    pub(crate) fn timeouts() -> Timeouts {
        Timeouts {
            populate_ms: 200,
            send_retry_ms: 50,
            retry_interval_ms: 1,
            flush_ms: 100,
        }
    }

    /// Builds a context for a port tunneled to `peer` with the given role.
    pub(crate) fn tunneled_context(
        config: PortConfig,
        peer: &Arc<MockPeer>,
        role: TunnelRole,
        kind: ExchangeKind,
    ) -> ExchangeContext {
        let peer: Arc<dyn TunnelPeer> = peer.clone();
        let weak: Weak<dyn TunnelPeer> = Arc::downgrade(&peer);
        let port = Arc::new(Port::new(config));
        port.set_tunnel(Some(TunnelLink {
            peer: weak,
            port: 0,
            role,
            kind,
        }));
        context(port)
    }

    pub(crate) fn context(port: Arc<Port>) -> ExchangeContext {
        ExchangeContext {
            component: Uuid::new_v4(),
            port,
            allocator: Arc::new(HeapAllocator::new()),
            segments: Arc::new(SegmentRegistry::default()),
            client: Arc::new(NullEventHandler),
            lifecycle: Arc::new(Lifecycle::default()),
            signals: Arc::new(EventFlags::new()),
            timeouts: timeouts(),
        }
    }
}
