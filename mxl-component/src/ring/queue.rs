// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Fixed-capacity frame ring.
//!
//! Slot indices circulate through two bounded lock-free queues: `free` holds slots a
//! writer may allocate, `ready` holds published frames in production order. Payloads
//! and frame records live in two named segments (`<name>.payload` and
//! `<name>.headers`) so a reader opening the queue by name sees the writer's bytes
//! without copying.

use std::{
    fmt,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, AtomicUsize, Ordering},
    },
};

use crossbeam_utils::CachePadded;
use tracing::debug;

use crate::{
    Allocator, Error, Heap, Mark, Result,
    buffer::data::BufferData,
    ring::{
        frame::{FRAME_META_LEN, FrameMeta},
        segment::{Segment, SegmentRegistry},
    },
    sync::lock,
};

/// Callback fired by the ring on `put` or `release`.
pub type Notifier = Arc<dyn Fn() + Send + Sync>;

struct Cell {
    sequence: AtomicUsize,
    value: AtomicU32,
}

/// Bounded multi-producer multi-consumer queue of slot indices.
///
/// Each cell carries a sequence number: a producer may write cell `pos & mask` once
/// its sequence equals `pos`, and a consumer may read it once the sequence equals
/// `pos + 1`. After reading, the consumer advances the sequence by one lap.
pub(crate) struct IndexQueue {
    cells: Box<[CachePadded<Cell>]>,
    mask: usize,
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
}

impl IndexQueue {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(2).next_power_of_two();
        let cells = (0..capacity)
            .map(|i| {
                CachePadded::new(Cell {
                    sequence: AtomicUsize::new(i),
                    value: AtomicU32::new(0),
                })
            })
            .collect();
        Self {
            cells,
            mask: capacity - 1,
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Returns `false` if the queue is full.
    pub(crate) fn push(&self, value: u32) -> bool {
        let mut pos = self.tail.load(Ordering::Relaxed);
        loop {
            let cell = &self.cells[pos & self.mask];
            let sequence = cell.sequence.load(Ordering::Acquire);
            let diff = (sequence as isize).wrapping_sub(pos as isize);
            if diff == 0 {
                match self.tail.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        cell.value.store(value, Ordering::Relaxed);
                        cell.sequence
                            .store(pos.wrapping_add(1), Ordering::Release);
                        return true;
                    }
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                return false;
            } else {
                pos = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    pub(crate) fn pop(&self) -> Option<u32> {
        let mut pos = self.head.load(Ordering::Relaxed);
        loop {
            let cell = &self.cells[pos & self.mask];
            let sequence = cell.sequence.load(Ordering::Acquire);
            let diff = (sequence as isize).wrapping_sub(pos.wrapping_add(1) as isize);
            if diff == 0 {
                match self.head.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let value = cell.value.load(Ordering::Relaxed);
                        cell.sequence
                            .store(pos.wrapping_add(self.mask + 1), Ordering::Release);
                        return Some(value);
                    }
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                return None;
            } else {
                pos = self.head.load(Ordering::Relaxed);
            }
        }
    }

    /// Number of queued values; exact only while no push or pop is in flight.
    pub(crate) fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        tail.wrapping_sub(head)
    }
}

/// A frame taken from the ring by a reader.
#[derive(Debug, Clone)]
pub struct Frame {
    pub slot: u32,
    pub meta: FrameMeta,
    pub mark: Option<Mark>,
}

/// Ring of frame slots shared between one writer and one reader.
///
/// Every slot carries a reference count: `alloc` sets it to one, `dup` adds one and
/// `release` removes one. The slot returns to the free list when the count drops to
/// zero.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use mxl_component::{Allocator, Heap, HeapAllocator, ring::{FrameMeta, FrameQueue, SegmentRegistry}};
///
/// # fn main() -> Result<(), mxl_component::Error> {
/// let registry = SegmentRegistry::default();
/// let allocator: Arc<dyn Allocator> = Arc::new(HeapAllocator::new());
/// let writer = FrameQueue::create(&registry, "demo", 4, 1024, 64, Heap::Shared, &allocator)?;
/// let reader = FrameQueue::open(&registry, "demo")?;
///
/// let slot = writer.alloc().unwrap();
/// writer.payload(slot)?.write(|bytes| bytes[..5].copy_from_slice(b"frame"));
/// writer.put(slot, &FrameMeta { filled_len: 5, ..Default::default() }, None)?;
///
/// let frame = reader.get()?.unwrap();
/// assert_eq!(reader.payload(frame.slot)?.read(|b| b[..5].to_vec()), b"frame");
/// reader.release(frame.slot)?;
/// FrameQueue::delete(&registry, "demo")?;
/// # Ok(())
/// # }
/// ```
pub struct FrameQueue {
    name: String,
    payloads: Arc<Segment>,
    headers: Arc<Segment>,
    refs: Box<[AtomicU32]>,
    marks: Mutex<Vec<Option<Mark>>>,
    free: IndexQueue,
    ready: IndexQueue,
    on_put: Mutex<Option<Notifier>>,
    on_release: Mutex<Option<Notifier>>,
}

impl FrameQueue {
    /// Creates the payload and header segments and registers the queue under `name`.
    ///
    /// # Errors
    ///
    /// - [`Error::BadParameter`] if the name is already in use
    /// - [`Error::InsufficientResources`] if a segment cannot be allocated
    pub fn create(
        registry: &SegmentRegistry,
        name: &str,
        capacity: usize,
        payload_size: usize,
        alignment: usize,
        heap: Heap,
        allocator: &Arc<dyn Allocator>,
    ) -> Result<Arc<FrameQueue>> {
        let payload_name = format!("{name}.payload");
        let header_name = format!("{name}.headers");
        let payloads = registry.create_segment(
            &payload_name,
            capacity,
            payload_size,
            alignment,
            heap,
            allocator,
        )?;
        let headers = match registry.create_segment(
            &header_name,
            capacity,
            FRAME_META_LEN,
            8,
            heap,
            allocator,
        ) {
            Ok(headers) => headers,
            Err(e) => {
                registry.delete_segment(&payload_name)?;
                return Err(e);
            }
        };

        let free = IndexQueue::with_capacity(capacity);
        for slot in 0..capacity as u32 {
            free.push(slot);
        }
        let queue = Arc::new(FrameQueue {
            name: name.to_string(),
            payloads,
            headers,
            refs: (0..capacity).map(|_| AtomicU32::new(0)).collect(),
            marks: Mutex::new(vec![None; capacity]),
            free,
            ready: IndexQueue::with_capacity(capacity),
            on_put: Mutex::new(None),
            on_release: Mutex::new(None),
        });
        if let Err(e) = registry.register_queue(queue.clone()) {
            registry.delete_segment(&payload_name)?;
            registry.delete_segment(&header_name)?;
            return Err(e);
        }
        debug!("Created frame queue {} with {} slots.", name, capacity);
        Ok(queue)
    }

    /// Opens a queue created in the same registry.
    pub fn open(registry: &SegmentRegistry, name: &str) -> Result<Arc<FrameQueue>> {
        registry.open_queue(name)
    }

    /// Unregisters the queue and its segments.
    ///
    /// Every step runs; the first failure is returned.
    pub fn delete(registry: &SegmentRegistry, name: &str) -> Result<()> {
        let mut first_error = None;
        if registry.unregister_queue(name).is_none() {
            first_error = Some(Error::BadParameter(format!("Frame queue {name} not found.")));
        }
        for segment in [format!("{name}.payload"), format!("{name}.headers")] {
            if let Err(e) = registry.delete_segment(&segment) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.refs.len()
    }

    /// Payload storage of a slot.
    pub fn payload(&self, slot: u32) -> Result<BufferData> {
        self.payloads
            .element(slot as usize)
            .ok_or_else(|| Error::BadParameter(format!("Ring slot {slot} out of range.")))
    }

    fn refs(&self, slot: u32) -> Result<&AtomicU32> {
        self.refs
            .get(slot as usize)
            .ok_or_else(|| Error::BadParameter(format!("Ring slot {slot} out of range.")))
    }

    /// Takes a free slot for writing.
    pub fn alloc(&self) -> Option<u32> {
        let slot = self.free.pop()?;
        self.refs[slot as usize].store(1, Ordering::Release);
        Some(slot)
    }

    /// Publishes a filled slot and fires the put notifier.
    pub fn put(&self, slot: u32, meta: &FrameMeta, mark: Option<Mark>) -> Result<()> {
        let record = self.headers.element(slot as usize).ok_or_else(|| {
            Error::BadParameter(format!("Ring slot {slot} out of range."))
        })?;
        record.write(|bytes| meta.encode(bytes))?;
        if let Some(entry) = lock(&self.marks).get_mut(slot as usize) {
            *entry = mark;
        }
        if !self.ready.push(slot) {
            return Err(Error::Other(format!("Frame queue {} overflow.", self.name)));
        }
        Self::fire(&self.on_put);
        Ok(())
    }

    /// Takes the oldest published frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::VersionMismatch`] if the frame record has a foreign layout; the
    /// slot is released in that case.
    pub fn get(&self) -> Result<Option<Frame>> {
        let Some(slot) = self.ready.pop() else {
            return Ok(None);
        };
        let record = self.headers.element(slot as usize).ok_or_else(|| {
            Error::BadParameter(format!("Ring slot {slot} out of range."))
        })?;
        let meta = match record.read(FrameMeta::decode) {
            Ok(meta) => meta,
            Err(e) => {
                self.release(slot)?;
                return Err(e);
            }
        };
        let mark = lock(&self.marks)
            .get_mut(slot as usize)
            .and_then(Option::take);
        Ok(Some(Frame { slot, meta, mark }))
    }

    /// Adds a reference to a slot and returns the new count.
    pub fn dup(&self, slot: u32) -> Result<u32> {
        let refs = self.refs(slot)?;
        let previous = refs.fetch_add(1, Ordering::AcqRel);
        if previous == 0 {
            refs.fetch_sub(1, Ordering::AcqRel);
            return Err(Error::BadParameter(format!(
                "Ring slot {slot} is not allocated."
            )));
        }
        Ok(previous + 1)
    }

    /// Drops one reference; the slot becomes free when none remain.
    pub fn release(&self, slot: u32) -> Result<()> {
        let refs = self.refs(slot)?;
        let previous = refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| count.checked_sub(1))
            .map_err(|_| Error::BadParameter(format!("Ring slot {slot} released twice.")))?;
        if previous == 1 {
            if !self.free.push(slot) {
                return Err(Error::Other(format!(
                    "Frame queue {} free list overflow.",
                    self.name
                )));
            }
            Self::fire(&self.on_release);
        }
        Ok(())
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn ready_count(&self) -> usize {
        self.ready.len()
    }

    /// Registers the callback fired after every successful [`Self::put`].
    pub fn set_notifier(&self, notifier: Option<Notifier>) {
        *lock(&self.on_put) = notifier;
    }

    /// Registers the callback fired whenever a slot returns to the free list.
    pub fn set_release_notifier(&self, notifier: Option<Notifier>) {
        *lock(&self.on_release) = notifier;
    }

    fn fire(notifier: &Mutex<Option<Notifier>>) {
        let callback = lock(notifier).clone();
        if let Some(callback) = callback {
            callback();
        }
    }
}

impl fmt::Debug for FrameQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameQueue")
            .field("name", &self.name)
            .field("capacity", &self.capacity())
            .field("free", &self.free_count())
            .field("ready", &self.ready_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, thread};

    use super::*;
    use crate::{BufferFlags, HeapAllocator};

    fn ring(registry: &SegmentRegistry, name: &str, capacity: usize) -> Arc<FrameQueue> {
        let allocator: Arc<dyn Allocator> = Arc::new(HeapAllocator::new());
        FrameQueue::create(registry, name, capacity, 64, 16, Heap::System, &allocator).unwrap()
    }

    #[test]
    fn index_queue_is_bounded_and_fifo() {
        let queue = IndexQueue::with_capacity(4);
        for i in 0..4 {
            assert!(queue.push(i));
        }
        assert!(!queue.push(9));
        assert_eq!(queue.len(), 4);
        assert_eq!((0..4).map(|_| queue.pop().unwrap()).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn index_queue_survives_concurrent_producers_and_consumers() {
        let queue = Arc::new(IndexQueue::with_capacity(64));
        let producers: Vec<_> = (0..4u32)
            .map(|p| {
                let queue = queue.clone();
                thread::spawn(move || {
                    for i in 0..1000u32 {
                        while !queue.push(p * 1000 + i) {
                            thread::yield_now();
                        }
                    }
                })
            })
            .collect();
        let consumers: Vec<_> = (0..2)
            .map(|_| {
                let queue = queue.clone();
                thread::spawn(move || {
                    let mut seen = Vec::new();
                    while seen.len() < 2000 {
                        match queue.pop() {
                            Some(v) => seen.push(v),
                            None => thread::yield_now(),
                        }
                    }
                    seen
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }
        let all: HashSet<u32> = consumers
            .into_iter()
            .flat_map(|c| c.join().unwrap())
            .collect();
        assert_eq!(all.len(), 4000);
    }

    #[test]
    fn frames_flow_in_order_with_notifications() {
        let registry = SegmentRegistry::default();
        let writer = ring(&registry, "order", 4);
        let reader = FrameQueue::open(&registry, "order").unwrap();
        let puts = Arc::new(AtomicUsize::new(0));
        let counter = puts.clone();
        reader.set_notifier(Some(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })));

        for n in 0..3i64 {
            let slot = writer.alloc().unwrap();
            let meta = FrameMeta {
                timestamp: n,
                flags: if n == 2 { BufferFlags::EOS } else { BufferFlags::empty() },
                ..Default::default()
            };
            writer.put(slot, &meta, None).unwrap();
        }
        assert_eq!(puts.load(Ordering::SeqCst), 3);
        let stamps: Vec<i64> = (0..3)
            .map(|_| reader.get().unwrap().unwrap().meta.timestamp)
            .collect();
        assert_eq!(stamps, vec![0, 1, 2]);
        assert!(reader.get().unwrap().is_none());
    }

    #[test]
    fn duplicated_slot_frees_on_last_release() {
        let registry = SegmentRegistry::default();
        let queue = ring(&registry, "dup", 2);
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        queue.set_release_notifier(Some(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })));

        let slot = queue.alloc().unwrap();
        assert_eq!(queue.free_count(), 1);
        assert_eq!(queue.dup(slot).unwrap(), 2);
        queue.release(slot).unwrap();
        assert_eq!((queue.free_count(), released.load(Ordering::SeqCst)), (1, 0));
        queue.release(slot).unwrap();
        assert_eq!((queue.free_count(), released.load(Ordering::SeqCst)), (2, 1));
        assert!(queue.release(slot).is_err());
        assert!(queue.dup(slot).is_err());
    }

    #[test]
    fn delete_removes_queue_and_segments() {
        let registry = SegmentRegistry::default();
        ring(&registry, "gone", 2);
        assert_eq!(
            registry.segment_names(),
            vec!["gone.headers".to_string(), "gone.payload".to_string()]
        );
        FrameQueue::delete(&registry, "gone").unwrap();
        assert!(FrameQueue::open(&registry, "gone").is_err());
        assert!(registry.segment_names().is_empty());
        assert!(FrameQueue::delete(&registry, "gone").is_err());
    }
}
