// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Named memory segments.
//!
//! A segment is one allocation split into `count` equally sized elements and
//! registered under a string name, so that the component that creates it and the
//! component that opens it by name address the same bytes.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex},
};

use tracing::{debug, warn};

use crate::{
    Allocator, Error, Heap, Result,
    buffer::data::{BufferData, Memory},
    ring::queue::FrameQueue,
    sync::lock,
};

pub struct Segment {
    name: String,
    element_size: usize,
    elements: Vec<BufferData>,
    block: Option<Arc<Mutex<Memory>>>,
    allocator: Arc<dyn Allocator>,
}

impl Segment {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn element_size(&self) -> usize {
        self.element_size
    }

    pub fn count(&self) -> usize {
        self.elements.len()
    }

    /// Storage of element `index`, shared with every other user of the segment.
    pub fn element(&self, index: usize) -> Option<BufferData> {
        self.elements.get(index).cloned()
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("name", &self.name)
            .field("element_size", &self.element_size)
            .field("count", &self.elements.len())
            .finish()
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        self.elements.clear();
        if let Some(block) = self.block.take() {
            match Arc::try_unwrap(block) {
                Ok(memory) => self
                    .allocator
                    .free(memory.into_inner().unwrap_or_else(|e| e.into_inner())),
                Err(_) => debug!(
                    "Segment {} is still mapped by a buffer, its last user frees it.",
                    self.name
                ),
            }
        }
    }
}

/// Process-wide namespace of segments and frame queues.
///
/// Owned by a [`crate::Domain`]; components created from the same domain can open
/// each other's queues by name.
#[derive(Default)]
pub struct SegmentRegistry {
    segments: Mutex<HashMap<String, Arc<Segment>>>,
    queues: Mutex<HashMap<String, Arc<FrameQueue>>>,
}

impl SegmentRegistry {
    /// Creates a segment of `count` elements of `element_size` bytes each.
    ///
    /// Every element starts on an `alignment` boundary.
    ///
    /// # Errors
    ///
    /// - [`Error::BadParameter`] if the name is taken or the geometry is empty
    /// - [`Error::InsufficientResources`] if the allocation fails
    pub fn create_segment(
        &self,
        name: &str,
        count: usize,
        element_size: usize,
        alignment: usize,
        heap: Heap,
        allocator: &Arc<dyn Allocator>,
    ) -> Result<Arc<Segment>> {
        if count == 0 || element_size == 0 {
            return Err(Error::BadParameter(format!(
                "Segment {name} needs a non-empty geometry."
            )));
        }
        let mut segments = lock(&self.segments);
        if segments.contains_key(name) {
            return Err(Error::BadParameter(format!("Segment {name} already exists.")));
        }
        let alignment = alignment.max(1);
        let stride = element_size.next_multiple_of(alignment);
        let total = stride
            .checked_mul(count)
            .ok_or(Error::InsufficientResources)?;
        let memory = allocator
            .alloc(total, alignment, heap)
            .ok_or(Error::InsufficientResources)?;
        let (block, elements) = BufferData::carve(memory, count, stride, element_size)
            .ok_or(Error::InsufficientResources)?;
        let segment = Arc::new(Segment {
            name: name.to_string(),
            element_size,
            elements,
            block: Some(block),
            allocator: allocator.clone(),
        });
        segments.insert(name.to_string(), segment.clone());
        debug!("Created segment {} ({} x {} bytes).", name, count, element_size);
        Ok(segment)
    }

    pub fn open_segment(&self, name: &str) -> Result<Arc<Segment>> {
        lock(&self.segments)
            .get(name)
            .cloned()
            .ok_or_else(|| Error::BadParameter(format!("Segment {name} not found.")))
    }

    /// Unregisters a segment; its memory is freed once the last opener drops it.
    pub fn delete_segment(&self, name: &str) -> Result<()> {
        lock(&self.segments)
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::BadParameter(format!("Segment {name} not found.")))
    }

    pub fn segment_names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.segments).keys().cloned().collect();
        names.sort();
        names
    }

    pub(crate) fn register_queue(&self, queue: Arc<FrameQueue>) -> Result<()> {
        let mut queues = lock(&self.queues);
        if queues.contains_key(queue.name()) {
            return Err(Error::BadParameter(format!(
                "Frame queue {} already exists.",
                queue.name()
            )));
        }
        queues.insert(queue.name().to_string(), queue);
        Ok(())
    }

    pub fn open_queue(&self, name: &str) -> Result<Arc<FrameQueue>> {
        lock(&self.queues)
            .get(name)
            .cloned()
            .ok_or_else(|| Error::BadParameter(format!("Frame queue {name} not found.")))
    }

    pub(crate) fn unregister_queue(&self, name: &str) -> Option<Arc<FrameQueue>> {
        let queue = lock(&self.queues).remove(name);
        if queue.is_none() {
            warn!("Frame queue {} was already gone.", name);
        }
        queue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HeapAllocator;

    #[test]
    fn segments_are_shared_by_name() {
        let allocator = Arc::new(HeapAllocator::new());
        let dyn_allocator: Arc<dyn Allocator> = allocator.clone();
        let registry = SegmentRegistry::default();
        let created = registry
            .create_segment("frames", 4, 100, 64, Heap::Shared, &dyn_allocator)
            .unwrap();
        assert_eq!(allocator.bytes_in_use(), 4 * 128);
        assert!(
            registry
                .create_segment("frames", 1, 1, 1, Heap::Shared, &dyn_allocator)
                .is_err()
        );

        let opened = registry.open_segment("frames").unwrap();
        created.element(2).unwrap().write(|b| b[0] = 42);
        assert_eq!(opened.element(2).unwrap().read(|b| b[0]), 42);
        assert_eq!(opened.element(2).unwrap().len(), 100);

        registry.delete_segment("frames").unwrap();
        assert!(registry.open_segment("frames").is_err());
        drop((created, opened));
        assert_eq!(allocator.bytes_in_use(), 0);
    }
}
