// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Backing-storage allocation for port buffers.
//!
//! Supplier ports and [`crate::Component::allocate_buffer`] obtain payload memory
//! through an [`Allocator`]. The default [`HeapAllocator`] serves every [`Heap`] from
//! process memory and keeps track of the bytes it has handed out.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use serde::{Deserialize, Serialize};

use crate::buffer::data::Memory;

/// Memory heap a port asks its buffers to come from.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Heap {
    /// Ordinary process memory.
    #[default]
    System,
    /// Physically contiguous memory (carve-out style heaps).
    Contiguous,
    /// Memory that may be mapped by another process.
    Shared,
}

/// Source of payload memory.
///
/// Implementations must be synchronous and must report failure with `None`
/// rather than panicking.
pub trait Allocator: Send + Sync {
    /// Allocates `size` zeroed bytes whose first byte is aligned to `alignment`.
    fn alloc(&self, size: usize, alignment: usize, heap: Heap) -> Option<Memory>;

    /// Returns memory obtained from [`Self::alloc`].
    fn free(&self, memory: Memory) {
        drop(memory);
    }
}

/// Allocator backed by the global Rust allocator.
///
/// # Examples
///
/// ```
/// use mxl_component::{Allocator, Heap, HeapAllocator};
///
/// let allocator = HeapAllocator::new();
/// let memory = allocator.alloc(4096, 64, Heap::System).unwrap();
/// assert_eq!(allocator.bytes_in_use(), 4096);
/// allocator.free(memory);
/// assert_eq!(allocator.bytes_in_use(), 0);
/// ```
#[derive(Default)]
pub struct HeapAllocator {
    in_use: Arc<AtomicUsize>,
}

impl HeapAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of bytes currently handed out and not yet dropped.
    pub fn bytes_in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }
}

impl Allocator for HeapAllocator {
    fn alloc(&self, size: usize, alignment: usize, heap: Heap) -> Option<Memory> {
        let memory = Memory::zeroed(size, alignment, heap)?;
        self.in_use.fetch_add(size, Ordering::AcqRel);
        Some(memory.with_accounting(self.in_use.clone()))
    }
}
