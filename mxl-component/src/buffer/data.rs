// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Payload storage shared between the headers that describe it.

use std::{
    fmt,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use crate::{allocator::Heap, sync::lock};

/// A block of payload memory obtained from an [`crate::Allocator`].
pub struct Memory {
    bytes: Vec<u8>,
    start: usize,
    len: usize,
    heap: Heap,
    accounting: Option<Arc<AtomicUsize>>,
}

impl Memory {
    /// Allocates `len` zeroed bytes aligned to `alignment`.
    ///
    /// Returns `None` if `alignment` is not a power of two or the allocation fails.
    pub fn zeroed(len: usize, alignment: usize, heap: Heap) -> Option<Self> {
        if !alignment.is_power_of_two() {
            return None;
        }
        let total = len.checked_add(alignment - 1)?;
        let mut bytes = Vec::new();
        bytes.try_reserve_exact(total).ok()?;
        bytes.resize(total, 0);
        let address = bytes.as_ptr() as usize;
        let start = address.next_multiple_of(alignment) - address;
        Some(Self {
            bytes,
            start,
            len,
            heap,
            accounting: None,
        })
    }

    /// Wraps client-provided bytes.
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        let len = bytes.len();
        Self {
            bytes,
            start: 0,
            len,
            heap: Heap::System,
            accounting: None,
        }
    }

    pub(crate) fn with_accounting(mut self, counter: Arc<AtomicUsize>) -> Self {
        self.accounting = Some(counter);
        self
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn heap(&self) -> Heap {
        self.heap
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[self.start..self.start + self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes[self.start..self.start + self.len]
    }
}

impl Drop for Memory {
    fn drop(&mut self) {
        if let Some(counter) = self.accounting.take() {
            counter.fetch_sub(self.len, Ordering::AcqRel);
        }
    }
}

impl fmt::Debug for Memory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memory")
            .field("len", &self.len)
            .field("heap", &self.heap)
            .finish()
    }
}

/// Handle to one buffer's payload window inside a (possibly shared) memory block.
///
/// Cloning the handle shares the storage: every header describing the same
/// physical buffer, canonical or duplicate, holds a clone.
#[derive(Clone)]
pub struct BufferData {
    memory: Arc<Mutex<Memory>>,
    base: usize,
    len: usize,
}

impl BufferData {
    /// Wraps client-provided bytes as a standalone buffer.
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self::from_memory(Memory::from_vec(bytes))
    }

    /// Uses a whole memory block as one buffer.
    pub fn from_memory(memory: Memory) -> Self {
        let len = memory.len();
        Self {
            memory: Arc::new(Mutex::new(memory)),
            base: 0,
            len,
        }
    }

    /// Splits one contiguous block into `count` windows of `len` bytes spaced by `stride`.
    ///
    /// Returns `None` if the block is too small.
    pub(crate) fn carve(
        memory: Memory,
        count: usize,
        stride: usize,
        len: usize,
    ) -> Option<(Arc<Mutex<Memory>>, Vec<BufferData>)> {
        if count == 0 || stride < len || memory.len() < stride * (count - 1) + len {
            return None;
        }
        let memory = Arc::new(Mutex::new(memory));
        let windows = (0..count)
            .map(|i| BufferData {
                memory: memory.clone(),
                base: i * stride,
                len,
            })
            .collect();
        Some((memory, windows))
    }

    /// Capacity of this buffer in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Runs `f` with read access to the buffer bytes.
    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let memory = lock(&self.memory);
        f(&memory.as_slice()[self.base..self.base + self.len])
    }

    /// Runs `f` with write access to the buffer bytes.
    pub fn write<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut memory = lock(&self.memory);
        f(&mut memory.as_mut_slice()[self.base..self.base + self.len])
    }

    /// Copies the whole buffer into a `Vec`.
    pub fn to_vec(&self) -> Vec<u8> {
        self.read(<[u8]>::to_vec)
    }

    /// Returns `true` if both handles describe the same bytes of the same block.
    pub fn same_storage(&self, other: &BufferData) -> bool {
        Arc::ptr_eq(&self.memory, &other.memory) && self.base == other.base
    }

    /// Unwraps the memory block if this is the last handle referring to it.
    pub(crate) fn into_memory(self) -> Option<Memory> {
        Arc::try_unwrap(self.memory)
            .ok()
            .map(|memory| memory.into_inner().unwrap_or_else(|e| e.into_inner()))
    }
}

impl fmt::Debug for BufferData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferData")
            .field("base", &self.base)
            .field("len", &self.len)
            .finish()
    }
}
