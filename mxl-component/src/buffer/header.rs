// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Buffer headers, flags, marks and duplicate-reference counting.

use std::sync::{Arc, Mutex};

use bitflags::bitflags;
use uuid::Uuid;

use crate::{Error, Result, buffer::data::BufferData, sync::lock};

bitflags! {
    /// Per-buffer flags travelling with the payload.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BufferFlags: u32 {
        /// Last buffer of the stream.
        const EOS = 0x0000_0001;
        /// Timestamp marks the stream start time.
        const START_TIME = 0x0000_0002;
        /// Decode but do not render.
        const DECODE_ONLY = 0x0000_0004;
        /// Payload is known to be corrupt.
        const DATA_CORRUPT = 0x0000_0008;
        /// Buffer ends a frame.
        const END_OF_FRAME = 0x0000_0010;
        /// Buffer starts a sync (key) frame.
        const SYNC_FRAME = 0x0000_0020;
        /// Extra data follows the payload.
        const EXTRA_DATA = 0x0000_0040;
        /// Payload is codec configuration, not media.
        const CODEC_CONFIG = 0x0000_0080;
    }
}

/// Opaque `(target, data)` pair attached to a buffer by a mark-buffer command.
///
/// The mark rides along from input to output buffers until it reaches the
/// component whose id equals `target`, which then reports
/// [`crate::Event::MarkReached`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Mark {
    pub target: Uuid,
    pub data: u64,
}

/// Index of a canonical buffer slot in its port's buffer table.
///
/// Both ends of a tunnel use the same index for the same physical buffer, so a
/// header arriving from the peer resolves to the local canonical header by slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(pub(crate) u32);

impl SlotId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// Outcome of releasing one reference through [`DupCounter::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DupRelease {
    /// No copies remain; the canonical buffer goes back to the pipe.
    Return,
    /// Other copies are still in flight; the buffer stays checked out.
    Held,
}

/// Duplicate-reference counter living on output-direction canonical headers.
///
/// Zero means "no duplicates". The first duplicate takes the count to two (the
/// canonical reference plus the copy), each further duplicate adds one, and each
/// release removes one; the buffer returns when the count falls back to zero.
#[derive(Debug, Clone, Default)]
pub(crate) struct DupCounter(Arc<Mutex<u32>>);

impl DupCounter {
    pub(crate) fn acquire(&self) -> u32 {
        let mut count = lock(&self.0);
        *count = if *count == 0 { 2 } else { *count + 1 };
        *count
    }

    pub(crate) fn release(&self) -> DupRelease {
        let mut count = lock(&self.0);
        match *count {
            0 => DupRelease::Return,
            1 => {
                *count = 0;
                DupRelease::Return
            }
            _ => {
                *count -= 1;
                DupRelease::Held
            }
        }
    }

    pub(crate) fn count(&self) -> u32 {
        *lock(&self.0)
    }
}

/// Describes one buffer in flight.
///
/// Exactly one canonical header exists per physical buffer in each port's buffer
/// table. Headers handed to callers are copies; sending one copies its
/// descriptive fields back over the canonical header located through [`Self::slot`].
#[derive(Debug, Clone)]
pub struct BufferHeader {
    data: BufferData,
    /// Capacity of the payload in bytes.
    pub alloc_len: usize,
    /// Number of valid bytes starting at [`Self::offset`].
    pub filled_len: usize,
    /// Start of valid data inside the payload.
    pub offset: usize,
    /// Presentation timestamp in nanoseconds.
    pub timestamp: i64,
    pub flags: BufferFlags,
    pub mark: Option<Mark>,
    pub input_port_index: u32,
    pub output_port_index: u32,
    slot: SlotId,
    dup_refs: Option<DupCounter>,
    duplicate: bool,
}

impl BufferHeader {
    pub(crate) fn new(
        data: BufferData,
        slot: SlotId,
        input_port_index: u32,
        output_port_index: u32,
        output_side: bool,
    ) -> Self {
        Self {
            alloc_len: data.len(),
            data,
            filled_len: 0,
            offset: 0,
            timestamp: 0,
            flags: BufferFlags::empty(),
            mark: None,
            input_port_index,
            output_port_index,
            slot,
            dup_refs: output_side.then(DupCounter::default),
            duplicate: false,
        }
    }

    /// Payload storage shared by every copy of this buffer.
    pub fn data(&self) -> &BufferData {
        &self.data
    }

    /// Canonical slot this header resolves to.
    pub fn slot(&self) -> SlotId {
        self.slot
    }

    /// Returns `true` for transient copies produced by `dup`.
    pub fn is_duplicate(&self) -> bool {
        self.duplicate
    }

    /// Copies the valid region (`offset..offset + filled_len`) into a `Vec`.
    pub fn payload(&self) -> Vec<u8> {
        let (offset, filled) = (self.offset, self.filled_len);
        self.data.read(|bytes| {
            let end = (offset + filled).min(bytes.len());
            bytes[offset.min(end)..end].to_vec()
        })
    }

    /// Writes `bytes` at offset zero and updates the filled length.
    pub fn write_payload(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.alloc_len {
            return Err(Error::BadParameter(format!(
                "Payload of {} bytes exceeds buffer capacity {}.",
                bytes.len(),
                self.alloc_len
            )));
        }
        self.data.write(|dst| dst[..bytes.len()].copy_from_slice(bytes));
        self.offset = 0;
        self.filled_len = bytes.len();
        Ok(())
    }

    /// Resets the descriptive fields so the buffer can be refilled.
    pub fn clear(&mut self) {
        self.filled_len = 0;
        self.offset = 0;
        self.timestamp = 0;
        self.flags = BufferFlags::empty();
        self.mark = None;
    }

    /// Copies descriptive fields from a caller's header onto this canonical header.
    pub(crate) fn copy_fields_from(&mut self, other: &BufferHeader) {
        self.filled_len = other.filled_len;
        self.offset = other.offset;
        self.timestamp = other.timestamp;
        self.flags = other.flags;
        self.mark = other.mark;
    }

    pub(crate) fn dup_counter(&self) -> Option<&DupCounter> {
        self.dup_refs.as_ref()
    }

    pub(crate) fn duplicate_of(&self) -> Self {
        let mut copy = self.clone();
        copy.duplicate = true;
        copy
    }

    /// Gives up the header, keeping only its storage handle.
    pub(crate) fn into_data(self) -> BufferData {
        self.data
    }
}
