// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Per-port arena of canonical buffer headers, indexed by [`SlotId`].

use std::sync::Mutex;

use crate::{
    Error, Result,
    buffer::header::{BufferHeader, SlotId},
    sync::lock,
};

#[derive(Default)]
pub(crate) struct BufferTable {
    slots: Mutex<Vec<Option<BufferHeader>>>,
}

impl BufferTable {
    /// Builds a header for the first free slot, stores it and returns a copy.
    pub(crate) fn push(&self, make: impl FnOnce(SlotId) -> BufferHeader) -> BufferHeader {
        let mut slots = lock(&self.slots);
        let index = slots
            .iter()
            .position(Option::is_none)
            .unwrap_or(slots.len());
        let header = make(SlotId(index as u32));
        if index == slots.len() {
            slots.push(Some(header.clone()));
        } else {
            slots[index] = Some(header.clone());
        }
        header
    }

    /// Stores `header` at a slot chosen by the tunnel supplier.
    pub(crate) fn insert(&self, header: BufferHeader) -> Result<()> {
        let mut slots = lock(&self.slots);
        let index = header.slot().index();
        if slots.len() <= index {
            slots.resize(index + 1, None);
        }
        if slots[index].is_some() {
            return Err(Error::BadParameter(format!("Buffer slot {index} already in use.")));
        }
        slots[index] = Some(header);
        Ok(())
    }

    /// Returns a copy of the canonical header.
    pub(crate) fn get(&self, slot: SlotId) -> Result<BufferHeader> {
        lock(&self.slots)
            .get(slot.index())
            .and_then(Option::clone)
            .ok_or_else(|| Error::BadParameter(format!("Unknown buffer slot {}.", slot.index())))
    }

    /// Copies the descriptive fields of `from` onto the canonical header and returns it.
    pub(crate) fn commit(&self, from: &BufferHeader) -> Result<BufferHeader> {
        let mut slots = lock(&self.slots);
        let canonical = slots
            .get_mut(from.slot().index())
            .and_then(Option::as_mut)
            .ok_or_else(|| {
                Error::BadParameter(format!("Unknown buffer slot {}.", from.slot().index()))
            })?;
        if !from.is_duplicate() {
            canonical.copy_fields_from(from);
        }
        Ok(canonical.clone())
    }

    pub(crate) fn remove(&self, slot: SlotId) -> Option<BufferHeader> {
        let mut slots = lock(&self.slots);
        let removed = slots.get_mut(slot.index()).and_then(Option::take);
        while matches!(slots.last(), Some(None)) {
            slots.pop();
        }
        removed
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.slots).iter().filter(|s| s.is_some()).count()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn slots(&self) -> Vec<SlotId> {
        lock(&self.slots)
            .iter()
            .flatten()
            .map(BufferHeader::slot)
            .collect()
    }

    pub(crate) fn clear(&self) -> Vec<BufferHeader> {
        lock(&self.slots).drain(..).flatten().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::data::BufferData;

    fn header(slot: SlotId) -> BufferHeader {
        BufferHeader::new(BufferData::from_vec(vec![0; 8]), slot, 0, 1, true)
    }

    #[test]
    fn commit_updates_canonical_but_not_from_duplicates() {
        let table = BufferTable::default();
        let canonical = table.push(header);
        let mut local = canonical.clone();
        local.filled_len = 5;
        assert_eq!(table.commit(&local).unwrap().filled_len, 5);

        let mut dup = local.duplicate_of();
        dup.filled_len = 1;
        assert_eq!(table.commit(&dup).unwrap().filled_len, 5);
    }

    #[test]
    fn removed_slots_are_reused() {
        let table = BufferTable::default();
        let a = table.push(header);
        let b = table.push(header);
        assert_eq!((a.slot().index(), b.slot().index()), (0, 1));
        table.remove(a.slot());
        assert_eq!(table.push(header).slot().index(), 0);
        assert_eq!(table.len(), 2);
        assert!(table.insert(header(SlotId(1))).is_err());
    }
}
