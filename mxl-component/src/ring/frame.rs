// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Frame header record stored in a ring's header segment.
//!
//! Layout, little endian:
//!
//! | offset | size | field        |
//! |--------|------|--------------|
//! | 0      | 4    | version      |
//! | 4      | 4    | flags        |
//! | 8      | 8    | filled_len   |
//! | 16     | 8    | offset       |
//! | 24     | 8    | timestamp    |

use crate::{BufferFlags, BufferHeader, Error, Result};

/// Version written into every record.
pub const FRAME_META_VERSION: u32 = 1;

/// Size of one encoded record.
pub const FRAME_META_LEN: usize = 32;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameMeta {
    pub flags: BufferFlags,
    pub filled_len: usize,
    pub offset: usize,
    pub timestamp: i64,
}

impl FrameMeta {
    pub fn from_header(header: &BufferHeader) -> Self {
        Self {
            flags: header.flags,
            filled_len: header.filled_len,
            offset: header.offset,
            timestamp: header.timestamp,
        }
    }

    /// Copies the record onto a buffer header.
    pub fn apply(&self, header: &mut BufferHeader) {
        header.flags = self.flags;
        header.filled_len = self.filled_len;
        header.offset = self.offset;
        header.timestamp = self.timestamp;
    }

    /// Writes the record into `out`, which must hold at least [`FRAME_META_LEN`] bytes.
    pub fn encode(&self, out: &mut [u8]) -> Result<()> {
        let out = out.get_mut(..FRAME_META_LEN).ok_or_else(|| {
            Error::BadParameter(format!("Frame record needs {FRAME_META_LEN} bytes."))
        })?;
        out[0..4].copy_from_slice(&FRAME_META_VERSION.to_le_bytes());
        out[4..8].copy_from_slice(&self.flags.bits().to_le_bytes());
        out[8..16].copy_from_slice(&(self.filled_len as u64).to_le_bytes());
        out[16..24].copy_from_slice(&(self.offset as u64).to_le_bytes());
        out[24..32].copy_from_slice(&self.timestamp.to_le_bytes());
        Ok(())
    }

    /// Reads a record.
    ///
    /// # Errors
    ///
    /// - [`Error::BadParameter`] if `bytes` is shorter than [`FRAME_META_LEN`]
    /// - [`Error::VersionMismatch`] if the record was written by another layout version
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let bytes: &[u8; FRAME_META_LEN] = bytes
            .get(..FRAME_META_LEN)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| Error::BadParameter("Truncated frame record.".to_string()))?;
        let word = |range: std::ops::Range<usize>| -> [u8; 8] {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes[range]);
            buf
        };
        let version = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if version != FRAME_META_VERSION {
            return Err(Error::VersionMismatch {
                expected: FRAME_META_VERSION,
                found: version,
            });
        }
        let flags = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        Ok(Self {
            flags: BufferFlags::from_bits_retain(flags),
            filled_len: u64::from_le_bytes(word(8..16)) as usize,
            offset: u64::from_le_bytes(word(16..24)) as usize,
            timestamp: i64::from_le_bytes(word(24..32)),
        })
    }
}
