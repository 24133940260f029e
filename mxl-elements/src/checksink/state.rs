// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Settings and statistics of checksink.

use std::sync::{Arc, Mutex};

use mxl_component::{BufferFlags, ExchangeKind, ExecutionMode};
use serde::Serialize;

/// FNV-1a 64-bit offset basis.
pub const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;

const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Folds `bytes` into a running FNV-1a 64-bit hash.
pub fn fnv1a(hash: u64, bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .fold(hash, |hash, byte| (hash ^ u64::from(*byte)).wrapping_mul(FNV_PRIME))
}

/// User-configurable settings for checksink.
#[derive(Debug, Clone)]
pub struct Settings {
    pub name: String,
    pub mode: ExecutionMode,
    pub buffer_count: u32,
    pub buffer_size: usize,
    pub exchange: ExchangeKind,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            name: "checksink".to_owned(),
            mode: ExecutionMode::Passive,
            buffer_count: 4,
            buffer_size: 4096,
            exchange: ExchangeKind::StdTunnel,
        }
    }
}

/// What the sink has seen so far.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub frames: u64,
    pub bytes: u64,
    /// FNV-1a hash over every payload byte, in arrival order.
    pub checksum: u64,
    pub first_timestamp: Option<i64>,
    pub last_timestamp: Option<i64>,
    /// Frames whose timestamp went backwards.
    pub out_of_order: u64,
    pub attributes: u64,
    pub flushes: u64,
    pub eos: bool,
}

impl Default for Stats {
    fn default() -> Self {
        Stats {
            frames: 0,
            bytes: 0,
            checksum: FNV_OFFSET,
            first_timestamp: None,
            last_timestamp: None,
            out_of_order: 0,
            attributes: 0,
            flushes: 0,
            eos: false,
        }
    }
}

impl Stats {
    /// Accounts for one received frame.
    pub fn record(&mut self, payload: &[u8], timestamp: i64, flags: BufferFlags) {
        if self.last_timestamp.is_some_and(|last| timestamp < last) {
            self.out_of_order += 1;
        }
        self.first_timestamp.get_or_insert(timestamp);
        self.last_timestamp = Some(timestamp);
        self.frames += 1;
        self.bytes += payload.len() as u64;
        self.checksum = fnv1a(self.checksum, payload);
        if flags.contains(BufferFlags::EOS) {
            self.eos = true;
        }
    }
}

/// Shared view on the statistics of a running checksink.
#[derive(Debug, Clone, Default)]
pub struct StatsHandle(Arc<Mutex<Stats>>);

impl StatsHandle {
    pub fn snapshot(&self) -> Stats {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub(crate) fn update<R>(&self, f: impl FnOnce(&mut Stats) -> R) -> R {
        f(&mut self.0.lock().unwrap_or_else(|e| e.into_inner()))
    }
}
