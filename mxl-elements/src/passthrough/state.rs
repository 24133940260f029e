// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Settings and runtime state of passthrough.

use mxl_component::{Attribute, ExchangeKind, ExecutionMode};

/// User-configurable settings for passthrough.
#[derive(Debug, Clone)]
pub struct Settings {
    pub name: String,
    pub mode: ExecutionMode,
    /// Buffer count and size of both ports.
    pub buffer_count: u32,
    pub buffer_size: usize,
    /// Number of sent frames held as references; `0` disables retaining.
    pub retain_depth: usize,
    pub exchange: ExchangeKind,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            name: "passthrough".to_owned(),
            mode: ExecutionMode::Passive,
            buffer_count: 4,
            buffer_size: 4096,
            retain_depth: 0,
            exchange: ExchangeKind::StdTunnel,
        }
    }
}

/// Runtime state of passthrough.
#[derive(Debug, Default)]
pub struct State {
    pub frames: u64,
    pub bytes: u64,
    /// Frames currently retained by the component on our behalf.
    pub held: usize,
    /// Attributes received on the input, forwarded with the next frame.
    pub pending_attributes: Vec<Attribute>,
}
