// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Buffers exchanged between ports.
//!
//! # Key Types
//!
//! - [`BufferHeader`]: fixed-format record describing one buffer in flight
//! - [`BufferData`]: payload storage shared by all headers of a physical buffer
//! - [`BufferFlags`]: end-of-stream, codec-config and friends
//! - [`Mark`]: opaque marker propagated until it reaches its target component

pub mod data;
pub mod header;

pub(crate) mod table;
