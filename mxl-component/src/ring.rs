// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Lock-free frame ring used by the ring-queue exchange.
//!
//! # Key Types
//!
//! - [`FrameQueue`]: fixed-capacity ring of frame slots living in two named segments
//! - [`SegmentRegistry`]: create/open/delete named memory segments and queues
//! - [`FrameMeta`]: 32-byte record stored in the header segment for each frame

pub mod frame;
pub mod queue;
pub mod segment;

pub use frame::{FRAME_META_LEN, FRAME_META_VERSION, FrameMeta};
pub use queue::{Frame, FrameQueue, Notifier};
pub use segment::{Segment, SegmentRegistry};
