// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Domains: the shared context components are created in.
//!
//! A [`Domain`] owns the allocator used for port buffers and the registry of named
//! segments that ring-queue tunnels are built on. Components tunneled together must
//! come from the same domain.

use std::sync::Arc;

use tracing::info;

use crate::{
    Allocator, Component, EventHandler, HeapAllocator, Result,
    component::inner::ComponentCore,
    config::ComponentConfig,
    processing::ProcessingEngine,
    ring::SegmentRegistry,
};

/// Factory and shared resources for components.
///
/// Cloning is cheap; clones share the allocator and the segment registry.
#[derive(Clone)]
pub struct Domain {
    allocator: Arc<dyn Allocator>,
    segments: Arc<SegmentRegistry>,
}

impl Default for Domain {
    fn default() -> Self {
        Self::new()
    }
}

impl Domain {
    /// Creates a domain backed by a [`HeapAllocator`].
    pub fn new() -> Self {
        Self::with_allocator(Arc::new(HeapAllocator::new()))
    }

    pub fn with_allocator(allocator: Arc<dyn Allocator>) -> Self {
        Self {
            allocator,
            segments: Arc::new(SegmentRegistry::default()),
        }
    }

    pub fn allocator(&self) -> &Arc<dyn Allocator> {
        &self.allocator
    }

    /// Named segments currently alive in the domain.
    pub fn segments(&self) -> &Arc<SegmentRegistry> {
        &self.segments
    }

    /// Creates a component in `Loaded` state.
    ///
    /// In active mode this spawns the component's worker thread.
    ///
    /// # Errors
    ///
    /// - [`crate::Error::VersionMismatch`] or [`crate::Error::BadParameter`] if the
    ///   configuration does not validate
    /// - [`crate::Error::Other`] if the worker thread cannot be spawned
    pub fn create_component(
        &self,
        config: ComponentConfig,
        processing: Box<dyn ProcessingEngine>,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Component> {
        config.validate()?;
        info!(
            "Creating component {} ({:?}, {} ports).",
            config.name,
            config.mode,
            config.ports.len()
        );
        Component::start(ComponentCore::new(
            config,
            processing,
            handler,
            self.allocator.clone(),
            self.segments.clone(),
        ))
    }
}
