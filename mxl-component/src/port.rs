// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Ports: the directional endpoints of a component.
//!
//! A port owns its negotiated definition, its tunnel link, its table of canonical
//! buffer headers and the buffer-exchange strategy that is active while the
//! component is out of `Loaded`.

use std::sync::{
    Arc, Mutex, Weak,
    atomic::{AtomicBool, Ordering},
};

use serde::{Deserialize, Serialize};

use crate::{
    Error, Mark, Result,
    buffer::table::BufferTable,
    config::{PortConfig, PortDefinition},
    exchange::{BufferExchange, ExchangeKind, TunnelPeer},
    sync::{EventFlags, lock},
};

/// Direction of a port relative to its component.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Input,
    Output,
}

/// Role of a port in a tunnel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TunnelRole {
    /// Buffers come from and go back to the client.
    #[default]
    NotTunneled,
    /// The port allocates the buffers shared with its peer.
    Supplier,
    /// The port uses buffers allocated by its peer.
    NonSupplier,
}

/// Enable/disable transition in progress on a port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PortTransition {
    #[default]
    None,
    Enabling,
    Disabling,
}

/// Link from a port to the port it is tunneled with.
#[derive(Clone)]
pub(crate) struct TunnelLink {
    pub(crate) peer: Weak<dyn TunnelPeer>,
    pub(crate) port: u32,
    pub(crate) role: TunnelRole,
    pub(crate) kind: ExchangeKind,
}

impl TunnelLink {
    pub(crate) fn peer(&self) -> Result<Arc<dyn TunnelPeer>> {
        self.peer.upgrade().ok_or(Error::PeerUnresponsive)
    }
}

/// Every buffer of the port is registered in its table.
pub(crate) const PORT_POPULATED: u32 = 1 << 0;
/// The last buffer of the port left its table.
pub(crate) const PORT_UNPOPULATED: u32 = 1 << 1;
/// A ring-queue supplier published the queue name to this port.
pub(crate) const PORT_RING_HANDOFF: u32 = 1 << 2;
/// Something a blocked `dequeue` may be waiting for happened.
pub(crate) const PORT_DOORBELL: u32 = 1 << 3;

struct PortSettings {
    definition: PortDefinition,
    enabled: bool,
    transition: PortTransition,
    tunnel: Option<TunnelLink>,
    eos: bool,
    pending_mark: Option<Mark>,
    ring_name: Option<String>,
}

pub(crate) struct Port {
    pub(crate) index: u32,
    pub(crate) direction: Direction,
    pub(crate) config: PortConfig,
    pub(crate) buffers: BufferTable,
    pub(crate) events: EventFlags,
    settings: Mutex<PortSettings>,
    flushing: AtomicBool,
    exchange: Mutex<Option<Arc<dyn BufferExchange>>>,
}

impl Port {
    pub(crate) fn new(config: PortConfig) -> Self {
        let settings = PortSettings {
            definition: config.definition.clone(),
            enabled: config.enabled,
            transition: PortTransition::None,
            tunnel: None,
            eos: false,
            pending_mark: None,
            ring_name: None,
        };
        let port = Self {
            index: config.index,
            direction: config.direction,
            config,
            buffers: BufferTable::default(),
            events: EventFlags::new(),
            settings: Mutex::new(settings),
            flushing: AtomicBool::new(false),
            exchange: Mutex::new(None),
        };
        port.events.set(PORT_UNPOPULATED);
        port
    }

    pub(crate) fn definition(&self) -> PortDefinition {
        lock(&self.settings).definition.clone()
    }

    pub(crate) fn set_definition(&self, definition: PortDefinition) {
        lock(&self.settings).definition = definition;
    }

    pub(crate) fn is_enabled(&self) -> bool {
        lock(&self.settings).enabled
    }

    pub(crate) fn transition(&self) -> PortTransition {
        lock(&self.settings).transition
    }

    pub(crate) fn set_transition(&self, transition: PortTransition) {
        lock(&self.settings).transition = transition;
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        let mut settings = lock(&self.settings);
        settings.enabled = enabled;
        settings.transition = PortTransition::None;
    }

    /// Enabled and not on its way out: the port takes part in data processing.
    pub(crate) fn is_active(&self) -> bool {
        let settings = lock(&self.settings);
        (settings.enabled && settings.transition != PortTransition::Disabling)
            || settings.transition == PortTransition::Enabling
    }

    pub(crate) fn tunnel(&self) -> Option<TunnelLink> {
        lock(&self.settings).tunnel.clone()
    }

    pub(crate) fn set_tunnel(&self, tunnel: Option<TunnelLink>) {
        lock(&self.settings).tunnel = tunnel;
    }

    pub(crate) fn role(&self) -> TunnelRole {
        lock(&self.settings)
            .tunnel
            .as_ref()
            .map_or(TunnelRole::NotTunneled, |t| t.role)
    }

    pub(crate) fn is_flushing(&self) -> bool {
        self.flushing.load(Ordering::Acquire)
    }

    pub(crate) fn set_flushing(&self, flushing: bool) {
        self.flushing.store(flushing, Ordering::Release);
    }

    pub(crate) fn eos(&self) -> bool {
        lock(&self.settings).eos
    }

    pub(crate) fn set_eos(&self, eos: bool) {
        lock(&self.settings).eos = eos;
    }

    pub(crate) fn set_pending_mark(&self, mark: Mark) {
        lock(&self.settings).pending_mark = Some(mark);
    }

    pub(crate) fn take_pending_mark(&self) -> Option<Mark> {
        lock(&self.settings).pending_mark.take()
    }

    pub(crate) fn publish_ring(&self, name: String) {
        lock(&self.settings).ring_name = Some(name);
        self.events.set(PORT_RING_HANDOFF);
    }

    pub(crate) fn take_ring_name(&self) -> Option<String> {
        self.events.clear(PORT_RING_HANDOFF);
        lock(&self.settings).ring_name.take()
    }

    pub(crate) fn exchange(&self) -> Option<Arc<dyn BufferExchange>> {
        lock(&self.exchange).clone()
    }

    pub(crate) fn require_exchange(&self) -> Result<Arc<dyn BufferExchange>> {
        self.exchange().ok_or(Error::InvalidState)
    }

    pub(crate) fn set_exchange(
        &self,
        exchange: Option<Arc<dyn BufferExchange>>,
    ) -> Option<Arc<dyn BufferExchange>> {
        std::mem::replace(&mut *lock(&self.exchange), exchange)
    }

    /// Raises the populated/unpopulated flags according to the buffer table.
    pub(crate) fn update_population(&self) {
        let registered = self.buffers.len();
        if registered >= self.definition().buffer_count as usize {
            self.events.clear(PORT_UNPOPULATED);
            self.events.set(PORT_POPULATED);
        } else {
            self.events.clear(PORT_POPULATED);
        }
        if registered == 0 {
            self.events.set(PORT_UNPOPULATED);
        }
    }

    pub(crate) fn is_populated(&self) -> bool {
        self.events.is_set(PORT_POPULATED)
    }
}
