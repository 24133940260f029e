// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Shared state of a component.
//!
//! [`ComponentCore`] is what the worker thread, the client-facing [`crate::Component`]
//! handle and tunneled peers all point to. Peers only hold a `Weak` reference.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};

use uuid::Uuid;

use crate::{
    Allocator, BufferHeader, Error, Event, EventHandler, Result, State,
    config::ComponentConfig,
    engine::{CommandEngine, SIGNAL_DATA},
    exchange::{BufferExchange, ExchangeContext},
    port::{Port, PortTransition, TunnelRole},
    processing::{EngineControl, ProcessingEngine},
    ring::SegmentRegistry,
    sync::lock,
};

pub(crate) struct ComponentCore {
    pub(crate) id: Uuid,
    pub(crate) config: ComponentConfig,
    pub(crate) ports: Vec<Arc<Port>>,
    pub(crate) engine: CommandEngine,
    pub(super) processing: Mutex<Box<dyn ProcessingEngine>>,
    pub(super) client: Arc<dyn EventHandler>,
    pub(super) allocator: Arc<dyn Allocator>,
    pub(super) segments: Arc<SegmentRegistry>,
    /// Duplicates of sent outputs kept on behalf of the processing engine.
    pub(super) retained: Mutex<Vec<(u32, BufferHeader)>>,
    /// An `Idle`/`Invalid` to `Loaded` teardown is running.
    pub(super) teardown: AtomicBool,
    pub(super) shutdown: AtomicBool,
    /// Held by whoever drives commands and data.
    pub(super) driver: Mutex<()>,
}

impl ComponentCore {
    pub(crate) fn new(
        config: ComponentConfig,
        processing: Box<dyn ProcessingEngine>,
        client: Arc<dyn EventHandler>,
        allocator: Arc<dyn Allocator>,
        segments: Arc<SegmentRegistry>,
    ) -> Self {
        let mut ports: Vec<Arc<Port>> = config
            .ports
            .iter()
            .cloned()
            .map(|port| Arc::new(Port::new(port)))
            .collect();
        ports.sort_by_key(|port| port.index);
        Self {
            id: Uuid::new_v4(),
            config,
            ports,
            engine: CommandEngine::new(),
            processing: Mutex::new(processing),
            client,
            allocator,
            segments,
            retained: Mutex::new(Vec::new()),
            teardown: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            driver: Mutex::new(()),
        }
    }

    pub(crate) fn port(&self, index: u32) -> Result<&Arc<Port>> {
        self.ports
            .iter()
            .find(|port| port.index == index)
            .ok_or_else(|| {
                Error::BadParameter(format!(
                    "Component {} has no port {}.",
                    self.config.name, index
                ))
            })
    }

    pub(crate) fn state(&self) -> State {
        self.engine.lifecycle.current()
    }

    pub(super) fn emit(&self, event: Event) {
        self.client.notify(self.id, event);
    }

    pub(super) fn engine_control(&self, control: EngineControl) -> Result<()> {
        let status = lock(&self.processing).control(control);
        Error::from_process_status(status)
    }

    pub(super) fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(super) fn exchange_context(&self, port: &Arc<Port>) -> ExchangeContext {
        ExchangeContext {
            component: self.id,
            port: port.clone(),
            allocator: self.allocator.clone(),
            segments: self.segments.clone(),
            client: self.client.clone(),
            lifecycle: self.engine.lifecycle.clone(),
            signals: self.engine.signals.clone(),
            timeouts: self.config.timeouts.clone(),
        }
    }

    /// Returns the exchange of a port if it accepts buffers right now.
    ///
    /// Supplier ports always take their buffers back. Other ports accept once their
    /// component has reached a state where it handles data, and refuse with
    /// [`Error::NotReady`] while they are flushing or disabling.
    pub(super) fn accepting_exchange(&self, port: &Port) -> Result<Arc<dyn BufferExchange>> {
        let exchange = port.exchange().ok_or(Error::NotReady)?;
        let role = port.role();
        if role == TunnelRole::Supplier {
            return Ok(exchange);
        }
        if !port.is_active() || port.is_flushing() {
            return Err(Error::NotReady);
        }
        let (current, pending) = self.engine.lifecycle.snapshot();
        let ready = match role {
            TunnelRole::NotTunneled => current.has_open_ports() && pending != Some(State::Loaded),
            _ => {
                (matches!(current, State::Executing | State::Paused)
                    && pending != Some(State::Idle))
                    || (current == State::Idle
                        && matches!(pending, Some(State::Executing | State::Paused)))
            }
        };
        if ready { Ok(exchange) } else { Err(Error::NotReady) }
    }

    /// Buffers may be registered on `port` right now.
    pub(super) fn may_populate(&self, port: &Port) -> bool {
        self.state() == State::Loaded
            || !port.is_enabled()
            || port.transition() == PortTransition::Enabling
    }

    pub(super) fn wake_data(&self) {
        self.engine.wake(SIGNAL_DATA);
    }

    /// Releases the duplicates retained on `port` (every port for `None`).
    pub(super) fn release_retained(&self, port: Option<u32>) {
        let released: Vec<(u32, BufferHeader)> = {
            let mut retained = lock(&self.retained);
            let (released, kept) = retained
                .drain(..)
                .partition(|(index, _)| port.is_none_or(|p| p == *index));
            *retained = kept;
            released
        };
        for (index, duplicate) in released {
            let result = self
                .port(index)
                .and_then(|port| port.require_exchange())
                .and_then(|exchange| exchange.queue(duplicate));
            if let Err(e) = result {
                tracing::error!("Failed to release a retained buffer of port {}: {}", index, e);
            }
        }
    }
}
