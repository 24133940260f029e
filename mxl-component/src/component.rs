// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Components: a processing engine behind a uniform command and buffer interface.
//!
//! A [`Component`] is created by a [`crate::Domain`]. Commands are queued with
//! [`Component::send_command`] and complete asynchronously through the
//! [`crate::EventHandler`]. In [`ExecutionMode::Active`] a worker thread dispatches
//! commands and runs the data loop; in [`ExecutionMode::Passive`] the caller does so by
//! calling [`Component::process_pending`] and [`Component::process_data`].

mod commands;
mod data;
pub(crate) mod inner;
mod peer;
pub(crate) mod tunnel;

use std::{
    sync::{Arc, atomic::Ordering},
    thread::{self, JoinHandle},
    time::Duration,
};

use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::{
    BufferData, BufferHeader, Command, Error, Result, State,
    config::{ExecutionMode, PortDefinition},
    engine::SIGNAL_EXIT,
    exchange::{Attribute, BufferExchange},
    sync::lock,
};

use self::inner::ComponentCore;

/// How long an idle worker sleeps before polling its ports again.
const IDLE_POLL: Duration = Duration::from_millis(20);

fn run_worker(core: Arc<ComponentCore>) {
    debug!("Worker of {} started.", core.config.name);
    loop {
        let signals = core.engine.wait(IDLE_POLL);
        if signals & SIGNAL_EXIT != 0 || core.is_shutting_down() {
            break;
        }
        let _driver = lock(&core.driver);
        core.process_pending();
        core.process_data();
    }
    debug!("Worker of {} stopped.", core.config.name);
}

/// Handle to a component.
///
/// Dropping the handle stops the worker thread. Ports still open at that point are
/// not torn down; bring the component back to `Loaded` first.
pub struct Component {
    core: Arc<ComponentCore>,
    worker: Option<JoinHandle<()>>,
}

impl Component {
    pub(crate) fn start(core: ComponentCore) -> Result<Self> {
        let core = Arc::new(core);
        let worker = match core.config.mode {
            ExecutionMode::Passive => None,
            ExecutionMode::Active => {
                let worker_core = core.clone();
                let handle = thread::Builder::new()
                    .name(format!("mxl-{}", core.config.name))
                    .spawn(move || run_worker(worker_core))
                    .map_err(|e| Error::Other(format!("Failed to spawn worker thread: {e}")))?;
                Some(handle)
            }
        };
        Ok(Self { core, worker })
    }

    pub(crate) fn core(&self) -> &Arc<ComponentCore> {
        &self.core
    }

    /// Identity used as [`crate::Mark::target`] and in event callbacks.
    pub fn id(&self) -> Uuid {
        self.core.id
    }

    pub fn name(&self) -> &str {
        &self.core.config.name
    }

    pub fn mode(&self) -> ExecutionMode {
        self.core.config.mode
    }

    pub fn state(&self) -> State {
        self.core.state()
    }

    /// Target of the transition currently running, if any.
    pub fn pending_state(&self) -> Option<State> {
        self.core.engine.lifecycle.pending()
    }

    /// Queues a command; completion is reported through the event handler.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the component is `Invalid` and the command
    /// is not a transition to `Loaded`.
    pub fn send_command(&self, command: Command) -> Result<()> {
        self.core.engine.submit(command)
    }

    /// Whether commands are waiting to be dispatched.
    ///
    /// Data processing polls this before every cycle.
    pub fn is_command_pending(&self) -> bool {
        self.core.engine.is_command_pending()
    }

    fn require_passive(&self) -> Result<()> {
        match self.core.config.mode {
            ExecutionMode::Passive => Ok(()),
            ExecutionMode::Active => Err(Error::InvalidState),
        }
    }

    /// Dispatches every queued command on the calling thread.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] for active components, whose worker does this.
    pub fn process_pending(&self) -> Result<()> {
        self.require_passive()?;
        let _driver = lock(&self.core.driver);
        self.core.process_pending();
        Ok(())
    }

    /// Runs data cycles on the calling thread until no buffer moves or a command
    /// is queued. Returns the number of cycles that moved buffers.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] for active components.
    pub fn process_data(&self) -> Result<usize> {
        self.require_passive()?;
        let _driver = lock(&self.core.driver);
        Ok(self.core.process_data())
    }

    pub fn port_definition(&self, port: u32) -> Result<PortDefinition> {
        Ok(self.core.port(port)?.definition())
    }

    /// Replaces a port definition.
    ///
    /// Allowed while the component is `Loaded` or while the port is disabled; the
    /// latter reports [`crate::Event::PortSettingsChanged`].
    pub fn set_port_definition(&self, port: u32, definition: PortDefinition) -> Result<()> {
        self.core.set_definition(port, definition)
    }

    /// Registers a client-owned buffer on a non-tunneled port.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] outside `Loaded` unless the port is disabled or enabling
    /// - [`Error::BadParameter`] for tunneled ports, undersized buffers, or when the
    ///   port already holds its buffer count
    pub fn use_buffer(&self, port: u32, data: BufferData) -> Result<BufferHeader> {
        self.core.use_client_buffer(port, data)
    }

    /// Allocates a buffer of at least `size` bytes and registers it.
    ///
    /// # Errors
    ///
    /// Same as [`Self::use_buffer`], plus [`Error::InsufficientResources`] if the
    /// allocator fails.
    pub fn allocate_buffer(&self, port: u32, size: usize) -> Result<BufferHeader> {
        self.core.allocate_client_buffer(port, size)
    }

    /// Unregisters a client buffer.
    ///
    /// Freeing a buffer of an enabled port outside a teardown or disable also
    /// reports [`Error::PortUnpopulated`] through the event handler.
    pub fn free_buffer(&self, port: u32, header: BufferHeader) -> Result<()> {
        self.core.free_client_buffer(port, header)
    }

    /// Hands a filled buffer to an input port.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotReady`] if the port does not accept buffers in the
    /// current state.
    pub fn empty_this_buffer(&self, port: u32, header: BufferHeader) -> Result<()> {
        self.core.empty_buffer(port, header)
    }

    /// Hands an empty buffer to an output port.
    pub fn fill_this_buffer(&self, port: u32, header: BufferHeader) -> Result<()> {
        self.core.fill_buffer(port, header)
    }

    /// Queues out-of-band data ahead of the next buffers of an open input port.
    pub fn queue_attribute(&self, port: u32, attribute: Attribute) -> Result<()> {
        self.core.add_attribute(port, attribute)
    }

    /// The exchange of an open port.
    pub fn port_exchange(&self, port: u32) -> Result<Arc<dyn BufferExchange>> {
        self.core.port(port)?.require_exchange()
    }

    /// Whether an end-of-stream buffer went through the port since it was last
    /// flushed or stopped.
    pub fn is_eos(&self, port: u32) -> Result<bool> {
        Ok(self.core.port(port)?.eos())
    }
}

impl Drop for Component {
    fn drop(&mut self) {
        self.core.shutdown.store(true, Ordering::Release);
        self.core.engine.wake(SIGNAL_EXIT);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("Worker thread of {} panicked.", self.core.config.name);
            }
        }
        let state = self.core.state();
        if state != State::Loaded {
            warn!("Component {} dropped in state {:?}.", self.core.config.name, state);
        }
    }
}
