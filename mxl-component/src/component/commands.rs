// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Command dispatch: lifecycle transitions and port commands.

use std::sync::{Arc, atomic::Ordering};

use tracing::{debug, error, info, warn};

use crate::{
    Command, Error, Event, Result, State,
    engine::command::PortSelector,
    exchange::{ExchangeControl, ExchangeKind, OpenParams},
    port::{Direction, Port, PortTransition},
    processing::EngineControl,
};

use super::inner::ComponentCore;

/// Keeps the first error while letting every step run.
fn keep_first(first: &mut Option<Error>, result: Result<()>) {
    if let Err(e) = result {
        first.get_or_insert(e);
    }
}

impl ComponentCore {
    /// Dispatches every queued command, oldest first.
    pub(crate) fn process_pending(&self) {
        while let Some(command) = self.engine.next() {
            debug!("Component {} dispatches {:?}", self.config.name, command);
            self.dispatch(command);
            self.engine.done();
        }
    }

    fn dispatch(&self, command: Command) {
        match command {
            Command::StateSet(target) => self.set_state(target),
            Command::Flush(selector) => {
                self.for_each_port(selector, Command::Flush, |port| self.flush_port(port))
            }
            Command::PortDisable(selector) => {
                self.for_each_port(selector, Command::PortDisable, |port| self.disable_port(port))
            }
            Command::PortEnable(selector) => {
                self.for_each_port(selector, Command::PortEnable, |port| self.enable_port(port))
            }
            Command::MarkBuffer(index, mark) => match self.port(index) {
                Ok(port) => {
                    port.set_pending_mark(mark);
                    self.emit(Event::CmdComplete(Command::MarkBuffer(index, mark)));
                }
                Err(e) => self.emit(Event::Error(e)),
            },
        }
    }

    /// Runs a port command on every selected port, completing once per port.
    fn for_each_port(
        &self,
        selector: PortSelector,
        command: fn(PortSelector) -> Command,
        run: impl Fn(&Arc<Port>) -> Result<()>,
    ) {
        if let PortSelector::Port(index) = selector {
            if let Err(e) = self.port(index) {
                self.emit(Event::Error(e));
                return;
            }
        }
        for port in self.ports.iter().filter(|port| selector.matches(port.index)) {
            match run(port) {
                Ok(()) => self.emit(Event::CmdComplete(command(PortSelector::Port(port.index)))),
                Err(e) => {
                    warn!(
                        "{:?} failed on port {} of {}: {}",
                        command(PortSelector::Port(port.index)),
                        port.index,
                        self.config.name,
                        e
                    );
                    self.emit(Event::Error(e));
                }
            }
        }
    }

    fn set_state(&self, target: State) {
        let current = self.state();
        if let Err(e) = current.check_transition(target) {
            warn!("{} rejected {:?} -> {:?}: {}", self.config.name, current, target, e);
            self.emit(Event::Error(e));
            return;
        }
        self.engine.lifecycle.begin(target);
        info!("{} transitions {:?} -> {:?}", self.config.name, current, target);

        let result = match (current, target) {
            (State::Loaded, State::Idle) => self.open_ports(),
            (State::Idle, State::Executing | State::Paused) => self.start_ports(),
            (State::Executing, State::Paused) | (State::Paused, State::Executing) => Ok(()),
            (State::Executing | State::Paused, State::Idle) => {
                // Leaving the data states completes even if a port failed to stop.
                let stopped = self.stop_ports();
                self.finish(target, stopped);
                return;
            }
            (State::Idle | State::Invalid, State::Loaded) => {
                self.unload(current == State::Invalid);
                return;
            }
            _ => Err(Error::IncorrectStateTransition {
                from: current,
                to: target,
            }),
        };
        match result {
            Ok(()) => self.finish(target, Ok(())),
            Err(e) => {
                error!("{} failed {:?} -> {:?}: {}", self.config.name, current, target, e);
                self.engine.lifecycle.abort();
                self.emit(Event::Error(e));
            }
        }
    }

    /// Completes a transition, reporting `outcome` before the completion event.
    fn finish(&self, target: State, outcome: Result<()>) {
        self.engine.lifecycle.complete(target);
        if let Err(e) = outcome {
            self.emit(Event::Error(e));
        }
        if target == State::Executing {
            self.wake_data();
        }
        self.emit(Event::CmdComplete(Command::StateSet(target)));
    }

    fn open_ports(&self) -> Result<()> {
        let mut opened: Vec<&Arc<Port>> = Vec::new();
        for port in self.ports.iter().filter(|port| port.is_enabled()) {
            if let Err(e) = self.open_port(port) {
                for port in opened.into_iter().rev() {
                    if let Err(close) = self.close_port(port) {
                        warn!("Closing port {} after a failed open: {}", port.index, close);
                    }
                }
                return Err(e);
            }
            opened.push(port);
        }
        Ok(())
    }

    fn open_port(&self, port: &Arc<Port>) -> Result<()> {
        let kind = port.tunnel().map_or(ExchangeKind::Direct, |link| link.kind);
        let exchange = kind.create(self.exchange_context(port))?;
        port.set_exchange(Some(exchange.clone()));
        let params = OpenParams {
            mode: port.direction.into(),
            cached: port.config.cached,
            buffer_size: port.definition().buffer_size,
        };
        if let Err(e) = exchange.open(params) {
            exchange.deinit();
            port.set_exchange(None);
            return Err(e);
        }
        debug!(
            "{} opened port {} ({:?}, {:?}).",
            self.config.name,
            port.index,
            kind,
            port.role()
        );
        Ok(())
    }

    /// Closes a port's exchange; the exchange stays reachable until `close` returns.
    fn close_port(&self, port: &Arc<Port>) -> Result<()> {
        let Some(exchange) = port.exchange() else {
            return Ok(());
        };
        let result = exchange.close();
        exchange.deinit();
        port.set_exchange(None);
        port.set_eos(false);
        result
    }

    fn start_ports(&self) -> Result<()> {
        for port in self.ports.iter().filter(|port| port.is_active()) {
            if let Some(exchange) = port.exchange() {
                exchange.control(ExchangeControl::Start)?;
            }
        }
        self.engine_control(EngineControl::Start)
    }

    /// Ports in stop order: inputs first, so upstream suppliers get their buffers back.
    fn ports_in_stop_order(&self) -> impl Iterator<Item = &Arc<Port>> {
        let inputs = self.ports.iter().filter(|p| p.direction == Direction::Input);
        let outputs = self.ports.iter().filter(|p| p.direction == Direction::Output);
        inputs.chain(outputs)
    }

    fn stop_ports(&self) -> Result<()> {
        self.release_retained(None);
        let mut first = None;
        for port in self.ports_in_stop_order() {
            if let Some(exchange) = port.exchange() {
                let stopped = exchange.control(ExchangeControl::Stop).map(|_| ());
                if let Err(e) = &stopped {
                    warn!("Port {} of {} did not stop cleanly: {}", port.index, self.config.name, e);
                }
                keep_first(&mut first, stopped);
            }
            port.set_eos(false);
        }
        keep_first(&mut first, self.engine_control(EngineControl::Stop));
        first.map_or(Ok(()), Err)
    }

    /// Runs the teardown towards `Loaded`.
    ///
    /// Every port is closed even if an earlier one failed. The component ends up
    /// `Loaded` unless buffers are still registered afterwards, in which case it
    /// goes `Invalid`.
    fn unload(&self, from_invalid: bool) {
        self.teardown.store(true, Ordering::Release);
        let mut first = None;
        if from_invalid {
            keep_first(&mut first, self.stop_ports());
        }
        self.release_retained(None);
        for port in self.ports_in_stop_order() {
            keep_first(&mut first, self.close_port(port));
        }
        if from_invalid {
            for port in &self.ports {
                let dropped = port.buffers.clear();
                if !dropped.is_empty() {
                    debug!("Dropped {} buffers of port {}.", dropped.len(), port.index);
                }
                port.update_population();
            }
        }
        self.teardown.store(false, Ordering::Release);

        let leftover: usize = self.ports.iter().map(|port| port.buffers.len()).sum();
        if leftover > 0 {
            error!(
                "{} still holds {} buffers after teardown, going Invalid.",
                self.config.name, leftover
            );
            self.engine.lifecycle.complete(State::Invalid);
            self.emit(Event::Error(
                first.unwrap_or(Error::Undefined(format!("{leftover} buffers were not released."))),
            ));
            return;
        }
        if let Some(e) = &first {
            error!("{} teardown reported: {}", self.config.name, e);
        }
        self.finish(State::Loaded, first.map_or(Ok(()), Err));
    }

    pub(super) fn flush_port(&self, port: &Arc<Port>) -> Result<()> {
        let Some(exchange) = port.exchange() else {
            return Ok(());
        };
        port.set_flushing(true);
        self.release_retained(Some(port.index));
        let flushed = exchange.control(ExchangeControl::Flush).map(|_| ());
        port.set_flushing(false);
        port.set_eos(false);
        debug!("{} flushed port {}.", self.config.name, port.index);
        flushed.and(self.engine_control(EngineControl::Flush(port.index)))
    }

    fn disable_port(&self, port: &Arc<Port>) -> Result<()> {
        if !port.is_enabled() {
            return Ok(());
        }
        if !self.state().has_open_ports() {
            port.set_enabled(false);
            return Ok(());
        }
        port.set_transition(PortTransition::Disabling);
        self.release_retained(Some(port.index));
        let mut first = None;
        if let Some(exchange) = port.exchange() {
            keep_first(&mut first, exchange.control(ExchangeControl::Flush).map(|_| ()));
        }
        keep_first(&mut first, self.close_port(port));
        port.set_enabled(false);
        info!("{} disabled port {}.", self.config.name, port.index);
        first.map_or(Ok(()), Err)
    }

    fn enable_port(&self, port: &Arc<Port>) -> Result<()> {
        if port.is_enabled() {
            return Ok(());
        }
        let state = self.state();
        if !state.has_open_ports() {
            port.set_enabled(true);
            return Ok(());
        }
        port.set_transition(PortTransition::Enabling);
        let opened = self.open_port(port).and_then(|_| {
            if matches!(state, State::Executing | State::Paused) {
                port.require_exchange()?.control(ExchangeControl::Start)?;
            }
            Ok(())
        });
        match opened {
            Ok(()) => {
                port.set_enabled(true);
                info!("{} enabled port {}.", self.config.name, port.index);
                self.wake_data();
                Ok(())
            }
            Err(e) => {
                port.set_transition(PortTransition::None);
                Err(e)
            }
        }
    }
}
