// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! The data-processing loop.
//!
//! One cycle takes a buffer from every active port, hands them to the processing
//! engine and disposes of them as it asked. The loop yields as soon as a command is
//! queued, so commands never wait behind a busy data path.

use std::{sync::Arc, time::Duration};

use tracing::{error, trace, warn};

use crate::{
    BufferFlags, BufferHeader, Error, Event, Result, State,
    exchange::{BufferExchange, ExchangeControl},
    port::{Direction, Port},
    processing::{EngineControl, OutputAction, ProcessArgs},
    sync::lock,
};

use super::inner::ComponentCore;

/// A dequeued buffer and where it came from.
struct Taken {
    port: Arc<Port>,
    exchange: Arc<dyn BufferExchange>,
}

impl ComponentCore {
    /// Runs data cycles until no progress is made or a command is queued.
    ///
    /// Returns the number of cycles that moved buffers.
    pub(crate) fn process_data(&self) -> usize {
        let mut cycles = 0;
        while !self.engine.is_command_pending() && !self.is_shutting_down() {
            if self.engine.lifecycle.snapshot() != (State::Executing, None) {
                break;
            }
            match self.run_cycle() {
                Ok(true) => cycles += 1,
                Ok(false) => break,
                Err(e) => {
                    self.fail(e);
                    break;
                }
            }
        }
        if cycles > 0 {
            trace!("{} ran {} data cycles.", self.config.name, cycles);
        }
        cycles
    }

    /// Moves the component to `Invalid` after a data-path failure.
    fn fail(&self, e: Error) {
        error!("{} data path failed, going Invalid: {}", self.config.name, e);
        self.engine.lifecycle.complete(State::Invalid);
        self.emit(Event::Error(e));
    }

    fn active_ports(&self, direction: Direction) -> Vec<(Arc<Port>, Arc<dyn BufferExchange>)> {
        self.ports
            .iter()
            .filter(|port| port.direction == direction && port.is_active())
            .filter_map(|port| port.exchange().map(|exchange| (port.clone(), exchange)))
            .collect()
    }

    /// Dequeues the next buffer of a port, feeding pending attributes to the engine.
    fn take_buffer(
        &self,
        port: &Port,
        exchange: &dyn BufferExchange,
    ) -> Result<Option<BufferHeader>> {
        loop {
            match exchange.dequeue(Duration::ZERO) {
                Err(Error::AttributePending) => {
                    let Some(attribute) = exchange.control(ExchangeControl::GetAttribute)? else {
                        return Ok(None);
                    };
                    trace!("Port {} delivers attribute {}.", port.index, attribute.id);
                    self.engine_control(EngineControl::Attribute {
                        port: port.index,
                        attribute,
                    })?;
                }
                other => return other,
            }
        }
    }

    fn cancel_all(&self, taken: Vec<(Taken, BufferHeader)>) {
        for (source, header) in taken.into_iter().rev() {
            if let Err(e) = source.exchange.cancel(header) {
                error!("Failed to put back a buffer of port {}: {}", source.port.index, e);
            }
        }
    }

    /// Gathers one buffer per port; puts everything back if a port has none.
    fn gather(
        &self,
        ports: Vec<(Arc<Port>, Arc<dyn BufferExchange>)>,
        gathered: &mut Vec<(Taken, BufferHeader)>,
    ) -> Result<bool> {
        for (port, exchange) in ports {
            match self.take_buffer(&port, exchange.as_ref())? {
                Some(mut header) => {
                    // Outputs pick up the pending mark when they are sent.
                    if port.direction == Direction::Input && header.mark.is_none() {
                        header.mark = port.take_pending_mark();
                    }
                    gathered.push((Taken { port, exchange }, header));
                }
                None => return Ok(false),
            }
        }
        Ok(true)
    }

    /// Runs one cycle; returns `false` when it moved nothing.
    fn run_cycle(&self) -> Result<bool> {
        let input_ports = self.active_ports(Direction::Input);
        let output_ports = self.active_ports(Direction::Output);
        if input_ports.is_empty() && output_ports.is_empty() {
            return Ok(false);
        }

        let mut inputs = Vec::with_capacity(input_ports.len());
        let mut outputs = Vec::with_capacity(output_ports.len());
        let complete = match self.gather(input_ports, &mut inputs) {
            Ok(true) => self.gather(output_ports, &mut outputs),
            other => other,
        };
        match complete {
            Ok(true) => {}
            Ok(false) => {
                self.cancel_all(outputs);
                self.cancel_all(inputs);
                return Ok(false);
            }
            Err(e) => {
                self.cancel_all(outputs);
                self.cancel_all(inputs);
                return Err(e);
            }
        }

        let (in_sources, mut in_headers): (Vec<Taken>, Vec<BufferHeader>) =
            inputs.into_iter().unzip();
        let (out_sources, mut out_headers): (Vec<Taken>, Vec<BufferHeader>) =
            outputs.into_iter().unzip();
        let mut args = ProcessArgs::new(
            in_sources.iter().map(|t| t.port.index).collect(),
            out_sources.iter().map(|t| t.port.index).collect(),
        );

        let status = lock(&self.processing).process(&mut in_headers, &mut out_headers, &mut args);
        if let Err(e) = Error::from_process_status(status) {
            self.cancel_all(out_sources.into_iter().zip(out_headers).collect());
            self.cancel_all(in_sources.into_iter().zip(in_headers).collect());
            return Err(e);
        }

        self.route_marks(&mut in_headers, &mut out_headers, &args);
        let mut progress = !args.attributes.is_empty();
        let sink = out_sources.is_empty();

        let consumed = args.inputs_consumed.iter().copied().chain(std::iter::repeat(true));
        let actions = args.outputs.iter().copied().chain(std::iter::repeat(OutputAction::Send));
        let mut inputs = in_sources.into_iter().zip(in_headers).zip(consumed);
        let mut outputs = out_sources.into_iter().zip(out_headers).zip(actions);
        let mut failure = None;
        for ((source, header), consumed) in inputs.by_ref() {
            match self.dispose_input(&source, header, consumed, sink) {
                Ok(moved) => progress |= moved,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        if failure.is_none() {
            for ((source, header), action) in outputs.by_ref() {
                match self.dispose_output(&source, header, action) {
                    Ok(moved) => progress |= moved,
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
        }
        if let Some(e) = failure {
            self.cancel_all(outputs.map(|(taken, _)| taken).collect());
            self.cancel_all(inputs.map(|(taken, _)| taken).collect());
            return Err(e);
        }

        for (index, attribute) in args.attributes {
            let forwarded = self
                .port(index)
                .and_then(|port| port.require_exchange())
                .and_then(|exchange| exchange.control(ExchangeControl::SetAttribute(attribute)));
            if let Err(e) = forwarded {
                warn!("Attribute for port {} was not forwarded: {}", index, e);
            }
        }
        if args.release_retained {
            self.release_retained(None);
        }
        Ok(progress)
    }

    /// Returns an input to its exchange; `true` when it was consumed.
    fn dispose_input(
        &self,
        source: &Taken,
        header: BufferHeader,
        consumed: bool,
        sink: bool,
    ) -> Result<bool> {
        if !consumed {
            source.exchange.cancel(header)?;
            return Ok(false);
        }
        if header.flags.contains(BufferFlags::EOS) {
            source.port.set_eos(true);
            if sink {
                self.emit(Event::BufferFlag {
                    port: source.port.index,
                    flags: header.flags,
                });
            }
        }
        source.exchange.send(header)?;
        Ok(true)
    }

    /// Sends or reuses an output; `true` when it was sent.
    fn dispose_output(
        &self,
        source: &Taken,
        mut header: BufferHeader,
        action: OutputAction,
    ) -> Result<bool> {
        if action == OutputAction::Reuse {
            source.exchange.cancel(header)?;
            return Ok(false);
        }
        let eos = header.flags.contains(BufferFlags::EOS);
        let flags = header.flags;
        if action == OutputAction::SendAndRetain {
            let duplicate = source.exchange.dup(&header)?;
            lock(&self.retained).push((source.port.index, duplicate));
        }
        if header.mark.is_none() {
            header.mark = source.port.take_pending_mark();
        }
        source.exchange.send(header)?;
        if eos {
            source.port.set_eos(true);
            self.emit(Event::BufferFlag {
                port: source.port.index,
                flags,
            });
        }
        Ok(true)
    }

    /// Reports marks that reached this component and carries the others to outputs.
    fn route_marks(
        &self,
        inputs: &mut [BufferHeader],
        outputs: &mut [BufferHeader],
        args: &ProcessArgs,
    ) {
        for (i, input) in inputs.iter_mut().enumerate() {
            if !args.inputs_consumed.get(i).copied().unwrap_or(true) {
                continue;
            }
            let Some(mark) = input.mark.take() else {
                continue;
            };
            if mark.target == self.id {
                let port = args.input_ports.get(i).copied().unwrap_or_default();
                self.emit(Event::MarkReached { port, mark });
                continue;
            }
            let carrier = outputs.iter_mut().enumerate().find(|(j, output)| {
                output.mark.is_none()
                    && args.outputs.get(*j).copied().unwrap_or_default() != OutputAction::Reuse
            });
            match carrier {
                Some((_, output)) => output.mark = Some(mark),
                None => trace!("Mark {:?} stops at {}.", mark, self.config.name),
            }
        }
    }
}
