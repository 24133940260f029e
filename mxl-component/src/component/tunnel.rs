// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Tunnel setup between an output port and an input port.

use std::sync::{Arc, Weak};

use tracing::info;

use crate::{
    Component, Error, Result, State,
    config::{PortDefinition, SupplierPreference},
    exchange::{ExchangeKind, TunnelPeer},
    port::{Direction, Port, TunnelLink, TunnelRole},
};

use super::inner::ComponentCore;

fn check_port(core: &ComponentCore, port: &Port, direction: Direction) -> Result<()> {
    if port.direction != direction {
        return Err(Error::BadParameter(format!(
            "Port {} of {} is not an {:?} port.",
            port.index, core.config.name, direction
        )));
    }
    let (current, pending) = core.engine.lifecycle.snapshot();
    let loaded = current == State::Loaded && pending.is_none();
    if !loaded && port.is_enabled() {
        return Err(Error::InvalidState);
    }
    Ok(())
}

/// Decides which side allocates the shared buffers.
fn output_supplies(kind: ExchangeKind, output: &Port, input: &Port) -> bool {
    if kind == ExchangeKind::RingQueue {
        return true;
    }
    match (input.config.supplier, output.config.supplier) {
        (SupplierPreference::Supplier, _) => false,
        (SupplierPreference::NonSupplier, _) => true,
        (SupplierPreference::Unspecified, SupplierPreference::NonSupplier) => false,
        (SupplierPreference::Unspecified, _) => true,
    }
}

/// Definition both ports agree on: the larger count, size and alignment.
fn harmonise(output: &PortDefinition, input: &PortDefinition) -> Result<PortDefinition> {
    let format = match (output.format.as_str(), input.format.as_str()) {
        (a, b) if a == b => a.to_string(),
        ("", b) => b.to_string(),
        (a, "") => a.to_string(),
        (a, b) => {
            return Err(Error::BadParameter(format!(
                "Port formats {a:?} and {b:?} do not match."
            )));
        }
    };
    Ok(PortDefinition {
        buffer_count: output.buffer_count.max(input.buffer_count),
        buffer_size: output.buffer_size.max(input.buffer_size),
        alignment: output.alignment.max(input.alignment),
        format,
    })
}

fn link_to(
    core: &Arc<ComponentCore>,
    port: u32,
    role: TunnelRole,
    kind: ExchangeKind,
) -> TunnelLink {
    let peer: Arc<dyn TunnelPeer> = core.clone();
    let peer: Weak<dyn TunnelPeer> = Arc::downgrade(&peer);
    TunnelLink {
        peer,
        port,
        role,
        kind,
    }
}

/// Connects `output`'s port `out_port` to `input`'s port `in_port`.
///
/// Both ports must use the same exchange kind and both components must be `Loaded`,
/// unless the port is disabled. The supplier is the input port if it prefers to
/// supply, otherwise the output port; ring-queue tunnels are always supplied by
/// the output. Both ports end up with the larger buffer count and size.
///
/// # Errors
///
/// - [`Error::BadParameter`] for unknown ports, wrong directions, mismatched
///   exchange kinds or formats
/// - [`Error::InvalidState`] if a component is out of `Loaded` with the port enabled
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use mxl_component::{
///     BufferHeader, ComponentConfig, Direction, Domain, ExecutionMode, NullEventHandler,
///     PortConfig, ProcessArgs, ProcessStatus, ProcessingEngine, tunnel,
/// };
///
/// struct Idle;
/// impl ProcessingEngine for Idle {
///     fn process(
///         &mut self,
///         _: &mut [BufferHeader],
///         _: &mut [BufferHeader],
///         _: &mut ProcessArgs,
///     ) -> ProcessStatus {
///         ProcessStatus::Ok
///     }
/// }
///
/// # fn main() -> Result<(), mxl_component::Error> {
/// let domain = Domain::new();
/// let handler = Arc::new(NullEventHandler);
/// let source = domain.create_component(
///     ComponentConfig::new("source", ExecutionMode::Passive)
///         .with_port(PortConfig::new(1, Direction::Output, 4, 1024)),
///     Box::new(Idle),
///     handler.clone(),
/// )?;
/// let sink = domain.create_component(
///     ComponentConfig::new("sink", ExecutionMode::Passive)
///         .with_port(PortConfig::new(0, Direction::Input, 6, 512)),
///     Box::new(Idle),
///     handler,
/// )?;
/// tunnel(&source, 1, &sink, 0)?;
/// assert_eq!(sink.port_definition(0)?.buffer_count, 6);
/// assert_eq!(source.port_definition(1)?.buffer_size, 1024);
/// # Ok(())
/// # }
/// ```
pub fn tunnel(output: &Component, out_port: u32, input: &Component, in_port: u32) -> Result<()> {
    let (out_core, in_core) = (output.core(), input.core());
    let out = out_core.port(out_port)?;
    let inp = in_core.port(in_port)?;
    check_port(out_core, out, Direction::Output)?;
    check_port(in_core, inp, Direction::Input)?;

    let kind = out.config.tunnel_exchange;
    if kind != inp.config.tunnel_exchange {
        return Err(Error::BadParameter(format!(
            "Exchange kinds differ: {:?} on the output, {:?} on the input.",
            kind, inp.config.tunnel_exchange
        )));
    }
    if kind == ExchangeKind::Direct {
        return Err(Error::BadParameter(
            "Direct exchange cannot be tunneled.".to_string(),
        ));
    }

    let definition = harmonise(&out.definition(), &inp.definition())?;
    let (out_role, in_role) = if output_supplies(kind, out, inp) {
        (TunnelRole::Supplier, TunnelRole::NonSupplier)
    } else {
        (TunnelRole::NonSupplier, TunnelRole::Supplier)
    };
    out.set_definition(definition.clone());
    inp.set_definition(definition.clone());
    out.set_tunnel(Some(link_to(in_core, in_port, out_role, kind)));
    inp.set_tunnel(Some(link_to(out_core, out_port, in_role, kind)));
    info!(
        "Tunneled {}:{} -> {}:{} ({:?}, {} x {} bytes, output is {:?}).",
        out_core.config.name,
        out_port,
        in_core.config.name,
        in_port,
        kind,
        definition.buffer_count,
        definition.buffer_size,
        out_role
    );
    Ok(())
}
