// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

use crate::{Mark, State};

/// Ports affected by a port command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortSelector {
    All,
    Port(u32),
}

impl PortSelector {
    pub fn matches(&self, index: u32) -> bool {
        match self {
            PortSelector::All => true,
            PortSelector::Port(port) => *port == index,
        }
    }
}

/// A command queued to a component.
///
/// Completion is reported asynchronously through [`crate::Event::CmdComplete`]; port
/// commands addressed to [`PortSelector::All`] complete once per affected port, each
/// carrying [`PortSelector::Port`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    StateSet(State),
    Flush(PortSelector),
    PortDisable(PortSelector),
    PortEnable(PortSelector),
    /// Attach a mark to the next buffer flowing through the port.
    MarkBuffer(u32, Mark),
}
