// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Component configuration.
//!
//! A component is described by a JSON document deserialized into
//! [`ComponentConfig`]: its ports with their negotiated definitions, the execution
//! mode of its command engine and the deadlines of its blocking operations.
//!
//! # Examples
//!
//! ```
//! use mxl_component::config::{ComponentConfig, ExecutionMode};
//!
//! let json = r#"{
//!     "version": 1,
//!     "name": "decoder",
//!     "mode": "active",
//!     "ports": [
//!         { "index": 0, "direction": "input",
//!           "definition": { "buffer_count": 4, "buffer_size": 65536 } },
//!         { "index": 1, "direction": "output",
//!           "definition": { "buffer_count": 4, "buffer_size": 3110400, "alignment": 128 } }
//!     ]
//! }"#;
//!
//! let config = ComponentConfig::from_json(json).unwrap();
//! assert_eq!(config.mode, ExecutionMode::Active);
//! assert_eq!(config.ports[1].definition.alignment, 128);
//! ```

use std::{collections::HashSet, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{Error, Heap, Result, exchange::ExchangeKind, port::Direction};

/// Version of the configuration layout understood by this build.
pub const CONFIG_VERSION: u32 = 1;

/// Where a component's command dispatch and data processing run.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// A dedicated worker thread owns command dispatch and data processing.
    #[default]
    Active,
    /// The caller drives [`crate::Component::process_pending`] and
    /// [`crate::Component::process_data`] on its own thread.
    Passive,
}

/// Which end of a tunnel a port would like to allocate the buffers.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SupplierPreference {
    /// Let the tunnel negotiation decide.
    #[default]
    Unspecified,
    /// This port wants to supply the buffers.
    Supplier,
    /// This port wants the peer to supply the buffers.
    NonSupplier,
}

/// Negotiated buffer requirements of a port.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PortDefinition {
    /// Number of buffers the port needs to operate.
    pub buffer_count: u32,
    /// Size of each buffer in bytes.
    pub buffer_size: usize,
    /// Required alignment of each buffer (power of two).
    #[serde(default = "default_alignment")]
    pub alignment: usize,
    /// Free-form media format description (e.g. "video/v210").
    #[serde(default)]
    pub format: String,
}

fn default_alignment() -> usize {
    1
}

/// Static configuration of one port.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PortConfig {
    /// Port index, unique within the component.
    pub index: u32,
    pub direction: Direction,
    pub definition: PortDefinition,
    /// Heap the port's own allocations come from.
    #[serde(default)]
    pub heap: Heap,
    /// Whether the payload memory may be CPU cached.
    #[serde(default = "default_cached")]
    pub cached: bool,
    #[serde(default)]
    pub supplier: SupplierPreference,
    /// Buffer-exchange strategy used when the port gets tunneled.
    #[serde(default = "default_tunnel_exchange")]
    pub tunnel_exchange: ExchangeKind,
    /// Whether the port starts enabled.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_cached() -> bool {
    true
}

fn default_tunnel_exchange() -> ExchangeKind {
    ExchangeKind::StdTunnel
}

fn default_enabled() -> bool {
    true
}

impl PortConfig {
    /// Builds a port configuration with default settings.
    pub fn new(index: u32, direction: Direction, buffer_count: u32, buffer_size: usize) -> Self {
        Self {
            index,
            direction,
            definition: PortDefinition {
                buffer_count,
                buffer_size,
                alignment: default_alignment(),
                format: String::new(),
            },
            heap: Heap::default(),
            cached: default_cached(),
            supplier: SupplierPreference::default(),
            tunnel_exchange: default_tunnel_exchange(),
            enabled: default_enabled(),
        }
    }
}

/// Deadlines of the blocking operations, in milliseconds.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Timeouts {
    /// How long `open`/`close` wait for buffers to be populated or released.
    pub populate_ms: u64,
    /// Retry budget for handing a buffer to a peer that is not ready.
    pub send_retry_ms: u64,
    /// Sleep between two peer-readiness retries.
    pub retry_interval_ms: u64,
    /// How long flush/stop wait for the peer to return outstanding buffers.
    pub flush_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            populate_ms: 2000,
            send_retry_ms: 500,
            retry_interval_ms: 2,
            flush_ms: 2000,
        }
    }
}

impl Timeouts {
    pub fn populate(&self) -> Duration {
        Duration::from_millis(self.populate_ms)
    }

    pub fn send_retry(&self) -> Duration {
        Duration::from_millis(self.send_retry_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn flush(&self) -> Duration {
        Duration::from_millis(self.flush_ms)
    }
}

/// Complete description of a component instance.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ComponentConfig {
    /// Layout version, must equal [`CONFIG_VERSION`].
    pub version: u32,
    /// Human-readable component name used in logs.
    pub name: String,
    #[serde(default)]
    pub mode: ExecutionMode,
    pub ports: Vec<PortConfig>,
    #[serde(default)]
    pub timeouts: Timeouts,
}

impl ComponentConfig {
    /// Builds an empty configuration with the current layout version.
    pub fn new(name: impl Into<String>, mode: ExecutionMode) -> Self {
        Self {
            version: CONFIG_VERSION,
            name: name.into(),
            mode,
            ports: Vec::new(),
            timeouts: Timeouts::default(),
        }
    }

    /// Adds a port, builder style.
    pub fn with_port(mut self, port: PortConfig) -> Self {
        self.ports.push(port);
        self
    }

    /// Parses and validates a JSON configuration.
    ///
    /// # Errors
    ///
    /// - [`Error::BadParameter`] if the JSON is malformed or fails validation
    /// - [`Error::VersionMismatch`] if `version` differs from [`CONFIG_VERSION`]
    pub fn from_json(json: &str) -> Result<Self> {
        let config: ComponentConfig = serde_json::from_str(json)
            .map_err(|e| Error::BadParameter(format!("Invalid component config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Serializes the configuration back to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| Error::Other(format!("Failed to serialize component config: {e}")))
    }

    /// Checks the structural invariants of the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.version != CONFIG_VERSION {
            return Err(Error::VersionMismatch {
                expected: CONFIG_VERSION,
                found: self.version,
            });
        }
        let mut seen = HashSet::new();
        for port in &self.ports {
            if !seen.insert(port.index) {
                return Err(Error::BadParameter(format!(
                    "Port index {} is declared twice.",
                    port.index
                )));
            }
            port.definition.validate()?;
        }
        Ok(())
    }
}

impl PortDefinition {
    /// Rejects definitions no buffer pool can satisfy.
    pub fn validate(&self) -> Result<()> {
        if self.buffer_count == 0 || self.buffer_size == 0 {
            return Err(Error::BadParameter(
                "Buffer count and size must be non-zero.".to_string(),
            ));
        }
        if !self.alignment.is_power_of_two() {
            return Err(Error::BadParameter(format!(
                "Alignment {} is not a power of two.",
                self.alignment
            )));
        }
        Ok(())
    }

    /// Buffer size rounded up to the alignment, i.e. the stride inside a pool.
    pub fn aligned_size(&self) -> usize {
        self.buffer_size.next_multiple_of(self.alignment.max(1))
    }
}
