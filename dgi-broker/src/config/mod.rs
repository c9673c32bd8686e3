//! Broker configuration loading.
//!
//! The expected YAML structure is:
//! ```yaml
//! node:
//!   uuid: alpha
//!   listen: "0.0.0.0:1870"
//!   protocol: SRC          # SRC | SUC
//!   reliability: 100       # percent of outbound datagrams delivered
//! peers:
//!   beta: "127.0.0.1:1871"
//! timings:                 # milliseconds, every field optional
//!   csrc_resend_time: 10
//!   csrc_default_timeout: 2000
//!   csuc_resend_time: 10
//!   clock_query_interval: 10000
//!   alignment_duration: 250
//! modules:
//!   - name: gm
//!     phase: 400
//! ```

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::protocol::{ProtocolKind, ProtocolTimings};

// ── Private YAML deserialization types ────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BrokerConfigFile {
    node: NodeSection,
    #[serde(default)]
    peers: BTreeMap<String, SocketAddr>,
    #[serde(default)]
    timings: TimingsSection,
    #[serde(default)]
    modules: Vec<ModuleEntry>,
}

#[derive(Debug, Deserialize)]
struct NodeSection {
    uuid: String,
    listen: SocketAddr,
    #[serde(default)]
    protocol: ProtocolKind,
    #[serde(default = "default_reliability")]
    reliability: u8,
}

fn default_reliability() -> u8 {
    100
}

/// Every field in milliseconds; absent fields take the built-in defaults.
#[derive(Debug, Default, Deserialize)]
struct TimingsSection {
    csrc_resend_time: Option<u64>,
    csrc_default_timeout: Option<u64>,
    csuc_resend_time: Option<u64>,
    clock_query_interval: Option<u64>,
    alignment_duration: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ModuleEntry {
    name: String,
    /// Phase length in milliseconds.
    phase: u64,
}

// ── Public data structures ────────────────────────────────────────────────────

/// Protocol and service timings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    pub csrc_resend_time: Duration,
    pub csrc_default_timeout: Duration,
    pub csuc_resend_time: Duration,
    pub clock_query_interval: Duration,
    pub alignment_duration: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        let reliable = ProtocolTimings::default();
        Self {
            csrc_resend_time: reliable.resend_time,
            csrc_default_timeout: reliable.default_timeout,
            csuc_resend_time: Duration::from_millis(10),
            clock_query_interval: Duration::from_millis(10_000),
            alignment_duration: Duration::from_millis(250),
        }
    }
}

impl Timings {
    /// Timings handed to `SRC` sessions.
    pub fn reliable(&self) -> ProtocolTimings {
        ProtocolTimings {
            resend_time: self.csrc_resend_time,
            default_timeout: self.csrc_default_timeout,
        }
    }
}

/// One entry of the phase schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleConfig {
    pub name: String,
    pub phase: Duration,
}

/// Fully resolved configuration of one broker node.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub uuid: String,
    pub listen: SocketAddr,
    pub protocol: ProtocolKind,
    /// Percentage of outbound datagrams actually written (`0..=100`).
    pub reliability: u8,
    /// Every known node by uuid, possibly including this one.
    pub peers: BTreeMap<String, SocketAddr>,
    pub timings: Timings,
    pub modules: Vec<ModuleConfig>,
}

impl BrokerConfig {
    /// Minimal configuration with no peers and no modules.
    pub fn new(uuid: impl Into<String>, listen: SocketAddr) -> Self {
        Self {
            uuid: uuid.into(),
            listen,
            protocol: ProtocolKind::default(),
            reliability: 100,
            peers: BTreeMap::new(),
            timings: Timings::default(),
            modules: Vec::new(),
        }
    }

    /// Parses `path`.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, the YAML is invalid, or a
    /// value is out of range.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        info!("Loading broker configuration from: {}", path.display());

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot open configuration file: {}", path.display()))?;

        let file: BrokerConfigFile = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse YAML file: {}", path.display()))?;

        let config = Self::from_file(file)
            .with_context(|| format!("Invalid configuration in {}", path.display()))?;

        info!(
            uuid = %config.uuid,
            listen = %config.listen,
            protocol = %config.protocol,
            peers = config.peers.len(),
            modules = config.modules.len(),
            "configuration loaded"
        );
        for module in &config.modules {
            debug!("  Module: {} | phase: {}ms", module.name, module.phase.as_millis());
        }
        Ok(config)
    }

    fn from_file(file: BrokerConfigFile) -> Result<Self> {
        if file.node.uuid.trim().is_empty() {
            bail!("node.uuid must not be empty");
        }
        if file.node.reliability > 100 {
            bail!(
                "node.reliability must be within 0..=100, got {}",
                file.node.reliability
            );
        }

        let defaults = Timings::default();
        let ms = |key: &str, value: Option<u64>, default: Duration| -> Result<Duration> {
            match value {
                Some(0) => bail!("timings.{key} must be greater than zero"),
                Some(v) => Ok(Duration::from_millis(v)),
                None => Ok(default),
            }
        };
        let t = &file.timings;
        let timings = Timings {
            csrc_resend_time: ms("csrc_resend_time", t.csrc_resend_time, defaults.csrc_resend_time)?,
            csrc_default_timeout: ms(
                "csrc_default_timeout",
                t.csrc_default_timeout,
                defaults.csrc_default_timeout,
            )?,
            csuc_resend_time: ms("csuc_resend_time", t.csuc_resend_time, defaults.csuc_resend_time)?,
            clock_query_interval: ms(
                "clock_query_interval",
                t.clock_query_interval,
                defaults.clock_query_interval,
            )?,
            alignment_duration: ms(
                "alignment_duration",
                t.alignment_duration,
                defaults.alignment_duration,
            )?,
        };

        let mut modules: Vec<ModuleConfig> = Vec::with_capacity(file.modules.len());
        for entry in file.modules {
            if entry.phase == 0 {
                bail!("module '{}' has a zero-length phase", entry.name);
            }
            if modules.iter().any(|m| m.name == entry.name) {
                warn!("Module '{}' listed twice, keeping the first entry", entry.name);
                continue;
            }
            modules.push(ModuleConfig {
                name: entry.name,
                phase: Duration::from_millis(entry.phase),
            });
        }
        if modules.is_empty() {
            warn!("No modules configured, the phase scheduler will stay idle");
        }

        Ok(Self {
            uuid: file.node.uuid,
            listen: file.node.listen,
            protocol: file.node.protocol,
            reliability: file.node.reliability,
            peers: file.peers,
            timings,
            modules,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
