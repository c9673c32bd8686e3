/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! DGI broker – communication and scheduling substrate for a distributed
//! grid-control daemon.
//!
//! Module layout:
//!
//! ```text
//! lib.rs
//! ├── config/         – YAML broker configuration (node, peers, timings, modules)
//! ├── scheduler/      – phase scheduler, alarms, scheduling errors
//! ├── clock/          – corrected clock, regression, peer clock synchronizer
//! ├── wire/           – prost wire messages (protocol windows, clock exchange)
//! ├── protocol/       – per-peer delivery sessions (SRC reliable, SUC unreliable)
//! ├── transport/      – datagram sinks over UDP, link-loss emulation
//! ├── connection/     – peer connections, connection manager, peer list, listener
//! ├── dispatch        – recipient → handler routing for accepted payloads
//! └── node            – wiring of every service into one running broker
//! ```

pub mod clock;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod node;
pub mod protocol;
pub mod scheduler;
pub mod transport;
pub mod wire;

mod sync;
