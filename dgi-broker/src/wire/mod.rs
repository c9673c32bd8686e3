/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Wire messages exchanged between brokers.
//!
//! The types are protobuf messages derived directly with `prost`, laid out
//! the way prost-build would emit them for:
//!
//! ```text
//! message ModuleMessage   { string recipient_module = 1; bytes payload = 2; }
//! message ProtocolFrame   { FrameStatus status = 1; uint32 sequence_num = 2;
//!                           optional uint64 hash = 3; optional string expire_time = 4;
//!                           optional uint32 kill = 5; ModuleMessage module_message = 6; }
//! message ProtocolWindow  { string source_uuid = 1; string protocol = 2;
//!                           repeated ProtocolFrame frames = 3; }
//! message ClockSynchronizerMessage { oneof body { ExchangeMessage exchange = 1;
//!                                                 ExchangeResponseMessage exchange_response = 2; } }
//! ```
//!
//! One datagram carries exactly one encoded [`ProtocolWindow`].

use std::hash::Hasher;

use fnv::FnvHasher;
use prost::Message;

/// Largest datagram a broker will send or expect to receive.
pub const MAX_DATAGRAM_SIZE: usize = 60_000;

// ── Protocol frames ───────────────────────────────────────────────────────────

/// Opaque application payload addressed to a module on the receiving node.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ModuleMessage {
    #[prost(string, tag = "1")]
    pub recipient_module: String,
    #[prost(bytes = "vec", tag = "2")]
    pub payload: Vec<u8>,
}

impl ModuleMessage {
    pub fn new(recipient_module: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            recipient_module: recipient_module.into(),
            payload: payload.into(),
        }
    }

    /// FNV-1a 64 of the encoded message; identifies a frame in ACKs.
    pub fn content_hash(&self) -> u64 {
        let mut hasher = FnvHasher::default();
        hasher.write(&self.encode_to_vec());
        hasher.finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum FrameStatus {
    /// Synchronization (SYN).
    Created = 0,
    Message = 1,
    Accepted = 2,
    BadRequest = 3,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ProtocolFrame {
    #[prost(enumeration = "FrameStatus", tag = "1")]
    pub status: i32,
    #[prost(uint32, tag = "2")]
    pub sequence_num: u32,
    #[prost(uint64, optional, tag = "3")]
    pub hash: Option<u64>,
    #[prost(string, optional, tag = "4")]
    pub expire_time: Option<String>,
    #[prost(uint32, optional, tag = "5")]
    pub kill: Option<u32>,
    #[prost(message, optional, tag = "6")]
    pub module_message: Option<ModuleMessage>,
}

impl ProtocolFrame {
    /// Bare frame with only a status and sequence number.
    pub fn with_status(status: FrameStatus, sequence_num: u32) -> Self {
        Self {
            status: status as i32,
            sequence_num,
            ..Default::default()
        }
    }

    pub fn is(&self, status: FrameStatus) -> bool {
        self.status == status as i32
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ProtocolWindow {
    #[prost(string, tag = "1")]
    pub source_uuid: String,
    /// Identifier of the protocol that produced the frames (`"SRC"` / `"SUC"`).
    #[prost(string, tag = "2")]
    pub protocol: String,
    #[prost(message, repeated, tag = "3")]
    pub frames: Vec<ProtocolFrame>,
}

// ── Clock synchronizer ────────────────────────────────────────────────────────

#[derive(Clone, PartialEq, prost::Message)]
pub struct ExchangeMessage {
    #[prost(uint32, tag = "1")]
    pub query: u32,
    /// Sender's synchronized time.
    #[prost(string, tag = "2")]
    pub sendtime: String,
    #[prost(int64, tag = "3")]
    pub offset_secs: i64,
    #[prost(int64, tag = "4")]
    pub offset_fracs: i64,
    #[prost(double, tag = "5")]
    pub skew: f64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct TableEntry {
    #[prost(string, tag = "1")]
    pub uuid: String,
    #[prost(int64, tag = "2")]
    pub offset_secs: i64,
    /// Microseconds, always in `0..1_000_000`.
    #[prost(int64, tag = "3")]
    pub offset_fracs: i64,
    #[prost(double, tag = "4")]
    pub skew: f64,
    #[prost(double, tag = "5")]
    pub weight: f64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ExchangeResponseMessage {
    #[prost(uint32, tag = "1")]
    pub response: u32,
    #[prost(string, tag = "2")]
    pub unsynchronized_sendtime: String,
    #[prost(message, repeated, tag = "3")]
    pub table_entry: Vec<TableEntry>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ClockSynchronizerMessage {
    #[prost(oneof = "clock_synchronizer_message::Body", tags = "1, 2")]
    pub body: Option<clock_synchronizer_message::Body>,
}

pub mod clock_synchronizer_message {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Body {
        #[prost(message, tag = "1")]
        Exchange(super::ExchangeMessage),
        #[prost(message, tag = "2")]
        ExchangeResponse(super::ExchangeResponseMessage),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
