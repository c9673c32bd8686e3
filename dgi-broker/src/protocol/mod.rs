/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Per-peer delivery sessions.
//!
//! A session is a pure state machine: it never sleeps, never touches a
//! socket and never reads the clock. The owning
//! [`PeerConnection`](crate::connection::PeerConnection) passes in the
//! corrected time, drains the frames the session wants written with
//! [`DeliveryProtocol::take_outgoing`], and keeps the resend alarm armed
//! while [`DeliveryProtocol::wants_resend`] holds.
//!
//! | Kind | Identifier | Ordering | Loss handling |
//! |---|---|---|---|
//! | [`SequencedReliable`](sr::SequencedReliable) | `SRC` | strict, one in flight | expiry + kill gap-skip, SYN resync |
//! | [`SequencedUnreliable`](su::SequencedUnreliable) | `SUC` | windowed | bounded retries, then give up |

pub mod sr;
pub mod su;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::wire::{ModuleMessage, ProtocolFrame};

pub use sr::SequencedReliable;
pub use su::SequencedUnreliable;

// ── Constants ─────────────────────────────────────────────────────────────────

/// Sequence numbers live in `0..SEQUENCE_MODULO`.
pub const SEQUENCE_MODULO: u32 = 1024;

pub fn next_seq(seq: u32) -> u32 {
    (seq % SEQUENCE_MODULO + 1) % SEQUENCE_MODULO
}

pub fn prev_seq(seq: u32) -> u32 {
    (seq % SEQUENCE_MODULO + SEQUENCE_MODULO - 1) % SEQUENCE_MODULO
}

/// Forward distance from `from` to `to` in sequence space.
pub fn seq_distance(from: u32, to: u32) -> u32 {
    (to % SEQUENCE_MODULO + SEQUENCE_MODULO - from % SEQUENCE_MODULO) % SEQUENCE_MODULO
}

// ── ProtocolKind ──────────────────────────────────────────────────────────────

/// Closed set of delivery protocols a connection can be built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
pub enum ProtocolKind {
    #[default]
    #[serde(rename = "SRC")]
    SequencedReliable,
    #[serde(rename = "SUC")]
    SequencedUnreliable,
}

impl ProtocolKind {
    /// Identifier carried in every [`ProtocolWindow`](crate::wire::ProtocolWindow).
    pub fn identifier(self) -> &'static str {
        match self {
            ProtocolKind::SequencedReliable => "SRC",
            ProtocolKind::SequencedUnreliable => "SUC",
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.identifier())
    }
}

impl FromStr for ProtocolKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SRC" => Ok(ProtocolKind::SequencedReliable),
            "SUC" => Ok(ProtocolKind::SequencedUnreliable),
            other => Err(format!("unknown protocol '{other}' (valid: SRC, SUC)")),
        }
    }
}

/// Timing knobs handed to a session when it is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolTimings {
    /// Period of the resend alarm.
    pub resend_time: Duration,
    /// Lifetime stamped on every reliable frame.
    pub default_timeout: Duration,
}

impl Default for ProtocolTimings {
    fn default() -> Self {
        Self {
            resend_time: Duration::from_millis(10),
            default_timeout: Duration::from_millis(2000),
        }
    }
}

// ── DeliveryProtocol ──────────────────────────────────────────────────────────

/// Operations every session kind supports.
///
/// Every method that may produce traffic queues whole windows; the caller
/// collects them with [`take_outgoing`](Self::take_outgoing) and sends each
/// as one datagram.
pub trait DeliveryProtocol {
    fn kind(&self) -> ProtocolKind;

    /// Queues an application message for delivery.
    fn send(&mut self, message: ModuleMessage, now: DateTime<Utc>);

    /// One pass of the resend alarm.
    fn resend(&mut self, now: DateTime<Utc>);

    /// Handles an `accepted` frame from the peer.
    fn receive_ack(&mut self, frame: &ProtocolFrame);

    /// Decides whether an inbound frame's payload goes to the dispatcher.
    fn receive(&mut self, frame: &ProtocolFrame, now: DateTime<Utc>) -> bool;

    /// Acknowledges a frame that [`receive`](Self::receive) accepted.
    fn send_ack(&mut self, frame: &ProtocolFrame);

    /// Runs once after every inbound datagram has been processed.
    fn on_receive(&mut self);

    /// Windows queued for writing since the last call.
    fn take_outgoing(&mut self) -> Vec<Vec<ProtocolFrame>>;

    /// Whether the resend alarm should stay armed.
    fn wants_resend(&self) -> bool;

    fn stop(&mut self);

    fn is_stopped(&self) -> bool;
}

// ── Session ───────────────────────────────────────────────────────────────────

/// A session of one of the [`ProtocolKind`]s.
#[derive(Debug)]
pub enum Session {
    Reliable(SequencedReliable),
    Unreliable(SequencedUnreliable),
}

impl Session {
    pub fn new(kind: ProtocolKind, timings: ProtocolTimings) -> Self {
        match kind {
            ProtocolKind::SequencedReliable => Session::Reliable(SequencedReliable::new(timings)),
            ProtocolKind::SequencedUnreliable => Session::Unreliable(SequencedUnreliable::new()),
        }
    }

    fn inner(&self) -> &dyn DeliveryProtocol {
        match self {
            Session::Reliable(s) => s,
            Session::Unreliable(s) => s,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn DeliveryProtocol {
        match self {
            Session::Reliable(s) => s,
            Session::Unreliable(s) => s,
        }
    }
}

impl DeliveryProtocol for Session {
    fn kind(&self) -> ProtocolKind {
        self.inner().kind()
    }

    fn send(&mut self, message: ModuleMessage, now: DateTime<Utc>) {
        self.inner_mut().send(message, now)
    }

    fn resend(&mut self, now: DateTime<Utc>) {
        self.inner_mut().resend(now)
    }

    fn receive_ack(&mut self, frame: &ProtocolFrame) {
        self.inner_mut().receive_ack(frame)
    }

    fn receive(&mut self, frame: &ProtocolFrame, now: DateTime<Utc>) -> bool {
        self.inner_mut().receive(frame, now)
    }

    fn send_ack(&mut self, frame: &ProtocolFrame) {
        self.inner_mut().send_ack(frame)
    }

    fn on_receive(&mut self) {
        self.inner_mut().on_receive()
    }

    fn take_outgoing(&mut self) -> Vec<Vec<ProtocolFrame>> {
        self.inner_mut().take_outgoing()
    }

    fn wants_resend(&self) -> bool {
        self.inner().wants_resend()
    }

    fn stop(&mut self) {
        self.inner_mut().stop()
    }

    fn is_stopped(&self) -> bool {
        self.inner().is_stopped()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_helpers_wrap() {
        assert_eq!(next_seq(SEQUENCE_MODULO - 1), 0);
        assert_eq!(prev_seq(0), SEQUENCE_MODULO - 1);
        assert_eq!(seq_distance(1020, 3), 7);
        assert_eq!(seq_distance(5, 5), 0);
    }

    #[test]
    fn kind_identifiers_round_trip() {
        for kind in [ProtocolKind::SequencedReliable, ProtocolKind::SequencedUnreliable] {
            assert_eq!(kind.identifier().parse::<ProtocolKind>().unwrap(), kind);
        }
        assert!("TCP".parse::<ProtocolKind>().is_err());
        assert_eq!(ProtocolKind::default(), ProtocolKind::SequencedReliable);
    }

    #[test]
    fn session_reports_its_kind() {
        let timings = ProtocolTimings::default();
        assert_eq!(
            Session::new(ProtocolKind::SequencedUnreliable, timings).kind(),
            ProtocolKind::SequencedUnreliable
        );
        assert_eq!(
            Session::new(ProtocolKind::SequencedReliable, timings).kind(),
            ProtocolKind::SequencedReliable
        );
    }
}
