/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Peer connections.
//!
//! ```text
//!  module ──send()──► PeerConnection ──► Session (SRC | SUC) ──► windows
//!                          │                                        │
//!                          ├── resend Alarm ◄── wants_resend()      ▼
//!                          │                               DatagramSink ──► UDP
//!  Listener ──receive_window()──┘
//!                          └── accepted payloads ──► Dispatcher
//! ```
//!
//! The session lock is never held while writing datagrams or running
//! handlers.

pub mod listener;
pub mod manager;

pub use listener::Listener;
pub use manager::{ConnectionManager, MessageSender, PeerList};

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clock::SyncedClock;
use crate::dispatch::{Delivery, Dispatcher};
use crate::protocol::{DeliveryProtocol, ProtocolKind, ProtocolTimings, Session};
use crate::scheduler::{Alarm, Deadline, TimerStatus};
use crate::sync::lock;
use crate::transport::{encode_window, DatagramSink, TransportError};
use crate::wire::{FrameStatus, ModuleMessage, ProtocolFrame, ProtocolWindow};

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("peer '{0}' is not in the peer list")]
    UnknownPeer(String),

    #[error("connection to '{0}' has been torn down")]
    Stopped(String),
}

// ── ConnectionContext ─────────────────────────────────────────────────────────

/// Everything a connection shares with its siblings.
#[derive(Clone)]
pub struct ConnectionContext {
    pub local_uuid: String,
    pub kind: ProtocolKind,
    pub sink: Arc<dyn DatagramSink>,
    pub clock: SyncedClock,
    pub dispatcher: Arc<Dispatcher>,
    /// Timings for `SRC` sessions.
    pub reliable: ProtocolTimings,
    /// Resend period for `SUC` sessions.
    pub unreliable_resend: Duration,
}

impl ConnectionContext {
    fn timings(&self) -> ProtocolTimings {
        match self.kind {
            ProtocolKind::SequencedReliable => self.reliable,
            ProtocolKind::SequencedUnreliable => ProtocolTimings {
                resend_time: self.unreliable_resend,
                ..self.reliable
            },
        }
    }
}

// ── PeerConnection ────────────────────────────────────────────────────────────

/// One delivery session with one peer.
pub struct PeerConnection {
    peer: String,
    endpoint: SocketAddr,
    ctx: ConnectionContext,
    timings: ProtocolTimings,
    session: Mutex<Session>,
    resend_alarm: Alarm,
}

impl PeerConnection {
    pub fn new(peer: impl Into<String>, endpoint: SocketAddr, ctx: ConnectionContext) -> Arc<Self> {
        let timings = ctx.timings();
        let peer = peer.into();
        info!(peer = %peer, endpoint = %endpoint, protocol = %ctx.kind, "connection established");
        Arc::new(Self {
            session: Mutex::new(Session::new(ctx.kind, timings)),
            peer,
            endpoint,
            ctx,
            timings,
            resend_alarm: Alarm::new(),
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn kind(&self) -> ProtocolKind {
        self.ctx.kind
    }

    /// Hands `message` to the session and writes whatever it produces.
    pub fn send(self: &Arc<Self>, message: ModuleMessage) -> Result<(), ConnectionError> {
        let (outgoing, wants_resend) = {
            let mut session = lock(&self.session);
            if session.is_stopped() {
                return Err(ConnectionError::Stopped(self.peer.clone()));
            }
            session.send(message, self.ctx.clock.now());
            (session.take_outgoing(), session.wants_resend())
        };
        self.flush(outgoing);
        if wants_resend {
            self.arm_resend();
        }
        Ok(())
    }

    /// Processes one inbound datagram from this peer.
    ///
    /// Returns the number of payloads handed to the dispatcher.
    pub fn receive_window(self: &Arc<Self>, window: &ProtocolWindow, received_at: DateTime<Utc>) -> usize {
        if window.protocol != self.ctx.kind.identifier() {
            warn!(
                peer = %self.peer,
                got = %window.protocol,
                expected = %self.ctx.kind,
                "window for another protocol dropped"
            );
            return 0;
        }

        let now = self.ctx.clock.now();
        let mut accepted = Vec::new();
        let (outgoing, wants_resend) = {
            let mut session = lock(&self.session);
            if session.is_stopped() {
                debug!(peer = %self.peer, "datagram for torn-down connection");
                return 0;
            }
            for frame in &window.frames {
                if frame.is(FrameStatus::Accepted) {
                    session.receive_ack(frame);
                } else if session.receive(frame, now) {
                    session.send_ack(frame);
                    if let Some(message) = frame.module_message.clone() {
                        accepted.push(message);
                    }
                }
            }
            session.on_receive();
            (session.take_outgoing(), session.wants_resend())
        };
        self.flush(outgoing);
        if wants_resend {
            self.arm_resend();
        }

        let count = accepted.len();
        for message in accepted {
            self.ctx.dispatcher.dispatch(Delivery {
                source: self.peer.clone(),
                message,
                received_at,
            });
        }
        count
    }

    /// Tears the session down and cancels the resend alarm.
    pub fn stop(&self) {
        lock(&self.session).stop();
        self.resend_alarm.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        lock(&self.session).is_stopped()
    }

    /// Whether frames are still waiting for acknowledgment.
    pub fn has_pending(&self) -> bool {
        lock(&self.session).wants_resend()
    }

    fn resend_pass(self: &Arc<Self>) {
        let (outgoing, wants_resend, stopped) = {
            let mut session = lock(&self.session);
            session.resend(self.ctx.clock.now());
            (session.take_outgoing(), session.wants_resend(), session.is_stopped())
        };
        self.flush(outgoing);
        if stopped {
            warn!(peer = %self.peer, "connection torn down");
        } else if wants_resend {
            self.arm_resend();
        }
    }

    fn arm_resend(self: &Arc<Self>) {
        if self.resend_alarm.is_pending() {
            return;
        }
        let weak = Arc::downgrade(self);
        self.resend_alarm
            .arm(Deadline::After(self.timings.resend_time), move |status| {
                if status != TimerStatus::Fired {
                    return;
                }
                if let Some(conn) = weak.upgrade() {
                    conn.resend_pass();
                }
            });
    }

    fn flush(&self, outgoing: Vec<Vec<ProtocolFrame>>) {
        for frames in outgoing {
            if frames.is_empty() {
                continue;
            }
            let window = ProtocolWindow {
                source_uuid: self.ctx.local_uuid.clone(),
                protocol: self.ctx.kind.identifier().to_string(),
                frames,
            };
            let result = encode_window(&window)
                .and_then(|datagram| self.ctx.sink.send_to(&datagram, self.endpoint));
            match result {
                Ok(()) => {}
                Err(TransportError::Emulated) => {
                    debug!(peer = %self.peer, "datagram dropped by link emulation")
                }
                Err(e) => warn!(peer = %self.peer, error = %e, "datagram lost"),
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{PhaseScheduler, ALIGNMENT_DURATION};
    use crate::transport::decode_window;
    use tokio::sync::mpsc;

    /// Sink that records every datagram it is handed.
    struct Recording(mpsc::UnboundedSender<Vec<u8>>);

    impl DatagramSink for Recording {
        fn send_to(&self, datagram: &[u8], _: SocketAddr) -> Result<(), TransportError> {
            let _ = self.0.send(datagram.to_vec());
            Ok(())
        }
    }

    fn context(
        local: &str,
        kind: ProtocolKind,
    ) -> (ConnectionContext, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let clock = SyncedClock::new();
        let scheduler = PhaseScheduler::new(clock.clone(), ALIGNMENT_DURATION);
        let ctx = ConnectionContext {
            local_uuid: local.into(),
            kind,
            sink: Arc::new(Recording(tx)),
            clock,
            dispatcher: Dispatcher::new(scheduler),
            reliable: ProtocolTimings::default(),
            unreliable_resend: Duration::from_millis(10),
        };
        (ctx, rx)
    }

    fn endpoint() -> SocketAddr {
        "127.0.0.1:1870".parse().unwrap()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> Vec<ProtocolWindow> {
        std::iter::from_fn(|| rx.try_recv().ok())
            .map(|d| decode_window(&d).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn first_send_carries_syn_and_message() {
        let (ctx, mut rx) = context("alpha", ProtocolKind::SequencedReliable);
        let conn = PeerConnection::new("beta", endpoint(), ctx);
        conn.send(ModuleMessage::new("gm", b"hi".to_vec())).unwrap();

        let windows = drain(&mut rx);
        let first = windows.first().expect("nothing written");
        assert_eq!(first.source_uuid, "alpha");
        assert_eq!(first.protocol, "SRC");
        assert!(first.frames[0].is(FrameStatus::Created));
        assert!(first.frames.iter().any(|f| f.is(FrameStatus::Message)));
        assert!(conn.has_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn resend_runs_without_any_registered_module() {
        let (ctx, mut rx) = context("alpha", ProtocolKind::SequencedReliable);
        let resend = ctx.reliable.resend_time;
        let conn = PeerConnection::new("beta", endpoint(), ctx);
        conn.send(ModuleMessage::new("gm", b"hi".to_vec())).unwrap();
        assert!(!drain(&mut rx).is_empty());

        tokio::time::sleep(resend + Duration::from_millis(1)).await;
        let again = drain(&mut rx);
        let window = again.last().expect("no resend while no module is registered");
        assert!(window.frames.iter().any(|f| f.is(FrameStatus::Message)));
        assert!(conn.has_pending());

        conn.stop();
        tokio::time::sleep(resend * 5).await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn two_connections_deliver_once() {
        let (a_ctx, mut a_out) = context("alpha", ProtocolKind::SequencedReliable);
        let (b_ctx, mut b_out) = context("beta", ProtocolKind::SequencedReliable);
        let (tx, mut delivered) = mpsc::unbounded_channel();
        b_ctx
            .dispatcher
            .register_handler("gm", None, move |d| tx.send(d.message.payload).unwrap());

        let a = PeerConnection::new("beta", endpoint(), a_ctx);
        let b = PeerConnection::new("alpha", endpoint(), b_ctx);
        a.send(ModuleMessage::new("gm", b"hello".to_vec())).unwrap();

        let now = Utc::now();
        let sent = drain(&mut a_out);
        // Every datagram arrives twice.
        for window in sent.iter().chain(sent.iter()) {
            b.receive_window(window, now);
        }
        for window in drain(&mut b_out) {
            a.receive_window(&window, now);
        }

        assert_eq!(delivered.try_recv().unwrap(), b"hello");
        assert!(delivered.try_recv().is_err());
        assert!(!a.has_pending());
    }

    #[tokio::test]
    async fn window_for_other_protocol_is_dropped() {
        let (ctx, _rx) = context("alpha", ProtocolKind::SequencedReliable);
        let conn = PeerConnection::new("beta", endpoint(), ctx);
        let mut frame = ProtocolFrame::with_status(FrameStatus::Message, 0);
        frame.module_message = Some(ModuleMessage::new("gm", b"x".to_vec()));
        let window = ProtocolWindow {
            source_uuid: "beta".into(),
            protocol: "SUC".into(),
            frames: vec![frame],
        };
        assert_eq!(conn.receive_window(&window, Utc::now()), 0);
    }

    #[tokio::test]
    async fn stopped_connection_refuses_sends() {
        let (ctx, _rx) = context("alpha", ProtocolKind::SequencedUnreliable);
        let conn = PeerConnection::new("beta", endpoint(), ctx);
        conn.stop();
        assert!(conn.is_stopped());
        assert_eq!(
            conn.send(ModuleMessage::new("gm", Vec::new())).unwrap_err(),
            ConnectionError::Stopped("beta".into())
        );
    }

    #[tokio::test]
    async fn unreliable_connection_acks_immediately() {
        let (ctx, mut rx) = context("beta", ProtocolKind::SequencedUnreliable);
        let conn = PeerConnection::new("alpha", endpoint(), ctx);
        let mut frame = ProtocolFrame::with_status(FrameStatus::Message, 0);
        frame.module_message = Some(ModuleMessage::new("gm", b"x".to_vec()));
        let window = ProtocolWindow {
            source_uuid: "alpha".into(),
            protocol: "SUC".into(),
            frames: vec![frame],
        };
        assert_eq!(conn.receive_window(&window, Utc::now()), 1);

        let acks = drain(&mut rx);
        assert_eq!(acks.len(), 1);
        assert!(acks[0].frames[0].is(FrameStatus::Accepted));
    }
}
