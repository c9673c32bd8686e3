//! Sequenced unreliable protocol (`SUC`).
//!
//! Up to [`WINDOW_SIZE`] frames are written per pass and each frame is tried
//! at most [`MAX_RETRIES`] times. There is no SYN handshake and no expiry:
//! the receiver accepts anything inside a sliding acceptance window above the
//! next expected sequence number and widens that window after every
//! rejection.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::{next_seq, seq_distance, DeliveryProtocol, ProtocolKind, SEQUENCE_MODULO};
use crate::wire::{FrameStatus, ModuleMessage, ProtocolFrame};

pub const WINDOW_SIZE: u32 = 8;
pub const MAX_RETRIES: u32 = 100;

#[derive(Debug)]
struct QueueItem {
    retries_left: u32,
    frame: ProtocolFrame,
}

#[derive(Debug)]
pub struct SequencedUnreliable {
    out_seq: u32,
    window: VecDeque<QueueItem>,
    in_seq: u32,
    accept_mod: u32,
    outgoing: Vec<Vec<ProtocolFrame>>,
    stopped: bool,
}

impl Default for SequencedUnreliable {
    fn default() -> Self {
        Self::new()
    }
}

impl SequencedUnreliable {
    pub fn new() -> Self {
        Self {
            out_seq: 0,
            window: VecDeque::new(),
            in_seq: 0,
            accept_mod: 1,
            outgoing: Vec::new(),
            stopped: false,
        }
    }

    pub fn expected_in_seq(&self) -> u32 {
        self.in_seq
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    /// Current width of the acceptance window, in units of [`WINDOW_SIZE`].
    pub fn accept_mod(&self) -> u32 {
        self.accept_mod
    }
}

impl DeliveryProtocol for SequencedUnreliable {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::SequencedUnreliable
    }

    fn send(&mut self, message: ModuleMessage, now: DateTime<Utc>) {
        if self.stopped {
            return;
        }
        let mut frame = ProtocolFrame::with_status(FrameStatus::Message, self.out_seq);
        self.out_seq = next_seq(self.out_seq);
        frame.hash = Some(message.content_hash());
        frame.module_message = Some(message);

        self.window.push_back(QueueItem {
            retries_left: MAX_RETRIES,
            frame,
        });
        if (self.window.len() as u32) < WINDOW_SIZE {
            self.resend(now);
        }
    }

    fn resend(&mut self, _now: DateTime<Utc>) {
        if self.stopped {
            return;
        }
        let mut writes = 0u32;
        for _ in 0..self.window.len() {
            let Some(mut item) = self.window.pop_front() else {
                break;
            };
            if writes < WINDOW_SIZE {
                self.outgoing.push(vec![item.frame.clone()]);
                writes += 1;
                item.retries_left = item.retries_left.saturating_sub(1);
            }
            if item.retries_left > 0 {
                self.window.push_back(item);
            } else {
                info!(seq = item.frame.sequence_num, "gave up sending");
            }
        }
    }

    fn receive_ack(&mut self, frame: &ProtocolFrame) {
        let seq = frame.sequence_num;
        while let Some(front) = self.window.front() {
            if seq_distance(front.frame.sequence_num, seq) < WINDOW_SIZE {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    fn receive(&mut self, frame: &ProtocolFrame, _now: DateTime<Utc>) -> bool {
        if !frame.is(FrameStatus::Message) {
            return false;
        }
        let seq = frame.sequence_num;
        if seq_distance(self.in_seq, seq) < WINDOW_SIZE * self.accept_mod {
            self.accept_mod = 1;
            self.in_seq = next_seq(seq);
            return true;
        }
        if self.accept_mod < SEQUENCE_MODULO / WINDOW_SIZE {
            self.accept_mod *= 2;
        }
        debug!(
            seq,
            expected = self.in_seq,
            width = WINDOW_SIZE * self.accept_mod,
            "frame outside acceptance window"
        );
        false
    }

    fn send_ack(&mut self, frame: &ProtocolFrame) {
        self.outgoing.push(vec![ProtocolFrame::with_status(
            FrameStatus::Accepted,
            frame.sequence_num,
        )]);
    }

    fn on_receive(&mut self) {}

    fn take_outgoing(&mut self) -> Vec<Vec<ProtocolFrame>> {
        std::mem::take(&mut self.outgoing)
    }

    fn wants_resend(&self) -> bool {
        !self.stopped && !self.window.is_empty()
    }

    fn stop(&mut self) {
        self.stopped = true;
        self.window.clear();
    }

    fn is_stopped(&self) -> bool {
        self.stopped
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
