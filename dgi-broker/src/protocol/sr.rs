//! Sequenced reliable protocol (`SRC`).
//!
//! One message is in flight at a time and is acknowledged head-of-line.
//! Every frame carries an expiry; frames that expire at the sender are
//! dropped and the next frame carries a *kill* value (the last sequence
//! number the peer acknowledged) so the receiver can skip the gap instead of
//! waiting forever.
//!
//! ```text
//!  outbound:  UNSYNCED ──send_syn──► SYNC PENDING ──ack(SYN)──► SYNCED
//!
//!  window:    [SYN?][seq n][seq n+1] ...        front = only frame the peer can accept
//!  resend:    drop expired front frames ─► teardown if too many
//!                                      ─► resync if kill wrapped past the front
//!                                      ─► stamp kill on the front
//!                                      ─► write acks + window
//! ```

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::{next_seq, prev_seq, DeliveryProtocol, ProtocolKind, ProtocolTimings, SEQUENCE_MODULO};
use crate::clock::{format_timestamp, parse_timestamp, to_chrono};
use crate::wire::{FrameStatus, ModuleMessage, ProtocolFrame};

/// Consecutive expiries tolerated before the peer is presumed unreachable.
pub const MAX_DROPPED_MSGS: u32 = 3;

fn is_expired(frame: &ProtocolFrame, now: DateTime<Utc>) -> bool {
    frame
        .expire_time
        .as_deref()
        .and_then(parse_timestamp)
        .map_or(true, |expiry| expiry < now)
}

/// Send and receive state for one peer.
#[derive(Debug)]
pub struct SequencedReliable {
    timings: ProtocolTimings,

    // Outbound
    out_seq: u32,
    window: VecDeque<ProtocolFrame>,
    out_synced: bool,
    out_sync_hash: Option<u64>,
    send_kills: bool,
    kill_seq: u32,
    dropped: u32,

    // Inbound
    in_seq: u32,
    in_synced: bool,
    in_sync_time: Option<String>,
    in_resyncs: u32,
    ack_window: Vec<ProtocolFrame>,

    outgoing: Vec<Vec<ProtocolFrame>>,
    stopped: bool,
}

impl SequencedReliable {
    pub fn new(timings: ProtocolTimings) -> Self {
        Self {
            timings,
            out_seq: 0,
            window: VecDeque::new(),
            out_synced: false,
            out_sync_hash: None,
            send_kills: false,
            kill_seq: 0,
            dropped: 0,
            in_seq: 0,
            in_synced: false,
            in_sync_time: None,
            in_resyncs: 0,
            ack_window: Vec::new(),
            outgoing: Vec::new(),
            stopped: false,
        }
    }

    // ── Observers ─────────────────────────────────────────────────────────────

    pub fn expected_in_seq(&self) -> u32 {
        self.in_seq
    }

    pub fn is_in_synced(&self) -> bool {
        self.in_synced
    }

    pub fn resync_count(&self) -> u32 {
        self.in_resyncs
    }

    /// Frames waiting for acknowledgment, front first.
    pub fn window(&self) -> impl Iterator<Item = &ProtocolFrame> {
        self.window.iter()
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    pub fn kill_seq(&self) -> u32 {
        self.kill_seq
    }

    pub fn dropped(&self) -> u32 {
        self.dropped
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    fn expiry_from(&self, now: DateTime<Utc>) -> String {
        format_timestamp(now + to_chrono(self.timings.default_timeout))
    }

    fn front_is_syn(&self) -> bool {
        self.window
            .front()
            .is_some_and(|f| f.is(FrameStatus::Created))
    }

    /// Puts a SYN at the front of the window unless one is already there.
    fn send_syn(&mut self, now: DateTime<Utc>) {
        let seq = match self.window.front() {
            None => {
                let seq = self.out_seq;
                self.out_seq = next_seq(self.out_seq);
                seq
            }
            Some(front) if front.is(FrameStatus::Created) => return,
            Some(front) => prev_seq(front.sequence_num),
        };

        let mut syn = ProtocolFrame::with_status(FrameStatus::Created, seq);
        syn.expire_time = Some(self.expiry_from(now));
        debug!(seq, "queueing SYN");
        self.window.push_front(syn);
        self.out_synced = true;
    }

    fn write_window(&mut self) {
        let frames: Vec<ProtocolFrame> = self
            .ack_window
            .iter()
            .chain(self.window.iter())
            .cloned()
            .collect();
        if !frames.is_empty() {
            self.outgoing.push(frames);
        }
    }
}

impl DeliveryProtocol for SequencedReliable {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::SequencedReliable
    }

    fn send(&mut self, message: ModuleMessage, now: DateTime<Utc>) {
        if self.stopped {
            debug!(recipient = %message.recipient_module, "send on torn-down session discarded");
            return;
        }
        if !self.out_synced {
            self.send_syn(now);
        }

        let mut frame = ProtocolFrame::with_status(FrameStatus::Message, self.out_seq);
        self.out_seq = next_seq(self.out_seq);
        frame.hash = Some(message.content_hash());
        frame.expire_time = Some(self.expiry_from(now));
        frame.module_message = Some(message);

        debug!(seq = frame.sequence_num, "message queued");
        self.window.push_back(frame);
        self.resend(now);
    }

    fn resend(&mut self, now: DateTime<Utc>) {
        if self.stopped {
            return;
        }

        let mut expired_behind_syn = 0u32;
        if self.front_is_syn() {
            expired_behind_syn = self
                .window
                .iter()
                .skip(1)
                .filter(|f| is_expired(f, now))
                .count() as u32;
        } else {
            while let Some(front) = self.window.front() {
                if front.is(FrameStatus::Created) || !is_expired(front, now) {
                    break;
                }
                debug!(seq = front.sequence_num, "frame expired");
                self.window.pop_front();
                self.send_kills = true;
                self.dropped += 1;
            }
        }

        if self.dropped > MAX_DROPPED_MSGS || expired_behind_syn > MAX_DROPPED_MSGS {
            warn!(
                dropped = self.dropped.max(expired_behind_syn),
                "peer presumed unreachable, tearing down session"
            );
            self.stop();
            return;
        }

        if let Some(front_seq) = self.window.front().map(|f| f.sequence_num) {
            if self.send_kills && self.kill_seq > front_seq {
                // Expiry wrapped the sequence space; a kill would be misread.
                self.send_kills = false;
                self.kill_seq = 0;
                self.send_syn(now);
            }
            if self.send_kills {
                let kill = self.kill_seq;
                if let Some(front) = self.window.front_mut() {
                    front.kill = Some(kill);
                }
            }
        }

        self.write_window();
    }

    fn receive_ack(&mut self, frame: &ProtocolFrame) {
        let Some(front) = self.window.front() else {
            debug!(seq = frame.sequence_num, "ack with nothing in flight");
            return;
        };
        if front.sequence_num == frame.sequence_num
            && front.hash.unwrap_or(0) == frame.hash.unwrap_or(0)
        {
            self.kill_seq = front.sequence_num;
            self.window.pop_front();
            self.send_kills = false;
            self.dropped = 0;
            debug!(seq = self.kill_seq, "frame acknowledged");
        } else {
            debug!(
                seq = frame.sequence_num,
                expected = front.sequence_num,
                "stale ack ignored"
            );
        }
    }

    fn receive(&mut self, frame: &ProtocolFrame, now: DateTime<Utc>) -> bool {
        let status = match FrameStatus::try_from(frame.status) {
            Ok(status) => status,
            Err(_) => {
                warn!(status = frame.status, seq = frame.sequence_num, "frame with unknown status dropped");
                return false;
            }
        };
        match status {
            FrameStatus::Accepted => false,
            FrameStatus::BadRequest => {
                if self.front_is_syn() {
                    debug!("bad request while a SYN is already pending");
                } else if frame.hash == self.out_sync_hash {
                    debug!("bad request already answered");
                } else {
                    debug!("peer lost sync, resynchronizing");
                    self.out_sync_hash = frame.hash;
                    self.send_syn(now);
                }
                false
            }
            FrameStatus::Created => {
                let Some(stamp) = frame.expire_time.clone() else {
                    debug!(seq = frame.sequence_num, "SYN without timestamp ignored");
                    return false;
                };
                if self.in_sync_time.as_deref() == Some(stamp.as_str()) {
                    debug!(seq = frame.sequence_num, "duplicate SYN");
                    return false;
                }
                self.in_seq = next_seq(frame.sequence_num);
                self.in_sync_time = Some(stamp);
                self.in_resyncs = self.in_resyncs.wrapping_add(1);
                self.in_synced = true;
                debug!(expected = self.in_seq, "inbound synchronized");
                self.send_ack(frame);
                false
            }
            _ if !self.in_synced => {
                debug!(seq = frame.sequence_num, "message before SYN, answering bad request");
                let mut reply =
                    ProtocolFrame::with_status(FrameStatus::BadRequest, self.in_resyncs % SEQUENCE_MODULO);
                reply.hash = frame.hash;
                self.outgoing.push(vec![reply]);
                false
            }
            FrameStatus::Message => {
                if frame.hash.is_none() {
                    return false;
                }
                let seq = frame.sequence_num;
                if seq == self.in_seq {
                    self.in_seq = next_seq(self.in_seq);
                    true
                } else if let Some(kill) = frame.kill.filter(|&k| k < self.in_seq && seq > self.in_seq) {
                    debug!(seq, kill, skipped_from = self.in_seq, "gap skipped by kill");
                    self.in_seq = next_seq(seq);
                    true
                } else {
                    debug!(seq, expected = self.in_seq, kill = ?frame.kill, "frame rejected");
                    false
                }
            }
        }
    }

    fn send_ack(&mut self, frame: &ProtocolFrame) {
        let mut ack = ProtocolFrame::with_status(FrameStatus::Accepted, frame.sequence_num);
        ack.expire_time = frame.expire_time.clone();
        ack.hash = Some(frame.hash.unwrap_or(0));
        self.ack_window.push(ack);
    }

    fn on_receive(&mut self) {
        self.write_window();
        self.ack_window.clear();
    }

    fn take_outgoing(&mut self) -> Vec<Vec<ProtocolFrame>> {
        std::mem::take(&mut self.outgoing)
    }

    fn wants_resend(&self) -> bool {
        !self.stopped && !self.window.is_empty()
    }

    fn stop(&mut self) {
        self.stopped = true;
        self.window.clear();
        self.ack_window.clear();
    }

    fn is_stopped(&self) -> bool {
        self.stopped
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn session() -> SequencedReliable {
        SequencedReliable::new(ProtocolTimings {
            resend_time: std::time::Duration::from_millis(10),
            default_timeout: std::time::Duration::from_millis(100),
        })
    }

    fn msg(payload: &str) -> ModuleMessage {
        ModuleMessage::new("gm", payload.as_bytes().to_vec())
    }

    fn syn(seq: u32, at: DateTime<Utc>) -> ProtocolFrame {
        let mut f = ProtocolFrame::with_status(FrameStatus::Created, seq);
        f.expire_time = Some(format_timestamp(at));
        f
    }

    fn data(seq: u32, kill: Option<u32>) -> ProtocolFrame {
        let m = msg("x");
        let mut f = ProtocolFrame::with_status(FrameStatus::Message, seq);
        f.hash = Some(m.content_hash());
        f.kill = kill;
        f.module_message = Some(m);
        f
    }

    /// Receiver synchronized so that `expected` is the next sequence number.
    fn receiver_expecting(expected: u32) -> SequencedReliable {
        let mut rx = session();
        rx.receive(&syn(prev_seq(expected), t0()), t0());
        rx.on_receive();
        rx.take_outgoing();
        assert_eq!(rx.expected_in_seq(), expected);
        rx
    }

    /// Delivers every frame the sender wrote to the receiver, and the
    /// receiver's replies back to the sender. Returns accepted payloads.
    fn exchange(tx: &mut SequencedReliable, rx: &mut SequencedReliable) -> Vec<ProtocolFrame> {
        let mut accepted = Vec::new();
        for window in tx.take_outgoing() {
            for frame in &window {
                if rx.receive(frame, t0()) {
                    rx.send_ack(frame);
                    accepted.push(frame.clone());
                }
            }
            rx.on_receive();
        }
        for window in rx.take_outgoing() {
            for frame in &window {
                if frame.is(FrameStatus::Accepted) {
                    tx.receive_ack(frame);
                } else {
                    tx.receive(frame, t0());
                }
            }
            tx.on_receive();
        }
        accepted
    }

    // ── Send side ─────────────────────────────────────────────────────────────

    #[test]
    fn first_send_prepends_syn_and_writes_window() {
        let mut tx = session();
        tx.send(msg("x"), t0());

        let frames: Vec<_> = tx.window().cloned().collect();
        assert_eq!(frames.len(), 2);
        assert!(frames[0].is(FrameStatus::Created));
        assert_eq!(frames[0].sequence_num, 0);
        assert!(frames[1].is(FrameStatus::Message));
        assert_eq!(frames[1].sequence_num, 1);
        assert!(frames[1].hash.is_some());
        assert!(frames[1].expire_time.is_some());

        let out = tx.take_outgoing();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].len(), 2);
        assert!(tx.wants_resend());
    }

    #[test]
    fn ack_must_match_head_sequence_and_hash() {
        let mut tx = session();
        tx.send(msg("x"), t0());
        tx.receive_ack(&ProtocolFrame {
            hash: Some(0),
            ..ProtocolFrame::with_status(FrameStatus::Accepted, 0)
        });
        assert_eq!(tx.window_len(), 1, "SYN acknowledged");

        // Wrong hash for seq 1
        tx.receive_ack(&ProtocolFrame {
            hash: Some(12345),
            ..ProtocolFrame::with_status(FrameStatus::Accepted, 1)
        });
        assert_eq!(tx.window_len(), 1);

        let hash = tx.window().next().unwrap().hash;
        tx.receive_ack(&ProtocolFrame {
            hash,
            ..ProtocolFrame::with_status(FrameStatus::Accepted, 1)
        });
        assert_eq!(tx.window_len(), 0);
        assert_eq!(tx.kill_seq(), 1);
        assert!(!tx.wants_resend());
    }

    #[test]
    fn expired_front_is_dropped_and_next_frame_carries_kill() {
        let mut tx = session();
        let mut rx = session();
        tx.send(msg("a"), t0());
        assert_eq!(exchange(&mut tx, &mut rx).len(), 1);
        assert_eq!(tx.window_len(), 0);

        tx.send(msg("b"), t0());
        tx.send(msg("c"), t0() + Duration::milliseconds(80));
        tx.take_outgoing();

        tx.resend(t0() + Duration::milliseconds(120));
        assert_eq!(tx.dropped(), 1);
        let front = tx.window().next().unwrap();
        assert_eq!(front.sequence_num, 3);
        assert_eq!(front.kill, Some(1));

        // The receiver missed seq 2 entirely and skips it.
        let accepted = exchange(&mut tx, &mut rx);
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].sequence_num, 3);
        assert_eq!(rx.expected_in_seq(), 4);
        assert_eq!(tx.window_len(), 0);
        assert_eq!(tx.dropped(), 0);
    }

    #[test]
    fn kill_past_wrapped_front_forces_resync() {
        let mut tx = session();
        let mut rx = session();
        // Walk the sequence space up to 1023.
        for _ in 0..(SEQUENCE_MODULO - 1) {
            tx.send(msg("x"), t0());
            exchange(&mut tx, &mut rx);
        }
        assert_eq!(tx.kill_seq(), SEQUENCE_MODULO - 1);

        tx.send(msg("wrapped"), t0());
        tx.send(msg("next"), t0() + Duration::milliseconds(80));
        tx.take_outgoing();
        tx.resend(t0() + Duration::milliseconds(120));

        let frames: Vec<_> = tx.window().cloned().collect();
        assert!(frames[0].is(FrameStatus::Created), "SYN pushed to front");
        assert_eq!(frames[0].sequence_num, 0);
        assert_eq!(frames[1].sequence_num, 1);
        assert_eq!(frames[1].kill, None);
        assert_eq!(tx.kill_seq(), 0);
    }

    #[test]
    fn loss_threshold_tears_session_down() {
        let mut tx = session();
        let mut rx = session();
        tx.send(msg("sync"), t0());
        exchange(&mut tx, &mut rx);

        for i in 0..=MAX_DROPPED_MSGS {
            tx.send(msg(&format!("lost-{i}")), t0());
        }
        tx.take_outgoing();

        tx.resend(t0() + Duration::seconds(1));
        assert!(tx.is_stopped());
        assert!(!tx.wants_resend());
        assert!(tx.take_outgoing().is_empty());

        tx.resend(t0() + Duration::seconds(2));
        tx.send(msg("after"), t0() + Duration::seconds(2));
        assert!(tx.take_outgoing().is_empty(), "no further traffic");
    }

    #[test]
    fn unacknowledged_syn_with_expired_backlog_tears_down() {
        let mut tx = session();
        for i in 0..=MAX_DROPPED_MSGS {
            tx.send(msg(&format!("m{i}")), t0());
        }
        tx.resend(t0() + Duration::milliseconds(50));
        assert!(!tx.is_stopped());

        tx.resend(t0() + Duration::seconds(1));
        assert!(tx.is_stopped());
    }

    // ── Receive side ──────────────────────────────────────────────────────────

    #[test]
    fn gap_skip_accepts_when_kill_explains_the_gap() {
        let mut rx = receiver_expecting(5);
        assert!(rx.receive(&data(7, Some(4)), t0()));
        assert_eq!(rx.expected_in_seq(), 8);
    }

    #[test]
    fn unexplained_gap_is_rejected() {
        let mut rx = receiver_expecting(5);
        assert!(!rx.receive(&data(7, None), t0()));
        assert!(!rx.receive(&data(7, Some(6)), t0()), "kill not below expected");
        assert!(!rx.receive(&data(3, Some(2)), t0()), "older than expected");
        assert_eq!(rx.expected_in_seq(), 5);
    }

    #[test]
    fn duplicate_message_is_accepted_once() {
        let mut rx = receiver_expecting(1);
        let frame = data(1, None);
        assert!(rx.receive(&frame, t0()));
        assert!(!rx.receive(&frame, t0()));
        assert_eq!(rx.expected_in_seq(), 2);
    }

    #[test]
    fn frame_without_hash_is_rejected() {
        let mut rx = receiver_expecting(1);
        let mut frame = data(1, None);
        frame.hash = None;
        assert!(!rx.receive(&frame, t0()));
    }

    #[test]
    fn duplicate_syn_yields_one_ack_and_one_transition() {
        let mut rx = session();
        let s = syn(9, t0());
        assert!(!rx.receive(&s, t0()));
        assert!(!rx.receive(&s, t0()));
        rx.on_receive();

        assert_eq!(rx.resync_count(), 1);
        assert_eq!(rx.expected_in_seq(), 10);
        let out = rx.take_outgoing();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].len(), 1);
        assert!(out[0][0].is(FrameStatus::Accepted));
        assert_eq!(out[0][0].sequence_num, 9);
        assert_eq!(out[0][0].expire_time, s.expire_time);
    }

    #[test]
    fn unknown_status_is_not_taken_for_a_syn() {
        let mut rx = session();
        assert!(!rx.is_in_synced());
        rx.receive(&syn(4, t0()), t0());
        assert!(rx.is_in_synced());
        rx.on_receive();
        rx.take_outgoing();

        let odd = ProtocolFrame {
            status: 42,
            expire_time: Some(format_timestamp(t0() + Duration::seconds(1))),
            ..ProtocolFrame::with_status(FrameStatus::Message, 900)
        };
        assert!(!rx.receive(&odd, t0()));
        rx.on_receive();

        assert_eq!(rx.expected_in_seq(), 5);
        assert_eq!(rx.resync_count(), 1);
        assert!(rx.take_outgoing().is_empty(), "nothing acknowledged");
        assert!(rx.receive(&data(5, None), t0()));
    }

    #[test]
    fn unsynced_receiver_answers_bad_request() {
        let mut rx = session();
        let frame = data(4, None);
        assert!(!rx.receive(&frame, t0()));
        assert!(!rx.is_in_synced());

        let out = rx.take_outgoing();
        assert_eq!(out.len(), 1);
        let reply = &out[0][0];
        assert!(reply.is(FrameStatus::BadRequest));
        assert_eq!(reply.hash, frame.hash);
        assert_eq!(reply.sequence_num, 0);
    }

    #[test]
    fn bad_request_triggers_one_resync_per_hash() {
        let mut tx = session();
        let mut rx = session();
        tx.send(msg("a"), t0());
        exchange(&mut tx, &mut rx);
        tx.send(msg("b"), t0());
        tx.take_outgoing();

        let mut bad = ProtocolFrame::with_status(FrameStatus::BadRequest, 0);
        bad.hash = Some(77);
        tx.receive(&bad, t0());
        let front = tx.window().next().unwrap().clone();
        assert!(front.is(FrameStatus::Created));
        assert_eq!(front.sequence_num, 1, "SYN precedes the pending frame");

        // Acknowledge the SYN, then repeat the same bad request.
        tx.receive_ack(&ProtocolFrame {
            hash: Some(0),
            ..ProtocolFrame::with_status(FrameStatus::Accepted, 1)
        });
        tx.receive(&bad, t0());
        assert!(tx.window().next().unwrap().is(FrameStatus::Message));
    }

    #[test]
    fn resynced_receiver_restarts_at_syn_sequence() {
        let mut rx = receiver_expecting(40);
        rx.receive(&syn(2, t0() + Duration::seconds(5)), t0());
        assert_eq!(rx.resync_count(), 2);
        assert!(rx.receive(&data(3, None), t0()));
    }
}
