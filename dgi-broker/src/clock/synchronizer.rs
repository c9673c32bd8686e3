//! Gossip-based clock synchronizer.
//!
//! Every `query_interval` the synchronizer asks each peer for its clock and
//! its whole offset table. Direct answers feed a per-peer regression
//! ([`regression::estimate`](super::regression::estimate)); the peer's table
//! entries are adopted second-hand when they are more trusted than what this
//! node already knows.
//!
//! ```text
//!  round k:  Exchange{query=k} ──► peer
//!                                    │
//!            Response{k, t_peer, table} ◄──┘
//!                │
//!                ├─ sample (t_peer, challenged, received) ─► regression ─► table[peer]
//!                └─ table rows, weight − HOP_PENALTY ───────────────────► table[other]
//!
//!  publish:  offset = Σ wᵢ·offsetᵢ / Σ wᵢ,   wᵢ = weightᵢ · DECAYᵏ⁻ˡᵃˢᵗ
//! ```

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use prost::Message;
use tracing::{debug, info, warn};

use super::regression::{estimate, Sample};
use super::{format_timestamp, join_offset, parse_timestamp, split_offset, SyncedClock};
use crate::connection::{MessageSender, PeerList};
use crate::dispatch::Delivery;
use crate::scheduler::{Alarm, Deadline, TimerStatus};
use crate::sync::lock;
use crate::wire::clock_synchronizer_message::Body;
use crate::wire::{
    ClockSynchronizerMessage, ExchangeMessage, ExchangeResponseMessage, ModuleMessage, TableEntry,
};

// ── Constants ─────────────────────────────────────────────────────────────────

/// Recipient name of clock exchange traffic.
pub const CLOCK_RECIPIENT: &str = "clk";

/// Samples kept per peer.
pub const MAX_REGRESSION_ENTRIES: usize = 200;

pub const QUERY_INTERVAL: Duration = Duration::from_secs(10);

/// Per-round decay applied to stale entries.
const WEIGHT_DECAY: f64 = 0.99999;

/// Trust lost by an entry for every hop it travels.
const HOP_PENALTY: f64 = 0.1;

// ── Table ─────────────────────────────────────────────────────────────────────

/// What this node believes about one peer's clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockEntry {
    /// Peer clock minus local clock.
    pub offset: chrono::Duration,
    pub skew: f64,
    pub weight: f64,
    /// Round in which the entry was last written.
    pub last_refresh: u32,
}

impl ClockEntry {
    fn pinned(round: u32) -> Self {
        Self {
            offset: chrono::Duration::zero(),
            skew: 0.0,
            weight: 1.0,
            last_refresh: round,
        }
    }

    fn decayed_weight(&self, round: u32) -> f64 {
        let age = round.saturating_sub(self.last_refresh);
        self.weight * WEIGHT_DECAY.powi(i32::try_from(age).unwrap_or(i32::MAX))
    }
}

#[derive(Default)]
struct SyncState {
    round: u32,
    queries: HashMap<String, (u32, DateTime<Utc>)>,
    table: BTreeMap<String, ClockEntry>,
    history: HashMap<String, VecDeque<Sample>>,
    skew: f64,
}

// ── ClockSynchronizer ─────────────────────────────────────────────────────────

pub struct ClockSynchronizer {
    peers: Arc<PeerList>,
    sender: Arc<dyn MessageSender>,
    clock: SyncedClock,
    interval: Duration,
    alarm: Alarm,
    stopped: AtomicBool,
    state: Mutex<SyncState>,
}

impl ClockSynchronizer {
    pub fn new(
        peers: Arc<PeerList>,
        sender: Arc<dyn MessageSender>,
        clock: SyncedClock,
        interval: Duration,
    ) -> Arc<Self> {
        let mut state = SyncState::default();
        state
            .table
            .insert(peers.local_uuid().to_string(), ClockEntry::pinned(0));
        Arc::new(Self {
            peers,
            sender,
            clock,
            interval,
            alarm: Alarm::new(),
            stopped: AtomicBool::new(false),
            state: Mutex::new(state),
        })
    }

    /// Starts the periodic exchange. The first round goes out immediately.
    pub fn run(self: &Arc<Self>) {
        info!(interval_ms = self.interval.as_millis() as u64, "clock synchronizer running");
        self.stopped.store(false, Ordering::SeqCst);
        self.tick(TimerStatus::Fired);
    }

    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            info!("clock synchronizer stopped");
        }
        self.alarm.cancel();
    }

    /// Local time plus the published correction.
    pub fn synchronized_time(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Current table entry for `peer`.
    pub fn entry(&self, peer: &str) -> Option<ClockEntry> {
        lock(&self.state).table.get(peer).copied()
    }

    pub fn round(&self) -> u32 {
        lock(&self.state).round
    }

    /// Averaged drift published with the last round.
    pub fn skew(&self) -> f64 {
        lock(&self.state).skew
    }

    fn tick(self: &Arc<Self>, status: TimerStatus) {
        if status == TimerStatus::Aborted || self.stopped.load(Ordering::SeqCst) {
            return;
        }
        self.exchange_round();

        let weak = Arc::downgrade(self);
        self.alarm.arm(Deadline::After(self.interval), move |status| {
            if let Some(sync) = weak.upgrade() {
                sync.tick(status);
            }
        });
    }

    /// Queries every peer, then publishes the weighted offset.
    pub fn exchange_round(&self) {
        let (query, skew) = {
            let st = lock(&self.state);
            (st.round, st.skew)
        };
        let (offset_secs, offset_fracs) = split_offset(self.clock.offset());
        let exchange = ClockSynchronizerMessage {
            body: Some(Body::Exchange(ExchangeMessage {
                query,
                sendtime: format_timestamp(self.clock.now()),
                offset_secs,
                offset_fracs,
                skew,
            })),
        };
        let payload = exchange.encode_to_vec();

        for peer in self.peers.others_after_self() {
            let challenged = self.clock.local_now();
            lock(&self.state)
                .queries
                .insert(peer.clone(), (query, challenged));
            if let Err(e) = self
                .sender
                .send_to(&peer, ModuleMessage::new(CLOCK_RECIPIENT, payload.clone()))
            {
                warn!(peer = %peer, error = %e, "clock query not sent");
                lock(&self.state).queries.remove(&peer);
            }
        }

        let mut st = lock(&self.state);
        st.round = st.round.wrapping_add(1);
        let round = st.round;
        let local = self.peers.local_uuid().to_string();
        st.table.insert(local.clone(), ClockEntry::pinned(round));

        let (mut total, mut offset_us, mut skew_sum) = (0.0, 0.0, 0.0);
        for entry in st.table.values() {
            let w = entry.decayed_weight(round);
            total += w;
            offset_us += w * entry.offset.num_microseconds().unwrap_or(0) as f64;
            skew_sum += w * entry.skew;
        }
        if total > 0.0 {
            let offset = chrono::Duration::microseconds((offset_us / total).round() as i64);
            self.clock.set_offset(offset);
            st.skew = skew_sum / total;
            debug!(
                round,
                offset_us = offset.num_microseconds().unwrap_or(0),
                skew = st.skew,
                "clock offset published"
            );
        }
        st.table.insert(local, ClockEntry::pinned(round));
    }

    /// Handles one `"clk"` payload from the dispatcher.
    pub fn handle_delivery(&self, delivery: &Delivery) {
        let message = match ClockSynchronizerMessage::decode(delivery.message.payload.as_slice()) {
            Ok(message) => message,
            Err(e) => {
                warn!(peer = %delivery.source, error = %e, "undecodable clock message");
                return;
            }
        };
        match message.body {
            Some(Body::Exchange(exchange)) => self.handle_exchange(&delivery.source, &exchange),
            Some(Body::ExchangeResponse(response)) => {
                self.handle_response(&delivery.source, &response, delivery.received_at)
            }
            None => warn!(peer = %delivery.source, "empty clock message"),
        }
    }

    fn handle_exchange(&self, peer: &str, exchange: &ExchangeMessage) {
        let table_entry: Vec<TableEntry> = {
            let st = lock(&self.state);
            st.table
                .iter()
                .map(|(uuid, entry)| {
                    let (offset_secs, offset_fracs) = split_offset(entry.offset);
                    TableEntry {
                        uuid: uuid.clone(),
                        offset_secs,
                        offset_fracs,
                        skew: entry.skew,
                        weight: entry.decayed_weight(st.round),
                    }
                })
                .collect()
        };
        let response = ClockSynchronizerMessage {
            body: Some(Body::ExchangeResponse(ExchangeResponseMessage {
                response: exchange.query,
                unsynchronized_sendtime: format_timestamp(self.clock.local_now()),
                table_entry,
            })),
        };
        if let Err(e) = self.sender.send_to(
            peer,
            ModuleMessage::new(CLOCK_RECIPIENT, response.encode_to_vec()),
        ) {
            warn!(peer = %peer, error = %e, "clock response not sent");
        }
    }

    fn handle_response(&self, peer: &str, response: &ExchangeResponseMessage, received: DateTime<Utc>) {
        let mut st = lock(&self.state);
        let challenged = match st.queries.get(peer) {
            Some(&(query, challenged)) if query == response.response => challenged,
            _ => {
                warn!(peer = %peer, response = response.response, "unsolicited clock response");
                return;
            }
        };
        st.queries.remove(peer);

        let Some(remote_sent) = parse_timestamp(&response.unsynchronized_sendtime) else {
            warn!(peer = %peer, "clock response with bad timestamp");
            return;
        };

        let history = st.history.entry(peer.to_string()).or_default();
        history.push_back(Sample {
            remote_sent,
            challenged,
            received,
        });
        while history.len() > MAX_REGRESSION_ENTRIES {
            history.pop_front();
        }
        let Some(est) = estimate(history.make_contiguous(), self.clock.local_now()) else {
            return;
        };

        let round = st.round;
        let direct = ClockEntry {
            offset: est.offset,
            skew: est.skew(),
            weight: 1.0,
            last_refresh: round,
        };
        st.table.insert(peer.to_string(), direct);
        debug!(
            peer = %peer,
            offset_us = est.offset.num_microseconds().unwrap_or(0),
            skew = direct.skew,
            lag_us = est.lag.num_microseconds().unwrap_or(0),
            "peer clock estimated"
        );

        let local = self.peers.local_uuid();
        for reported in &response.table_entry {
            if reported.uuid == peer || reported.uuid == local {
                continue;
            }
            let weight = reported.weight - HOP_PENALTY;
            let known = st
                .table
                .get(&reported.uuid)
                .map_or(0.0, |e| e.decayed_weight(round));
            if known < weight {
                let Some(offset) = join_offset(reported.offset_secs, reported.offset_fracs)
                    .and_then(|o| direct.offset.checked_add(&o))
                else {
                    warn!(
                        peer = %peer,
                        entry = %reported.uuid,
                        offset_secs = reported.offset_secs,
                        "gossiped offset out of range"
                    );
                    continue;
                };
                st.table.insert(
                    reported.uuid.clone(),
                    ClockEntry {
                        offset,
                        skew: direct.skew + reported.skew,
                        weight,
                        last_refresh: round,
                    },
                );
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
