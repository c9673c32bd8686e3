//! Connection bookkeeping and the static peer list.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use super::{ConnectionContext, ConnectionError, PeerConnection};
use crate::sync::lock;
use crate::wire::ModuleMessage;

// ── PeerList ──────────────────────────────────────────────────────────────────

/// Every node this broker talks to, keyed by uuid. Always contains this node.
#[derive(Debug, Clone)]
pub struct PeerList {
    local_uuid: String,
    peers: BTreeMap<String, SocketAddr>,
}

impl PeerList {
    pub fn new(
        local_uuid: impl Into<String>,
        local_addr: SocketAddr,
        peers: impl IntoIterator<Item = (String, SocketAddr)>,
    ) -> Self {
        let local_uuid = local_uuid.into();
        let mut map: BTreeMap<String, SocketAddr> = peers.into_iter().collect();
        map.insert(local_uuid.clone(), local_addr);
        Self {
            local_uuid,
            peers: map,
        }
    }

    pub fn local_uuid(&self) -> &str {
        &self.local_uuid
    }

    pub fn address(&self, uuid: &str) -> Option<SocketAddr> {
        self.peers.get(uuid).copied()
    }

    pub fn contains(&self, uuid: &str) -> bool {
        self.peers.contains_key(uuid)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// All uuids in order.
    pub fn uuids(&self) -> impl Iterator<Item = &str> {
        self.peers.keys().map(String::as_str)
    }

    /// Remote uuids in list order, starting just after this node and wrapping.
    pub fn others_after_self(&self) -> Vec<String> {
        let (before, after): (Vec<&String>, Vec<&String>) = self
            .peers
            .keys()
            .filter(|uuid| **uuid != self.local_uuid)
            .partition(|uuid| uuid.as_str() < self.local_uuid.as_str());
        after.into_iter().chain(before).cloned().collect()
    }
}

// ── MessageSender ─────────────────────────────────────────────────────────────

/// Outbound half of the broker as seen by services such as the clock
/// synchronizer.
pub trait MessageSender: Send + Sync {
    fn send_to(&self, peer: &str, message: ModuleMessage) -> Result<(), ConnectionError>;
}

// ── ConnectionManager ─────────────────────────────────────────────────────────

/// Owns one [`PeerConnection`] per peer, created on first use.
pub struct ConnectionManager {
    peers: Arc<PeerList>,
    ctx: ConnectionContext,
    connections: Mutex<HashMap<String, Arc<PeerConnection>>>,
}

impl ConnectionManager {
    pub fn new(peers: Arc<PeerList>, ctx: ConnectionContext) -> Arc<Self> {
        Arc::new(Self {
            peers,
            ctx,
            connections: Mutex::new(HashMap::new()),
        })
    }

    pub fn peers(&self) -> &Arc<PeerList> {
        &self.peers
    }

    /// Returns the live connection to `uuid`, building a new one when there
    /// is none or the previous one was torn down.
    pub fn connect(&self, uuid: &str) -> Result<Arc<PeerConnection>, ConnectionError> {
        let endpoint = self
            .peers
            .address(uuid)
            .ok_or_else(|| ConnectionError::UnknownPeer(uuid.to_string()))?;

        let mut connections = lock(&self.connections);
        if let Some(existing) = connections.get(uuid) {
            if !existing.is_stopped() {
                return Ok(Arc::clone(existing));
            }
            info!(peer = %uuid, "replacing torn-down connection");
        }
        let conn = PeerConnection::new(uuid, endpoint, self.ctx.clone());
        connections.insert(uuid.to_string(), Arc::clone(&conn));
        Ok(conn)
    }

    /// Existing connection to `uuid`, whatever its state.
    pub fn connection(&self, uuid: &str) -> Option<Arc<PeerConnection>> {
        lock(&self.connections).get(uuid).cloned()
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.connections).len()
    }

    /// Stops every connection. Later sends build fresh ones.
    pub fn stop_all(&self) {
        let connections: Vec<Arc<PeerConnection>> =
            lock(&self.connections).drain().map(|(_, c)| c).collect();
        debug!(count = connections.len(), "stopping connections");
        for conn in connections {
            conn.stop();
        }
    }
}

impl MessageSender for ConnectionManager {
    fn send_to(&self, peer: &str, message: ModuleMessage) -> Result<(), ConnectionError> {
        self.connect(peer)?.send(message)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
