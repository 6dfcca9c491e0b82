use std::collections::HashMap;
use std::time::Duration;

use tracing::{debug, info};

use crate::types::{NodeId, PeerEvent, PeerSpec, PeerState, PeersMap};

/// Transition function of the peer state machine. Total: pairs outside
/// the protocol table are self-loops so a stray event can never wedge a
/// peer in an undefined state.
pub fn next_state(state: PeerState, event: PeerEvent) -> PeerState {
    use PeerEvent::*;
    use PeerState::*;
    match (state, event) {
        (Idle, PeerAdd) => Syncing,
        (Syncing, SyncRespRcvd) => Initialized,
        (Syncing, ApiError) => Idle,
        (Initialized, SyncRespRcvd) => Initialized,
        (Initialized, ApiError) => Idle,
        // Orphaned completions and repeated errors: stay put
        (Idle, SyncRespRcvd) => Idle,
        (Idle, ApiError) => Idle,
        // Re-adds restart through Idle first, so these only fire on
        // stray events; treat them as a restart already in flight
        (Syncing, PeerAdd) => Syncing,
        (Initialized, PeerAdd) => Syncing,
    }
}

/// One peer of one area
#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub spec: PeerSpec,
    pub state: PeerState,
    /// Token identifying the current incarnation of this peer entry.
    /// Completions of sync sessions started under an older token are
    /// discarded.
    pub session: u64,
    /// Delay before the next sync retry after an error
    pub backoff: Duration,
}

impl PeerEntry {
    fn new(spec: PeerSpec, session: u64, backoff: Duration) -> Self {
        Self {
            spec,
            state: PeerState::Idle,
            session,
            backoff,
        }
    }
}

/// Set of peers for one area, keyed by peer name
pub struct PeerTable {
    area: String,
    self_node_id: NodeId,
    peers: HashMap<String, PeerEntry>,
}

impl PeerTable {
    pub fn new(area: impl Into<String>, self_node_id: impl Into<NodeId>) -> Self {
        Self {
            area: area.into(),
            self_node_id: self_node_id.into(),
            peers: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn get(&self, peer_name: &str) -> Option<&PeerEntry> {
        self.peers.get(peer_name)
    }

    pub fn get_mut(&mut self, peer_name: &str) -> Option<&mut PeerEntry> {
        self.peers.get_mut(peer_name)
    }

    /// Insert a peer at Idle, replacing any previous entry with the same
    /// name. Replacement is unconditional - same or different spec, the
    /// old entry and its in-flight session are discarded.
    pub fn insert(&mut self, peer_name: &str, spec: PeerSpec, session: u64, backoff: Duration) {
        if self.peers.remove(peer_name).is_some() {
            info!(
                area = self.area,
                peer = peer_name,
                "Replacing existing peer, restarting from Idle"
            );
        } else {
            info!(area = self.area, peer = peer_name, "Adding peer");
        }
        self.peers
            .insert(peer_name.to_string(), PeerEntry::new(spec, session, backoff));
    }

    pub fn remove(&mut self, peer_name: &str) -> Option<PeerEntry> {
        let removed = self.peers.remove(peer_name);
        if removed.is_some() {
            info!(area = self.area, peer = peer_name, "Removed peer");
        } else {
            debug!(area = self.area, peer = peer_name, "Removing unknown peer");
        }
        removed
    }

    /// Apply an event to a peer's state machine; returns the new state
    pub fn transition(&mut self, peer_name: &str, event: PeerEvent) -> Option<PeerState> {
        let entry = self.peers.get_mut(peer_name)?;
        let old = entry.state;
        entry.state = next_state(old, event);
        if old != entry.state {
            info!(
                area = self.area,
                peer = peer_name,
                ?event,
                ?old,
                new = ?entry.state,
                "Peer state transition"
            );
        }
        Some(entry.state)
    }

    /// Peers eligible to receive a flooded publication: Initialized, not
    /// already on the publication's path, and not the node we got the
    /// update from
    pub fn flood_targets(
        &self,
        node_ids: &[NodeId],
        sender_id: Option<&str>,
    ) -> Vec<(String, PeerSpec)> {
        self.peers
            .iter()
            .filter(|(name, entry)| {
                entry.state == PeerState::Initialized
                    && !node_ids.iter().any(|id| id == *name)
                    && Some(name.as_str()) != sender_id
                    && name.as_str() != self.self_node_id
            })
            .map(|(name, entry)| (name.clone(), entry.spec.clone()))
            .collect()
    }

    /// Peer map with each spec's advertised state filled in
    pub fn dump(&self) -> PeersMap {
        self.peers
            .iter()
            .map(|(name, entry)| {
                let mut spec = entry.spec.clone();
                spec.state = Some(entry.state);
                (name.clone(), spec)
            })
            .collect()
    }
}
