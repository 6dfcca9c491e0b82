use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{NodeId, PeersMap};

/// Store configuration. No CLI or config file is attached at this layer;
/// embedders construct this and hand it to [`crate::Store::new`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// This node's identifier, the originator id stamped on local writes
    pub node_id: NodeId,

    /// Areas this store participates in. Keys never cross areas.
    pub areas: Vec<String>,

    /// Peers inserted per area at startup. These are the peers the
    /// initial synced signal waits for; when empty the signal is emitted
    /// immediately after startup.
    pub initial_peers: HashMap<String, PeersMap>,

    /// RPC listen address. Port 0 binds an ephemeral port; the bound
    /// address is queryable once the store is running.
    pub listen_addr: String,

    /// How long local reads wait on the run loop before giving up
    pub read_timeout: Duration,

    /// Per-call timeout for peer RPCs
    pub rpc_timeout: Duration,

    /// Exponential backoff bounds for re-syncing a peer after an error
    pub sync_retry_min: Duration,
    pub sync_retry_max: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            node_id: "node".to_string(),
            areas: Vec::new(),
            initial_peers: HashMap::new(),
            listen_addr: "127.0.0.1:0".to_string(),
            read_timeout: Duration::from_secs(1),
            rpc_timeout: Duration::from_secs(2),
            sync_retry_min: Duration::from_millis(100),
            sync_retry_max: Duration::from_secs(5),
        }
    }
}

impl StoreConfig {
    pub fn new(node_id: impl Into<NodeId>, areas: impl IntoIterator<Item = String>) -> Self {
        Self {
            node_id: node_id.into(),
            areas: areas.into_iter().collect(),
            ..Self::default()
        }
    }
}
