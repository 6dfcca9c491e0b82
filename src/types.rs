use std::cmp::Ordering;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Node identifier - an opaque string chosen by the operator
pub type NodeId = String;

/// Map of key to versioned record, the payload of every bulk operation
pub type KeyVals = HashMap<String, Value>;

/// Map of peer name to endpoint spec
pub type PeersMap = HashMap<String, PeerSpec>;

/// Versioned record, the unit of replication.
///
/// `version` is a monotonic counter per (area, key) chosen by the
/// originator. `value` may be absent (tombstone-like; the core never
/// garbage-collects). `ttl`/`ttl_version` are liveness hints carried
/// verbatim - expiration is a collaborator's concern.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Value {
    pub version: i64,
    pub originator_id: NodeId,
    pub value: Option<Vec<u8>>,
    pub ttl: i64,
    pub ttl_version: i64,
    /// Fingerprint over (version, originator_id, value); lets sync
    /// compare records without shipping the payload
    pub hash: Option<i64>,
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Value")
            .field("version", &self.version)
            .field("originator_id", &self.originator_id)
            .field("value", &self.value.is_some())
            .field("ttl", &self.ttl)
            .field("ttl_version", &self.ttl_version)
            .field("hash", &self.hash)
            .finish()
    }
}

impl Value {
    /// Create a new record with its fingerprint filled in
    pub fn new(version: i64, originator_id: impl Into<NodeId>, value: impl Into<Vec<u8>>) -> Self {
        let originator_id = originator_id.into();
        let value = Some(value.into());
        let hash = Some(fingerprint(version, &originator_id, value.as_deref()));
        Self {
            version,
            originator_id,
            value,
            ttl: 0,
            ttl_version: 0,
            hash,
        }
    }

    pub fn with_ttl(mut self, ttl: i64, ttl_version: i64) -> Self {
        self.ttl = ttl;
        self.ttl_version = ttl_version;
        self
    }

    /// Fingerprint of this record, computing it if the field is unset
    pub fn fingerprint(&self) -> i64 {
        self.hash.unwrap_or_else(|| {
            fingerprint(self.version, &self.originator_id, self.value.as_deref())
        })
    }

    /// Copy with the payload stripped and the fingerprint guaranteed present
    pub fn to_hash_only(&self) -> Self {
        let mut copy = self.clone();
        copy.hash = Some(self.fingerprint());
        copy.value = None;
        copy
    }
}

/// Deterministic fingerprint over the dominance-relevant record fields
pub fn fingerprint(version: i64, originator_id: &str, value: Option<&[u8]>) -> i64 {
    let encoded =
        bincode::serde::encode_to_vec(&(version, originator_id, value), bincode::config::standard())
            .unwrap_or_default();
    crc32fast::hash(&encoded) as i64
}

/// Compare two records of the same key under the dominance rule.
///
/// Higher version wins; ties break on originator id, then on the payload
/// bytes with an absent payload ordered below any present one. The result
/// is a total order, which is what makes merge order-independent.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match a.version.cmp(&b.version) {
        Ordering::Equal => match a.originator_id.cmp(&b.originator_id) {
            Ordering::Equal => a.value.cmp(&b.value),
            originator_ord => originator_ord,
        },
        version_ord => version_ord,
    }
}

/// Endpoint spec for reaching a peer's RPC surface.
///
/// `state` is advertised metadata: it is unset on the way in and filled
/// with the live state-machine state when peers are dumped back out.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerSpec {
    pub peer_addr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<PeerState>,
}

impl PeerSpec {
    pub fn new(peer_addr: impl Into<String>) -> Self {
        Self {
            peer_addr: peer_addr.into(),
            state: None,
        }
    }
}

/// Per-peer state machine state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum PeerState {
    Idle,
    Syncing,
    Initialized,
}

/// Events driving the peer state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEvent {
    PeerAdd,
    SyncRespRcvd,
    ApiError,
}

/// Incremental update as flooded between stores and delivered to
/// in-process subscribers.
///
/// `node_ids` is the ordered list of nodes this publication has already
/// traversed; a store refuses to re-flood through a node on the path.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Publication {
    pub area: String,
    pub key_vals: KeyVals,
    #[serde(default)]
    pub expired_keys: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<NodeId>,
    #[serde(default)]
    pub node_ids: Vec<NodeId>,
}

/// Item on the updates queue
#[derive(Debug, Clone)]
pub enum Update {
    Publication(Publication),
    /// One-shot marker emitted after the initial convergence window
    Synced,
}

/// Parameters for injecting or flooding key-vals
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeySetParams {
    pub key_vals: KeyVals,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_ids: Option<Vec<NodeId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<NodeId>,
}

/// Parameters for fetching specific keys
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyGetParams {
    pub keys: Vec<String>,
}

/// Parameters for enumerating keys.
///
/// With `key_val_hashes` set, the dump answers the reconciliation
/// question instead: "which of my records should the sender take".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyDumpParams {
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub originator_ids: Vec<NodeId>,
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_val_hashes: Option<KeyVals>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<NodeId>,
}

/// Record filter used by dumps: prefixes and originators compose with AND,
/// an empty dimension matches everything
#[derive(Debug, Clone, Default)]
pub struct KeyDumpFilter {
    prefixes: Vec<String>,
    originator_ids: Vec<NodeId>,
}

impl KeyDumpFilter {
    pub fn new(prefixes: Vec<String>, originator_ids: Vec<NodeId>) -> Self {
        Self {
            prefixes,
            originator_ids,
        }
    }

    pub fn from_params(params: &KeyDumpParams) -> Self {
        let mut prefixes = params.keys.clone();
        if prefixes.is_empty() && !params.prefix.is_empty() {
            prefixes.push(params.prefix.clone());
        }
        Self {
            prefixes,
            originator_ids: params.originator_ids.clone(),
        }
    }

    pub fn matches(&self, key: &str, value: &Value) -> bool {
        let prefix_ok =
            self.prefixes.is_empty() || self.prefixes.iter().any(|p| key.starts_with(p.as_str()));
        let originator_ok = self.originator_ids.is_empty()
            || self.originator_ids.contains(&value.originator_id);
        prefix_ok && originator_ok
    }
}

/// Per-area counts reported by `get_summary`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AreaSummary {
    pub area: String,
    pub key_vals_count: usize,
    pub key_vals_bytes: usize,
    pub peers_count: usize,
}
