use std::cmp::Ordering;
use std::collections::BTreeMap;

use tracing::{debug, trace};

use crate::types::{compare_values, fingerprint, KeyDumpFilter, KeyVals, NodeId, Value};

/// In-memory database for one area: key to dominant record.
///
/// Writes go through the dominance rule; the stored record for a key is
/// always the greatest record seen so far, which makes merging commutative
/// and delivery-order independent. Entries are never deleted by the core.
pub struct AreaDb {
    area: String,
    self_node_id: NodeId,
    /// BTreeMap for prefix scanning support
    data: BTreeMap<String, Value>,
}

impl AreaDb {
    pub fn new(area: impl Into<String>, self_node_id: impl Into<NodeId>) -> Self {
        Self {
            area: area.into(),
            self_node_id: self_node_id.into(),
            data: BTreeMap::new(),
        }
    }

    pub fn area(&self) -> &str {
        &self.area
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Apply one incoming record under the dominance rule.
    ///
    /// Returns true iff the record was accepted (it dominates the stored
    /// one, or the key is new). An exact dominance tie with a strictly
    /// larger ttl_version refreshes the stored ttl in place; that is not
    /// an accept and produces no publication downstream.
    pub fn set(&mut self, key: &str, incoming: Value) -> bool {
        match self.data.get_mut(key) {
            None => {
                trace!(area = self.area, key, "Storing first record for key");
                self.data.insert(key.to_string(), filled(incoming));
                true
            }
            Some(existing) => match compare_values(existing, &incoming) {
                Ordering::Less => {
                    trace!(area = self.area, key, "Incoming record dominates");
                    *existing = filled(incoming);
                    true
                }
                Ordering::Equal => {
                    if incoming.ttl_version > existing.ttl_version {
                        existing.ttl = incoming.ttl;
                        existing.ttl_version = incoming.ttl_version;
                    }
                    debug!(area = self.area, key, "Rejecting equal record");
                    false
                }
                Ordering::Greater => {
                    debug!(
                        area = self.area,
                        key,
                        stored_version = existing.version,
                        incoming_version = incoming.version,
                        "Rejecting dominated record"
                    );
                    false
                }
            },
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Enumerate records matching the filter
    pub fn dump(&self, filter: &KeyDumpFilter) -> KeyVals {
        self.data
            .iter()
            .filter(|(k, v)| filter.matches(k, v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Enumerate matching-prefix records with payloads stripped.
    ///
    /// Uses the BTreeMap range to scan only the prefix span.
    pub fn dump_hashes(&self, prefix: &str) -> KeyVals {
        let mut result = KeyVals::new();
        for (k, v) in self.data.range(prefix.to_string()..) {
            if !k.starts_with(prefix) {
                break;
            }
            result.insert(k.clone(), v.to_hash_only());
        }
        result
    }

    /// Records this node originated
    pub fn dump_self_originated(&self) -> KeyVals {
        self.data
            .iter()
            .filter(|(_, v)| v.originator_id == self.self_node_id)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Apply a delta under the dominance rule; returns the accepted keys
    /// in a deterministic order for downstream publication and flooding
    pub fn merge(&mut self, delta: KeyVals) -> Vec<String> {
        let mut delta: Vec<(String, Value)> = delta.into_iter().collect();
        delta.sort_by(|(a, _), (b, _)| a.cmp(b));

        let mut accepted = Vec::new();
        for (key, value) in delta {
            if self.set(&key, value) {
                accepted.push(key);
            }
        }
        accepted
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.data.iter()
    }

    /// Total encoded size of all records, for area summaries
    pub fn encoded_bytes(&self) -> usize {
        self.data
            .iter()
            .map(|(k, v)| {
                k.len()
                    + bincode::serde::encode_to_vec(v, bincode::config::standard())
                        .map(|buf| buf.len())
                        .unwrap_or(0)
            })
            .sum()
    }
}

/// Records are stored with their fingerprint recomputed from the actual
/// fields, so hash dumps never recompute per request and a peer-supplied
/// fingerprint can never go stale in the map
fn filled(mut value: Value) -> Value {
    value.hash = Some(fingerprint(
        value.version,
        &value.originator_id,
        value.value.as_deref(),
    ));
    value
}
