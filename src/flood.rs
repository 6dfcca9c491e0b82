//! Dissemination of accepted records to initialized peers.
//!
//! Every accepted write or delta produces one publication whose
//! `node_ids` path grows by the local node; peers already on the path
//! (and the node the update came from) are never sent to, which keeps
//! flooding loop-free even on cyclic topologies.

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::client::StoreClient;
use crate::store::Command;
use crate::types::{KeySetParams, KeyVals, NodeId, PeerSpec, Publication};

/// Build the outbound publication for a set of accepted records.
///
/// The path is the incoming path with the local node appended; duplicates
/// are dropped so the path can never revisit a node.
pub fn build_publication(
    area: &str,
    key_vals: KeyVals,
    incoming_node_ids: Option<Vec<NodeId>>,
    sender_id: Option<NodeId>,
    self_node_id: &str,
) -> Publication {
    let mut node_ids: Vec<NodeId> = Vec::new();
    for id in incoming_node_ids.unwrap_or_default() {
        if !node_ids.contains(&id) {
            node_ids.push(id);
        }
    }
    if !node_ids.iter().any(|id| id == self_node_id) {
        node_ids.push(self_node_id.to_string());
    }

    Publication {
        area: area.to_string(),
        key_vals,
        expired_keys: Vec::new(),
        sender_id,
        node_ids,
    }
}

/// Send a publication to the selected peers, one fire-and-forget task
/// per peer. A failed send reports the peer back to the run loop, which
/// evicts it from flooding until the next sync cycle.
pub(crate) fn spawn_floods<C: StoreClient>(
    client: &C,
    cmd_tx: &mpsc::UnboundedSender<Command>,
    self_node_id: &str,
    publication: &Publication,
    targets: Vec<(String, PeerSpec)>,
) {
    for (peer_name, spec) in targets {
        let params = KeySetParams {
            key_vals: publication.key_vals.clone(),
            node_ids: Some(publication.node_ids.clone()),
            sender_id: Some(self_node_id.to_string()),
        };
        let area = publication.area.clone();
        let client = client.clone();
        let cmd_tx = cmd_tx.clone();

        debug!(
            area,
            peer = peer_name,
            keys = params.key_vals.len(),
            "Flooding publication to peer"
        );
        tokio::spawn(async move {
            if let Err(err) = client.set_key_vals(&spec, &area, params).await {
                warn!(area, peer = peer_name, "Flood to peer failed: {err:#}");
                let _ = cmd_tx.send(Command::FloodFailed { area, peer_name });
            }
        });
    }
}
