//! Full-sync reconciliation: bring a newly added or errored peer to
//! parity while shipping the minimum possible bytes.
//!
//! A session fetches the peer's payload-less hash enumeration, diffs it
//! against the local database on the run loop, ships the records this
//! node dominates, fetches the records the peer dominates, and posts the
//! outcome back to the loop. Any transport error abandons the session and
//! collapses the peer to Idle; records already merged stay, which is safe
//! because dominance is monotone.

use std::cmp::Ordering;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::client::StoreClient;
use crate::db::AreaDb;
use crate::metrics::Counters;
use crate::store::Command;
use crate::types::{KeyDumpParams, KeyGetParams, KeySetParams, KeyVals, NodeId, PeerSpec};

/// Outcome of diffing the peer's hashes against the local database
#[derive(Debug, Default)]
pub struct SyncPlan {
    /// Records this node dominates: shipped to the peer in the finalize
    /// request
    pub give_to_peer: KeyVals,
    /// Keys the peer dominates (or we lack): fetched with their bodies
    pub need_from_peer: Vec<String>,
}

/// Diff the peer's hash enumeration against the local database.
///
/// Hash dumps carry no payloads, so ordering uses (version, originator);
/// on a tie the fingerprints decide equality. A tie with differing
/// fingerprints means the payloads differ - the key goes both ways and
/// the dominance rule settles it on each side.
pub fn compute_sync_plan(db: &AreaDb, their_hashes: &KeyVals) -> SyncPlan {
    let mut plan = SyncPlan::default();

    for (key, theirs) in their_hashes {
        match db.get(key) {
            None => plan.need_from_peer.push(key.clone()),
            Some(ours) => {
                let ord = ours
                    .version
                    .cmp(&theirs.version)
                    .then_with(|| ours.originator_id.cmp(&theirs.originator_id));
                match ord {
                    Ordering::Less => plan.need_from_peer.push(key.clone()),
                    Ordering::Greater => {
                        plan.give_to_peer.insert(key.clone(), ours.clone());
                    }
                    Ordering::Equal => {
                        if ours.fingerprint() != theirs.fingerprint() {
                            plan.need_from_peer.push(key.clone());
                            plan.give_to_peer.insert(key.clone(), ours.clone());
                        }
                    }
                }
            }
        }
    }

    for (key, ours) in db.iter() {
        if !their_hashes.contains_key(key) {
            plan.give_to_peer.insert(key.clone(), ours.clone());
        }
    }

    plan
}

/// Responder side of the reconciliation: given the requester's hashes,
/// the records of ours the requester should take
pub fn records_to_send(db: &AreaDb, their_hashes: &KeyVals) -> KeyVals {
    compute_sync_plan(db, their_hashes).give_to_peer
}

/// Start a full-sync session for one (area, peer) as a background task.
/// `session` identifies the peer entry incarnation; the run loop discards
/// completions whose token no longer matches.
pub(crate) fn spawn_full_sync<C: StoreClient>(
    client: C,
    cmd_tx: mpsc::UnboundedSender<Command>,
    counters: Arc<Counters>,
    node_id: NodeId,
    area: String,
    peer_name: String,
    spec: PeerSpec,
    session: u64,
) {
    tokio::spawn(async move {
        counters.num_full_sync.inc();
        info!(area, peer = peer_name, "Starting full sync with peer");

        match full_sync_session(
            &client, &cmd_tx, &counters, &node_id, &area, &peer_name, &spec, session,
        )
        .await
        {
            Ok(true) => {}
            Ok(false) => debug!(area, peer = peer_name, "Abandoning orphaned sync session"),
            Err(err) => {
                warn!(area, peer = peer_name, "Full sync with peer failed: {err:#}");
                let _ = cmd_tx.send(Command::SyncFailed {
                    area,
                    peer_name,
                    session,
                });
            }
        }
    });
}

/// One reconciliation round. Returns Ok(false) when the session turned
/// out to be orphaned and no completion should be reported.
#[allow(clippy::too_many_arguments)]
async fn full_sync_session<C: StoreClient>(
    client: &C,
    cmd_tx: &mpsc::UnboundedSender<Command>,
    counters: &Counters,
    node_id: &str,
    area: &str,
    peer_name: &str,
    spec: &PeerSpec,
    session: u64,
) -> Result<bool> {
    let dump_params = KeyDumpParams {
        sender_id: Some(node_id.to_string()),
        ..Default::default()
    };
    let their_hashes = client
        .dump_hashes(spec, area, dump_params)
        .await
        .context("Failed to dump hashes from peer")?
        .key_vals;

    // Diff happens on the run loop, against the live database
    let (plan_tx, plan_rx) = oneshot::channel();
    cmd_tx
        .send(Command::SyncPlan {
            area: area.to_string(),
            peer_name: peer_name.to_string(),
            session,
            their_hashes,
            resp: plan_tx,
        })
        .map_err(|_| anyhow!("Store stopped during sync"))?;
    let Some(plan) = plan_rx
        .await
        .map_err(|_| anyhow!("Store stopped during sync"))?
    else {
        return Ok(false);
    };

    debug!(
        area,
        peer = peer_name,
        give = plan.give_to_peer.len(),
        need = plan.need_from_peer.len(),
        "Computed sync plan"
    );

    if !plan.give_to_peer.is_empty() {
        counters.num_finalized_sync.inc();
        let params = KeySetParams {
            key_vals: plan.give_to_peer,
            node_ids: Some(vec![node_id.to_string()]),
            sender_id: Some(node_id.to_string()),
        };
        match client.set_key_vals(spec, area, params).await {
            Ok(()) => counters.num_finalized_sync_success.inc(),
            Err(err) => {
                counters.num_finalized_sync_failure.inc();
                return Err(err).context("Failed to finalize sync with peer");
            }
        }
    }

    let fetched = if plan.need_from_peer.is_empty() {
        KeyVals::new()
    } else {
        let params = KeyGetParams {
            keys: plan.need_from_peer,
        };
        client
            .get_key_vals(spec, area, params)
            .await
            .context("Failed to fetch records from peer")?
            .key_vals
    };

    let _ = cmd_tx.send(Command::SyncDone {
        area: area.to_string(),
        peer_name: peer_name.to_string(),
        session,
        fetched,
    });
    Ok(true)
}
