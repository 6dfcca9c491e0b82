use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::Duration;

use tokio::time::{sleep, timeout, Instant};

use crate::client::{HttpStoreClient, LocalStoreClient, StoreClient};
use crate::config::StoreConfig;
use crate::db::AreaDb;
use crate::peers::next_state;
use crate::store::Store;
use crate::sync::compute_sync_plan;
use crate::types::{
    compare_values, KeyDumpFilter, KeyDumpParams, KeyVals, PeerEvent, PeerSpec, PeerState, Value,
};

const AREA: &str = "test-area";

fn local_addr(node_id: &str) -> String {
    format!("{node_id}.local")
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

async fn create_store(client: &LocalStoreClient, node_id: &str) -> Store<LocalStoreClient> {
    init_tracing();
    let mut config = StoreConfig::new(node_id, vec![AREA.to_string()]);
    config.sync_retry_min = Duration::from_millis(50);
    config.sync_retry_max = Duration::from_millis(500);
    let mut store = Store::new(config, client.clone());
    store.run().await.unwrap();
    client.register(local_addr(node_id), store.handle());
    store
}

async fn verify_key<C: StoreClient>(
    store: &Store<C>,
    area: &str,
    key: &str,
    expected: &Value,
) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if let Some(value) = store.get_key(area, key).await {
            if &value == expected {
                return true;
            }
        }
        sleep(Duration::from_millis(10)).await;
    }
    false
}

async fn verify_peer_state<C: StoreClient>(
    store: &Store<C>,
    area: &str,
    peer: &str,
    expected: PeerState,
) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if store.get_peer_state(area, peer).await == Some(expected) {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    false
}

#[test]
fn test_dominance_rule() {
    // Larger version dominates
    let v1 = Value::new(1, "node-1", b"a".to_vec());
    let v2 = Value::new(2, "node-1", b"a".to_vec());
    assert_eq!(compare_values(&v1, &v2), Ordering::Less);
    assert_eq!(compare_values(&v2, &v1), Ordering::Greater);

    // Version tie: lexicographically larger originator dominates
    let a = Value::new(5, "node-1", b"x".to_vec());
    let b = Value::new(5, "node-2", b"x".to_vec());
    assert_eq!(compare_values(&a, &b), Ordering::Less);

    // Full tie on (version, originator): larger value dominates, absent
    // ordered below present
    let small = Value::new(5, "node-1", b"aaa".to_vec());
    let big = Value::new(5, "node-1", b"aab".to_vec());
    assert_eq!(compare_values(&small, &big), Ordering::Less);

    let mut absent = Value::new(5, "node-1", b"aaa".to_vec());
    absent.value = None;
    assert_eq!(compare_values(&absent, &small), Ordering::Less);

    // Exact equality
    let x = Value::new(3, "node-1", b"v".to_vec());
    let y = Value::new(3, "node-1", b"v".to_vec());
    assert_eq!(compare_values(&x, &y), Ordering::Equal);
}

#[test]
fn test_dominance_transitivity() {
    let records = [
        Value::new(1, "node-1", b"a".to_vec()),
        Value::new(1, "node-2", b"a".to_vec()),
        Value::new(2, "node-1", b"a".to_vec()),
        Value::new(2, "node-1", b"b".to_vec()),
    ];
    for x in &records {
        for y in &records {
            for z in &records {
                if compare_values(x, y) == Ordering::Less
                    && compare_values(y, z) == Ordering::Less
                {
                    assert_eq!(compare_values(x, z), Ordering::Less);
                }
            }
        }
    }
}

#[test]
fn test_state_transitions() {
    use PeerEvent::*;
    use PeerState::*;

    assert_eq!(next_state(Idle, PeerAdd), Syncing);
    assert_eq!(next_state(Syncing, SyncRespRcvd), Initialized);
    assert_eq!(next_state(Syncing, ApiError), Idle);
    assert_eq!(next_state(Initialized, SyncRespRcvd), Initialized);
    assert_eq!(next_state(Initialized, ApiError), Idle);

    // SyncRespRcvd is idempotent from Initialized
    let state = next_state(Initialized, SyncRespRcvd);
    assert_eq!(next_state(state, SyncRespRcvd), Initialized);

    // Every (state, event) pair is defined
    for state in [Idle, Syncing, Initialized] {
        for event in [PeerAdd, SyncRespRcvd, ApiError] {
            let _ = next_state(state, event);
        }
    }
}

#[test]
fn test_area_db_dominance() {
    let mut db = AreaDb::new(AREA, "node-1");

    // First write for a key is accepted
    assert!(db.set("key1", Value::new(1, "node-1", b"v1".to_vec())));

    // Dominated and equal records are rejected
    assert!(!db.set("key1", Value::new(1, "node-1", b"v1".to_vec())));
    let older = Value::new(0, "node-1", b"newer-but-lower-version".to_vec());
    assert!(!db.set("key1", older));
    assert_eq!(db.get("key1").unwrap().value.as_deref(), Some(&b"v1"[..]));

    // Dominant record replaces
    assert!(db.set("key1", Value::new(2, "node-2", b"v2".to_vec())));
    assert_eq!(db.get("key1").unwrap().version, 2);
}

#[test]
fn test_area_db_merge_returns_accepted() {
    let mut db = AreaDb::new(AREA, "node-1");
    db.set("key1", Value::new(5, "node-1", b"mine".to_vec()));

    let delta = KeyVals::from([
        (
            "key1".to_string(),
            Value::new(1, "node-2", b"stale".to_vec()),
        ),
        ("key2".to_string(), Value::new(1, "node-2", b"new".to_vec())),
    ]);
    let accepted = db.merge(delta);
    assert_eq!(accepted, vec!["key2".to_string()]);
    assert_eq!(db.get("key1").unwrap().version, 5);
    assert_eq!(db.get("key2").unwrap().version, 1);
}

#[test]
fn test_area_db_dumps() {
    let mut db = AreaDb::new(AREA, "node-1");
    db.set("prefix:a", Value::new(1, "node-1", b"1".to_vec()));
    db.set("prefix:b", Value::new(1, "node-2", b"2".to_vec()));
    db.set("other:c", Value::new(1, "node-2", b"3".to_vec()));

    // Prefix filter
    let params = KeyDumpParams {
        prefix: "prefix:".to_string(),
        ..Default::default()
    };
    let dumped = db.dump(&KeyDumpFilter::from_params(&params));
    assert_eq!(dumped.len(), 2);

    // Originator filter composes with prefix
    let params = KeyDumpParams {
        prefix: "prefix:".to_string(),
        originator_ids: vec!["node-2".to_string()],
        ..Default::default()
    };
    let dumped = db.dump(&KeyDumpFilter::from_params(&params));
    assert_eq!(dumped.len(), 1);
    assert!(dumped.contains_key("prefix:b"));

    // Hash dumps strip payloads but keep fingerprints
    let hashes = db.dump_hashes("");
    assert_eq!(hashes.len(), 3);
    for value in hashes.values() {
        assert!(value.value.is_none());
        assert!(value.hash.is_some());
    }

    // Self-originated subset
    let own = db.dump_self_originated();
    assert_eq!(own.len(), 1);
    assert!(own.contains_key("prefix:a"));
}

#[test]
fn test_area_db_ttl_refresh() {
    let mut db = AreaDb::new(AREA, "node-1");
    db.set("key1", Value::new(1, "node-1", b"v".to_vec()).with_ttl(1000, 1));

    // Same record with a larger ttl_version refreshes the ttl in place
    // without being an accept
    let refreshed = Value::new(1, "node-1", b"v".to_vec()).with_ttl(9000, 2);
    assert!(!db.set("key1", refreshed));
    let stored = db.get("key1").unwrap();
    assert_eq!(stored.ttl, 9000);
    assert_eq!(stored.ttl_version, 2);

    // A stale ttl_version does not roll the ttl back
    let stale = Value::new(1, "node-1", b"v".to_vec()).with_ttl(5, 1);
    assert!(!db.set("key1", stale));
    assert_eq!(db.get("key1").unwrap().ttl, 9000);
}

//
// Sync-plan diff, mirroring the unidirectional reconciliation data set:
// ours   has (k0, 5, a), (k1, 1, a), (k2, 9, a), (k3, 1, a)
// theirs has             (k1, 1, a), (k2, 1, b), (k3, 9, b), (k4, 6, b)
//
#[test]
fn test_compute_sync_plan() {
    let mut db = AreaDb::new(AREA, "node-a");
    db.set("k0", Value::new(5, "a", b"value-1".to_vec()));
    db.set("k1", Value::new(1, "a", b"value-1".to_vec()));
    db.set("k2", Value::new(9, "a", b"value-1".to_vec()));
    db.set("k3", Value::new(1, "a", b"value-1".to_vec()));

    let theirs = KeyVals::from([
        (
            "k1".to_string(),
            Value::new(1, "a", b"value-1".to_vec()).to_hash_only(),
        ),
        (
            "k2".to_string(),
            Value::new(1, "b", b"value-2".to_vec()).to_hash_only(),
        ),
        (
            "k3".to_string(),
            Value::new(9, "b", b"value-2".to_vec()).to_hash_only(),
        ),
        (
            "k4".to_string(),
            Value::new(6, "b", b"value-2".to_vec()).to_hash_only(),
        ),
    ]);

    let plan = compute_sync_plan(&db, &theirs);

    let mut need = plan.need_from_peer.clone();
    need.sort();
    assert_eq!(need, vec!["k3".to_string(), "k4".to_string()]);

    let mut give: Vec<&str> = plan.give_to_peer.keys().map(String::as_str).collect();
    give.sort();
    assert_eq!(give, vec!["k0", "k2"]);
}

#[test]
fn test_sync_plan_hash_mismatch_goes_both_ways() {
    let mut db = AreaDb::new(AREA, "node-a");
    db.set("k", Value::new(1, "a", b"ours".to_vec()));

    // Same (version, originator) but a different payload fingerprint:
    // neither side can order without the bodies, so the key is exchanged
    // in both directions
    let theirs = KeyVals::from([(
        "k".to_string(),
        Value::new(1, "a", b"theirs".to_vec()).to_hash_only(),
    )]);
    let plan = compute_sync_plan(&db, &theirs);
    assert_eq!(plan.need_from_peer, vec!["k".to_string()]);
    assert!(plan.give_to_peer.contains_key("k"));

    // Matching fingerprints mean equal records: nothing moves
    let theirs = KeyVals::from([(
        "k".to_string(),
        Value::new(1, "a", b"ours".to_vec()).to_hash_only(),
    )]);
    let plan = compute_sync_plan(&db, &theirs);
    assert!(plan.need_from_peer.is_empty());
    assert!(plan.give_to_peer.is_empty());
}

#[tokio::test]
async fn test_basic_set_get() {
    let client = LocalStoreClient::new();
    let mut store = create_store(&client, "node-1").await;

    let value = Value::new(1, "node-1", b"value1".to_vec());
    assert!(store.set_key(AREA, "key1", value.clone(), None).await);
    assert_eq!(store.get_key(AREA, "key1").await, Some(value));
    assert_eq!(store.get_key(AREA, "missing").await, None);

    // Unknown areas are caller errors, reported as false
    let value = Value::new(1, "node-1", b"value1".to_vec());
    assert!(!store.set_key("bogus-area", "key1", value, None).await);

    store.stop().await;
}

#[tokio::test]
async fn test_accepted_write_is_published() {
    let client = LocalStoreClient::new();
    let mut store = create_store(&client, "node-1").await;

    let value = Value::new(1, "node-1", b"value1".to_vec());
    store.set_key(AREA, "key1", value.clone(), None).await;

    let publication = store.recv_publication().await.unwrap();
    assert_eq!(publication.area, AREA);
    assert_eq!(publication.key_vals.get("key1"), Some(&value));
    assert_eq!(publication.node_ids, vec!["node-1".to_string()]);

    // A dominated write is not an accept and produces no publication
    let stale = Value::new(0, "node-1", b"stale".to_vec());
    store.set_key(AREA, "key1", stale, None).await;
    let next = timeout(Duration::from_millis(300), store.recv_publication()).await;
    assert!(next.is_err());

    store.stop().await;
}

#[tokio::test]
async fn test_push_to_updates_queue() {
    let client = LocalStoreClient::new();
    let mut store = create_store(&client, "node-1").await;

    let key_vals = KeyVals::from([(
        "injected".to_string(),
        Value::new(7, "elsewhere", b"x".to_vec()),
    )]);
    store
        .push_to_updates_queue(AREA, key_vals.clone())
        .await
        .unwrap();

    let publication = store.recv_publication().await.unwrap();
    assert_eq!(publication.area, AREA);
    assert_eq!(publication.key_vals, key_vals);

    store.stop().await;
}

#[tokio::test]
async fn test_recv_fails_after_queue_close() {
    let client = LocalStoreClient::new();
    let mut store = create_store(&client, "node-1").await;

    store.close_queue();
    assert!(store.recv_publication().await.is_err());
    assert!(store.recv_kvstore_synced_signal().await.is_err());

    store.stop().await;
}

//
// Positive case for the initial full sync: two stores, each holding one
// key, peer each other and converge to both keys.
//
#[tokio::test]
async fn test_initial_full_sync() {
    let client = LocalStoreClient::new();
    let mut store1 = create_store(&client, "node-1").await;
    let mut store2 = create_store(&client, "node-2").await;

    let val1 = Value::new(1, "node-1", b"value1".to_vec());
    let val2 = Value::new(2, "node-2", b"value2".to_vec());
    assert!(store1.set_key(AREA, "key1", val1.clone(), None).await);
    assert!(store2.set_key(AREA, "key2", val2.clone(), None).await);

    // Keys are mutually exclusive before peering
    assert!(store1.get_key(AREA, "key2").await.is_none());
    assert!(store2.get_key(AREA, "key1").await.is_none());

    assert!(
        store1
            .add_peer(AREA, "node-2", PeerSpec::new(local_addr("node-2")))
            .await
    );
    assert!(
        store2
            .add_peer(AREA, "node-1", PeerSpec::new(local_addr("node-1")))
            .await
    );

    assert!(verify_peer_state(&store1, AREA, "node-2", PeerState::Initialized).await);
    assert!(verify_peer_state(&store2, AREA, "node-1", PeerState::Initialized).await);

    assert!(verify_key(&store1, AREA, "key2", &val2).await);
    assert!(verify_key(&store2, AREA, "key1", &val1).await);

    assert_eq!(store1.dump_all(AREA, None).await.unwrap().len(), 2);
    assert_eq!(store2.dump_all(AREA, None).await.unwrap().len(), 2);

    // Peer dumps advertise the live state
    let peers = store1.get_peers(AREA).await.unwrap();
    assert_eq!(peers.len(), 1);
    let spec = peers.get("node-2").unwrap();
    assert_eq!(spec.peer_addr, local_addr("node-2"));
    assert_eq!(spec.state, Some(PeerState::Initialized));

    store1.stop().await;
    store2.stop().await;
}

//
// Updating a peer entry restarts the state machine and re-syncs,
// regardless of whether the spec changed.
//
#[tokio::test]
async fn test_peer_replace_resyncs() {
    let client = LocalStoreClient::new();
    let mut store1 = create_store(&client, "node-1").await;
    let mut store2 = create_store(&client, "node-2").await;

    let val2 = Value::new(2, "node-2", b"value2".to_vec());
    store2.set_key(AREA, "key2", val2.clone(), None).await;

    store1
        .add_peer(AREA, "node-2", PeerSpec::new(local_addr("node-2")))
        .await;
    assert!(verify_peer_state(&store1, AREA, "node-2", PeerState::Initialized).await);

    // Tear store2 down and bring a fresh instance up under a new address
    store2.stop().await;
    client.unregister(&local_addr("node-2"));

    let mut store2 = {
        let mut config = StoreConfig::new("node-2", vec![AREA.to_string()]);
        config.sync_retry_min = Duration::from_millis(50);
        let mut store = Store::new(config, client.clone());
        store.run().await.unwrap();
        client.register("node-2-replacement.local", store.handle());
        store
    };
    let new_val = Value::new(3, "node-2", b"value3".to_vec());
    store2
        .set_key(AREA, "key2-new", new_val.clone(), None)
        .await;

    // Re-add under the new spec: restart from Idle, another full sync
    assert!(
        store1
            .add_peer(AREA, "node-2", PeerSpec::new("node-2-replacement.local"))
            .await
    );
    assert!(verify_peer_state(&store1, AREA, "node-2", PeerState::Initialized).await);
    assert!(verify_key(&store1, AREA, "key2-new", &new_val).await);

    let peers = store1.get_peers(AREA).await.unwrap();
    assert_eq!(
        peers.get("node-2").unwrap().peer_addr,
        "node-2-replacement.local"
    );

    // Remove peers
    assert!(store1.del_peer(AREA, "node-2").await);
    assert_eq!(store1.get_peers(AREA).await.unwrap().len(), 0);

    store1.stop().await;
    store2.stop().await;
}

//
// Negative case: peer specs point nowhere, so the full sync keeps
// failing and no keys are exchanged.
//
#[tokio::test]
async fn test_full_sync_with_unreachable_peer() {
    let client = LocalStoreClient::new();
    let mut store1 = create_store(&client, "node-1").await;
    let mut store2 = create_store(&client, "node-2").await;

    let val1 = Value::new(1, "node-1", b"value1".to_vec());
    let val2 = Value::new(2, "node-2", b"value2".to_vec());
    store1.set_key(AREA, "key1", val1.clone(), None).await;
    store2.set_key(AREA, "key2", val2.clone(), None).await;

    // Addresses with no store behind them
    assert!(
        store1
            .add_peer(AREA, "node-2", PeerSpec::new("unreachable-2.local"))
            .await
    );
    assert!(
        store2
            .add_peer(AREA, "node-1", PeerSpec::new("unreachable-1.local"))
            .await
    );

    sleep(Duration::from_millis(500)).await;

    // No exchange happened; the peers flap between Syncing and Idle but
    // never reach Initialized
    assert!(store1.get_key(AREA, "key2").await.is_none());
    assert!(store2.get_key(AREA, "key1").await.is_none());
    assert_eq!(store1.dump_all(AREA, None).await.unwrap().len(), 1);
    assert_eq!(store2.dump_all(AREA, None).await.unwrap().len(), 1);

    let state = store1.get_peer_state(AREA, "node-2").await.unwrap();
    assert!(matches!(state, PeerState::Idle | PeerState::Syncing));
    assert!(store1.counters().num_full_sync_failure.get() >= 1);
    assert_eq!(store1.counters().num_full_sync_success.get(), 0);

    store1.stop().await;
    store2.stop().await;
}

//
// Correctness of the 3-way full sync, one-way peering:
//
// store1 has (k0, 5, a), (k1, 1, a), (k2, 9, a), (k3, 1, a)
// store2 has             (k1, 1, a), (k2, 1, b), (k3, 9, b), (k4, 6, b)
//
// After store1 full-syncs with store2, both hold:
// (k0, 5, a), (k1, 1, a), (k2, 9, a), (k3, 9, b), (k4, 6, b)
//
#[tokio::test]
async fn test_unidirectional_full_sync() {
    let client = LocalStoreClient::new();
    let mut store1 = create_store(&client, "node-a").await;
    let mut store2 = create_store(&client, "node-b").await;

    let value1 = b"value-1".to_vec();
    let value2 = b"value-2".to_vec();

    for (key, version) in [("k0", 5), ("k1", 1), ("k2", 9), ("k3", 1)] {
        let val = Value::new(version, "a", value1.clone());
        assert!(store1.set_key(AREA, key, val, None).await);
    }
    for (key, version, originator) in
        [("k1", 1, "a"), ("k2", 1, "b"), ("k3", 9, "b"), ("k4", 6, "b")]
    {
        let payload = if key == "k1" {
            value1.clone()
        } else {
            value2.clone()
        };
        let val = Value::new(version, originator, payload);
        assert!(store2.set_key(AREA, key, val, None).await);
    }

    // One-way peering only
    assert!(
        store1
            .add_peer(AREA, "node-b", PeerSpec::new(local_addr("node-b")))
            .await
    );
    assert!(verify_peer_state(&store1, AREA, "node-b", PeerState::Initialized).await);

    let expected = [
        ("k0", 5, "a", value1.clone()),
        ("k1", 1, "a", value1.clone()),
        ("k2", 9, "a", value1.clone()),
        ("k3", 9, "b", value2.clone()),
        ("k4", 6, "b", value2.clone()),
    ];
    for (key, version, originator, payload) in expected {
        let want = Value::new(version, originator, payload);
        assert!(verify_key(&store1, AREA, key, &want).await, "store1 {key}");
        assert!(verify_key(&store2, AREA, key, &want).await, "store2 {key}");
    }
    assert_eq!(store1.dump_all(AREA, None).await.unwrap().len(), 5);
    assert_eq!(store2.dump_all(AREA, None).await.unwrap().len(), 5);

    // Exactly one full sync ran, with one finalize leg
    let counters = store1.counters();
    assert_eq!(counters.num_full_sync.get(), 1);
    assert_eq!(counters.num_full_sync_success.get(), 1);
    assert_eq!(counters.num_full_sync_failure.get(), 0);
    assert_eq!(counters.num_finalized_sync.get(), 1);
    assert_eq!(counters.num_finalized_sync_success.get(), 1);
    assert_eq!(counters.num_finalized_sync_failure.get(), 0);

    store1.stop().await;
    store2.stop().await;
}

//
// Flooding: once peers are initialized, a fresh write on one store shows
// up on the other without any further sync.
//
#[tokio::test]
async fn test_flooding_after_sync() {
    let client = LocalStoreClient::new();
    let mut store1 = create_store(&client, "node-1").await;
    let mut store2 = create_store(&client, "node-2").await;

    let val1 = Value::new(1, "node-1", b"value1".to_vec());
    let val2 = Value::new(2, "node-2", b"value2".to_vec());
    store1.set_key(AREA, "key1", val1.clone(), None).await;
    store2.set_key(AREA, "key2", val2.clone(), None).await;

    store1
        .add_peer(AREA, "node-2", PeerSpec::new(local_addr("node-2")))
        .await;
    store2
        .add_peer(AREA, "node-1", PeerSpec::new(local_addr("node-1")))
        .await;
    assert!(verify_key(&store1, AREA, "key2", &val2).await);
    assert!(verify_key(&store2, AREA, "key1", &val1).await);

    let val3 = Value::new(3, "node-2", b"value3".to_vec());
    assert!(store2.set_key(AREA, "key3", val3.clone(), None).await);
    assert!(verify_key(&store1, AREA, "key3", &val3).await);

    assert_eq!(store1.dump_all(AREA, None).await.unwrap().len(), 3);
    assert_eq!(store2.dump_all(AREA, None).await.unwrap().len(), 3);

    store1.stop().await;
    store2.stop().await;
}

//
// Ring topology: node1 -> node2 -> node3 -> node1, where an arrow means
// "has as peer". One key injected at each node reaches every node, and
// the traversed-node path keeps the ring loop-free.
//
#[tokio::test]
async fn test_ring_topology_flooding() {
    let client = LocalStoreClient::new();
    let mut store1 = create_store(&client, "node-1").await;
    let mut store2 = create_store(&client, "node-2").await;
    let mut store3 = create_store(&client, "node-3").await;

    store1
        .add_peer(AREA, "node-2", PeerSpec::new(local_addr("node-2")))
        .await;
    store2
        .add_peer(AREA, "node-3", PeerSpec::new(local_addr("node-3")))
        .await;
    store3
        .add_peer(AREA, "node-1", PeerSpec::new(local_addr("node-1")))
        .await;

    assert!(verify_peer_state(&store1, AREA, "node-2", PeerState::Initialized).await);
    assert!(verify_peer_state(&store2, AREA, "node-3", PeerState::Initialized).await);
    assert!(verify_peer_state(&store3, AREA, "node-1", PeerState::Initialized).await);
    assert_eq!(store1.dump_all(AREA, None).await.unwrap().len(), 0);

    let val1 = Value::new(1, "node-1", b"value1".to_vec());
    let val2 = Value::new(2, "node-2", b"value2".to_vec());
    let val3 = Value::new(3, "node-3", b"value3".to_vec());
    assert!(store1.set_key(AREA, "key-1", val1.clone(), None).await);
    assert!(store2.set_key(AREA, "key-2", val2.clone(), None).await);
    assert!(store3.set_key(AREA, "key-3", val3.clone(), None).await);

    for store in [&store1, &store2, &store3] {
        assert!(verify_key(store, AREA, "key-1", &val1).await);
        assert!(verify_key(store, AREA, "key-2", &val2).await);
        assert!(verify_key(store, AREA, "key-3", &val3).await);
        assert_eq!(store.dump_all(AREA, None).await.unwrap().len(), 3);
    }

    // Loop freedom: no publication path ever revisits a node
    for _ in 0..3 {
        let publication = store1.recv_publication().await.unwrap();
        let mut path = publication.node_ids.clone();
        path.sort();
        path.dedup();
        assert_eq!(path.len(), publication.node_ids.len());
    }

    store1.stop().await;
    store2.stop().await;
    store3.stop().await;
}

//
// The synced signal: emitted immediately with no configured peers,
// emitted after the first pass through configured peers otherwise, and
// never emitted twice.
//
#[tokio::test]
async fn test_synced_signal_no_peers() {
    let client = LocalStoreClient::new();
    let mut store = create_store(&client, "node-1").await;

    timeout(Duration::from_secs(1), store.recv_kvstore_synced_signal())
        .await
        .expect("synced signal not emitted")
        .unwrap();

    store.stop().await;
}

#[tokio::test]
async fn test_synced_signal_with_configured_peers() {
    let client = LocalStoreClient::new();
    let mut store2 = create_store(&client, "node-2").await;
    let val2 = Value::new(2, "node-2", b"value2".to_vec());
    store2.set_key(AREA, "key2", val2.clone(), None).await;

    let mut config = StoreConfig::new("node-1", vec![AREA.to_string()]);
    config.initial_peers.insert(
        AREA.to_string(),
        HashMap::from([("node-2".to_string(), PeerSpec::new(local_addr("node-2")))]),
    );
    let mut store1 = Store::new(config, client.clone());
    client.register(local_addr("node-1"), store1.handle());
    store1.run().await.unwrap();

    timeout(Duration::from_secs(5), store1.recv_kvstore_synced_signal())
        .await
        .expect("synced signal not emitted")
        .unwrap();

    // By the time the signal fires the configured peer finished its first
    // sync pass
    assert_eq!(
        store1.get_peer_state(AREA, "node-2").await,
        Some(PeerState::Initialized)
    );
    assert!(verify_key(&store1, AREA, "key2", &val2).await);

    // At most once: no second signal, even after more peer activity
    store1.del_peer(AREA, "node-2").await;
    store1
        .add_peer(AREA, "node-2", PeerSpec::new(local_addr("node-2")))
        .await;
    let second = timeout(
        Duration::from_millis(300),
        store1.recv_kvstore_synced_signal(),
    )
    .await;
    assert!(second.is_err());

    store1.stop().await;
    store2.stop().await;
}

//
// Areas are isolation domains: records and peers in one area are
// invisible to the other.
//
#[tokio::test]
async fn test_area_isolation() {
    let client = LocalStoreClient::new();
    let mut config = StoreConfig::new("node-1", vec!["area-1".to_string(), "area-2".to_string()]);
    config.sync_retry_min = Duration::from_millis(50);
    let mut store = Store::new(config, client.clone());
    store.run().await.unwrap();
    client.register(local_addr("node-1"), store.handle());

    let value = Value::new(1, "node-1", b"v".to_vec());
    assert!(store.set_key("area-1", "key1", value.clone(), None).await);
    assert_eq!(store.get_key("area-1", "key1").await, Some(value));
    assert!(store.get_key("area-2", "key1").await.is_none());

    assert!(
        store
            .add_peer("area-1", "node-2", PeerSpec::new("peer.local"))
            .await
    );
    assert_eq!(store.get_peers("area-1").await.unwrap().len(), 1);
    assert_eq!(store.get_peers("area-2").await.unwrap().len(), 0);

    let summaries = store.get_summary(vec![]).await.unwrap();
    assert_eq!(summaries.len(), 2);
    let area1 = summaries.iter().find(|s| s.area == "area-1").unwrap();
    assert_eq!(area1.key_vals_count, 1);
    assert_eq!(area1.peers_count, 1);
    assert!(area1.key_vals_bytes > 0);
    let area2 = summaries.iter().find(|s| s.area == "area-2").unwrap();
    assert_eq!(area2.key_vals_count, 0);

    let selected = store.get_summary(vec!["area-2".to_string()]).await.unwrap();
    assert_eq!(selected.len(), 1);
    assert_eq!(selected[0].area, "area-2");

    store.stop().await;
}

//
// Round-trip law: a hash dump plus fetching the missing bodies reproduces
// the responder's full map.
//
#[tokio::test]
async fn test_hash_dump_round_trip() {
    let client = LocalStoreClient::new();
    let mut store = create_store(&client, "node-1").await;

    for (key, version) in [("k1", 1), ("k2", 2), ("k3", 3)] {
        let val = Value::new(version, "node-1", format!("value-{version}").into_bytes());
        store.set_key(AREA, key, val, None).await;
    }

    let hashes = store.dump_hashes(AREA, "").await.unwrap();
    assert_eq!(hashes.len(), 3);

    // An empty map against those hashes asks for everything
    let empty_db = AreaDb::new(AREA, "probe");
    let plan = compute_sync_plan(&empty_db, &hashes);
    assert_eq!(plan.need_from_peer.len(), 3);
    assert!(plan.give_to_peer.is_empty());

    // sync_key_vals with our own hashes returns nothing new
    let full = store.dump_all(AREA, None).await.unwrap();
    let own_hashes: KeyVals = full
        .iter()
        .map(|(k, v)| (k.clone(), v.to_hash_only()))
        .collect();
    let missing = store.sync_key_vals(AREA, own_hashes).await.unwrap();
    assert!(missing.is_empty());

    store.stop().await;
}

#[tokio::test]
async fn test_dump_self_originated() {
    let client = LocalStoreClient::new();
    let mut store1 = create_store(&client, "node-1").await;
    let mut store2 = create_store(&client, "node-2").await;

    let own = Value::new(1, "node-1", b"mine".to_vec());
    let foreign = Value::new(1, "node-2", b"theirs".to_vec());
    store1.set_key(AREA, "own-key", own.clone(), None).await;
    store2.set_key(AREA, "foreign-key", foreign, None).await;

    store1
        .add_peer(AREA, "node-2", PeerSpec::new(local_addr("node-2")))
        .await;
    assert!(verify_peer_state(&store1, AREA, "node-2", PeerState::Initialized).await);
    assert_eq!(store1.dump_all(AREA, None).await.unwrap().len(), 2);

    let self_originated = store1.dump_self_originated(AREA).await.unwrap();
    assert_eq!(self_originated.len(), 1);
    assert_eq!(self_originated.get("own-key"), Some(&own));

    store1.stop().await;
    store2.stop().await;
}

//
// The same protocol over the HTTP client flavor and real sockets.
//
#[tokio::test]
async fn test_http_transport_full_sync_and_flooding() {
    init_tracing();

    let mut config1 = StoreConfig::new("node-1", vec![AREA.to_string()]);
    config1.sync_retry_min = Duration::from_millis(50);
    let client = HttpStoreClient::from_config(&config1).unwrap();
    let mut store1 = Store::new(config1, client.clone());
    store1.run().await.unwrap();

    let mut config2 = StoreConfig::new("node-2", vec![AREA.to_string()]);
    config2.sync_retry_min = Duration::from_millis(50);
    let mut store2 = Store::new(config2, client.clone());
    store2.run().await.unwrap();

    let addr1 = store1.listen_addr().unwrap().to_string();
    let addr2 = store2.listen_addr().unwrap().to_string();

    let val1 = Value::new(1, "node-1", b"value1".to_vec());
    let val2 = Value::new(2, "node-2", b"value2".to_vec());
    store1.set_key(AREA, "key1", val1.clone(), None).await;
    store2.set_key(AREA, "key2", val2.clone(), None).await;

    assert!(store1.add_peer(AREA, "node-2", PeerSpec::new(addr2)).await);
    assert!(store2.add_peer(AREA, "node-1", PeerSpec::new(addr1)).await);

    assert!(verify_peer_state(&store1, AREA, "node-2", PeerState::Initialized).await);
    assert!(verify_peer_state(&store2, AREA, "node-1", PeerState::Initialized).await);
    assert!(verify_key(&store1, AREA, "key2", &val2).await);
    assert!(verify_key(&store2, AREA, "key1", &val1).await);

    // Flooding over the same transport
    let val3 = Value::new(3, "node-2", b"value3".to_vec());
    store2.set_key(AREA, "key3", val3.clone(), None).await;
    assert!(verify_key(&store1, AREA, "key3", &val3).await);

    store1.stop().await;
    store2.stop().await;
}
