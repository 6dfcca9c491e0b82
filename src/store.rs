use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::client::StoreClient;
use crate::config::StoreConfig;
use crate::db::AreaDb;
use crate::flood;
use crate::metrics::Counters;
use crate::peers::PeerTable;
use crate::queue::{updates_queue, UpdatesReader, UpdatesWriter};
use crate::server;
use crate::sync::{self, SyncPlan};
use crate::types::{
    AreaSummary, KeyDumpFilter, KeyDumpParams, KeyGetParams, KeySetParams, KeyVals, NodeId,
    PeerEvent, PeerSpec, PeerState, PeersMap, Publication, Update, Value,
};

/// Work posted onto the run loop. Every mutation of database and peer
/// state happens through one of these.
pub(crate) enum Command {
    SetKeyVals {
        area: String,
        params: KeySetParams,
        resp: oneshot::Sender<Result<()>>,
    },
    GetKeyVals {
        area: String,
        params: KeyGetParams,
        resp: oneshot::Sender<Result<Publication>>,
    },
    DumpKeys {
        params: KeyDumpParams,
        areas: Vec<String>,
        resp: oneshot::Sender<Vec<Publication>>,
    },
    DumpHashes {
        area: String,
        params: KeyDumpParams,
        resp: oneshot::Sender<Result<Publication>>,
    },
    DumpSelfOriginated {
        area: String,
        resp: oneshot::Sender<Result<KeyVals>>,
    },
    AddPeers {
        area: String,
        peers: PeersMap,
        resp: oneshot::Sender<Result<()>>,
    },
    DelPeers {
        area: String,
        peer_names: Vec<String>,
        resp: oneshot::Sender<Result<()>>,
    },
    GetPeerState {
        area: String,
        peer_name: String,
        resp: oneshot::Sender<Option<PeerState>>,
    },
    GetPeers {
        area: String,
        resp: oneshot::Sender<Result<PeersMap>>,
    },
    GetSummary {
        areas: Vec<String>,
        resp: oneshot::Sender<Vec<AreaSummary>>,
    },
    PushUpdates {
        area: String,
        key_vals: KeyVals,
        resp: oneshot::Sender<()>,
    },
    CloseQueue,
    Bootstrap {
        resp: oneshot::Sender<()>,
    },
    SyncPlan {
        area: String,
        peer_name: String,
        session: u64,
        their_hashes: KeyVals,
        resp: oneshot::Sender<Option<SyncPlan>>,
    },
    SyncDone {
        area: String,
        peer_name: String,
        session: u64,
        fetched: KeyVals,
    },
    SyncFailed {
        area: String,
        peer_name: String,
        session: u64,
    },
    RetrySync {
        area: String,
        peer_name: String,
        session: u64,
    },
    FloodFailed {
        area: String,
        peer_name: String,
    },
    Stop,
}

/// Cloneable entry point to a store's run loop. RPC handlers, the
/// in-process client flavor, and the façade all go through this; awaiting
/// a call is the suspension point until the loop has processed it.
#[derive(Clone)]
pub struct StoreHandle {
    node_id: NodeId,
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl StoreHandle {
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(tx))
            .map_err(|_| anyhow!("Store is not running"))?;
        rx.await.map_err(|_| anyhow!("Store stopped before replying"))
    }

    pub async fn set_key_vals(&self, area: &str, params: KeySetParams) -> Result<()> {
        let area = area.to_string();
        self.request(|resp| Command::SetKeyVals { area, params, resp })
            .await?
    }

    pub async fn get_key_vals(&self, area: &str, params: KeyGetParams) -> Result<Publication> {
        let area = area.to_string();
        self.request(|resp| Command::GetKeyVals { area, params, resp })
            .await?
    }

    pub async fn dump_keys(
        &self,
        params: KeyDumpParams,
        areas: Vec<String>,
    ) -> Result<Vec<Publication>> {
        self.request(|resp| Command::DumpKeys {
            params,
            areas,
            resp,
        })
        .await
    }

    pub async fn dump_hashes(&self, area: &str, params: KeyDumpParams) -> Result<Publication> {
        let area = area.to_string();
        self.request(|resp| Command::DumpHashes { area, params, resp })
            .await?
    }

    pub async fn dump_self_originated(&self, area: &str) -> Result<KeyVals> {
        let area = area.to_string();
        self.request(|resp| Command::DumpSelfOriginated { area, resp })
            .await?
    }

    /// Responder side of the reconciliation: our records the sender of
    /// `key_val_hashes` should take
    pub async fn sync_key_vals(&self, area: &str, key_val_hashes: KeyVals) -> Result<KeyVals> {
        let params = KeyDumpParams {
            key_val_hashes: Some(key_val_hashes),
            sender_id: Some(self.node_id.clone()),
            ..Default::default()
        };
        let publications = self.dump_keys(params, vec![area.to_string()]).await?;
        let publication = publications
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("Unknown area {area}"))?;
        Ok(publication.key_vals)
    }

    pub async fn add_peers(&self, area: &str, peers: PeersMap) -> Result<()> {
        let area = area.to_string();
        self.request(|resp| Command::AddPeers { area, peers, resp })
            .await?
    }

    pub async fn del_peers(&self, area: &str, peer_names: Vec<String>) -> Result<()> {
        let area = area.to_string();
        self.request(|resp| Command::DelPeers {
            area,
            peer_names,
            resp,
        })
        .await?
    }

    pub async fn get_peer_state(&self, area: &str, peer_name: &str) -> Result<Option<PeerState>> {
        let area = area.to_string();
        let peer_name = peer_name.to_string();
        self.request(|resp| Command::GetPeerState {
            area,
            peer_name,
            resp,
        })
        .await
    }

    pub async fn get_peers(&self, area: &str) -> Result<PeersMap> {
        let area = area.to_string();
        self.request(|resp| Command::GetPeers { area, resp }).await?
    }

    pub async fn get_summary(&self, areas: Vec<String>) -> Result<Vec<AreaSummary>> {
        self.request(|resp| Command::GetSummary { areas, resp })
            .await
    }

    /// Injection hook: enqueue a publication for the subscriber without
    /// touching the database
    pub async fn push_to_updates_queue(&self, area: &str, key_vals: KeyVals) -> Result<()> {
        let area = area.to_string();
        self.request(|resp| Command::PushUpdates {
            area,
            key_vals,
            resp,
        })
        .await
    }

    pub fn close_queue(&self) {
        let _ = self.cmd_tx.send(Command::CloseQueue);
    }

    async fn bootstrap(&self) -> Result<()> {
        self.request(|resp| Command::Bootstrap { resp }).await
    }

    fn stop(&self) {
        let _ = self.cmd_tx.send(Command::Stop);
    }

    pub(crate) fn cmd_tx(&self) -> mpsc::UnboundedSender<Command> {
        self.cmd_tx.clone()
    }
}

/// Replicated key-value store node.
///
/// Composes the per-area databases, peer tables, sync engine, flooder and
/// updates queue behind one lifecycle. Generic over the client flavor
/// used to reach peers.
pub struct Store<C: StoreClient> {
    config: StoreConfig,
    client: C,
    counters: Arc<Counters>,
    handle: StoreHandle,
    cmd_rx: Option<mpsc::UnboundedReceiver<Command>>,
    updates_writer: Option<UpdatesWriter>,
    updates_reader: Mutex<UpdatesReader>,
    listen_addr: Option<SocketAddr>,
    loop_task: Option<JoinHandle<()>>,
    server_task: Option<JoinHandle<()>>,
    running: bool,
}

impl<C: StoreClient> Store<C> {
    pub fn new(config: StoreConfig, client: C) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (updates_writer, updates_reader) = updates_queue();
        let handle = StoreHandle {
            node_id: config.node_id.clone(),
            cmd_tx,
        };
        Self {
            config,
            client,
            counters: Arc::new(Counters::default()),
            handle,
            cmd_rx: Some(cmd_rx),
            updates_writer: Some(updates_writer),
            updates_reader: Mutex::new(updates_reader),
            listen_addr: None,
            loop_task: None,
            server_task: None,
            running: false,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn handle(&self) -> StoreHandle {
        self.handle.clone()
    }

    pub fn counters(&self) -> Arc<Counters> {
        self.counters.clone()
    }

    /// Address the RPC server is bound to, once running
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listen_addr
    }

    /// Start the run loop and the RPC server; returns once both are up
    /// and the configured peers have been inserted.
    pub async fn run(&mut self) -> Result<()> {
        if self.running {
            return Ok(());
        }
        let cmd_rx = self
            .cmd_rx
            .take()
            .ok_or_else(|| anyhow!("Store cannot be restarted"))?;
        let updates = self
            .updates_writer
            .take()
            .ok_or_else(|| anyhow!("Store cannot be restarted"))?;

        let run_loop = RunLoop::new(
            self.config.clone(),
            self.client.clone(),
            self.counters.clone(),
            updates,
            self.handle.cmd_tx(),
        );
        self.loop_task = Some(tokio::spawn(run_loop.run(cmd_rx)));

        let listener = tokio::net::TcpListener::bind(&self.config.listen_addr)
            .await
            .with_context(|| format!("Failed to bind {}", self.config.listen_addr))?;
        let addr = listener
            .local_addr()
            .context("Failed to read bound address")?;
        self.listen_addr = Some(addr);

        let app = server::router(self.handle.clone());
        self.server_task = Some(tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app).await {
                warn!("RPC server stopped: {err:#}");
            }
        }));

        // Insert configured peers and open the initial-sync window
        self.handle.bootstrap().await?;
        self.running = true;

        info!(node = self.config.node_id, %addr, "Store running");
        Ok(())
    }

    /// Stop the store: close the updates queue, shut the RPC server down,
    /// and join the run loop. Idempotent.
    pub async fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;

        self.handle.close_queue();
        if let Some(server_task) = self.server_task.take() {
            server_task.abort();
            let _ = server_task.await;
        }
        self.handle.stop();
        if let Some(loop_task) = self.loop_task.take() {
            let _ = loop_task.await;
        }
        info!(node = self.config.node_id, "Store stopped");
    }

    /// Close the updates queue without stopping the store; a blocked
    /// subscriber observes a terminal error
    pub fn close_queue(&self) {
        self.handle.close_queue();
    }

    /// Inject one record. Returns whether the store processed the write;
    /// a non-dominant record is processed but changes nothing.
    pub async fn set_key(
        &self,
        area: &str,
        key: impl Into<String>,
        value: Value,
        node_ids: Option<Vec<NodeId>>,
    ) -> bool {
        self.set_keys(area, vec![(key.into(), value)], node_ids)
            .await
    }

    /// Inject a batch of records under one publication
    pub async fn set_keys(
        &self,
        area: &str,
        key_vals: Vec<(String, Value)>,
        node_ids: Option<Vec<NodeId>>,
    ) -> bool {
        let params = KeySetParams {
            key_vals: key_vals.into_iter().collect(),
            node_ids,
            sender_id: None,
        };
        match self.handle.set_key_vals(area, params).await {
            Ok(()) => true,
            Err(err) => {
                error!(area, "Failed to set keys: {err:#}");
                false
            }
        }
    }

    /// Fetch one record, bounded by the configured read timeout
    pub async fn get_key(&self, area: &str, key: &str) -> Option<Value> {
        let params = KeyGetParams {
            keys: vec![key.to_string()],
        };
        let read = tokio::time::timeout(
            self.config.read_timeout,
            self.handle.get_key_vals(area, params),
        );
        match read.await {
            Err(_) => {
                error!(area, key, "Timed out retrieving key");
                None
            }
            Ok(Err(err)) => {
                warn!(area, key, "Failed to retrieve key: {err:#}");
                None
            }
            Ok(Ok(publication)) => publication.key_vals.get(key).cloned(),
        }
    }

    /// Enumerate an area's records, optionally filtered
    pub async fn dump_all(&self, area: &str, filter: Option<KeyDumpParams>) -> Result<KeyVals> {
        let params = filter.unwrap_or_default();
        let publications = self.handle.dump_keys(params, vec![area.to_string()]).await?;
        let publication = publications
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("Unknown area {area}"))?;
        Ok(publication.key_vals)
    }

    /// Enumerate matching-prefix records with payloads stripped
    pub async fn dump_hashes(&self, area: &str, prefix: &str) -> Result<KeyVals> {
        let params = KeyDumpParams {
            prefix: prefix.to_string(),
            sender_id: Some(self.config.node_id.clone()),
            ..Default::default()
        };
        Ok(self.handle.dump_hashes(area, params).await?.key_vals)
    }

    pub async fn dump_self_originated(&self, area: &str) -> Result<KeyVals> {
        self.handle.dump_self_originated(area).await
    }

    pub async fn sync_key_vals(&self, area: &str, key_val_hashes: KeyVals) -> Result<KeyVals> {
        self.handle.sync_key_vals(area, key_val_hashes).await
    }

    pub async fn add_peer(&self, area: &str, peer_name: &str, spec: PeerSpec) -> bool {
        let peers = PeersMap::from([(peer_name.to_string(), spec)]);
        self.add_peers(area, peers).await
    }

    pub async fn add_peers(&self, area: &str, peers: PeersMap) -> bool {
        match self.handle.add_peers(area, peers).await {
            Ok(()) => true,
            Err(err) => {
                error!(area, "Failed to add peers: {err:#}");
                false
            }
        }
    }

    pub async fn del_peer(&self, area: &str, peer_name: &str) -> bool {
        match self
            .handle
            .del_peers(area, vec![peer_name.to_string()])
            .await
        {
            Ok(()) => true,
            Err(err) => {
                error!(area, peer = peer_name, "Failed to delete peer: {err:#}");
                false
            }
        }
    }

    pub async fn get_peer_state(&self, area: &str, peer_name: &str) -> Option<PeerState> {
        self.handle
            .get_peer_state(area, peer_name)
            .await
            .unwrap_or_default()
    }

    pub async fn get_peers(&self, area: &str) -> Result<PeersMap> {
        self.handle.get_peers(area).await
    }

    pub async fn get_summary(&self, areas: Vec<String>) -> Result<Vec<AreaSummary>> {
        self.handle.get_summary(areas).await
    }

    pub async fn push_to_updates_queue(&self, area: &str, key_vals: KeyVals) -> Result<()> {
        self.handle.push_to_updates_queue(area, key_vals).await
    }

    /// Block until the next publication; fails once the queue is closed
    pub async fn recv_publication(&self) -> Result<Publication> {
        self.updates_reader.lock().await.recv_publication().await
    }

    /// Block until the one-shot synced signal; fails once the queue is
    /// closed
    pub async fn recv_kvstore_synced_signal(&self) -> Result<()> {
        self.updates_reader.lock().await.recv_synced().await
    }
}

/// State for one area: its database and its peers
struct AreaState {
    db: AreaDb,
    peers: PeerTable,
}

/// The run loop: exclusive owner of every area's database and peer table.
/// Commands are processed strictly in arrival order, which is what gives
/// local writes their total publication order.
struct RunLoop<C: StoreClient> {
    node_id: NodeId,
    config: StoreConfig,
    client: C,
    counters: Arc<Counters>,
    areas: HashMap<String, AreaState>,
    updates: UpdatesWriter,
    cmd_tx: mpsc::UnboundedSender<Command>,
    /// One-shot latch for the initial synced signal
    synced_emitted: bool,
    bootstrapped: bool,
    /// (area, peer) pairs whose first sync attempt is still outstanding
    pending_initial: HashSet<(String, String)>,
    next_session: u64,
}

impl<C: StoreClient> RunLoop<C> {
    fn new(
        config: StoreConfig,
        client: C,
        counters: Arc<Counters>,
        updates: UpdatesWriter,
        cmd_tx: mpsc::UnboundedSender<Command>,
    ) -> Self {
        let node_id = config.node_id.clone();
        let areas = config
            .areas
            .iter()
            .map(|area| {
                let state = AreaState {
                    db: AreaDb::new(area.clone(), node_id.clone()),
                    peers: PeerTable::new(area.clone(), node_id.clone()),
                };
                (area.clone(), state)
            })
            .collect();
        Self {
            node_id,
            config,
            client,
            counters,
            areas,
            updates,
            cmd_tx,
            synced_emitted: false,
            bootstrapped: false,
            pending_initial: HashSet::new(),
            next_session: 0,
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
        debug!(node = self.node_id, "Run loop started");
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                Command::SetKeyVals { area, params, resp } => {
                    let _ = resp.send(self.apply_key_vals(&area, params));
                }
                Command::GetKeyVals { area, params, resp } => {
                    let _ = resp.send(self.get_key_vals(&area, params));
                }
                Command::DumpKeys {
                    params,
                    areas,
                    resp,
                } => {
                    let _ = resp.send(self.dump_keys(params, areas));
                }
                Command::DumpHashes { area, params, resp } => {
                    let _ = resp.send(self.dump_hashes(&area, params));
                }
                Command::DumpSelfOriginated { area, resp } => {
                    let _ = resp.send(
                        self.area(&area)
                            .map(|state| state.db.dump_self_originated()),
                    );
                }
                Command::AddPeers { area, peers, resp } => {
                    let _ = resp.send(self.add_peers(&area, peers));
                }
                Command::DelPeers {
                    area,
                    peer_names,
                    resp,
                } => {
                    let _ = resp.send(self.del_peers(&area, peer_names));
                }
                Command::GetPeerState {
                    area,
                    peer_name,
                    resp,
                } => {
                    let state = self
                        .areas
                        .get(&area)
                        .and_then(|state| state.peers.get(&peer_name))
                        .map(|entry| entry.state);
                    let _ = resp.send(state);
                }
                Command::GetPeers { area, resp } => {
                    let _ = resp.send(self.area(&area).map(|state| state.peers.dump()));
                }
                Command::GetSummary { areas, resp } => {
                    let _ = resp.send(self.summary(areas));
                }
                Command::PushUpdates {
                    area,
                    key_vals,
                    resp,
                } => {
                    self.updates.push(Update::Publication(Publication {
                        area,
                        key_vals,
                        ..Default::default()
                    }));
                    let _ = resp.send(());
                }
                Command::CloseQueue => self.updates.close(),
                Command::Bootstrap { resp } => {
                    self.bootstrap();
                    let _ = resp.send(());
                }
                Command::SyncPlan {
                    area,
                    peer_name,
                    session,
                    their_hashes,
                    resp,
                } => {
                    let _ = resp.send(self.sync_plan(&area, &peer_name, session, &their_hashes));
                }
                Command::SyncDone {
                    area,
                    peer_name,
                    session,
                    fetched,
                } => self.sync_done(&area, &peer_name, session, fetched),
                Command::SyncFailed {
                    area,
                    peer_name,
                    session,
                } => self.sync_failed(&area, &peer_name, session),
                Command::RetrySync {
                    area,
                    peer_name,
                    session,
                } => self.retry_sync(&area, &peer_name, session),
                Command::FloodFailed { area, peer_name } => self.flood_failed(&area, &peer_name),
                Command::Stop => break,
            }
        }
        debug!(node = self.node_id, "Run loop stopped");
    }

    fn area(&self, area: &str) -> Result<&AreaState> {
        self.areas
            .get(area)
            .ok_or_else(|| anyhow!("Unknown area {area}"))
    }

    fn area_mut(&mut self, area: &str) -> Result<&mut AreaState> {
        self.areas
            .get_mut(area)
            .ok_or_else(|| anyhow!("Unknown area {area}"))
    }

    /// Merge incoming records; on any acceptance, publish exactly once and
    /// then flood to the eligible peers
    fn apply_key_vals(&mut self, area: &str, params: KeySetParams) -> Result<()> {
        let KeySetParams {
            key_vals,
            node_ids,
            sender_id,
        } = params;

        let state = self.area_mut(area)?;
        let accepted_keys = state.db.merge(key_vals);
        if accepted_keys.is_empty() {
            return Ok(());
        }

        let mut accepted = KeyVals::with_capacity(accepted_keys.len());
        for key in &accepted_keys {
            if let Some(value) = state.db.get(key) {
                accepted.insert(key.clone(), value.clone());
            }
        }

        let publication =
            flood::build_publication(area, accepted, node_ids, sender_id, &self.node_id);

        // The subscriber sees the change before any peer can
        self.updates.push(Update::Publication(publication.clone()));

        let targets = match self.area(area) {
            Ok(state) => state
                .peers
                .flood_targets(&publication.node_ids, publication.sender_id.as_deref()),
            Err(_) => Vec::new(),
        };
        flood::spawn_floods(
            &self.client,
            &self.cmd_tx,
            &self.node_id,
            &publication,
            targets,
        );
        Ok(())
    }

    fn get_key_vals(&self, area: &str, params: KeyGetParams) -> Result<Publication> {
        let state = self.area(area)?;
        let mut key_vals = KeyVals::new();
        for key in params.keys {
            if let Some(value) = state.db.get(&key) {
                key_vals.insert(key, value.clone());
            }
        }
        Ok(Publication {
            area: area.to_string(),
            key_vals,
            ..Default::default()
        })
    }

    /// Enumerate records per selected area; with hashes attached this is
    /// the responder side of a reconciliation instead
    fn dump_keys(&self, params: KeyDumpParams, areas: Vec<String>) -> Vec<Publication> {
        let selected: Vec<&AreaState> = if areas.is_empty() {
            self.areas.values().collect()
        } else {
            areas
                .iter()
                .filter_map(|area| match self.areas.get(area) {
                    Some(state) => Some(state),
                    None => {
                        debug!(area, "Skipping dump of unknown area");
                        None
                    }
                })
                .collect()
        };

        selected
            .into_iter()
            .map(|state| {
                let key_vals = match &params.key_val_hashes {
                    Some(their_hashes) => sync::records_to_send(&state.db, their_hashes),
                    None => state.db.dump(&KeyDumpFilter::from_params(&params)),
                };
                Publication {
                    area: state.db.area().to_string(),
                    key_vals,
                    ..Default::default()
                }
            })
            .collect()
    }

    fn dump_hashes(&self, area: &str, params: KeyDumpParams) -> Result<Publication> {
        let state = self.area(area)?;
        Ok(Publication {
            area: area.to_string(),
            key_vals: state.db.dump_hashes(&params.prefix),
            ..Default::default()
        })
    }

    fn summary(&self, areas: Vec<String>) -> Vec<AreaSummary> {
        self.areas
            .values()
            .filter(|state| areas.is_empty() || areas.iter().any(|a| a == state.db.area()))
            .map(|state| AreaSummary {
                area: state.db.area().to_string(),
                key_vals_count: state.db.len(),
                key_vals_bytes: state.db.encoded_bytes(),
                peers_count: state.peers.len(),
            })
            .collect()
    }

    fn bootstrap(&mut self) {
        let initial_peers = self.config.initial_peers.clone();
        for (area, peers) in initial_peers {
            if let Err(err) = self.add_peers(&area, peers) {
                warn!(area, "Skipping configured peers: {err:#}");
            }
        }
        self.bootstrapped = true;
        self.maybe_emit_synced();
    }

    fn add_peers(&mut self, area: &str, peers: PeersMap) -> Result<()> {
        self.area(area)?;
        for (peer_name, mut spec) in peers {
            if peer_name == self.node_id {
                warn!(area, "Ignoring request to peer with self");
                continue;
            }
            // Advertised state is output-only
            spec.state = None;

            self.next_session += 1;
            let session = self.next_session;
            let backoff = self.config.sync_retry_min;

            let state = self.area_mut(area)?;
            state.peers.insert(&peer_name, spec.clone(), session, backoff);
            state.peers.transition(&peer_name, PeerEvent::PeerAdd);

            if !self.synced_emitted {
                self.pending_initial
                    .insert((area.to_string(), peer_name.clone()));
            }

            sync::spawn_full_sync(
                self.client.clone(),
                self.cmd_tx.clone(),
                self.counters.clone(),
                self.node_id.clone(),
                area.to_string(),
                peer_name,
                spec,
                session,
            );
        }
        Ok(())
    }

    fn del_peers(&mut self, area: &str, peer_names: Vec<String>) -> Result<()> {
        self.area(area)?;
        for peer_name in peer_names {
            if let Some(state) = self.areas.get_mut(area) {
                state.peers.remove(&peer_name);
            }
            self.pending_initial
                .remove(&(area.to_string(), peer_name));
        }
        self.maybe_emit_synced();
        Ok(())
    }

    /// Validate that a session completion still refers to the live peer
    /// entry; stale tokens mean the peer was removed or replaced
    fn session_is_live(&self, area: &str, peer_name: &str, session: u64) -> bool {
        self.areas
            .get(area)
            .and_then(|state| state.peers.get(peer_name))
            .is_some_and(|entry| entry.session == session)
    }

    fn sync_plan(
        &self,
        area: &str,
        peer_name: &str,
        session: u64,
        their_hashes: &KeyVals,
    ) -> Option<SyncPlan> {
        if !self.session_is_live(area, peer_name, session) {
            return None;
        }
        let state = self.areas.get(area)?;
        Some(sync::compute_sync_plan(&state.db, their_hashes))
    }

    fn sync_done(&mut self, area: &str, peer_name: &str, session: u64, fetched: KeyVals) {
        if !self.session_is_live(area, peer_name, session) {
            debug!(area, peer = peer_name, "Discarding orphaned sync completion");
            return;
        }

        if !fetched.is_empty() {
            let params = KeySetParams {
                key_vals: fetched,
                node_ids: None,
                sender_id: Some(peer_name.to_string()),
            };
            if let Err(err) = self.apply_key_vals(area, params) {
                warn!(area, peer = peer_name, "Failed to merge sync response: {err:#}");
            }
        }

        let retry_min = self.config.sync_retry_min;
        if let Ok(state) = self.area_mut(area) {
            state.peers.transition(peer_name, PeerEvent::SyncRespRcvd);
            if let Some(entry) = state.peers.get_mut(peer_name) {
                entry.backoff = retry_min;
            }
        }
        self.counters.num_full_sync_success.inc();
        info!(area, peer = peer_name, "Full sync with peer completed");
        self.finish_initial_attempt(area, peer_name);
    }

    fn sync_failed(&mut self, area: &str, peer_name: &str, session: u64) {
        if !self.session_is_live(area, peer_name, session) {
            debug!(area, peer = peer_name, "Discarding orphaned sync failure");
            return;
        }
        self.counters.num_full_sync_failure.inc();

        let retry_max = self.config.sync_retry_max;
        let mut retry_delay = None;
        if let Ok(state) = self.area_mut(area) {
            state.peers.transition(peer_name, PeerEvent::ApiError);
            if let Some(entry) = state.peers.get_mut(peer_name) {
                let delay = entry.backoff;
                entry.backoff = (delay * 2).min(retry_max);
                retry_delay = Some(delay);
            }
        }
        if let Some(delay) = retry_delay {
            self.schedule_retry(area, peer_name, session, delay);
        }
        self.finish_initial_attempt(area, peer_name);
    }

    fn retry_sync(&mut self, area: &str, peer_name: &str, session: u64) {
        if !self.session_is_live(area, peer_name, session) {
            return;
        }
        let Ok(state) = self.area_mut(area) else {
            return;
        };
        let Some(entry) = state.peers.get(peer_name) else {
            return;
        };
        if entry.state != PeerState::Idle {
            return;
        }
        let spec = entry.spec.clone();
        state.peers.transition(peer_name, PeerEvent::PeerAdd);

        sync::spawn_full_sync(
            self.client.clone(),
            self.cmd_tx.clone(),
            self.counters.clone(),
            self.node_id.clone(),
            area.to_string(),
            peer_name.to_string(),
            spec,
            session,
        );
    }

    /// A failed flood evicts the peer from flooding until it re-syncs
    fn flood_failed(&mut self, area: &str, peer_name: &str) {
        let retry_max = self.config.sync_retry_max;
        let mut retry = None;
        if let Ok(state) = self.area_mut(area) {
            if state.peers.get(peer_name).is_some() {
                state.peers.transition(peer_name, PeerEvent::ApiError);
            }
            if let Some(entry) = state.peers.get_mut(peer_name) {
                let delay = entry.backoff;
                entry.backoff = (delay * 2).min(retry_max);
                retry = Some((entry.session, delay));
            }
        }
        if let Some((session, delay)) = retry {
            self.schedule_retry(area, peer_name, session, delay);
        }
    }

    fn schedule_retry(&self, area: &str, peer_name: &str, session: u64, delay: Duration) {
        debug!(area, peer = peer_name, ?delay, "Scheduling sync retry");
        let cmd_tx = self.cmd_tx.clone();
        let area = area.to_string();
        let peer_name = peer_name.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = cmd_tx.send(Command::RetrySync {
                area,
                peer_name,
                session,
            });
        });
    }

    fn finish_initial_attempt(&mut self, area: &str, peer_name: &str) {
        if self.synced_emitted {
            return;
        }
        self.pending_initial
            .remove(&(area.to_string(), peer_name.to_string()));
        self.maybe_emit_synced();
    }

    /// Emit the one-shot synced signal once every peer known during the
    /// initial window has finished one sync attempt
    fn maybe_emit_synced(&mut self) {
        if self.synced_emitted || !self.bootstrapped || !self.pending_initial.is_empty() {
            return;
        }
        info!(node = self.node_id, "Initial sync complete");
        self.updates.push(Update::Synced);
        self.synced_emitted = true;
    }
}
