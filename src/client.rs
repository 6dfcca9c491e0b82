//! Client side of the peer RPC surface.
//!
//! The store is generic over [`StoreClient`] so the same protocol logic
//! runs against either transport flavor: HTTP between processes, or an
//! in-process registry for embedding and tests.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};

use crate::config::StoreConfig;
use crate::store::StoreHandle;
use crate::types::{KeyDumpParams, KeyGetParams, KeySetParams, PeerSpec, Publication};

/// The peer-facing operations the store issues: flooding and injecting
/// records, fetching record bodies, and requesting a hash enumeration
/// for reconciliation.
pub trait StoreClient: Clone + Send + Sync + 'static {
    fn set_key_vals(
        &self,
        peer: &PeerSpec,
        area: &str,
        params: KeySetParams,
    ) -> impl Future<Output = Result<()>> + Send;

    fn get_key_vals(
        &self,
        peer: &PeerSpec,
        area: &str,
        params: KeyGetParams,
    ) -> impl Future<Output = Result<Publication>> + Send;

    fn dump_hashes(
        &self,
        peer: &PeerSpec,
        area: &str,
        params: KeyDumpParams,
    ) -> impl Future<Output = Result<Publication>> + Send;
}

/// HTTP client flavor: JSON POSTs against the peer's RPC server
#[derive(Clone)]
pub struct HttpStoreClient {
    client: reqwest::Client,
}

impl HttpStoreClient {
    /// Client with the per-call timeout taken from the store config
    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        Self::new(config.rpc_timeout)
    }

    /// `call_timeout` bounds every peer call; expiry is a transport error
    pub fn new(call_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(call_timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }

    fn url(peer: &PeerSpec, area: &str, op: &str) -> String {
        format!("http://{}/kvstore/{}/{}", peer.peer_addr, area, op)
    }
}

impl StoreClient for HttpStoreClient {
    async fn set_key_vals(&self, peer: &PeerSpec, area: &str, params: KeySetParams) -> Result<()> {
        let resp = self
            .client
            .post(Self::url(peer, area, "set"))
            .json(&params)
            .send()
            .await
            .context("Failed to send set request")?;
        if !resp.status().is_success() {
            bail!("Peer {} rejected set: {}", peer.peer_addr, resp.status());
        }
        Ok(())
    }

    async fn get_key_vals(
        &self,
        peer: &PeerSpec,
        area: &str,
        params: KeyGetParams,
    ) -> Result<Publication> {
        let resp = self
            .client
            .post(Self::url(peer, area, "get"))
            .json(&params)
            .send()
            .await
            .context("Failed to send get request")?;
        if !resp.status().is_success() {
            bail!("Peer {} rejected get: {}", peer.peer_addr, resp.status());
        }
        resp.json::<Publication>()
            .await
            .context("Failed to parse get response")
    }

    async fn dump_hashes(
        &self,
        peer: &PeerSpec,
        area: &str,
        params: KeyDumpParams,
    ) -> Result<Publication> {
        let resp = self
            .client
            .post(Self::url(peer, area, "hashes"))
            .json(&params)
            .send()
            .await
            .context("Failed to send hash dump request")?;
        if !resp.status().is_success() {
            bail!(
                "Peer {} rejected hash dump: {}",
                peer.peer_addr,
                resp.status()
            );
        }
        resp.json::<Publication>()
            .await
            .context("Failed to parse hash dump response")
    }
}

/// In-process client flavor: peer addresses resolve to store handles
/// through a shared registry. An unregistered address behaves like an
/// unreachable endpoint.
#[derive(Clone, Default)]
pub struct LocalStoreClient {
    registry: Arc<RwLock<HashMap<String, StoreHandle>>>,
}

impl LocalStoreClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, addr: impl Into<String>, handle: StoreHandle) {
        self.registry
            .write()
            .expect("peer registry lock poisoned")
            .insert(addr.into(), handle);
    }

    pub fn unregister(&self, addr: &str) {
        self.registry
            .write()
            .expect("peer registry lock poisoned")
            .remove(addr);
    }

    fn resolve(&self, addr: &str) -> Result<StoreHandle> {
        self.registry
            .read()
            .expect("peer registry lock poisoned")
            .get(addr)
            .cloned()
            .ok_or_else(|| anyhow!("No store listening on {addr}"))
    }
}

impl StoreClient for LocalStoreClient {
    async fn set_key_vals(&self, peer: &PeerSpec, area: &str, params: KeySetParams) -> Result<()> {
        let handle = self.resolve(&peer.peer_addr)?;
        handle.set_key_vals(area, params).await
    }

    async fn get_key_vals(
        &self,
        peer: &PeerSpec,
        area: &str,
        params: KeyGetParams,
    ) -> Result<Publication> {
        let handle = self.resolve(&peer.peer_addr)?;
        handle.get_key_vals(area, params).await
    }

    async fn dump_hashes(
        &self,
        peer: &PeerSpec,
        area: &str,
        params: KeyDumpParams,
    ) -> Result<Publication> {
        let handle = self.resolve(&peer.peer_addr)?;
        handle.dump_hashes(area, params).await
    }
}
