//! HTTP side of the peer RPC surface. Every operation dispatches into the
//! run loop through a [`StoreHandle`]; handlers hold no state of their
//! own.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::store::StoreHandle;
use crate::types::{
    AreaSummary, KeyDumpParams, KeyGetParams, KeySetParams, KeyVals, PeerState, PeersMap,
    Publication,
};

/// Body of the cross-area dump operation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DumpRequest {
    pub params: KeyDumpParams,
    #[serde(default)]
    pub areas: Vec<String>,
}

type HandlerError = (StatusCode, String);

fn internal(err: anyhow::Error) -> HandlerError {
    warn!("RPC handler failed: {err:#}");
    (StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
}

pub fn router(handle: StoreHandle) -> Router {
    Router::new()
        .route("/kvstore/dump", post(dump_keys))
        .route("/kvstore/summary", post(get_summary))
        .route("/kvstore/{area}/set", post(set_key_vals))
        .route("/kvstore/{area}/get", post(get_key_vals))
        .route("/kvstore/{area}/hashes", post(dump_hashes))
        .route("/kvstore/{area}/self-originated", get(dump_self_originated))
        .route("/kvstore/{area}/peers", get(get_peers))
        .route("/kvstore/{area}/peers/add", post(add_peers))
        .route("/kvstore/{area}/peers/delete", post(del_peers))
        .route("/kvstore/{area}/peers/{peer}/state", get(get_peer_state))
        .with_state(handle)
}

async fn set_key_vals(
    State(handle): State<StoreHandle>,
    Path(area): Path<String>,
    Json(params): Json<KeySetParams>,
) -> Result<StatusCode, HandlerError> {
    handle
        .set_key_vals(&area, params)
        .await
        .map_err(internal)?;
    Ok(StatusCode::OK)
}

async fn get_key_vals(
    State(handle): State<StoreHandle>,
    Path(area): Path<String>,
    Json(params): Json<KeyGetParams>,
) -> Result<Json<Publication>, HandlerError> {
    let publication = handle.get_key_vals(&area, params).await.map_err(internal)?;
    Ok(Json(publication))
}

async fn dump_keys(
    State(handle): State<StoreHandle>,
    Json(request): Json<DumpRequest>,
) -> Result<Json<Vec<Publication>>, HandlerError> {
    let publications = handle
        .dump_keys(request.params, request.areas)
        .await
        .map_err(internal)?;
    Ok(Json(publications))
}

async fn dump_hashes(
    State(handle): State<StoreHandle>,
    Path(area): Path<String>,
    Json(params): Json<KeyDumpParams>,
) -> Result<Json<Publication>, HandlerError> {
    let publication = handle.dump_hashes(&area, params).await.map_err(internal)?;
    Ok(Json(publication))
}

async fn dump_self_originated(
    State(handle): State<StoreHandle>,
    Path(area): Path<String>,
) -> Result<Json<KeyVals>, HandlerError> {
    let key_vals = handle
        .dump_self_originated(&area)
        .await
        .map_err(internal)?;
    Ok(Json(key_vals))
}

async fn add_peers(
    State(handle): State<StoreHandle>,
    Path(area): Path<String>,
    Json(peers): Json<PeersMap>,
) -> Result<StatusCode, HandlerError> {
    handle.add_peers(&area, peers).await.map_err(internal)?;
    Ok(StatusCode::OK)
}

async fn del_peers(
    State(handle): State<StoreHandle>,
    Path(area): Path<String>,
    Json(peer_names): Json<Vec<String>>,
) -> Result<StatusCode, HandlerError> {
    handle
        .del_peers(&area, peer_names)
        .await
        .map_err(internal)?;
    Ok(StatusCode::OK)
}

async fn get_peer_state(
    State(handle): State<StoreHandle>,
    Path((area, peer)): Path<(String, String)>,
) -> Result<Json<Option<PeerState>>, HandlerError> {
    let state = handle
        .get_peer_state(&area, &peer)
        .await
        .map_err(internal)?;
    Ok(Json(state))
}

async fn get_peers(
    State(handle): State<StoreHandle>,
    Path(area): Path<String>,
) -> Result<Json<PeersMap>, HandlerError> {
    let peers = handle.get_peers(&area).await.map_err(internal)?;
    Ok(Json(peers))
}

async fn get_summary(
    State(handle): State<StoreHandle>,
    Json(areas): Json<Vec<String>>,
) -> Result<Json<Vec<AreaSummary>>, HandlerError> {
    let summaries = handle.get_summary(areas).await.map_err(internal)?;
    Ok(Json(summaries))
}
