//! Request handlers for the HTTP surface.
//!
//! Handlers decode arguments, call the service layer, and map errors.
//! No business logic lives here; every invariant is enforced below the
//! service boundary.

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::Response;
use axum::Json;
use futures::StreamExt;
use serde::Deserialize;
use std::sync::Arc;

use crate::core::{Error, PayloadDescriptor, PayloadId, Tier};
use crate::repository::{StreamEntryRecord, StreamRecord};
use crate::service::{
    AcquireLeaseRequest, AcquireLeaseResponse, AdminService, AllocateRequest, AppendRequest,
    CatalogService, CommitOffsetRequest, CreateStreamRequest, DataService, GetCommittedResponse,
    LineageRequest, LineageResponse, MetadataEventRequest, MetadataEventResponse,
    MetadataUpdateRequest, RangeRequest, ReadRequest, SpillOutcome, SpillRequest, StatsResponse,
    StreamService, SubscribeRequest,
};
use crate::stream::AppendResult;

use super::responses::{ApiError, ApiResult};

/// Shared handler state: the four service surfaces.
#[derive(Clone)]
pub struct AppState {
    pub catalog: CatalogService,
    pub data: DataService,
    pub streams: StreamService,
    pub admin: AdminService,
}

fn parse_id(text: &str) -> ApiResult<PayloadId> {
    PayloadId::parse(text).map_err(ApiError::from)
}

// ============================================================================
// Catalog handlers
// ============================================================================

pub async fn allocate(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AllocateRequest>,
) -> ApiResult<Json<PayloadDescriptor>> {
    Ok(Json(state.catalog.allocate(request).await?))
}

pub async fn commit(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<PayloadDescriptor>> {
    let id = parse_id(&id)?;
    Ok(Json(state.catalog.commit(id).await?))
}

#[derive(Debug, Deserialize)]
pub struct DeleteParams {
    #[serde(default)]
    pub force: bool,
}

pub async fn delete_payload(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<DeleteParams>,
) -> ApiResult<Json<serde_json::Value>> {
    let id = parse_id(&id)?;
    state.catalog.delete(id, params.force).await?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}

#[derive(Debug, Deserialize)]
pub struct PromoteBody {
    pub target_tier: Tier,
}

pub async fn promote(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<PromoteBody>,
) -> ApiResult<Json<PayloadDescriptor>> {
    let id = parse_id(&id)?;
    Ok(Json(state.catalog.promote(id, body.target_tier).await?))
}

pub async fn spill(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SpillRequest>,
) -> ApiResult<Json<Vec<SpillOutcome>>> {
    Ok(Json(state.catalog.spill(request).await?))
}

pub async fn update_metadata(
    State(state): State<Arc<AppState>>,
    Json(request): Json<MetadataUpdateRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    state.catalog.update_metadata(request).await?;
    Ok(Json(serde_json::json!({ "updated": true })))
}

pub async fn append_metadata_event(
    State(state): State<Arc<AppState>>,
    Json(request): Json<MetadataEventRequest>,
) -> ApiResult<Json<MetadataEventResponse>> {
    Ok(Json(state.catalog.append_metadata_event(request).await?))
}

pub async fn add_lineage(
    State(state): State<Arc<AppState>>,
    Json(request): Json<LineageRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    state.catalog.add_lineage(request).await?;
    Ok(Json(serde_json::json!({ "added": true })))
}

#[derive(Debug, Deserialize)]
pub struct LineageParams {
    #[serde(default)]
    pub upstream: bool,
    #[serde(default)]
    pub max_depth: u32,
}

pub async fn get_lineage(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<LineageParams>,
) -> ApiResult<Json<LineageResponse>> {
    let id = parse_id(&id)?;
    Ok(Json(
        state
            .catalog
            .get_lineage(id, params.upstream, params.max_depth)
            .await?,
    ))
}

// ============================================================================
// Data handlers
// ============================================================================

pub async fn resolve_snapshot(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<PayloadDescriptor>> {
    let id = parse_id(&id)?;
    Ok(Json(state.data.resolve_snapshot(id).await?))
}

pub async fn acquire_lease(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AcquireLeaseRequest>,
) -> ApiResult<Json<AcquireLeaseResponse>> {
    Ok(Json(state.data.acquire_read_lease(request).await?))
}

pub async fn release_lease(
    State(state): State<Arc<AppState>>,
    Path(lease_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.data.release_lease(&lease_id);
    Ok(Json(serde_json::json!({ "released": true })))
}

// ============================================================================
// Stream handlers
// ============================================================================

pub async fn create_stream(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateStreamRequest>,
) -> ApiResult<Json<StreamRecord>> {
    Ok(Json(state.streams.create(request).await?))
}

pub async fn delete_stream(
    State(state): State<Arc<AppState>>,
    Path((namespace, name)): Path<(String, String)>,
) -> ApiResult<Json<serde_json::Value>> {
    state.streams.delete(&namespace, &name).await?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}

pub async fn append_stream(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AppendRequest>,
) -> ApiResult<Json<AppendResult>> {
    Ok(Json(state.streams.append(request).await?))
}

pub async fn read_stream(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ReadRequest>,
) -> ApiResult<Json<Vec<StreamEntryRecord>>> {
    Ok(Json(state.streams.read(request).await?))
}

pub async fn stream_range(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RangeRequest>,
) -> ApiResult<Json<Vec<StreamEntryRecord>>> {
    Ok(Json(state.streams.get_range(request).await?))
}

pub async fn commit_offset(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CommitOffsetRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    state.streams.commit(request).await?;
    Ok(Json(serde_json::json!({ "committed": true })))
}

pub async fn get_committed(
    State(state): State<Arc<AppState>>,
    Path((namespace, name, group)): Path<(String, String, String)>,
) -> ApiResult<Json<GetCommittedResponse>> {
    Ok(Json(
        state.streams.get_committed(&namespace, &name, &group).await?,
    ))
}

/// Server-streaming subscribe: newline-delimited JSON entries, one per
/// line, suspending while the log is drained. Closing the connection
/// cancels the feed.
pub async fn subscribe_stream(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SubscribeRequest>,
) -> ApiResult<Response> {
    let receiver = state.streams.subscribe(request).await?;
    let lines = tokio_stream_from(receiver).map(|entry| {
        serde_json::to_string(&entry)
            .map(|mut line| {
                line.push('\n');
                line
            })
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    });

    Response::builder()
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .body(Body::from_stream(lines))
        .map_err(|e| ApiError(Error::Internal(format!("response build: {}", e))))
}

fn tokio_stream_from(
    receiver: tokio::sync::mpsc::Receiver<StreamEntryRecord>,
) -> impl futures::Stream<Item = StreamEntryRecord> {
    futures::stream::unfold(receiver, |mut receiver| async move {
        receiver.recv().await.map(|entry| (entry, receiver))
    })
}

// ============================================================================
// Admin handlers
// ============================================================================

pub async fn stats(State(state): State<Arc<AppState>>) -> ApiResult<Json<StatsResponse>> {
    Ok(Json(state.admin.stats().await?))
}

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
