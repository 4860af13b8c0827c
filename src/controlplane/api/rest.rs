//! REST API Handlers
//!
//! Every resource lives under `/<orchestrator>/v<api-version>`. Errors are
//! rendered as `{error, message, retryable}` with a status derived from the
//! error kind.

use crate::controlplane::orchestrator::{Orchestrator, RequestContext};
use crate::domain::{
    AccessMode, Backend, BackendSpec, BackendState, CloneRequest, CsiAccessMode, ImportRequest,
    LuksRef, Node, Snapshot, StorageClass, Volume, VolumeMode, VolumePublication, VolumeRequest,
};
use crate::error::Error;
use crate::store::CURRENT_STORE_SCHEMA_VERSION;
use crate::txn::Transaction;
use axum::{
    extract::{DefaultBodyLimit, Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use uuid::Uuid;

// =============================================================================
// Request/Response Types
// =============================================================================

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
    pub retryable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionResponse {
    pub orchestrator_name: String,
    pub orchestrator_version: String,
    pub api_version: u32,
    pub store_schema_version: u32,
    pub ready: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendStateRequest {
    pub state: BackendState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResizeVolumeRequest {
    pub size_bytes: u64,
}

/// Clone of the volume named in the path
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloneVolumeRequest {
    pub name: String,
    #[serde(default)]
    pub snapshot: Option<String>,
}

/// Import under the volume name given in the path
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportVolumeRequest {
    pub backend_uuid: Uuid,
    pub pool: String,
    pub original_name: String,
    pub access_mode: AccessMode,
    #[serde(default)]
    pub volume_mode: VolumeMode,
    #[serde(default)]
    pub luks: Option<LuksRef>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishRequest {
    #[serde(default)]
    pub read_only: bool,
    /// Capability mode from a CSI ControllerPublish call, as its wire integer
    #[serde(default)]
    pub csi_access_mode: Option<CsiAccessMode>,
}

impl PublishRequest {
    /// Whether the attachment is read-only for a volume provisioned with
    /// `volume_mode`. Reader-only CSI modes force read-only; multi-node CSI
    /// modes are refused on single-node volumes.
    pub fn effective_read_only(&self, volume_mode: AccessMode) -> Result<bool, Error> {
        let Some(csi) = self.csi_access_mode else {
            return Ok(self.read_only);
        };
        let requested = csi.to_access_mode().ok_or_else(|| {
            Error::Validation(format!("CSI access mode {} cannot be published", csi))
        })?;
        if requested.is_multi_node() && !volume_mode.is_multi_node() {
            return Err(Error::Validation(format!(
                "CSI access mode {} needs a multi-node volume, volume is {}",
                csi,
                volume_mode.as_str()
            )));
        }
        let reader_only = matches!(
            csi,
            CsiAccessMode::SingleNodeReaderOnly | CsiAccessMode::MultiNodeReaderOnly
        );
        Ok(self.read_only || reader_only)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VolumeFilter {
    pub volume: Option<String>,
}

// =============================================================================
// Error Mapping
// =============================================================================

/// Orchestrator error rendered as an HTTP response
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

/// HTTP status for an orchestrator error
pub fn status_for(e: &Error) -> StatusCode {
    match e {
        Error::NotFound { .. } | Error::UnknownBackend { .. } => StatusCode::NOT_FOUND,
        Error::AlreadyExists { .. }
        | Error::ConflictingTransaction { .. }
        | Error::BackendInUse { .. }
        | Error::DuplicateUuid { .. }
        | Error::InvalidStateTransition { .. }
        | Error::VolumeNotOnline { .. } => StatusCode::CONFLICT,
        Error::Validation(_)
        | Error::Configuration(_)
        | Error::JsonParse(_)
        | Error::YamlParse(_)
        | Error::UnsupportedVersion { .. } => StatusCode::BAD_REQUEST,
        Error::NoEligibleBackend { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        Error::NotReady | Error::StoreUnavailable { .. } | Error::BackendNotOnline { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        Error::Cancelled { .. } => StatusCode::REQUEST_TIMEOUT,
        Error::DriverError { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        }
        (
            status,
            Json(ApiErrorResponse {
                error: self.0.code().into(),
                message: self.0.to_string(),
                retryable: self.0.is_retryable(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// =============================================================================
// REST Router
// =============================================================================

/// REST API router builder
pub struct RestRouter {
    orchestrator: Arc<Orchestrator>,
    request_timeout: Duration,
    max_body_size: usize,
}

impl RestRouter {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            request_timeout: Duration::from_secs(30),
            max_body_size: 1024 * 1024,
        }
    }

    /// Deadline applied to every lifecycle request
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_max_body_size(mut self, bytes: usize) -> Self {
        self.max_body_size = bytes;
        self
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        let base = self.orchestrator.config().api_base_path();
        let state = AppState {
            orchestrator: self.orchestrator,
            request_timeout: self.request_timeout,
        };

        let resources = Router::new()
            .route("/version", get(get_version))
            // Backends
            .route("/backend", post(add_backend).get(list_backends))
            .route("/backend/:name", get(get_backend).delete(delete_backend))
            .route("/backend/:name/state", post(set_backend_state))
            // Volumes
            .route("/volume", post(create_volume).get(list_volumes))
            .route("/volume/:name", get(get_volume).delete(delete_volume))
            .route("/volume/:name/resize", post(resize_volume))
            .route("/volume/:name/clone", post(clone_volume))
            .route("/volume/:name/import", post(import_volume))
            .route(
                "/volume/:name/publication/:node",
                put(publish_volume)
                    .get(get_publication)
                    .delete(unpublish_volume),
            )
            .route(
                "/volume/:name/snapshot/:snapshot",
                post(create_snapshot)
                    .get(get_snapshot)
                    .delete(delete_snapshot),
            )
            // Storage classes
            .route(
                "/storageclass",
                post(add_storage_class).get(list_storage_classes),
            )
            .route(
                "/storageclass/:name",
                get(get_storage_class)
                    .put(update_storage_class)
                    .delete(delete_storage_class),
            )
            // Nodes
            .route("/node", post(add_node).get(list_nodes))
            .route("/node/:name", get(get_node).delete(delete_node))
            // Read-only collections
            .route("/publication", get(list_publications))
            .route("/snapshot", get(list_snapshots))
            .route("/transaction", get(list_transactions));

        Router::new()
            .nest(&base, resources)
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .layer(DefaultBodyLimit::max(self.max_body_size))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    orchestrator: Arc<Orchestrator>,
    request_timeout: Duration,
}

impl AppState {
    fn context(&self) -> RequestContext {
        RequestContext::with_timeout(self.request_timeout)
    }
}

// =============================================================================
// Handlers
// =============================================================================

async fn get_version(State(state): State<AppState>) -> Json<VersionResponse> {
    let config = state.orchestrator.config();
    Json(VersionResponse {
        orchestrator_name: config.orchestrator_name.clone(),
        orchestrator_version: crate::VERSION.to_string(),
        api_version: config.api_version,
        store_schema_version: CURRENT_STORE_SCHEMA_VERSION,
        ready: state.orchestrator.is_ready(),
    })
}

async fn add_backend(
    State(state): State<AppState>,
    Json(spec): Json<BackendSpec>,
) -> ApiResult<(StatusCode, Json<Backend>)> {
    info!("Adding backend {} ({})", spec.name, spec.driver_name);
    let backend = state.orchestrator.add_backend(spec).await?;
    Ok((StatusCode::CREATED, Json(backend)))
}

async fn list_backends(State(state): State<AppState>) -> ApiResult<Json<Vec<Backend>>> {
    Ok(Json(state.orchestrator.list_backends()?))
}

async fn get_backend(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Backend>> {
    Ok(Json(state.orchestrator.get_backend(&name)?))
}

async fn delete_backend(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    state.orchestrator.delete_backend(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_backend_state(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<BackendStateRequest>,
) -> ApiResult<Json<Backend>> {
    Ok(Json(
        state
            .orchestrator
            .set_backend_state(&name, request.state)
            .await?,
    ))
}

async fn create_volume(
    State(state): State<AppState>,
    Json(request): Json<VolumeRequest>,
) -> ApiResult<(StatusCode, Json<Volume>)> {
    info!("Creating volume {}", request.name);
    let volume = state
        .orchestrator
        .create_volume(request, &state.context())
        .await?;
    Ok((StatusCode::CREATED, Json(volume)))
}

async fn list_volumes(State(state): State<AppState>) -> ApiResult<Json<Vec<Volume>>> {
    Ok(Json(state.orchestrator.list_volumes()?))
}

async fn get_volume(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Volume>> {
    Ok(Json(state.orchestrator.get_volume(&name)?))
}

async fn delete_volume(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    state
        .orchestrator
        .delete_volume(&name, &state.context())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn resize_volume(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<ResizeVolumeRequest>,
) -> ApiResult<Json<Volume>> {
    Ok(Json(
        state
            .orchestrator
            .resize_volume(&name, request.size_bytes, &state.context())
            .await?,
    ))
}

async fn clone_volume(
    State(state): State<AppState>,
    Path(source): Path<String>,
    Json(request): Json<CloneVolumeRequest>,
) -> ApiResult<(StatusCode, Json<Volume>)> {
    let request = CloneRequest {
        source,
        name: request.name,
        snapshot: request.snapshot,
    };
    let volume = state
        .orchestrator
        .clone_volume(request, &state.context())
        .await?;
    Ok((StatusCode::CREATED, Json(volume)))
}

async fn import_volume(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<ImportVolumeRequest>,
) -> ApiResult<(StatusCode, Json<Volume>)> {
    let request = ImportRequest {
        name,
        backend_uuid: request.backend_uuid,
        pool: request.pool,
        original_name: request.original_name,
        access_mode: request.access_mode,
        volume_mode: request.volume_mode,
        luks: request.luks,
    };
    let volume = state
        .orchestrator
        .import_volume(request, &state.context())
        .await?;
    Ok((StatusCode::CREATED, Json(volume)))
}

async fn publish_volume(
    State(state): State<AppState>,
    Path((name, node)): Path<(String, String)>,
    request: Option<Json<PublishRequest>>,
) -> ApiResult<Json<VolumePublication>> {
    let read_only = match request {
        Some(Json(request)) => {
            let volume = state.orchestrator.get_volume(&name)?;
            request.effective_read_only(volume.access_mode)?
        }
        None => false,
    };
    Ok(Json(
        state
            .orchestrator
            .publish_volume(&name, &node, read_only, &state.context())
            .await?,
    ))
}

async fn get_publication(
    State(state): State<AppState>,
    Path((name, node)): Path<(String, String)>,
) -> ApiResult<Json<VolumePublication>> {
    Ok(Json(state.orchestrator.get_publication(&name, &node)?))
}

async fn unpublish_volume(
    State(state): State<AppState>,
    Path((name, node)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    state
        .orchestrator
        .unpublish_volume(&name, &node, &state.context())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_publications(
    State(state): State<AppState>,
    Query(filter): Query<VolumeFilter>,
) -> ApiResult<Json<Vec<VolumePublication>>> {
    Ok(Json(
        state
            .orchestrator
            .list_publications(filter.volume.as_deref())?,
    ))
}

async fn create_snapshot(
    State(state): State<AppState>,
    Path((name, snapshot)): Path<(String, String)>,
) -> ApiResult<(StatusCode, Json<Snapshot>)> {
    let snapshot = state
        .orchestrator
        .create_snapshot(&name, &snapshot, &state.context())
        .await?;
    Ok((StatusCode::CREATED, Json(snapshot)))
}

async fn get_snapshot(
    State(state): State<AppState>,
    Path((name, snapshot)): Path<(String, String)>,
) -> ApiResult<Json<Snapshot>> {
    Ok(Json(state.orchestrator.get_snapshot(&name, &snapshot)?))
}

async fn delete_snapshot(
    State(state): State<AppState>,
    Path((name, snapshot)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    state
        .orchestrator
        .delete_snapshot(&name, &snapshot, &state.context())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_snapshots(
    State(state): State<AppState>,
    Query(filter): Query<VolumeFilter>,
) -> ApiResult<Json<Vec<Snapshot>>> {
    Ok(Json(
        state.orchestrator.list_snapshots(filter.volume.as_deref())?,
    ))
}

async fn add_storage_class(
    State(state): State<AppState>,
    Json(class): Json<StorageClass>,
) -> ApiResult<(StatusCode, Json<StorageClass>)> {
    let class = state.orchestrator.add_storage_class(class).await?;
    Ok((StatusCode::CREATED, Json(class)))
}

async fn list_storage_classes(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<StorageClass>>> {
    Ok(Json(state.orchestrator.list_storage_classes()?))
}

async fn get_storage_class(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<StorageClass>> {
    Ok(Json(state.orchestrator.get_storage_class(&name)?))
}

async fn update_storage_class(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(mut class): Json<StorageClass>,
) -> ApiResult<Json<StorageClass>> {
    class.name = name;
    Ok(Json(state.orchestrator.update_storage_class(class).await?))
}

async fn delete_storage_class(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    state.orchestrator.delete_storage_class(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn add_node(
    State(state): State<AppState>,
    Json(node): Json<Node>,
) -> ApiResult<(StatusCode, Json<Node>)> {
    let node = state.orchestrator.add_node(node).await?;
    Ok((StatusCode::CREATED, Json(node)))
}

async fn list_nodes(State(state): State<AppState>) -> ApiResult<Json<Vec<Node>>> {
    Ok(Json(state.orchestrator.list_nodes()?))
}

async fn get_node(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Node>> {
    Ok(Json(state.orchestrator.get_node(&name)?))
}

async fn delete_node(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    state.orchestrator.delete_node(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_transactions(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<Transaction>>> {
    Ok(Json(state.orchestrator.list_transactions().await?))
}

/// Health check
async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness check
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    if state.orchestrator.is_ready() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "bootstrapping")
    }
}
