//! Axum router exposing every node-local RPC surface.
//!
//! One route per entry in `stampede_core::rpc::routes`, JSON in and
//! out. Handlers stay thin: decode, delegate to the owning subsystem,
//! encode.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use stampede_core::Error;
use stampede_core::rpc::routes;
use stampede_core::serve::{Coordinator, WorkerAgent};
use stampede_core::store::KvsNode;
use stampede_proto::rpc::{
    BackupRequest, BackupResponse, BulkLookupRequest, BulkLookupResponse, DeleteRequest,
    DeleteResponse, FetchSequenceResponse, FinishInferenceRequest, FinishInferenceResponse,
    InferenceRequest, InferenceResponse, LookupRequest, LookupResponse, QueryDataRequest,
    QueryDataResponse, ReadRequest, ReadResponse, StatusRequest, StatusResponse, TrainRequest,
    TrainResponse, WriteRequest, WriteResponse,
};

/// Shared handles for every service this node hosts.
#[derive(Clone)]
pub struct AppState {
    pub kvs_node: Arc<KvsNode>,
    pub coordinator: Arc<Coordinator>,
    pub worker: Arc<WorkerAgent>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish()
    }
}

/// Core errors rendered as HTTP responses. Misroutes and admission
/// conflicts are the caller's fault; the rest is on us.
struct ApiError(Error);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::Misroute(_) | Error::Admission(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::NotConverged => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.0.to_string()).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(routes::KVS_READ, post(kvs_read))
        .route(routes::KVS_WRITE, post(kvs_write))
        .route(routes::KVS_DELETE, post(kvs_delete))
        .route(routes::KVS_LOOKUP, post(kvs_lookup))
        .route(routes::KVS_BULK_LOOKUP, post(kvs_bulk_lookup))
        .route(routes::KVS_FETCH_SEQUENCE, post(kvs_fetch_sequence))
        .route(routes::COORD_TRAIN, post(coord_train))
        .route(routes::COORD_INFERENCE, post(coord_inference))
        .route(routes::COORD_QUERY_DATA, post(coord_query_data))
        .route(routes::COORD_BACKUP, post(coord_backup))
        .route(routes::COORD_STATUS, post(coord_status))
        .route(routes::WORKER_TRAIN, post(worker_train))
        .route(routes::WORKER_INFERENCE, post(worker_inference))
        .route(routes::WORKER_FINISH_INFERENCE, post(worker_finish_inference))
        .with_state(state)
}

// -- key-value store -------------------------------------------------------

async fn kvs_read(
    State(state): State<AppState>,
    Json(request): Json<ReadRequest>,
) -> Json<ReadResponse> {
    Json(state.kvs_node.read(request).await)
}

async fn kvs_write(
    State(state): State<AppState>,
    Json(request): Json<WriteRequest>,
) -> Json<WriteResponse> {
    Json(state.kvs_node.write(request).await)
}

async fn kvs_delete(
    State(state): State<AppState>,
    Json(request): Json<DeleteRequest>,
) -> Json<DeleteResponse> {
    Json(state.kvs_node.delete(request))
}

async fn kvs_lookup(
    State(state): State<AppState>,
    Json(request): Json<LookupRequest>,
) -> Json<LookupResponse> {
    Json(state.kvs_node.lookup(request).await)
}

async fn kvs_bulk_lookup(
    State(state): State<AppState>,
    Json(request): Json<BulkLookupRequest>,
) -> Json<BulkLookupResponse> {
    Json(state.kvs_node.bulk_lookup(request).await)
}

async fn kvs_fetch_sequence(State(state): State<AppState>) -> Json<FetchSequenceResponse> {
    Json(state.kvs_node.fetch_sequence().await)
}

// -- coordinator -----------------------------------------------------------

async fn coord_train(
    State(state): State<AppState>,
    Json(request): Json<TrainRequest>,
) -> Result<Json<TrainResponse>, ApiError> {
    Ok(Json(state.coordinator.train(request).await?))
}

async fn coord_inference(
    State(state): State<AppState>,
    Json(request): Json<InferenceRequest>,
) -> Result<Json<InferenceResponse>, ApiError> {
    Ok(Json(state.coordinator.inference(request).await?))
}

async fn coord_query_data(
    State(state): State<AppState>,
    Json(request): Json<QueryDataRequest>,
) -> Result<Json<QueryDataResponse>, ApiError> {
    Ok(Json(state.coordinator.query_data(request).await?))
}

async fn coord_backup(
    State(state): State<AppState>,
    Json(request): Json<BackupRequest>,
) -> Json<BackupResponse> {
    Json(state.coordinator.backup(request).await)
}

async fn coord_status(
    State(state): State<AppState>,
    Json(request): Json<StatusRequest>,
) -> Json<StatusResponse> {
    Json(state.coordinator.status(request).await)
}

// -- worker ----------------------------------------------------------------

async fn worker_train(
    State(state): State<AppState>,
    Json(request): Json<TrainRequest>,
) -> Result<Json<TrainResponse>, ApiError> {
    Ok(Json(state.worker.train(request).await?))
}

async fn worker_inference(
    State(state): State<AppState>,
    Json(request): Json<InferenceRequest>,
) -> Result<Json<InferenceResponse>, ApiError> {
    Ok(Json(state.worker.inference(request).await?))
}

async fn worker_finish_inference(
    State(state): State<AppState>,
    Json(_request): Json<FinishInferenceRequest>,
) -> Json<FinishInferenceResponse> {
    Json(state.worker.finish_inference().await)
}
