//! Leader directory service plus the HTTP status façade.
//!
//! The directory holds a single value, the current leader's address,
//! written by whichever node wins the join-time election. The façade
//! routes proxy status queries to that leader's coordinator and return
//! its JSON verbatim.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use stampede_core::rpc::{RpcClient, routes};
use stampede_proto::rpc::{
    LookupLeaderResponse, ResponseStatus, StatusFormat, StatusKind, StatusRequest, StatusResponse,
    UpdateLeaderRequest, UpdateLeaderResponse,
};
use tracing::{info, warn};

const STATUS_PROXY_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct DirectoryApp {
    leader: Arc<Mutex<Option<String>>>,
    rpc: RpcClient,
}

impl std::fmt::Debug for DirectoryApp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryApp")
            .field("leader", &self.leader.lock().ok().and_then(|l| l.clone()))
            .finish()
    }
}

impl DirectoryApp {
    pub fn new() -> Self {
        Self {
            leader: Arc::new(Mutex::new(None)),
            rpc: RpcClient::new(),
        }
    }

    pub fn leader(&self) -> Option<String> {
        self.leader.lock().ok().and_then(|leader| leader.clone())
    }

    pub fn clear(&self) {
        if let Ok(mut leader) = self.leader.lock() {
            *leader = None;
        }
    }
}

impl Default for DirectoryApp {
    fn default() -> Self {
        Self::new()
    }
}

pub fn router(app: DirectoryApp) -> Router {
    Router::new()
        .route(routes::DIRECTORY_LOOKUP, post(lookup))
        .route(routes::DIRECTORY_UPDATE, post(update))
        .route("/worker", get(worker_status))
        .route("/jobs", get(jobs_status))
        .route("/completed-jobs", get(completed_jobs_status))
        .with_state(app)
}

async fn lookup(State(app): State<DirectoryApp>) -> Json<LookupLeaderResponse> {
    Json(LookupLeaderResponse {
        address: app.leader(),
    })
}

async fn update(
    State(app): State<DirectoryApp>,
    Json(request): Json<UpdateLeaderRequest>,
) -> Json<UpdateLeaderResponse> {
    let address = request.leader.address();
    info!(leader = %address, "directory updated");
    if let Ok(mut leader) = app.leader.lock() {
        *leader = Some(address);
    }
    Json(UpdateLeaderResponse {
        status: ResponseStatus::Ok,
    })
}

// -- status façade ---------------------------------------------------------

#[derive(Debug, Deserialize)]
struct JobsQuery {
    id: Option<String>,
}

async fn worker_status(State(app): State<DirectoryApp>) -> Response {
    proxy_status(&app, StatusKind::Workers, String::new()).await
}

async fn jobs_status(State(app): State<DirectoryApp>, Query(query): Query<JobsQuery>) -> Response {
    match query.id {
        Some(id) => proxy_status(&app, StatusKind::JobDetail, id).await,
        None => proxy_status(&app, StatusKind::Jobs, String::new()).await,
    }
}

async fn completed_jobs_status(State(app): State<DirectoryApp>) -> Response {
    proxy_status(&app, StatusKind::CompletedJobs, String::new()).await
}

async fn proxy_status(app: &DirectoryApp, which: StatusKind, payload: String) -> Response {
    let Some(leader) = app.leader() else {
        return (StatusCode::SERVICE_UNAVAILABLE, "no leader registered").into_response();
    };

    let proxied: Result<StatusResponse, _> = app
        .rpc
        .post(
            &leader,
            routes::COORD_STATUS,
            &StatusRequest {
                which,
                format: StatusFormat::Json,
                payload,
            },
            STATUS_PROXY_DEADLINE,
        )
        .await;

    match proxied {
        Ok(response) => (
            [(header::CONTENT_TYPE, "application/json")],
            response.message,
        )
            .into_response(),
        Err(err) => {
            warn!(leader = %leader, error = %err, "status proxy failed");
            (StatusCode::BAD_GATEWAY, "coordinator unreachable").into_response()
        }
    }
}
