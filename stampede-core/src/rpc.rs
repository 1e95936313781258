//! Shared HTTP/JSON transport for every RPC surface.
//!
//! Routes are plain constants so the client here and the axum router in
//! `stampede-server` cannot drift apart. All calls are `POST` with a JSON
//! body and a per-operation deadline.

use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};

/// Route table. One constant per RPC, grouped by surface.
pub mod routes {
    // Leader directory
    pub const DIRECTORY_LOOKUP: &str = "/directory/lookup";
    pub const DIRECTORY_UPDATE: &str = "/directory/update";

    // Key-value store
    pub const KVS_READ: &str = "/kvs/read";
    pub const KVS_WRITE: &str = "/kvs/write";
    pub const KVS_DELETE: &str = "/kvs/delete";
    pub const KVS_LOOKUP: &str = "/kvs/lookup";
    pub const KVS_BULK_LOOKUP: &str = "/kvs/bulk-lookup";
    pub const KVS_FETCH_SEQUENCE: &str = "/kvs/fetch-sequence";

    // Coordinator
    pub const COORD_TRAIN: &str = "/coord/train";
    pub const COORD_INFERENCE: &str = "/coord/inference";
    pub const COORD_QUERY_DATA: &str = "/coord/query-data";
    pub const COORD_BACKUP: &str = "/coord/backup";
    pub const COORD_STATUS: &str = "/coord/status";

    // Worker
    pub const WORKER_TRAIN: &str = "/worker/train";
    pub const WORKER_INFERENCE: &str = "/worker/inference";
    pub const WORKER_FINISH_INFERENCE: &str = "/worker/finish-inference";

    // External model runner
    pub const RUNNER_TRAIN: &str = "/runner/train";
    pub const RUNNER_SERVE_MODEL: &str = "/runner/serve-model";
    pub const RUNNER_EVALUATE: &str = "/runner/evaluate";
    pub const RUNNER_GREET: &str = "/runner/greet";
}

/// Thin typed JSON client over a shared connection pool.
#[derive(Clone, Debug)]
pub struct RpcClient {
    http: reqwest::Client,
}

impl Default for RpcClient {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    /// POST `request` to `http://{addr}{route}` and decode the JSON
    /// response, failing once `deadline` elapses.
    pub async fn post<Req, Res>(
        &self,
        addr: &str,
        route: &str,
        request: &Req,
        deadline: Duration,
    ) -> Result<Res>
    where
        Req: Serialize + ?Sized,
        Res: DeserializeOwned,
    {
        let url = format!("http://{addr}{route}");
        let response = self
            .http
            .post(&url)
            .timeout(deadline)
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(Error::Internal(format!(
                "{url} returned {status}: {detail}"
            )));
        }

        Ok(response.json().await?)
    }
}
