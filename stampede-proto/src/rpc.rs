//! Request/response bodies for every RPC surface in the cluster.
//!
//! The surfaces are transport-neutral serde types; `stampede-core` sends
//! them as HTTP/JSON with `reqwest` and `stampede-server` mounts the
//! matching axum routes. File payloads travel base64-encoded so the JSON
//! bodies stay valid UTF-8.

use serde::{Deserialize, Serialize};

use crate::job::{BatchInput, BatchOutput, EvalResult, Job};
use crate::process::Process;
use crate::seq::{Sequence, WriteId};

/// Outcome tag shared by every response body.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Ok,
    Error,
    NotFound,
    NotConverged,
}

/// Base64 wrapper for binary file payloads.
pub mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Leader directory
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LookupLeaderResponse {
    /// Empty when no leader has registered yet.
    pub address: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpdateLeaderRequest {
    pub leader: Process,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpdateLeaderResponse {
    pub status: ResponseStatus,
}

// ---------------------------------------------------------------------------
// Key-value store
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReadRequest {
    pub filename: String,
    /// 1 = latest, k = k-th newest.
    pub version: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReadResponse {
    pub status: ResponseStatus,
    pub seq: Option<Sequence>,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WriteRequest {
    pub filename: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    pub write_id: WriteId,
    pub seq: Sequence,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WriteResponse {
    pub status: ResponseStatus,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub filename: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub status: ResponseStatus,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LookupRequest {
    pub filename: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LookupResponse {
    pub status: ResponseStatus,
    /// Address of the replying host when the file is present there.
    pub address: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BulkLookupRequest {
    pub filenames: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BulkLookupResponse {
    pub address: String,
    /// The subset of the requested filenames this node does not host.
    pub missing_files: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FetchSequenceResponse {
    pub status: ResponseStatus,
    pub seq: Option<Sequence>,
}

/// One hosted file with its latest stamp, as reported by `store`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredFile {
    pub filename: String,
    pub versions: usize,
    pub latest_seq: Option<Sequence>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreResponse {
    pub address: String,
    pub files: Vec<StoredFile>,
}

// ---------------------------------------------------------------------------
// Coordinator & worker
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrainTask {
    pub model: String,
    pub dataset: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrainRequest {
    pub task: TrainTask,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrainResponse {
    pub status: ResponseStatus,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InferenceTask {
    pub model: String,
    pub batch_size: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub task: InferenceTask,
    /// Set when the coordinator dispatches a job to a worker; absent when
    /// a client submits the task for admission.
    pub job_id: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub status: ResponseStatus,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueryDataRequest {
    pub job_id: String,
    pub worker: Process,
    /// Output of the worker's previous batch, piggybacked on the request
    /// for the next one.
    pub batch_output: Option<BatchOutput>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueryDataResponse {
    pub batch_input: Option<BatchInput>,
    /// When true the inputs are store filenames the worker must fetch;
    /// otherwise they are raw model inputs.
    pub is_filename: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FinishInferenceRequest {}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FinishInferenceResponse {}

/// Wholesale snapshot of coordinator state pushed to the first successor.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CoordinatorBackup {
    pub model_store: Vec<(String, String)>,
    pub active_jobs: Vec<Job>,
    pub pending_jobs: Vec<Job>,
    pub completed_jobs: Vec<Job>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackupRequest {
    pub backup: CoordinatorBackup,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackupResponse {}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    Workers,
    Jobs,
    JobDetail,
    JobStats,
    CompletedJobs,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusFormat {
    Text,
    Json,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusRequest {
    pub which: StatusKind,
    pub format: StatusFormat,
    /// Job id for the per-job kinds; ignored otherwise.
    #[serde(default)]
    pub payload: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub message: String,
}

// ---------------------------------------------------------------------------
// External model runner
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServeModelRequest {
    pub model: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServeModelResponse {
    pub status: ResponseStatus,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EvaluateRequest {
    pub inputs: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EvaluateResponse {
    pub status: ResponseStatus,
    pub results: Vec<EvalResult>,
    pub metric: f32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GreetRequest {
    pub name: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GreetResponse {
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn write_request_round_trips_binary_payloads() {
        let request = WriteRequest {
            filename: "weights.bin".to_string(),
            data: vec![0u8, 159, 146, 150, 255],
            write_id: WriteId {
                ip: "127.0.0.1".to_string(),
                port: 5000,
                create_time: Utc::now(),
            },
            seq: Sequence {
                time: Utc::now(),
                count: 7,
            },
        };

        let body = serde_json::to_string(&request).expect("serialize");
        let parsed: WriteRequest = serde_json::from_str(&body).expect("deserialize");
        assert_eq!(parsed.data, request.data);
        assert_eq!(parsed.seq, request.seq);
    }

    #[test]
    fn status_payload_defaults_empty() {
        let parsed: StatusRequest =
            serde_json::from_str(r#"{"which":"workers","format":"text"}"#).expect("deserialize");
        assert_eq!(parsed.which, StatusKind::Workers);
        assert!(parsed.payload.is_empty());
    }
}
