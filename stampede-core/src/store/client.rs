use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use stampede_config::StoreConfig;
use stampede_proto::rpc::{
    DeleteRequest, DeleteResponse, FetchSequenceResponse, LookupRequest, LookupResponse,
    ReadRequest, ReadResponse, ResponseStatus, WriteRequest, WriteResponse,
};
use stampede_proto::{Process, Sequence, WriteId};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::ring::RingServer;
use crate::rpc::{RpcClient, routes};
use crate::store::node::KvsNode;
use crate::store::task::{StoreTask, StoreTaskResult, TaskKind};

/// Delay between retries while the leader reports `NotConverged`.
const CONVERGENCE_RETRY_DELAY: Duration = Duration::from_millis(300);
/// Bound on convergence retries so a torn ring cannot hang callers
/// forever; at the default delay this is ~12 s of patience.
const CONVERGENCE_MAX_RETRIES: usize = 40;

const SEQUENCE_DEADLINE: Duration = Duration::from_secs(2);

/// Client side of the store: sequence fetch from the leader, replica
/// fan-out, quorum collection and result reconciliation.
pub struct KvsClient {
    node: Arc<KvsNode>,
    ring: Arc<RingServer>,
    config: StoreConfig,
    rpc: RpcClient,
    scratch_dir: PathBuf,
}

impl std::fmt::Debug for KvsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvsClient")
            .field("config", &self.config)
            .field("scratch_dir", &self.scratch_dir)
            .finish()
    }
}

impl KvsClient {
    pub fn new(
        node: Arc<KvsNode>,
        ring: Arc<RingServer>,
        config: StoreConfig,
        rpc: RpcClient,
        scratch_dir: PathBuf,
    ) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&scratch_dir)?;
        Ok(Arc::new(Self {
            node,
            ring,
            config,
            rpc,
            scratch_dir,
        }))
    }

    // -- high-level operations --------------------------------------------

    /// Fetch one version of a file (1 = latest). `NotFound` when the
    /// quorum cannot produce it.
    pub async fn get(&self, filename: &str, version: usize) -> Result<Vec<u8>> {
        let result = self
            .execute_task(StoreTask::Get {
                filename: filename.to_string(),
                version,
            })
            .await?;

        match result {
            StoreTaskResult::Get {
                status: ResponseStatus::Ok,
                data,
                ..
            } => Ok(data),
            _ => Err(Error::NotFound(filename.to_string())),
        }
    }

    /// Fetch the latest version into the scratch directory and return
    /// the local path.
    pub async fn get_to_file(&self, local_name: &str, filename: &str) -> Result<PathBuf> {
        let data = self.get(filename, 1).await?;
        self.write_local_file(local_name, &data).await?;
        Ok(self.local_path(local_name))
    }

    /// Fetch the `count` newest versions, newest first. Stops early when
    /// fewer exist.
    pub async fn get_versions(&self, filename: &str, count: usize) -> Result<Vec<Vec<u8>>> {
        let mut versions = Vec::new();
        for version in 1..=count.max(1) {
            match self.get(filename, version).await {
                Ok(data) => versions.push(data),
                Err(Error::NotFound(_)) if !versions.is_empty() => break,
                Err(err) => return Err(err),
            }
        }
        Ok(versions)
    }

    pub async fn put_bytes(&self, filename: &str, data: Vec<u8>) -> Result<()> {
        let self_process = self.ring.self_process().await;
        let write_id = WriteId {
            ip: self_process.ip.clone(),
            port: self_process.port,
            create_time: Utc::now(),
        };

        let result = self
            .execute_task(StoreTask::Put {
                filename: filename.to_string(),
                data,
                write_id,
            })
            .await?;

        match result.status() {
            ResponseStatus::Ok => Ok(()),
            _ => Err(Error::PeerStatus("put")),
        }
    }

    /// Upload a local file under the given store name.
    pub async fn put(&self, local_path: &Path, filename: &str) -> Result<()> {
        let data = tokio::fs::read(local_path).await?;
        self.put_bytes(filename, data).await
    }

    pub async fn delete(&self, filename: &str) -> Result<()> {
        let result = self
            .execute_task(StoreTask::Delete {
                filename: filename.to_string(),
            })
            .await?;

        match result.status() {
            ResponseStatus::Ok => Ok(()),
            _ => Err(Error::PeerStatus("delete")),
        }
    }

    /// Addresses of the replicas currently hosting the file.
    pub async fn list(&self, filename: &str) -> Result<Vec<String>> {
        let result = self
            .execute_task(StoreTask::List {
                filename: filename.to_string(),
            })
            .await?;

        match result {
            StoreTaskResult::List {
                status: ResponseStatus::Ok,
                hosts,
            } => Ok(hosts),
            _ => Err(Error::NotFound(filename.to_string())),
        }
    }

    // -- directory conveniences -------------------------------------------

    /// Upload every file in a local directory as `<store_dir>/<name>`
    /// and write a manifest under `store_dir` listing the stored names.
    /// The manifest doubles as an inference dataset: one input per line.
    pub async fn put_dir(&self, local_dir: &Path, store_dir: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(local_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                names.push((entry.file_name().to_string_lossy().into_owned(), entry.path()));
            }
        }
        names.sort();

        let mut stored = Vec::new();
        for (name, path) in names {
            let store_name = format!("{store_dir}/{name}");
            self.put(&path, &store_name).await?;
            stored.push(store_name);
        }

        let manifest = stored.join("\n");
        self.put_bytes(store_dir, manifest.into_bytes()).await?;
        Ok(stored)
    }

    /// Check that every manifest entry still resolves somewhere.
    pub async fn validate_dir(&self, store_dir: &str) -> Result<Vec<(String, bool)>> {
        let manifest = self.get(store_dir, 1).await?;
        let mut checks = Vec::new();
        for name in manifest_lines(&manifest) {
            let present = self.list(&name).await.is_ok();
            checks.push((name, present));
        }
        Ok(checks)
    }

    /// Delete every manifest entry, then the manifest itself.
    pub async fn delete_dir(&self, store_dir: &str) -> Result<usize> {
        let manifest = self.get(store_dir, 1).await?;
        let names = manifest_lines(&manifest);
        let mut deleted = 0usize;
        for name in &names {
            self.delete(name).await?;
            deleted += 1;
        }
        self.delete(store_dir).await?;
        Ok(deleted)
    }

    // -- task execution ----------------------------------------------------

    /// Run one operation end to end: sequence from the leader, fan-out
    /// to the replica set, quorum wait, reconciliation.
    pub async fn execute_task(&self, task: StoreTask) -> Result<StoreTaskResult> {
        let kind = task.kind();
        let seq = self.fetch_sequence().await?;

        let replicas = self.node.find_replicas(task.filename());
        if replicas.is_empty() {
            return Err(Error::Internal("no replicas available for key".to_string()));
        }

        let (tx, mut rx) = mpsc::channel(replicas.len());
        for replica in replicas {
            let client = self.rpc.clone();
            let task = task.clone();
            let deadline = self.timeout_for(kind);
            let tx = tx.clone();
            tokio::spawn(async move {
                match route_task(&client, &task, seq, &replica, deadline).await {
                    Ok(result) => {
                        let _ = tx.send(result).await;
                    }
                    Err(err) => {
                        debug!(kind = %task.kind(), file = %task.filename(),
                               replica = %replica.address(), error = %err, "replica call failed");
                    }
                }
            });
        }
        drop(tx);

        let required = self.consistency_level(kind);
        let mut acks: Vec<StoreTaskResult> = Vec::new();
        let quorum = timeout(self.timeout_for(kind), async {
            while acks.len() < required {
                match rx.recv().await {
                    Some(result) => acks.push(result),
                    None => break,
                }
            }
        })
        .await;

        if quorum.is_err() || acks.len() < required {
            warn!(kind = %kind, file = %task.filename(), received = acks.len(), required,
                  "quorum not reached");
            return match kind {
                TaskKind::Get => Ok(StoreTaskResult::Get {
                    status: ResponseStatus::NotFound,
                    seq: None,
                    data: Vec::new(),
                }),
                TaskKind::List => Ok(StoreTaskResult::List {
                    status: ResponseStatus::NotFound,
                    hosts: Vec::new(),
                }),
                TaskKind::Put => Err(Error::QuorumTimeout {
                    op: "put",
                    received: acks.len(),
                    required,
                }),
                TaskKind::Delete => Err(Error::QuorumTimeout {
                    op: "delete",
                    received: acks.len(),
                    required,
                }),
            };
        }

        Ok(reconcile(kind, acks))
    }

    /// Ask the current leader for a sequence, retrying while the ring
    /// reports `NotConverged`.
    pub async fn fetch_sequence(&self) -> Result<Sequence> {
        for _ in 0..CONVERGENCE_MAX_RETRIES {
            let leader = self
                .ring
                .lookup_leader()
                .await?
                .ok_or(Error::NoLeader)?;

            let response: FetchSequenceResponse = self
                .rpc
                .post(
                    &leader,
                    routes::KVS_FETCH_SEQUENCE,
                    &serde_json::json!({}),
                    SEQUENCE_DEADLINE,
                )
                .await?;

            match (response.status, response.seq) {
                (ResponseStatus::Ok, Some(seq)) => return Ok(seq),
                (ResponseStatus::NotConverged, _) => {
                    debug!("leader not converged, retrying sequence fetch");
                    tokio::time::sleep(CONVERGENCE_RETRY_DELAY).await;
                }
                _ => return Err(Error::PeerStatus("fetch sequence")),
            }
        }
        Err(Error::NotConverged)
    }

    /// Consistency level for the operation, clamped to the ring size.
    fn consistency_level(&self, kind: TaskKind) -> usize {
        let level = match kind {
            TaskKind::Get => self.config.read_consistency,
            TaskKind::Put => self.config.write_consistency,
            TaskKind::Delete => self.config.delete_consistency(),
            TaskKind::List => self.config.list_consistency(),
        };
        level.min(self.node.hash_ring_len()).max(1)
    }

    fn timeout_for(&self, kind: TaskKind) -> Duration {
        match kind {
            TaskKind::Get => self.config.get_timeout,
            TaskKind::Put => self.config.put_timeout,
            TaskKind::Delete => self.config.delete_timeout,
            TaskKind::List => self.config.lookup_timeout,
        }
    }

    // -- local scratch files ----------------------------------------------

    pub fn local_path(&self, name: &str) -> PathBuf {
        self.scratch_dir.join(name.replace('/', "_"))
    }

    pub async fn read_local_file(&self, name: &str) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(self.local_path(name)).await?)
    }

    pub async fn write_local_file(&self, name: &str, data: &[u8]) -> Result<()> {
        tokio::fs::write(self.local_path(name), data).await?;
        Ok(())
    }

    pub async fn delete_local_file(&self, name: &str) -> Result<()> {
        tokio::fs::remove_file(self.local_path(name)).await?;
        Ok(())
    }
}

/// Split a manifest payload into its non-empty lines.
fn manifest_lines(manifest: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(manifest)
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.to_string())
        .collect()
}

/// Send one task to one replica and translate its reply. Errors and
/// error statuses are reported to the caller, which simply drops them;
/// the quorum wait only counts positive acks.
async fn route_task(
    rpc: &RpcClient,
    task: &StoreTask,
    seq: Sequence,
    replica: &Process,
    deadline: Duration,
) -> Result<StoreTaskResult> {
    let addr = replica.address();
    match task {
        StoreTask::Get { filename, version } => {
            let response: ReadResponse = rpc
                .post(
                    &addr,
                    routes::KVS_READ,
                    &ReadRequest {
                        filename: filename.clone(),
                        version: *version,
                    },
                    deadline,
                )
                .await?;
            if response.status != ResponseStatus::Ok {
                return Err(Error::PeerStatus("read"));
            }
            Ok(StoreTaskResult::Get {
                status: response.status,
                seq: response.seq,
                data: response.data,
            })
        }
        StoreTask::Put {
            filename,
            data,
            write_id,
        } => {
            let response: WriteResponse = rpc
                .post(
                    &addr,
                    routes::KVS_WRITE,
                    &WriteRequest {
                        filename: filename.clone(),
                        data: data.clone(),
                        write_id: write_id.clone(),
                        seq,
                    },
                    deadline,
                )
                .await?;
            if response.status != ResponseStatus::Ok {
                return Err(Error::PeerStatus("write"));
            }
            Ok(StoreTaskResult::Put {
                status: response.status,
            })
        }
        StoreTask::Delete { filename } => {
            let response: DeleteResponse = rpc
                .post(
                    &addr,
                    routes::KVS_DELETE,
                    &DeleteRequest {
                        filename: filename.clone(),
                    },
                    deadline,
                )
                .await?;
            if response.status != ResponseStatus::Ok {
                return Err(Error::PeerStatus("delete"));
            }
            Ok(StoreTaskResult::Delete {
                status: response.status,
            })
        }
        StoreTask::List { filename } => {
            let response: LookupResponse = rpc
                .post(
                    &addr,
                    routes::KVS_LOOKUP,
                    &LookupRequest {
                        filename: filename.clone(),
                    },
                    deadline,
                )
                .await?;
            if response.status != ResponseStatus::Ok {
                return Err(Error::PeerStatus("lookup"));
            }
            Ok(StoreTaskResult::List {
                status: response.status,
                hosts: response.address.into_iter().collect(),
            })
        }
    }
}

/// Collapse quorum acks into one result: reads pick the payload with
/// the largest sequence, lists union the replying hosts, writes and
/// deletes are OK once the quorum acked.
fn reconcile(kind: TaskKind, acks: Vec<StoreTaskResult>) -> StoreTaskResult {
    match kind {
        TaskKind::Get => {
            let mut best: Option<(Sequence, Vec<u8>)> = None;
            for ack in acks {
                if let StoreTaskResult::Get {
                    seq: Some(seq),
                    data,
                    ..
                } = ack
                {
                    let newer = best.as_ref().is_none_or(|(current, _)| seq > *current);
                    if newer {
                        best = Some((seq, data));
                    }
                }
            }
            match best {
                Some((seq, data)) => StoreTaskResult::Get {
                    status: ResponseStatus::Ok,
                    seq: Some(seq),
                    data,
                },
                None => StoreTaskResult::Get {
                    status: ResponseStatus::NotFound,
                    seq: None,
                    data: Vec::new(),
                },
            }
        }
        TaskKind::Put => StoreTaskResult::Put {
            status: ResponseStatus::Ok,
        },
        TaskKind::Delete => StoreTaskResult::Delete {
            status: ResponseStatus::Ok,
        },
        TaskKind::List => {
            let mut hosts: Vec<String> = acks
                .into_iter()
                .filter_map(|ack| match ack {
                    StoreTaskResult::List { hosts, .. } => Some(hosts),
                    _ => None,
                })
                .flatten()
                .collect();
            hosts.sort();
            hosts.dedup();
            StoreTaskResult::List {
                status: ResponseStatus::Ok,
                hosts,
            }
        }
    }
}
