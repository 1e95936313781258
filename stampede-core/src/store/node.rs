use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use stampede_config::StoreConfig;
use stampede_proto::rpc::{
    BulkLookupRequest, BulkLookupResponse, DeleteRequest, DeleteResponse, FetchSequenceResponse,
    LookupRequest, LookupResponse, ReadRequest, ReadResponse, ResponseStatus, StoredFile,
    WriteRequest, WriteResponse,
};
use stampede_proto::{Process, Sequence};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::ring::{MemberUpdate, RingServer};
use crate::rpc::{RpcClient, routes};
use crate::store::cache::LfuCache;
use crate::store::file_table::{FileTable, FileVersion};
use crate::store::hash_ring::HashRing;
use crate::util::concat_filename;

const TRANSFER_MAX_RETRY: usize = 5;
/// Successor replicas refreshed during convergence, besides the
/// predecessor.
const CONVERGE_SUCCESSORS: usize = 3;

/// A pending membership change the store has not reconciled yet.
#[derive(Clone, Debug)]
pub struct SignalEvent {
    pub action: MemberUpdate,
    pub process: Process,
}

#[derive(Debug)]
struct KvsState {
    file_table: FileTable,
    cache: LfuCache,
    hash_ring: HashRing,
    seq_counter: u64,
    signals: VecDeque<SignalEvent>,
    delete_pool: VecDeque<String>,
}

/// Replica-side store node.
///
/// Reacts to ring events with delete-pool recycling and replica
/// convergence; serves read/write/delete/lookup/bulk-lookup and the
/// leader's sequence fetch. State sits behind one coarse mutex that is
/// never held across disk or network I/O.
pub struct KvsNode {
    ring: Arc<RingServer>,
    config: StoreConfig,
    data_dir: PathBuf,
    rpc: RpcClient,
    state: Mutex<KvsState>,
}

impl std::fmt::Debug for KvsNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvsNode")
            .field("data_dir", &self.data_dir)
            .field("config", &self.config)
            .finish()
    }
}

impl KvsNode {
    /// Create the node and its data directory (named by the listening
    /// port). Failing to create the directory is fatal at boot.
    pub fn new(
        ring: Arc<RingServer>,
        config: StoreConfig,
        data_base: &Path,
        port: u16,
        rpc: RpcClient,
    ) -> Result<Arc<Self>> {
        let data_dir = data_base.join(port.to_string());
        std::fs::create_dir_all(&data_dir)?;

        Ok(Arc::new(Self {
            ring,
            config: config.clone(),
            data_dir,
            rpc,
            state: Mutex::new(KvsState {
                file_table: FileTable::default(),
                cache: LfuCache::new(config.cache_capacity),
                hash_ring: HashRing::default(),
                seq_counter: 0,
                signals: VecDeque::new(),
                delete_pool: VecDeque::new(),
            }),
        }))
    }

    /// Ring observer: queue the change for the next convergence pass.
    pub fn on_member_update(&self, process: &Process, action: MemberUpdate) {
        let mut state = self.state.lock().expect("kvs state poisoned");
        state.signals.push_back(SignalEvent {
            action,
            process: process.clone(),
        });
    }

    /// Replica set for a key under this node's current hash ring view.
    pub fn find_replicas(&self, key: &str) -> Vec<Process> {
        let state = self.state.lock().expect("kvs state poisoned");
        state.hash_ring.find_replicas(key, self.config.replica_count)
    }

    pub fn hash_ring_len(&self) -> usize {
        self.state.lock().expect("kvs state poisoned").hash_ring.len()
    }

    // -- service surface ---------------------------------------------------

    /// Issue the next sequence, or `NotConverged` while member changes
    /// or expirations are outstanding.
    pub async fn fetch_sequence(&self) -> FetchSequenceResponse {
        let expirations_empty = self.ring.expiration_pool_empty().await;
        let join_time = self.ring.self_process().await.join_time;

        let mut state = self.state.lock().expect("kvs state poisoned");
        if !state.signals.is_empty() || !expirations_empty {
            return FetchSequenceResponse {
                status: ResponseStatus::NotConverged,
                seq: None,
            };
        }

        state.seq_counter += 1;
        FetchSequenceResponse {
            status: ResponseStatus::Ok,
            seq: Some(Sequence {
                time: join_time,
                count: state.seq_counter,
            }),
        }
    }

    pub async fn read(&self, request: ReadRequest) -> ReadResponse {
        let (concat_name, seq) = {
            let mut state = self.state.lock().expect("kvs state poisoned");
            let Some(version) = state.file_table.get(&request.filename, request.version) else {
                debug!(file = %request.filename, version = request.version, "read miss");
                return ReadResponse {
                    status: ResponseStatus::Error,
                    seq: None,
                    data: Vec::new(),
                };
            };
            let concat_name = version.concat_name.clone();
            let seq = version.seq;

            if let Some(data) = state.cache.get(&concat_name) {
                return ReadResponse {
                    status: ResponseStatus::Ok,
                    seq: Some(seq),
                    data,
                };
            }
            (concat_name, seq)
        };

        match self.read_disk(&concat_name).await {
            Ok(data) => ReadResponse {
                status: ResponseStatus::Ok,
                seq: Some(seq),
                data,
            },
            Err(err) => {
                warn!(file = %concat_name, error = %err, "failed to read stored file");
                ReadResponse {
                    status: ResponseStatus::Error,
                    seq: None,
                    data: Vec::new(),
                }
            }
        }
    }

    /// Idempotent write: duplicate write id or sequence acks OK without
    /// creating a version, so client retries and convergence transfers
    /// are safe.
    pub async fn write(&self, request: WriteRequest) -> WriteResponse {
        let concat_name = concat_filename(&request.filename, &request.seq);

        {
            let mut state = self.state.lock().expect("kvs state poisoned");
            let inserted = state.file_table.insert(
                &request.filename,
                FileVersion {
                    concat_name: concat_name.clone(),
                    seq: request.seq,
                    write_id: request.write_id.clone(),
                },
            );
            if !inserted {
                debug!(file = %request.filename, "duplicate write id or sequence, acking without write");
                return WriteResponse {
                    status: ResponseStatus::Ok,
                };
            }
            if request.data.len() <= self.config.cache_threshold {
                state.cache.put(&concat_name, request.data.clone());
            }
        }

        match self.write_disk(&concat_name, &request.data).await {
            Ok(()) => WriteResponse {
                status: ResponseStatus::Ok,
            },
            Err(err) => {
                warn!(file = %request.filename, error = %err, "failed to persist write");
                WriteResponse {
                    status: ResponseStatus::Error,
                }
            }
        }
    }

    /// Soft delete: versions move to the delete pool and the filename
    /// leaves the table; OK even when the key was absent.
    pub fn delete(&self, request: DeleteRequest) -> DeleteResponse {
        let mut state = self.state.lock().expect("kvs state poisoned");
        if state.file_table.contains(&request.filename) {
            let versions = state.file_table.delete(&request.filename);
            for version in versions {
                debug!(file = %version.concat_name, "queued for deletion");
                state.cache.remove(&version.concat_name);
                state.delete_pool.push_back(version.concat_name);
            }
        }
        DeleteResponse {
            status: ResponseStatus::Ok,
        }
    }

    pub async fn lookup(&self, request: LookupRequest) -> LookupResponse {
        let present = {
            let state = self.state.lock().expect("kvs state poisoned");
            state.file_table.contains(&request.filename)
        };

        if present {
            LookupResponse {
                status: ResponseStatus::Ok,
                address: Some(self.ring.self_process().await.address()),
            }
        } else {
            LookupResponse {
                status: ResponseStatus::Error,
                address: None,
            }
        }
    }

    /// The subset of the requested filenames this node does not host.
    pub async fn bulk_lookup(&self, request: BulkLookupRequest) -> BulkLookupResponse {
        let missing_files = {
            let state = self.state.lock().expect("kvs state poisoned");
            request
                .filenames
                .into_iter()
                .filter(|filename| !state.file_table.contains(filename))
                .collect()
        };

        BulkLookupResponse {
            address: self.ring.self_process().await.address(),
            missing_files,
        }
    }

    /// Listing of hosted files for the `store` CLI command.
    pub async fn store_listing(&self) -> (String, Vec<StoredFile>) {
        let address = self.ring.self_process().await.address();
        let state = self.state.lock().expect("kvs state poisoned");

        let mut files: Vec<StoredFile> = state
            .file_table
            .stored_files()
            .into_iter()
            .map(|filename| StoredFile {
                versions: state.file_table.num_versions(&filename),
                latest_seq: state.file_table.latest(&filename).map(|v| v.seq),
                filename,
            })
            .collect();
        files.sort_by(|a, b| a.filename.cmp(&b.filename));
        (address, files)
    }

    // -- periodic work -----------------------------------------------------

    /// Spawn the 200 ms recycle/converge cron.
    pub fn run(self: &Arc<Self>, shutdown: CancellationToken) {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(node.config.cron_interval) => {}
                }
                node.recycle().await;
                node.converge().await;
            }
        });
    }

    /// Pop one file from the delete pool and remove its on-disk copy;
    /// then, only while the ring is stable, retire files this node is no
    /// longer a replica of.
    async fn recycle(&self) {
        let popped = {
            let mut state = self.state.lock().expect("kvs state poisoned");
            state.delete_pool.pop_front()
        };
        if let Some(concat_name) = popped {
            info!(file = %concat_name, "deleting stored file");
            if let Err(err) = self.delete_disk(&concat_name).await {
                warn!(file = %concat_name, error = %err, "failed to delete stored file");
            }
        }

        if !self.is_stable().await {
            return;
        }

        let members = self.ring.membership().await;
        let self_process = self.ring.self_process().await;

        let mut state = self.state.lock().expect("kvs state poisoned");
        state.hash_ring.refresh(&members);

        for filename in state.file_table.stored_files() {
            let replicas = state
                .hash_ring
                .find_replicas(&filename, self.config.replica_count);
            let still_ours = replicas
                .iter()
                .any(|replica| replica.same_identity(&self_process));
            if still_ours {
                continue;
            }

            info!(file = %filename, "no longer in replica set, retiring");
            for version in state.file_table.delete(&filename) {
                state.cache.remove(&version.concat_name);
                state.delete_pool.push_back(version.concat_name);
            }
        }
    }

    /// Reconcile replica placement after membership changes: transfer
    /// the keys we were primary for to the predecessor that now owns
    /// them, and our current primaries to the next successors to restore
    /// replica count. Runs only once all expirations have drained.
    async fn converge(self: &Arc<Self>) {
        {
            let state = self.state.lock().expect("kvs state poisoned");
            if state.signals.is_empty() {
                return;
            }
        }

        let members = self.ring.membership().await;
        if members.is_empty() {
            return;
        }
        if !self.ring.expiration_pool_empty().await {
            debug!("waiting for expiration pool to drain before convergence");
            return;
        }

        let self_process = self.ring.self_process().await;
        info!("membership changed, converging replica placement");

        let (predecessor_files, predecessor, successor_files, successors) = {
            let mut state = self.state.lock().expect("kvs state poisoned");

            // Files we were primary for must be recorded against the old
            // ring before refreshing, otherwise predecessor
            // reconstruction loses those keys.
            let prev_main: Vec<String> = state
                .file_table
                .stored_files()
                .into_iter()
                .filter(|file| {
                    state
                        .hash_ring
                        .route_process(file)
                        .is_some_and(|primary| primary.same_identity(&self_process))
                })
                .collect();

            state.hash_ring.refresh(&members);

            let curr_main: Vec<String> = state
                .file_table
                .stored_files()
                .into_iter()
                .filter(|file| {
                    state
                        .hash_ring
                        .route_process(file)
                        .is_some_and(|primary| primary.same_identity(&self_process))
                })
                .collect();

            let predecessor = state.hash_ring.find_predecessor(&self_process);
            let successors = state
                .hash_ring
                .find_successors(&self_process, CONVERGE_SUCCESSORS);

            let routed_to_predecessor: Vec<String> = match &predecessor {
                Some(predecessor) => prev_main
                    .into_iter()
                    .filter(|file| {
                        state
                            .hash_ring
                            .route_process(file)
                            .is_some_and(|primary| primary.same_identity(predecessor))
                    })
                    .collect(),
                None => Vec::new(),
            };

            (routed_to_predecessor, predecessor, curr_main, successors)
        };

        let mut transfers = JoinSet::new();
        if let Some(predecessor) = predecessor {
            let node = Arc::clone(self);
            transfers.spawn(async move {
                node.transfer_files(&predecessor, &predecessor_files).await;
            });
        }
        for successor in successors {
            let node = Arc::clone(self);
            let files = successor_files.clone();
            transfers.spawn(async move {
                node.transfer_files(&successor, &files).await;
            });
        }
        while transfers.join_next().await.is_some() {}

        let mut state = self.state.lock().expect("kvs state poisoned");
        state.signals.clear();
        info!(ring_len = state.hash_ring.len(), "store converged");
    }

    /// Send this node's copies of `files` that `peer` is missing, via
    /// idempotent writes so version order survives the transfer.
    async fn transfer_files(&self, peer: &Process, files: &[String]) {
        if files.is_empty() {
            return;
        }

        let response: BulkLookupResponse = match self
            .rpc
            .post(
                &peer.address(),
                routes::KVS_BULK_LOOKUP,
                &BulkLookupRequest {
                    filenames: files.to_vec(),
                },
                self.config.lookup_timeout,
            )
            .await
        {
            Ok(response) => response,
            Err(err) => {
                warn!(peer = %peer.address(), error = %err, "bulk lookup failed during convergence");
                return;
            }
        };

        let mut transferred = 0usize;
        for filename in response.missing_files {
            let versions: Vec<FileVersion> = {
                let state = self.state.lock().expect("kvs state poisoned");
                state.file_table.versions(&filename).to_vec()
            };
            if versions.is_empty() {
                warn!(file = %filename, "expected versions for missing file, found none");
                continue;
            }

            for version in versions {
                let data = match self.read_disk(&version.concat_name).await {
                    Ok(data) => data,
                    Err(err) => {
                        warn!(file = %version.concat_name, error = %err, "failed to read version for transfer");
                        continue;
                    }
                };

                let request = WriteRequest {
                    filename: filename.clone(),
                    data,
                    write_id: version.write_id.clone(),
                    seq: version.seq,
                };

                for attempt in 1..=TRANSFER_MAX_RETRY {
                    let sent: Result<WriteResponse> = self
                        .rpc
                        .post(
                            &peer.address(),
                            routes::KVS_WRITE,
                            &request,
                            self.config.put_timeout,
                        )
                        .await;
                    match sent {
                        Ok(_) => {
                            transferred += 1;
                            break;
                        }
                        Err(err) if attempt == TRANSFER_MAX_RETRY => {
                            warn!(file = %filename, peer = %peer.address(), error = %err,
                                  "giving up transferring version");
                        }
                        Err(err) => {
                            debug!(file = %filename, attempt, error = %err, "transfer retry");
                        }
                    }
                }
            }
        }

        info!(peer = %peer.address(), transferred, "convergence transfer finished");
    }

    async fn is_stable(&self) -> bool {
        let expirations_empty = self.ring.expiration_pool_empty().await;
        let state = self.state.lock().expect("kvs state poisoned");
        state.signals.is_empty() && expirations_empty
    }

    // -- disk --------------------------------------------------------------

    async fn read_disk(&self, concat_name: &str) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(self.data_dir.join(concat_name)).await?)
    }

    async fn write_disk(&self, concat_name: &str, data: &[u8]) -> Result<()> {
        tokio::fs::write(self.data_dir.join(concat_name), data).await?;
        Ok(())
    }

    async fn delete_disk(&self, concat_name: &str) -> Result<()> {
        tokio::fs::remove_file(self.data_dir.join(concat_name)).await?;
        Ok(())
    }

    /// Wipe all stored files at boot.
    pub async fn clear_disk(&self) -> Result<()> {
        let mut entries = tokio::fs::read_dir(&self.data_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let _ = tokio::fs::remove_file(entry.path()).await;
        }
        Ok(())
    }
}
