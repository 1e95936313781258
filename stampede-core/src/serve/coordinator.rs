use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use stampede_config::ServeConfig;
use stampede_proto::Job;
use stampede_proto::rpc::{
    BackupRequest, BackupResponse, CoordinatorBackup, FinishInferenceRequest,
    FinishInferenceResponse, InferenceRequest, InferenceResponse, InferenceTask, QueryDataRequest,
    QueryDataResponse, ResponseStatus, StatusFormat, StatusKind, StatusRequest, StatusResponse,
    TrainRequest, TrainResponse,
};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::ring::{MemberUpdate, RingServer};
use crate::rpc::{RpcClient, routes};
use crate::serve::model_store::{ModelStore, dataset_expects_filenames, validate_inputs};
use crate::serve::scheduler::{FairnessMode, Scheduler};
use crate::serve::status;
use crate::store::KvsClient;
use crate::util::create_id;

/// Deadline for dispatching a job to a worker (the worker loads the
/// model before acking).
const DISPATCH_DEADLINE: Duration = Duration::from_secs(5);
/// Deadline for pushing a backup snapshot to the successor.
const BACKUP_DEADLINE: Duration = Duration::from_secs(5);
/// Training fans out to every worker and waits for the runners.
const TRAIN_DEADLINE: Duration = Duration::from_secs(300);

#[derive(Debug)]
struct CoordinatorState {
    task_queue: VecDeque<InferenceTask>,
    model_store: ModelStore,
    scheduler: Scheduler,
}

/// Job admission and lifecycle on the ring leader.
///
/// Every node constructs a coordinator, but the periodic loops only act
/// once `on_become_coordinator` has fired, which happens the first time
/// a coordinator RPC reaches this node. A former coordinator that loses
/// leadership stops receiving those RPCs and its loops idle again,
/// while its successor picks up from the last pushed backup.
pub struct Coordinator {
    ring: Arc<RingServer>,
    kvs: Arc<KvsClient>,
    rpc: RpcClient,
    config: ServeConfig,
    state: Mutex<CoordinatorState>,
    is_coordinator: AtomicBool,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("config", &self.config)
            .field("is_coordinator", &self.is_coordinator.load(Ordering::Relaxed))
            .finish()
    }
}

impl Coordinator {
    pub fn new(
        ring: Arc<RingServer>,
        kvs: Arc<KvsClient>,
        config: ServeConfig,
        rpc: RpcClient,
    ) -> Arc<Self> {
        Arc::new(Self {
            ring,
            kvs,
            rpc,
            config,
            state: Mutex::new(CoordinatorState {
                task_queue: VecDeque::new(),
                model_store: ModelStore::default(),
                scheduler: Scheduler::default(),
            }),
            is_coordinator: AtomicBool::new(false),
        })
    }

    pub fn is_coordinator(&self) -> bool {
        self.is_coordinator.load(Ordering::Relaxed)
    }

    /// Flips the serving flag; fired by the first coordinator RPC that
    /// reaches this node.
    pub async fn on_become_coordinator(&self) {
        if !self.is_coordinator.swap(true, Ordering::Relaxed) {
            let addr = self.ring.self_process().await.address();
            info!(%addr, "assuming coordinator role");
        }
    }

    /// Switch the fair-time policy; takes effect at the next
    /// reallocation pass, running jobs are not drained.
    pub async fn set_fairness(&self, mode: FairnessMode) {
        let mut state = self.state.lock().await;
        state.scheduler.fairness = mode;
        info!(?mode, "fairness mode switched");
    }

    /// Ring observer. Insert/delete map to worker arrival/failure; a
    /// `Leaved` notification only fires for our own departure, which
    /// evacuates the pool wholesale.
    pub async fn on_member_update(&self, process: stampede_proto::Process, action: MemberUpdate) {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        match action {
            MemberUpdate::Insert => state.scheduler.on_worker_joined(&process, now),
            MemberUpdate::Delete => state.scheduler.on_worker_failed(&process),
            MemberUpdate::Leaved => state.scheduler.on_self_leave(),
        }
    }

    // -- periodic loops ----------------------------------------------------

    /// Spawn the coordinator's periodic loops; each is gated on the
    /// coordinator flag so non-leaders stay passive.
    pub fn run(self: &Arc<Self>, shutdown: CancellationToken) {
        self.spawn_loop(shutdown.clone(), self.config.process_queue_interval, |c| async move {
            c.process_queued_job().await;
        });
        self.spawn_loop(shutdown.clone(), self.config.reschedule_interval, |c| async move {
            c.reschedule_jobs().await;
        });
        self.spawn_loop(shutdown.clone(), self.config.flush_interval, |c| async move {
            c.flush_pending_jobs().await;
        });
        self.spawn_loop(shutdown.clone(), self.config.refresh_interval, |c| async move {
            c.state.lock().await.scheduler.refresh_batch_status();
        });
        self.spawn_loop(shutdown.clone(), self.config.refresh_interval, |c| async move {
            c.state.lock().await.scheduler.refresh_worker_status(Utc::now());
        });
        self.spawn_loop(shutdown.clone(), self.config.measure_interval, |c| async move {
            c.measure_stats().await;
        });
        self.spawn_loop(shutdown, self.config.backup_interval, |c| async move {
            c.backup_coordinator_data().await;
        });
    }

    fn spawn_loop<F, Fut>(self: &Arc<Self>, shutdown: CancellationToken, period: Duration, body: F)
    where
        F: Fn(Arc<Self>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(period) => {}
                }
                if !coordinator.is_coordinator() {
                    continue;
                }
                body(Arc::clone(&coordinator)).await;
            }
        });
    }

    /// Pop one queued inference task, fetch its dataset manifest from
    /// the store, partition into batches and register the job.
    async fn process_queued_job(&self) {
        let task = {
            let mut state = self.state.lock().await;
            state.task_queue.pop_front()
        };
        let Some(task) = task else {
            return;
        };

        let dataset = {
            let state = self.state.lock().await;
            state.model_store.dataset_for(&task.model).map(str::to_string)
        };
        let Some(dataset) = dataset else {
            warn!(model = %task.model, "queued task has no registered dataset");
            return;
        };

        // The dataset was deleted before inference started: drop the task.
        let manifest = match self.kvs.get(&dataset, 1).await {
            Ok(manifest) => manifest,
            Err(err) => {
                warn!(dataset = %dataset, error = %err, "failed to fetch dataset manifest");
                return;
            }
        };

        let inputs: Vec<String> = String::from_utf8_lossy(&manifest)
            .lines()
            .map(str::to_string)
            .collect();
        info!(dataset = %dataset, inputs = inputs.len(), "dataset manifest loaded");

        let now = Utc::now();
        let id = create_id(&format!("{}:{}", task.model, task.batch_size), now);
        let job = Job::new(id, task.model, task.batch_size, dataset, inputs, now);

        let mut state = self.state.lock().await;
        state.scheduler.add_job(job);
    }

    /// One reallocation pass: compute the new schedule under the lock,
    /// then dispatch inference RPCs to the newly assigned workers in
    /// parallel. A worker only becomes bound to the job once it acks.
    async fn reschedule_jobs(self: &Arc<Self>) {
        let now = Utc::now();
        let dispatch: Vec<(String, String, usize, Vec<String>)> = {
            let mut state = self.state.lock().await;
            let schedule = state.scheduler.refresh_schedule(now);
            schedule
                .into_iter()
                .filter_map(|(job_id, workers)| {
                    state
                        .scheduler
                        .job(&job_id)
                        .map(|job| (job_id, job.model.clone(), job.batch_size, workers))
                })
                .collect()
        };

        let mut dispatches = JoinSet::new();
        for (job_id, model, batch_size, workers) in dispatch {
            for address in workers {
                let coordinator = Arc::clone(self);
                let request = InferenceRequest {
                    task: InferenceTask {
                        model: model.clone(),
                        batch_size,
                    },
                    job_id: Some(job_id.clone()),
                };
                let job_id = job_id.clone();
                dispatches.spawn(async move {
                    coordinator.dispatch_inference(job_id, address, request).await;
                });
            }
        }
        while dispatches.join_next().await.is_some() {}
    }

    async fn dispatch_inference(&self, job_id: String, address: String, request: InferenceRequest) {
        let sent: Result<InferenceResponse> = self
            .rpc
            .post(&address, routes::WORKER_INFERENCE, &request, DISPATCH_DEADLINE)
            .await;

        match sent {
            Ok(response) if response.status == ResponseStatus::Ok => {
                let mut state = self.state.lock().await;
                if let Some(worker) = state.scheduler.resources.get_mut(&address) {
                    worker.job_id = Some(job_id.clone());
                    worker.last_query_time = Utc::now();
                }
                info!(job = %job_id, worker = %address, "job dispatched");
            }
            Ok(response) => {
                warn!(job = %job_id, worker = %address, status = ?response.status,
                      "worker rejected dispatch");
            }
            Err(err) => {
                warn!(job = %job_id, worker = %address, error = %err, "dispatch failed");
            }
        }
    }

    /// Flush the head of the pending queue: tell its workers to stand
    /// down, aggregate per-batch outputs, write the result file to the
    /// store and move the job to completed. A failed store write leaves
    /// the job queued for the next tick.
    async fn flush_pending_jobs(&self) {
        let job_id = {
            let state = self.state.lock().await;
            state.scheduler.pending_jobs.front().cloned()
        };
        let Some(job_id) = job_id else {
            return;
        };

        let workers = {
            let state = self.state.lock().await;
            state.scheduler.resources.addresses_for_job(&job_id)
        };

        for address in workers {
            let finished: Result<FinishInferenceResponse> = self
                .rpc
                .post(
                    &address,
                    routes::WORKER_FINISH_INFERENCE,
                    &FinishInferenceRequest {},
                    DISPATCH_DEADLINE,
                )
                .await;
            if let Err(err) = finished {
                warn!(worker = %address, error = %err, "finish-inference failed");
            }

            let mut state = self.state.lock().await;
            if let Some(worker) = state.scheduler.resources.get_mut(&address) {
                worker.reset(Utc::now());
            }
        }

        let payload = {
            let mut state = self.state.lock().await;
            if !state.scheduler.active_jobs.contains_key(&job_id) {
                // Job vanished (self-leave or backup restore); drop the entry.
                state.scheduler.pending_jobs.pop_front();
                return;
            }
            let job = &state.scheduler.active_jobs[&job_id];
            let (results, metric) = job.results();
            let mut lines: Vec<String> = results
                .iter()
                .map(|result| format!("{} {}", result.input, result.output))
                .collect();
            lines.push(format!("\n{metric:.6}"));
            lines.join("\n")
        };

        info!(job = %job_id, "writing job results to store");
        if let Err(err) = self.kvs.put_bytes(&job_id, payload.into_bytes()).await {
            warn!(job = %job_id, error = %err, "failed to flush job results, will retry");
            return;
        }

        let mut state = self.state.lock().await;
        state.scheduler.pending_jobs.pop_front();
        if let Some(mut job) = state.scheduler.active_jobs.remove(&job_id) {
            job.finish_time = Some(Utc::now());
            state.scheduler.completed_jobs.insert(job_id.clone(), job);
        }
        info!(job = %job_id, completed = state.scheduler.completed_jobs.len(), "job completed");
    }

    /// Sample QPS and processing time for every active job.
    async fn measure_stats(&self) {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        for job in state.scheduler.active_jobs.values_mut() {
            job.measure_stats(now);
        }
    }

    /// Push a wholesale snapshot to the first ring successor so it can
    /// take over within one backup interval of our failure.
    async fn backup_coordinator_data(&self) {
        let Some(successor) = self.ring.successors().await.into_iter().next() else {
            return;
        };

        let backup = {
            let state = self.state.lock().await;
            let scheduler = &state.scheduler;
            CoordinatorBackup {
                model_store: state.model_store.entries(),
                active_jobs: scheduler.active_jobs.values().cloned().collect(),
                pending_jobs: scheduler
                    .pending_jobs
                    .iter()
                    .filter_map(|id| scheduler.active_jobs.get(id).cloned())
                    .collect(),
                completed_jobs: scheduler.completed_jobs.values().cloned().collect(),
            }
        };

        debug!(successor = %successor.address(), "pushing coordinator backup");
        let pushed: Result<BackupResponse> = self
            .rpc
            .post(
                &successor.address(),
                routes::COORD_BACKUP,
                &BackupRequest { backup },
                BACKUP_DEADLINE,
            )
            .await;
        if let Err(err) = pushed {
            warn!(successor = %successor.address(), error = %err, "backup push failed");
        }
    }

    // -- RPC handlers ------------------------------------------------------

    /// Admit a training request: only while no jobs are active. The
    /// train directive is broadcast to every ring member's worker and
    /// must be acked by all before the model is registered.
    pub async fn train(&self, request: TrainRequest) -> Result<TrainResponse> {
        self.on_become_coordinator().await;

        {
            let state = self.state.lock().await;
            if !state.scheduler.active_jobs.is_empty() {
                return Err(Error::Admission(
                    "cannot train while serving inference jobs".to_string(),
                ));
            }
        }

        let members = self.ring.membership().await;
        info!(model = %request.task.model, workers = members.len(), "broadcasting train directive");

        let mut broadcasts = JoinSet::new();
        for member in members {
            let rpc = self.rpc.clone();
            let request = request.clone();
            broadcasts.spawn(async move {
                let response: Result<TrainResponse> = rpc
                    .post(
                        &member.address(),
                        routes::WORKER_TRAIN,
                        &request,
                        TRAIN_DEADLINE,
                    )
                    .await;
                (member.address(), response)
            });
        }

        while let Some(joined) = broadcasts.join_next().await {
            let Ok((address, response)) = joined else {
                continue;
            };
            match response {
                Ok(ack) if ack.status == ResponseStatus::Ok => {}
                Ok(_) => {
                    return Err(Error::PeerStatus("train broadcast"));
                }
                Err(err) => {
                    warn!(worker = %address, error = %err, "train broadcast failed");
                    return Err(err);
                }
            }
        }

        let mut state = self.state.lock().await;
        state
            .model_store
            .add_model(request.task.model, request.task.dataset);
        Ok(TrainResponse {
            status: ResponseStatus::Ok,
        })
    }

    /// Admit an inference task. Ingestion is deferred to the queued-job
    /// loop so a burst of submissions cannot storm one scheduling tick.
    pub async fn inference(&self, request: InferenceRequest) -> Result<InferenceResponse> {
        self.on_become_coordinator().await;

        let mut state = self.state.lock().await;
        if !state.model_store.contains(&request.task.model) {
            return Err(Error::Admission(format!(
                "model {} has not been trained",
                request.task.model
            )));
        }
        info!(model = %request.task.model, batch_size = request.task.batch_size, "inference task queued");
        state.task_queue.push_back(request.task);
        Ok(InferenceResponse {
            status: ResponseStatus::Ok,
        })
    }

    /// Worker poll: ingest the piggybacked previous output, validate the
    /// caller, and hand out the next available batch.
    pub async fn query_data(&self, mut request: QueryDataRequest) -> Result<QueryDataResponse> {
        self.on_become_coordinator().await;

        let now = Utc::now();
        let address = request.worker.address();
        let mut state = self.state.lock().await;

        if state.scheduler.resources.get(&address).is_none() {
            return Err(Error::Misroute(format!("worker {address} not known")));
        }
        if state.scheduler.job(&request.job_id).is_none() {
            return Err(Error::Misroute(format!("job {} not found", request.job_id)));
        }

        // The previous batch's result counts even if this worker has
        // since been preempted.
        if let Some(output) = request.batch_output.take() {
            state
                .scheduler
                .on_receive_batch_output(&request.job_id, &address, output, now);
        }

        let assigned = state
            .scheduler
            .resources
            .get(&address)
            .and_then(|worker| worker.job_id.clone());
        match assigned {
            None => {
                return Err(Error::Misroute(format!("worker {address} is idle")));
            }
            Some(assigned) if assigned != request.job_id => {
                return Err(Error::Misroute(format!(
                    "worker {address} is assigned to job {assigned}, not {}",
                    request.job_id
                )));
            }
            Some(_) => {}
        }

        let dataset = state
            .scheduler
            .job(&request.job_id)
            .map(|job| job.dataset.clone())
            .unwrap_or_default();

        let batch = state
            .scheduler
            .active_jobs
            .get_mut(&request.job_id)
            .and_then(|job| job.fetch_batch_input(now))
            .map(|mut batch| {
                batch.inputs = validate_inputs(&dataset, batch.inputs);
                batch
            });

        if let Some(worker) = state.scheduler.resources.get_mut(&address) {
            worker.current_batch = batch.clone();
        }

        Ok(QueryDataResponse {
            batch_input: batch,
            is_filename: dataset_expects_filenames(&dataset),
        })
    }

    /// Install a primary's snapshot wholesale; our view jumps to its
    /// last backup.
    pub async fn backup(&self, request: BackupRequest) -> BackupResponse {
        let backup = request.backup;
        info!(
            active = backup.active_jobs.len(),
            completed = backup.completed_jobs.len(),
            "installing coordinator backup"
        );

        let mut state = self.state.lock().await;
        state.model_store.replace_all(backup.model_store);
        state.scheduler.active_jobs = backup
            .active_jobs
            .into_iter()
            .map(|job| (job.id.clone(), job))
            .collect();
        state.scheduler.completed_jobs = backup
            .completed_jobs
            .into_iter()
            .map(|job| (job.id.clone(), job))
            .collect();
        state.scheduler.pending_jobs = backup
            .pending_jobs
            .into_iter()
            .map(|job| job.id)
            .collect();
        BackupResponse {}
    }

    /// Render one status view.
    pub async fn status(&self, request: StatusRequest) -> StatusResponse {
        self.on_become_coordinator().await;

        let now = Utc::now();
        let state = self.state.lock().await;
        let scheduler = &state.scheduler;
        let message = match (request.which, request.format) {
            (StatusKind::Workers, StatusFormat::Text) => status::workers_table(scheduler),
            (StatusKind::Workers, StatusFormat::Json) => status::workers_json(scheduler),
            (StatusKind::Jobs, StatusFormat::Text) => status::jobs_table(scheduler, now),
            (StatusKind::Jobs, StatusFormat::Json) => status::jobs_json(scheduler, now),
            (StatusKind::JobDetail, StatusFormat::Text) => {
                status::job_detail_table(scheduler, &request.payload)
            }
            (StatusKind::JobDetail, StatusFormat::Json) => {
                status::job_detail_json(scheduler, &request.payload)
            }
            (StatusKind::JobStats, _) => status::job_stats_table(scheduler, &request.payload),
            (StatusKind::CompletedJobs, StatusFormat::Text) => {
                status::completed_jobs_table(scheduler, now)
            }
            (StatusKind::CompletedJobs, StatusFormat::Json) => {
                status::completed_jobs_json(scheduler, now)
            }
        };
        StatusResponse { message }
    }
}
