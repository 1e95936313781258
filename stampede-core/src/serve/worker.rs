use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use stampede_config::ServeConfig;
use stampede_proto::BatchOutput;
use stampede_proto::rpc::{
    EvaluateRequest, EvaluateResponse, FinishInferenceResponse, GreetRequest, GreetResponse,
    InferenceRequest, InferenceResponse, QueryDataRequest, QueryDataResponse, ResponseStatus,
    ServeModelRequest, ServeModelResponse, TrainRequest, TrainResponse,
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::ring::RingServer;
use crate::rpc::{RpcClient, routes};
use crate::store::KvsClient;

/// Model evaluation can take a while on large batches.
const EVALUATE_DEADLINE: Duration = Duration::from_secs(60);
/// Model (re)loading on the runner.
const SERVE_MODEL_DEADLINE: Duration = Duration::from_secs(60);
/// Training runs to completion before the ack.
const TRAIN_DEADLINE: Duration = Duration::from_secs(300);
const GREET_DEADLINE: Duration = Duration::from_secs(2);

#[derive(Debug, Default)]
struct WorkerState {
    job_id: Option<String>,
    batch_output: Option<BatchOutput>,
}

/// Per-node serving agent.
///
/// Loops asking the current coordinator for a batch, piggybacking the
/// previous batch's output on each request; materialises store-hosted
/// inputs locally; forwards the batch to the external model runner and
/// keeps the result for the next poll.
pub struct WorkerAgent {
    ring: Arc<RingServer>,
    kvs: Arc<KvsClient>,
    rpc: RpcClient,
    config: ServeConfig,
    runner_addr: String,
    state: Mutex<WorkerState>,
}

impl std::fmt::Debug for WorkerAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerAgent")
            .field("runner_addr", &self.runner_addr)
            .field("config", &self.config)
            .finish()
    }
}

impl WorkerAgent {
    pub fn new(
        ring: Arc<RingServer>,
        kvs: Arc<KvsClient>,
        config: ServeConfig,
        rpc: RpcClient,
        runner_addr: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            ring,
            kvs,
            rpc,
            config,
            runner_addr,
            state: Mutex::new(WorkerState::default()),
        })
    }

    /// Spawn the query-data loop, backing off an extra second after a
    /// failed cycle (misroutes resolve themselves once the coordinator
    /// reassigns us or the leader moves).
    pub fn run(self: &Arc<Self>, shutdown: CancellationToken) {
        let agent = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if shutdown.is_cancelled() {
                    break;
                }
                let cycle = agent.query_data_cycle().await;

                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(agent.config.query_interval) => {}
                }
                if let Err(err) = cycle {
                    debug!(error = %err, "query cycle failed, backing off");
                    tokio::time::sleep(agent.config.query_backoff).await;
                }
            }
        });
    }

    async fn query_data_cycle(&self) -> Result<()> {
        let (job_id, previous_output) = {
            let state = self.state.lock().await;
            (state.job_id.clone(), state.batch_output.clone())
        };
        let Some(job_id) = job_id else {
            // Nothing assigned; idle until the coordinator dispatches.
            tokio::time::sleep(self.config.query_backoff).await;
            return Ok(());
        };

        let leader = self.ring.lookup_leader().await?.ok_or(Error::NoLeader)?;
        let worker = self.ring.self_process().await;

        let response: QueryDataResponse = self
            .rpc
            .post(
                &leader,
                routes::COORD_QUERY_DATA,
                &QueryDataRequest {
                    job_id: job_id.clone(),
                    worker,
                    batch_output: previous_output,
                },
                self.config.query_data_deadline,
            )
            .await?;

        let Some(batch) = response.batch_input else {
            // No batch this round; keep polling.
            return Ok(());
        };

        if batch.inputs.is_empty() {
            let mut state = self.state.lock().await;
            state.batch_output = Some(BatchOutput {
                batch_id: batch.batch_id,
                results: Vec::new(),
                metric: 0.0,
            });
            return Ok(());
        }

        let (model_inputs, staged) = if response.is_filename {
            self.materialize_inputs(&batch.inputs).await
        } else {
            (batch.inputs.clone(), Vec::new())
        };

        let evaluated = self.evaluate(model_inputs).await;

        for name in &staged {
            if let Err(err) = self.kvs.delete_local_file(name).await {
                debug!(file = %name, error = %err, "failed to remove staged input");
            }
        }

        let evaluation = evaluated?;
        let mut state = self.state.lock().await;
        state.batch_output = Some(BatchOutput {
            batch_id: batch.batch_id,
            results: evaluation.results,
            metric: evaluation.metric,
        });
        Ok(())
    }

    /// Fetch store-hosted inputs into the scratch directory, in
    /// parallel. Inputs that cannot be fetched are skipped (the result
    /// file simply misses them); returns the local paths and the staged
    /// names to clean up afterwards.
    async fn materialize_inputs(&self, inputs: &[String]) -> (Vec<String>, Vec<String>) {
        let fetches = inputs.iter().map(|input| {
            let kvs = Arc::clone(&self.kvs);
            async move {
                match kvs.get_to_file(input, input).await {
                    Ok(path) => Some((path.to_string_lossy().into_owned(), input.clone())),
                    Err(err) => {
                        warn!(file = %input, error = %err, "failed to fetch batch input");
                        None
                    }
                }
            }
        });

        let mut paths = Vec::new();
        let mut staged = Vec::new();
        for fetched in join_all(fetches).await.into_iter().flatten() {
            paths.push(fetched.0);
            staged.push(fetched.1);
        }
        (paths, staged)
    }

    async fn evaluate(&self, inputs: Vec<String>) -> Result<EvaluateResponse> {
        let response: EvaluateResponse = self
            .rpc
            .post(
                &self.runner_addr,
                routes::RUNNER_EVALUATE,
                &EvaluateRequest { inputs },
                EVALUATE_DEADLINE,
            )
            .await?;
        if response.status != ResponseStatus::Ok {
            return Err(Error::PeerStatus("runner evaluate"));
        }
        Ok(response)
    }

    // -- worker service handlers ------------------------------------------

    /// Train directive from the coordinator: forwarded to the runner,
    /// acked once it finishes.
    pub async fn train(&self, request: TrainRequest) -> Result<TrainResponse> {
        info!(model = %request.task.model, dataset = %request.task.dataset, "training on runner");
        let response: TrainResponse = self
            .rpc
            .post(&self.runner_addr, routes::RUNNER_TRAIN, &request, TRAIN_DEADLINE)
            .await?;
        if response.status != ResponseStatus::Ok {
            return Err(Error::PeerStatus("runner train"));
        }
        Ok(response)
    }

    /// Job assignment: point the runner at the model, then adopt the
    /// job id and clear any stale batch output.
    pub async fn inference(&self, request: InferenceRequest) -> Result<InferenceResponse> {
        let Some(job_id) = request.job_id else {
            return Err(Error::Misroute("inference dispatch without job id".to_string()));
        };

        let served: ServeModelResponse = self
            .rpc
            .post(
                &self.runner_addr,
                routes::RUNNER_SERVE_MODEL,
                &ServeModelRequest {
                    model: request.task.model.clone(),
                },
                SERVE_MODEL_DEADLINE,
            )
            .await?;
        if served.status != ResponseStatus::Ok {
            return Err(Error::PeerStatus("runner serve-model"));
        }

        let mut state = self.state.lock().await;
        info!(job = %job_id, model = %request.task.model, "inference assignment accepted");
        state.job_id = Some(job_id);
        state.batch_output = None;
        Ok(InferenceResponse {
            status: ResponseStatus::Ok,
        })
    }

    /// The job is done (or we were stood down): go idle.
    pub async fn finish_inference(&self) -> FinishInferenceResponse {
        let mut state = self.state.lock().await;
        state.job_id = None;
        state.batch_output = None;
        FinishInferenceResponse {}
    }

    /// Diagnostic passthrough to the runner.
    pub async fn greet(&self, name: String) -> Result<GreetResponse> {
        Ok(self
            .rpc
            .post(
                &self.runner_addr,
                routes::RUNNER_GREET,
                &GreetRequest { name },
                GREET_DEADLINE,
            )
            .await?)
    }
}

/// Launch the external model-runner process for this node. The command
/// is operator-provided; the runner's port and scratch path are
/// appended the way the stock runners expect.
pub fn spawn_runner(
    command: &str,
    runner_port: u16,
    scratch_dir: &Path,
) -> Result<tokio::process::Child> {
    let mut parts = command.split_whitespace();
    let program = parts
        .next()
        .ok_or_else(|| Error::Internal("empty runner command".to_string()))?;

    let child = tokio::process::Command::new(program)
        .args(parts)
        .arg("--port")
        .arg(runner_port.to_string())
        .arg("--filepath")
        .arg(scratch_dir)
        .kill_on_drop(true)
        .spawn()?;
    Ok(child)
}
