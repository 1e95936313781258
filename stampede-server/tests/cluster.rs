//! In-process cluster tests: a real directory, real UDP membership and
//! real HTTP RPC over loopback, with timers shrunk far below the
//! production defaults.

use std::time::Duration;

use stampede_config::NodeConfig;
use stampede_core::Error;
use stampede_proto::rpc::{
    InferenceRequest, InferenceTask, StatusFormat, StatusKind, StatusRequest, TrainRequest,
    TrainTask,
};
use stampede_server::directory::{DirectoryApp, router as directory_router};
use stampede_server::node::{NodeHandle, NodeOptions, build_node};
use tempfile::TempDir;

/// Millisecond-scale timers so scenarios resolve in seconds.
fn test_config() -> NodeConfig {
    let mut config = NodeConfig::default();
    config.ring.interval = Duration::from_millis(100);
    config.ring.ping_timeout = Duration::from_millis(300);
    config.ring.read_timeout = Duration::from_millis(300);
    config.ring.write_timeout = Duration::from_millis(300);
    config.ring.expiration = Duration::from_millis(600);
    config.store.cron_interval = Duration::from_millis(50);
    config.store.get_timeout = Duration::from_secs(4);
    config.store.put_timeout = Duration::from_secs(4);
    config.store.delete_timeout = Duration::from_secs(2);
    config.store.lookup_timeout = Duration::from_secs(4);
    config.serve.process_queue_interval = Duration::from_millis(200);
    config.serve.reschedule_interval = Duration::from_millis(300);
    config.serve.flush_interval = Duration::from_millis(300);
    config.serve.refresh_interval = Duration::from_millis(300);
    config.serve.backup_interval = Duration::from_millis(500);
    config.serve.measure_interval = Duration::from_millis(500);
    config.serve.query_interval = Duration::from_millis(200);
    config.serve.query_backoff = Duration::from_millis(200);
    config
}

async fn start_directory() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind directory");
    let addr = listener.local_addr().expect("directory addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, directory_router(DirectoryApp::new())).await;
    });
    format!("127.0.0.1:{}", addr.port())
}

struct TestNode {
    handle: NodeHandle,
    addr: String,
    server: tokio::task::JoinHandle<()>,
}

impl TestNode {
    /// Simulate a crash: all loops stop, the RPC listener dies, and the
    /// UDP socket goes silent.
    fn crash(self) {
        self.handle.shutdown.cancel();
        self.server.abort();
    }
}

async fn start_node(directory: &str, base: &TempDir, runner_addr: Option<String>) -> TestNode {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind node rpc");
    let port = listener.local_addr().expect("node addr").port();

    let handle = build_node(NodeOptions {
        host: "127.0.0.1".to_string(),
        port,
        directory_addr: directory.to_string(),
        data_dir: base.path().join("data"),
        scratch_dir: base.path().join("scratch").join(port.to_string()),
        config: test_config(),
        runner_addr,
    })
    .await
    .expect("build node");

    let router = handle.router.clone();
    let server = tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });

    TestNode {
        handle,
        addr: format!("127.0.0.1:{port}"),
        server,
    }
}

/// Poll until `check` passes or the deadline elapses.
async fn wait_for<F, Fut>(what: &str, deadline: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let started = std::time::Instant::now();
    loop {
        if check().await {
            return;
        }
        assert!(
            started.elapsed() < deadline,
            "timed out after {deadline:?} waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

async fn start_cluster(size: usize, runner_addr: Option<String>) -> (String, TempDir, Vec<TestNode>) {
    let directory = start_directory().await;
    let base = TempDir::new().expect("tempdir");

    let mut nodes = Vec::new();
    for _ in 0..size {
        let node = start_node(&directory, &base, runner_addr.clone()).await;
        node.handle.ring.join().await.expect("join ring");
        // Distinct join times keep the leader order unambiguous.
        tokio::time::sleep(Duration::from_millis(50)).await;
        nodes.push(node);
    }

    let expected = size;
    let nodes_ref = &nodes;
    wait_for("membership convergence", Duration::from_secs(5), || async move {
        let mut converged = true;
        for node in nodes_ref {
            converged &= node.handle.ring.membership().await.len() == expected;
        }
        converged
    })
    .await;

    (directory, base, nodes)
}

#[tokio::test(flavor = "multi_thread")]
async fn three_node_ring_converges_on_first_leader() {
    let (_directory, _base, nodes) = start_cluster(3, None).await;

    // Every node agrees on the leader: the first process to join.
    let first = nodes[0].addr.clone();
    for node in &nodes {
        let leader = node
            .handle
            .ring
            .lookup_leader()
            .await
            .expect("lookup leader")
            .expect("leader registered");
        assert_eq!(leader, first);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn put_get_delete_round_trip() {
    let (_directory, _base, nodes) = start_cluster(3, None).await;

    // Let the store crons refresh their hash rings after the joins.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let client = &nodes[1].handle.kvs_client;
    client
        .put_bytes("k", b"hello".to_vec())
        .await
        .expect("put quorum");

    let fetched = client.get("k", 1).await.expect("get quorum");
    assert_eq!(fetched, b"hello");

    client.delete("k").await.expect("delete quorum");
    // Deletes are acknowledged by every replica, so the read quorum
    // cannot see the key again.
    match client.get("k", 1).await {
        Err(Error::NotFound(_)) => {}
        other => panic!("expected NotFound after delete, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn versioned_reads_return_newest_first() {
    let (_directory, _base, nodes) = start_cluster(3, None).await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    let client = &nodes[0].handle.kvs_client;
    for payload in ["v1", "v2", "v3"] {
        client
            .put_bytes("log", payload.as_bytes().to_vec())
            .await
            .expect("put quorum");
    }

    assert_eq!(client.get("log", 1).await.expect("latest"), b"v3");
    assert_eq!(client.get("log", 2).await.expect("second"), b"v2");
    assert_eq!(client.get("log", 3).await.expect("third"), b"v1");

    let versions = client.get_versions("log", 3).await.expect("versions");
    assert_eq!(versions.len(), 3);
    assert_eq!(versions[0], b"v3");
}

#[tokio::test(flavor = "multi_thread")]
async fn sequences_are_strictly_increasing_within_an_epoch() {
    let (_directory, _base, nodes) = start_cluster(3, None).await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    let client = &nodes[2].handle.kvs_client;
    let mut previous = client.fetch_sequence().await.expect("first sequence");
    for _ in 0..5 {
        let next = client.fetch_sequence().await.expect("sequence");
        assert!(next > previous, "sequence must advance: {next:?} vs {previous:?}");
        assert_eq!(next.time, previous.time, "same leader epoch");
        previous = next;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn crashed_node_is_removed_within_expiration_window() {
    let (_directory, _base, mut nodes) = start_cluster(3, None).await;

    let crashed = nodes.pop().expect("third node");
    let crashed_addr = crashed.addr.clone();
    crashed.crash();

    // Expiration (600 ms) + a few ping intervals of slack.
    let nodes_ref = &nodes;
    let crashed_addr = &crashed_addr;
    wait_for("failure detection", Duration::from_secs(5), || async move {
        let mut removed = true;
        for node in nodes_ref {
            let members = node.handle.ring.membership().await;
            removed &= !members.iter().any(|m| m.address() == *crashed_addr);
        }
        removed
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn new_replica_receives_existing_files_after_join() {
    let (directory, base, mut nodes) = start_cluster(3, None).await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    nodes[0]
        .handle
        .kvs_client
        .put_bytes("shared.bin", vec![7u8; 64])
        .await
        .expect("put quorum");

    // A fourth node joins; with a replica target of 4 it must receive a
    // copy within a convergence tick.
    let late = start_node(&directory, &base, None).await;
    late.handle.ring.join().await.expect("join ring");

    let late_ref = &late;
    wait_for("replica transfer", Duration::from_secs(10), || async move {
        let (_, files) = late_ref.handle.kvs_node.store_listing().await;
        files.iter().any(|f| f.filename == "shared.bin")
    })
    .await;

    nodes.push(late);
}

/// Stub model runner: evaluates every input to `ok`.
async fn start_stub_runner() -> String {
    use axum::Json;
    use axum::routing::post;
    use stampede_proto::rpc::{
        EvaluateRequest, EvaluateResponse, GreetRequest, GreetResponse, ResponseStatus,
        ServeModelRequest, ServeModelResponse, TrainResponse,
    };
    use stampede_proto::EvalResult;

    async fn evaluate(Json(request): Json<EvaluateRequest>) -> Json<EvaluateResponse> {
        let results = request
            .inputs
            .iter()
            .map(|input| EvalResult {
                input: input.clone(),
                output: "ok".to_string(),
            })
            .collect();
        Json(EvaluateResponse {
            status: ResponseStatus::Ok,
            results,
            metric: 1.0,
        })
    }

    async fn serve_model(Json(_): Json<ServeModelRequest>) -> Json<ServeModelResponse> {
        Json(ServeModelResponse {
            status: ResponseStatus::Ok,
        })
    }

    async fn train(Json(_): Json<TrainRequest>) -> Json<TrainResponse> {
        Json(TrainResponse {
            status: ResponseStatus::Ok,
        })
    }

    async fn greet(Json(request): Json<GreetRequest>) -> Json<GreetResponse> {
        Json(GreetResponse {
            message: format!("hello {}", request.name),
        })
    }

    let app = axum::Router::new()
        .route(stampede_core::rpc::routes::RUNNER_EVALUATE, post(evaluate))
        .route(stampede_core::rpc::routes::RUNNER_SERVE_MODEL, post(serve_model))
        .route(stampede_core::rpc::routes::RUNNER_TRAIN, post(train))
        .route(stampede_core::rpc::routes::RUNNER_GREET, post(greet));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind runner");
    let addr = listener.local_addr().expect("runner addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("127.0.0.1:{}", addr.port())
}

#[tokio::test(flavor = "multi_thread")]
async fn raw_line_job_runs_to_completion() {
    let runner = start_stub_runner().await;
    let (_directory, _base, nodes) = start_cluster(3, Some(runner)).await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    let leader = &nodes[0].handle;
    leader
        .kvs_client
        .put_bytes("reviews.txt", b"good;1\nbad;0\nfine;1\nawful;0".to_vec())
        .await
        .expect("put dataset");

    leader
        .coordinator
        .train(TrainRequest {
            task: TrainTask {
                model: "sentiment".to_string(),
                dataset: "reviews.txt".to_string(),
            },
        })
        .await
        .expect("train");

    leader
        .coordinator
        .inference(InferenceRequest {
            task: InferenceTask {
                model: "sentiment".to_string(),
                batch_size: 2,
            },
            job_id: None,
        })
        .await
        .expect("admit inference");

    // 4 inputs at batch size 2: the job is done once 2 batches land and
    // the flush loop has written the result file.
    wait_for("job completion", Duration::from_secs(30), || async move {
        let status = leader
            .coordinator
            .status(StatusRequest {
                which: StatusKind::CompletedJobs,
                format: StatusFormat::Json,
                payload: String::new(),
            })
            .await;
        let completed: serde_json::Value =
            serde_json::from_str(&status.message).unwrap_or_default();
        completed.as_array().map(|jobs| !jobs.is_empty()).unwrap_or(false)
    })
    .await;

    let status = leader
        .coordinator
        .status(StatusRequest {
            which: StatusKind::CompletedJobs,
            format: StatusFormat::Json,
            payload: String::new(),
        })
        .await;
    let completed: serde_json::Value = serde_json::from_str(&status.message).expect("status json");
    let job = &completed.as_array().expect("jobs array")[0];
    assert_eq!(job["totalQueries"], 2);

    // The result file is in the store under the job id.
    let job_id = job["id"].as_str().expect("job id").to_string();
    let results = leader.kvs_client.get(&job_id, 1).await.expect("result file");
    let text = String::from_utf8_lossy(&results);
    assert!(text.contains("good;1 ok"), "results: {text}");
    assert!(text.contains("awful;0 ok"), "results: {text}");
}

#[tokio::test(flavor = "multi_thread")]
async fn successor_takes_over_after_coordinator_crash() {
    let runner = start_stub_runner().await;
    let (_directory, _base, mut nodes) = start_cluster(3, Some(runner)).await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    // A slow job: 60 single-input batches keeps it in flight well past
    // the first backup push.
    let inputs: Vec<String> = (0..60).map(|i| format!("line-{i};1")).collect();
    nodes[0]
        .handle
        .kvs_client
        .put_bytes("slow.txt", inputs.join("\n").into_bytes())
        .await
        .expect("put dataset");

    nodes[0]
        .handle
        .coordinator
        .train(TrainRequest {
            task: TrainTask {
                model: "slow".to_string(),
                dataset: "slow.txt".to_string(),
            },
        })
        .await
        .expect("train");
    nodes[0]
        .handle
        .coordinator
        .inference(InferenceRequest {
            task: InferenceTask {
                model: "slow".to_string(),
                batch_size: 1,
            },
            job_id: None,
        })
        .await
        .expect("admit inference");

    // Let the job start and at least one backup land on the successor.
    tokio::time::sleep(Duration::from_secs(2)).await;

    let old_leader = nodes.remove(0);
    old_leader.crash();

    // The successor owns the job once the workers' misrouted polls have
    // flipped its coordinator flag and its backup state is serving.
    let successor = &nodes[0].handle;
    let job_id = {
        let mut found = None;
        wait_for("job visible on successor", Duration::from_secs(15), || async move {
            let status = successor
                .coordinator
                .status(StatusRequest {
                    which: StatusKind::Jobs,
                    format: StatusFormat::Json,
                    payload: String::new(),
                })
                .await;
            let parsed: serde_json::Value =
                serde_json::from_str(&status.message).unwrap_or_default();
            parsed["jobs"]
                .as_array()
                .map(|jobs| !jobs.is_empty())
                .unwrap_or(false)
        })
        .await;

        let status = successor
            .coordinator
            .status(StatusRequest {
                which: StatusKind::Jobs,
                format: StatusFormat::Json,
                payload: String::new(),
            })
            .await;
        let parsed: serde_json::Value = serde_json::from_str(&status.message).expect("jobs json");
        if let Some(job) = parsed["jobs"].as_array().and_then(|jobs| jobs.first()) {
            found = job["id"].as_str().map(str::to_string);
        }
        found.expect("job id on successor")
    };

    // The surviving workers re-route to the new coordinator and the job
    // still runs to completion, unfinished batches included.
    let job_id = &job_id;
    wait_for("job completion on successor", Duration::from_secs(90), || async move {
        let status = successor
            .coordinator
            .status(StatusRequest {
                which: StatusKind::CompletedJobs,
                format: StatusFormat::Json,
                payload: String::new(),
            })
            .await;
        let completed: serde_json::Value =
            serde_json::from_str(&status.message).unwrap_or_default();
        completed
            .as_array()
            .map(|jobs| jobs.iter().any(|job| job["id"] == job_id.as_str()))
            .unwrap_or(false)
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn directory_facade_reports_workers() {
    let runner = start_stub_runner().await;
    let (directory, _base, nodes) = start_cluster(2, Some(runner)).await;

    // Wake the coordinator so the façade has something to proxy to.
    let _ = nodes[0]
        .handle
        .coordinator
        .status(StatusRequest {
            which: StatusKind::Workers,
            format: StatusFormat::Text,
            payload: String::new(),
        })
        .await;

    let facade = format!("http://{directory}/worker");
    let facade = &facade;
    wait_for("facade worker listing", Duration::from_secs(5), || async move {
        let body = reqwest_get(facade).await;
        serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|workers| workers.as_array().map(|list| list.len() == 2))
            .unwrap_or(false)
    })
    .await;
}

async fn reqwest_get(url: &str) -> String {
    // Plain GET without the typed client; the façade returns raw JSON.
    let response = reqwest::get(url).await.expect("facade reachable");
    assert!(response.status().is_success(), "status {}", response.status());
    response.text().await.expect("facade body")
}
