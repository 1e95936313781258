//! Assembly of one full Stampede node: membership ring, store node and
//! client, coordinator, worker agent, and the axum router tying their
//! RPC surfaces together.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use stampede_config::NodeConfig;
use stampede_core::directory::DirectoryClient;
use stampede_core::ring::{MemberUpdate, RingServer};
use stampede_core::rpc::RpcClient;
use stampede_core::serve::{Coordinator, WorkerAgent};
use stampede_core::store::{KvsClient, KvsNode};
use stampede_proto::Process;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug)]
pub struct NodeOptions {
    pub host: String,
    pub port: u16,
    pub directory_addr: String,
    pub data_dir: PathBuf,
    pub scratch_dir: PathBuf,
    pub config: NodeConfig,
    /// Address of the external model runner; defaults to this host at
    /// `port + runner_port_offset`.
    pub runner_addr: Option<String>,
}

/// A fully wired node. The caller serves `router` over TCP and decides
/// when to `join` the ring.
pub struct NodeHandle {
    pub ring: Arc<RingServer>,
    pub kvs_node: Arc<KvsNode>,
    pub kvs_client: Arc<KvsClient>,
    pub coordinator: Arc<Coordinator>,
    pub worker: Arc<WorkerAgent>,
    pub router: axum::Router,
    pub shutdown: CancellationToken,
}

impl std::fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeHandle").finish()
    }
}

/// Bind the UDP membership socket, construct every subsystem, register
/// the ring observers and start the periodic loops.
pub async fn build_node(options: NodeOptions) -> anyhow::Result<NodeHandle> {
    let NodeOptions {
        host,
        port,
        directory_addr,
        data_dir,
        scratch_dir,
        config,
        runner_addr,
    } = options;

    let socket = UdpSocket::bind((host.as_str(), port))
        .await
        .with_context(|| format!("binding membership socket on {host}:{port}"))?;

    let rpc = RpcClient::new();
    let directory = DirectoryClient::new(directory_addr, rpc.clone());
    let self_process = Process::new(host.clone(), port);

    let ring = RingServer::new(socket, self_process, directory, config.ring.clone());

    let kvs_node = KvsNode::new(
        Arc::clone(&ring),
        config.store.clone(),
        &data_dir,
        port,
        rpc.clone(),
    )
    .context("initialising store node")?;
    kvs_node
        .clear_disk()
        .await
        .context("clearing stale store files")?;

    let kvs_client = KvsClient::new(
        Arc::clone(&kvs_node),
        Arc::clone(&ring),
        config.store.clone(),
        rpc.clone(),
        scratch_dir,
    )
    .context("initialising store client")?;

    let coordinator = Coordinator::new(
        Arc::clone(&ring),
        Arc::clone(&kvs_client),
        config.serve.clone(),
        rpc.clone(),
    );

    let runner_addr = runner_addr
        .unwrap_or_else(|| format!("{host}:{}", port + config.serve.runner_port_offset));
    let worker = WorkerAgent::new(
        Arc::clone(&ring),
        Arc::clone(&kvs_client),
        config.serve.clone(),
        rpc.clone(),
        runner_addr,
    );

    // Ring observers: the store queues a convergence signal; the
    // coordinator updates its worker pool.
    {
        let node = Arc::clone(&kvs_node);
        ring.register_callback(Arc::new(move |process: &Process, action: MemberUpdate| {
            node.on_member_update(process, action);
        }));
    }
    {
        let coordinator = Arc::clone(&coordinator);
        ring.register_callback(Arc::new(move |process: &Process, action: MemberUpdate| {
            let coordinator = Arc::clone(&coordinator);
            let process = process.clone();
            tokio::spawn(async move {
                coordinator.on_member_update(process, action).await;
            });
        }));
    }

    let shutdown = CancellationToken::new();
    ring.run(shutdown.clone());
    kvs_node.run(shutdown.clone());
    coordinator.run(shutdown.clone());
    worker.run(shutdown.clone());

    let router = crate::routes::router(crate::routes::AppState {
        kvs_node: Arc::clone(&kvs_node),
        coordinator: Arc::clone(&coordinator),
        worker: Arc::clone(&worker),
    });

    Ok(NodeHandle {
        ring,
        kvs_node,
        kvs_client,
        coordinator,
        worker,
        router,
        shutdown,
    })
}
