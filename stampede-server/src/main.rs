//! `stampede-node`: one member of the cluster.
//!
//! Hosts the UDP membership ring, the replicated store, the coordinator
//! (active only while this node leads) and the worker agent, plus an
//! interactive operator REPL on stdin.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use stampede_config::NodeConfig;
use stampede_core::rpc::RpcClient;
use stampede_core::serve::worker::spawn_runner;
use stampede_server::cli;
use stampede_server::node::{NodeOptions, build_node};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "stampede-node")]
#[command(about = "Distributed inference-serving cluster node")]
struct Args {
    /// Membership/RPC port; the UDP ring and the HTTP services share it.
    #[arg(short, long, env = "STAMPEDE_PORT", default_value_t = 5000)]
    port: u16,

    /// Address other nodes reach us at.
    #[arg(long, env = "STAMPEDE_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Leader directory address (host:port).
    #[arg(long, env = "STAMPEDE_DIRECTORY", default_value = "127.0.0.1:8889")]
    directory: String,

    /// Base directory for replicated file storage.
    #[arg(long, env = "STAMPEDE_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    /// Scratch directory for staged batch inputs.
    #[arg(long, env = "STAMPEDE_SCRATCH_DIR", default_value = "scratch")]
    scratch_dir: PathBuf,

    /// Command line used to launch the local model runner; when unset
    /// the runner is expected to be started externally.
    #[arg(long, env = "STAMPEDE_RUNNER_CMD")]
    runner_cmd: Option<String>,

    /// Join the ring immediately instead of waiting for the `join`
    /// command.
    #[arg(long)]
    join: bool,

    /// Probability of dropping outgoing membership datagrams (failure
    /// injection experiments).
    #[arg(long)]
    drop_probability: Option<f64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    stampede_config::telemetry::init("info,stampede_core=info");

    let args = Args::parse();
    let mut config = NodeConfig::from_env().context("loading configuration")?;
    if let Some(probability) = args.drop_probability {
        config.ring.drop_probability = probability;
    }

    let scratch_dir = args.scratch_dir.join(args.port.to_string());
    let runner_port = args.port + config.serve.runner_port_offset;

    // The external model runner is a collaborator process; supervise it
    // for the lifetime of this node when a command is configured.
    let _runner = match &args.runner_cmd {
        Some(command) => Some(
            spawn_runner(command, runner_port, &scratch_dir)
                .context("launching model runner")?,
        ),
        None => None,
    };

    let handle = build_node(NodeOptions {
        host: args.host.clone(),
        port: args.port,
        directory_addr: args.directory.clone(),
        data_dir: args.data_dir.clone(),
        scratch_dir,
        config,
        runner_addr: None,
    })
    .await?;

    let listener = tokio::net::TcpListener::bind((args.host.as_str(), args.port))
        .await
        .with_context(|| format!("binding RPC listener on {}:{}", args.host, args.port))?;
    info!(host = %args.host, port = args.port, directory = %args.directory, "node listening");

    let router = handle.router.clone();
    let server_shutdown = handle.shutdown.clone();
    let server = tokio::spawn(async move {
        let shutdown = server_shutdown.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
    });

    if args.join {
        handle.ring.join().await.context("joining ring")?;
    }

    let rpc = RpcClient::new();
    tokio::select! {
        _ = cli::run_repl(&handle, rpc) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            handle.shutdown.cancel();
        }
    }

    handle.shutdown.cancel();
    let _ = server.await;
    Ok(())
}
