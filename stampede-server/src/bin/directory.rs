//! `stampede-directory`: the leader directory plus the HTTP status
//! façade. One instance serves a whole cluster; nodes find each other
//! through it and operators read cluster state from it.

use anyhow::Context;
use clap::Parser;
use stampede_server::directory::{DirectoryApp, router};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "stampede-directory")]
#[command(about = "Leader directory and status façade for a Stampede cluster")]
struct Args {
    /// Listen address.
    #[arg(long, env = "STAMPEDE_DIRECTORY_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Listen port for both the directory RPCs and the status façade.
    #[arg(short, long, env = "STAMPEDE_DIRECTORY_PORT", default_value_t = 8889)]
    port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    stampede_config::telemetry::init("info");

    let args = Args::parse();
    let app = DirectoryApp::new();

    let listener = tokio::net::TcpListener::bind((args.host.as_str(), args.port))
        .await
        .with_context(|| format!("binding directory on {}:{}", args.host, args.port))?;
    info!(host = %args.host, port = args.port, "directory listening");

    axum::serve(listener, router(app))
        .await
        .context("serving directory")?;
    Ok(())
}
